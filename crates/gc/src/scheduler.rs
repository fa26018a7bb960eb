use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::traits::{LeaderElection, ReferenceStore};
use common::NamespaceId;
use futures::future::{join_all, BoxFuture};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GcError, GcResult};
use crate::orphan_index::IndexOrphanCollector;
use crate::orphan_log::LogOrphanCollector;
use crate::references::ReferenceCleaner;
use crate::sweep::CollectionReport;

/// A collector the scheduler can run periodically.
pub trait CleanupService: Send + Sync {
    fn name(&self) -> &'static str;

    fn run_once<'a>(&'a self, cancel: &'a CancellationToken)
        -> BoxFuture<'a, GcResult<CollectionReport>>;
}

impl CleanupService for LogOrphanCollector {
    fn name(&self) -> &'static str {
        "log-orphan-collector"
    }

    fn run_once<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, GcResult<CollectionReport>> {
        Box::pin(self.collect(cancel))
    }
}

impl CleanupService for IndexOrphanCollector {
    fn name(&self) -> &'static str {
        "index-orphan-collector"
    }

    fn run_once<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, GcResult<CollectionReport>> {
        Box::pin(self.collect(cancel))
    }
}

/// Non-blocking run-in-progress guard.
#[derive(Clone, Debug, Default)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

/// Held for the duration of one run; releases the flight on drop.
#[derive(Debug)]
pub struct FlightGuard {
    running: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NotLeader,
    AlreadyRunning,
    Started,
    FannedOut { started: usize, reused: usize },
    Failed,
}

/// Something driven by the scheduler's timer.
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &str;

    fn tick<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, TickOutcome>;

    /// Wait for work started by earlier ticks.
    fn wait_idle(&self) -> BoxFuture<'_, ()>;
}

async fn holds_leadership(leader: &dyn LeaderElection, task: &str) -> bool {
    match leader.is_leader().await {
        Ok(is_leader) => is_leader,
        Err(err) => {
            warn!(task, error = %err, "leader check failed; skipping tick");
            false
        }
    }
}

/// Runs one [`CleanupService`] per tick, at most one run at a time.
pub struct ServiceDriver {
    service: Arc<dyn CleanupService>,
    leader: Arc<dyn LeaderElection>,
    flight: SingleFlight,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceDriver {
    pub fn new(service: Arc<dyn CleanupService>, leader: Arc<dyn LeaderElection>) -> Self {
        Self {
            service,
            leader,
            flight: SingleFlight::new(),
            current: Mutex::new(None),
        }
    }

    async fn run_tick(&self, cancel: &CancellationToken) -> TickOutcome {
        let name = self.service.name();
        if !holds_leadership(self.leader.as_ref(), name).await {
            debug!(service = name, "not leader; skipping tick");
            return TickOutcome::NotLeader;
        }
        let Some(guard) = self.flight.try_begin() else {
            debug!(service = name, "previous run still in progress; skipping tick");
            return TickOutcome::AlreadyRunning;
        };

        let service = self.service.clone();
        let cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match service.run_once(&cancel).await {
                Ok(report) => debug!(service = name, ?report, "cleanup run finished"),
                Err(GcError::Cancelled) => info!(service = name, "cleanup run cancelled"),
                Err(err) => error!(service = name, error = %err, "cleanup run failed"),
            }
        });

        match self.current.lock() {
            Ok(mut current) => *current = Some(handle),
            Err(_) => warn!(service = name, "driver state poisoned; run continues untracked"),
        }
        TickOutcome::Started
    }
}

impl PeriodicTask for ServiceDriver {
    fn name(&self) -> &str {
        self.service.name()
    }

    fn tick<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, TickOutcome> {
        Box::pin(self.run_tick(cancel))
    }

    fn wait_idle(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let handle = self.current.lock().ok().and_then(|mut current| current.take());
            if let Some(handle) = handle {
                if let Err(err) = handle.await {
                    error!(service = self.service.name(), error = %err, "cleanup run panicked");
                }
            }
        })
    }
}

/// Fans reference cleanup out to one task per namespace, reusing tasks
/// still running from the previous tick.
pub struct ReferenceCleanupDriver {
    cleaner: Arc<ReferenceCleaner>,
    references: Arc<dyn ReferenceStore>,
    leader: Arc<dyn LeaderElection>,
    tasks: Mutex<HashMap<NamespaceId, JoinHandle<()>>>,
}

impl ReferenceCleanupDriver {
    pub fn new(
        cleaner: Arc<ReferenceCleaner>,
        references: Arc<dyn ReferenceStore>,
        leader: Arc<dyn LeaderElection>,
    ) -> Self {
        Self {
            cleaner,
            references,
            leader,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    async fn run_tick(&self, cancel: &CancellationToken) -> TickOutcome {
        if !holds_leadership(self.leader.as_ref(), "reference-cleanup").await {
            debug!("not leader; skipping reference cleanup tick");
            return TickOutcome::NotLeader;
        }
        let namespaces = match self.references.namespaces().await {
            Ok(namespaces) => namespaces,
            Err(err) => {
                warn!(error = %err, "failed to list namespaces for reference cleanup");
                return TickOutcome::Failed;
            }
        };

        let Ok(mut tasks) = self.tasks.lock() else {
            error!("reference cleanup task table poisoned");
            return TickOutcome::Failed;
        };
        tasks.retain(|_, handle| !handle.is_finished());

        let (mut started, mut reused) = (0usize, 0usize);
        for namespace in namespaces {
            if cancel.is_cancelled() {
                break;
            }
            if tasks.contains_key(&namespace) {
                debug!(namespace = %namespace, "reference cleanup still running; reusing task");
                reused += 1;
                continue;
            }

            let cleaner = self.cleaner.clone();
            let task_namespace = namespace.clone();
            let cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                match cleaner.cleanup_namespace(&task_namespace, &cancel).await {
                    Ok(_) => {}
                    Err(GcError::Cancelled) => {}
                    Err(err) => {
                        error!(namespace = %task_namespace, error = %err, "reference cleanup failed")
                    }
                }
            });
            tasks.insert(namespace, handle);
            started += 1;
        }

        TickOutcome::FannedOut { started, reused }
    }
}

impl PeriodicTask for ReferenceCleanupDriver {
    fn name(&self) -> &str {
        "reference-cleanup"
    }

    fn tick<'a>(&'a self, cancel: &'a CancellationToken) -> BoxFuture<'a, TickOutcome> {
        Box::pin(self.run_tick(cancel))
    }

    fn wait_idle(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
                Ok(mut tasks) => tasks.drain().map(|(_, handle)| handle).collect(),
                Err(_) => Vec::new(),
            };
            for joined in join_all(handles).await {
                if let Err(err) = joined {
                    error!(error = %err, "reference cleanup task panicked");
                }
            }
        })
    }
}

/// Tick `task` every `every` until cancelled.
pub async fn run_periodic(task: Arc<dyn PeriodicTask>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(task = task.name(), interval_secs = every.as_secs(), "cleanup driver started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(task = task.name(), "cleanup driver shutting down");
                break;
            }
            _ = ticker.tick() => {
                let outcome = task.tick(&cancel).await;
                debug!(task = task.name(), ?outcome, "cleanup tick");
            }
        }
    }
}

/// Leader-gated periodic drivers, one per registered service.
pub struct CleanupScheduler {
    leader: Arc<dyn LeaderElection>,
    every: Duration,
    tasks: Vec<Arc<dyn PeriodicTask>>,
}

impl CleanupScheduler {
    pub fn new(leader: Arc<dyn LeaderElection>, every: Duration) -> Self {
        Self {
            leader,
            every,
            tasks: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: Arc<dyn CleanupService>) -> Self {
        self.tasks
            .push(Arc::new(ServiceDriver::new(service, self.leader.clone())));
        self
    }

    pub fn with_reference_cleanup(
        mut self,
        cleaner: Arc<ReferenceCleaner>,
        references: Arc<dyn ReferenceStore>,
    ) -> Self {
        self.tasks.push(Arc::new(ReferenceCleanupDriver::new(
            cleaner,
            references,
            self.leader.clone(),
        )));
        self
    }

    pub fn start(self, cancel: CancellationToken) -> SchedulerHandle {
        let drivers = self
            .tasks
            .iter()
            .map(|task| tokio::spawn(run_periodic(task.clone(), self.every, cancel.clone())))
            .collect();
        SchedulerHandle {
            cancel,
            drivers,
            tasks: self.tasks,
        }
    }
}

pub struct SchedulerHandle {
    cancel: CancellationToken,
    drivers: Vec<JoinHandle<()>>,
    tasks: Vec<Arc<dyn PeriodicTask>>,
}

impl SchedulerHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every driver and wait for in-flight runs to notice.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for joined in join_all(self.drivers).await {
            if let Err(err) = joined {
                error!(error = %err, "cleanup driver panicked");
            }
        }
        for task in &self.tasks {
            task.wait_idle().await;
        }
    }
}
