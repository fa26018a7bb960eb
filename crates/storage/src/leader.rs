use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use common::traits::LeaderElection;
use futures::future::{self, BoxFuture};

/// Leadership decided by whoever holds the flag: a static answer for
/// single-node deployments and a switch for tests.
#[derive(Clone, Debug)]
pub struct LeaderFlag {
    leader: Arc<AtomicBool>,
}

impl LeaderFlag {
    pub fn new(is_leader: bool) -> Self {
        Self {
            leader: Arc::new(AtomicBool::new(is_leader)),
        }
    }

    pub fn set(&self, is_leader: bool) {
        self.leader.store(is_leader, Ordering::SeqCst);
    }
}

impl LeaderElection for LeaderFlag {
    fn is_leader(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(future::ready(Ok(self.leader.load(Ordering::SeqCst))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flag_is_shared_between_clones() {
        let flag = LeaderFlag::new(false);
        let observer = flag.clone();
        assert!(!observer.is_leader().await.unwrap());
        flag.set(true);
        assert!(observer.is_leader().await.unwrap());
    }
}
