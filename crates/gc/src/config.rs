use std::time::Duration;

/// Blobs younger than this are never collected.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60 * 60);
/// Records re-scanned per namespace when looking for a late add.
pub const DEFAULT_MAX_TAIL_RESCAN: usize = 1_000_000;
pub const DEFAULT_LAST_ACCESS_CUTOFF: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub grace_period: Duration,
    /// Heuristic bound, not a safety barrier: a late add further out than
    /// this is missed.
    pub max_tail_rescan_records: usize,
    pub namespace_parallelism: usize,
    pub blob_parallelism: usize,
    /// Used when a namespace policy carries no override.
    pub last_access_cutoff: Duration,
    pub interval: Duration,
    pub scan_page_size: usize,
    /// Site that removes issued by reference cleanup are marked seen at.
    pub local_site: String,
}

impl Default for GcConfig {
    fn default() -> Self {
        let cpus = std::cmp::max(1, num_cpus::get());
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            max_tail_rescan_records: DEFAULT_MAX_TAIL_RESCAN,
            namespace_parallelism: std::cmp::max(1, cpus / 2),
            blob_parallelism: cpus * 2,
            last_access_cutoff: DEFAULT_LAST_ACCESS_CUTOFF,
            interval: DEFAULT_INTERVAL,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            local_site: "local".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl GcConfig {
    pub fn builder() -> GcConfigBuilder {
        GcConfigBuilder::default()
    }

    pub fn from_env() -> Self {
        let mut builder = GcConfig::builder();
        if let Some(secs) = env_parse::<u64>("BLOBKEEP_GC_GRACE_SECS") {
            builder = builder.grace_period(Duration::from_secs(secs));
        }
        if let Some(records) = env_parse::<usize>("BLOBKEEP_GC_TAIL_RESCAN") {
            builder = builder.max_tail_rescan_records(records);
        }
        if let Some(n) = env_parse::<usize>("BLOBKEEP_GC_NAMESPACE_PARALLELISM") {
            builder = builder.namespace_parallelism(n);
        }
        if let Some(n) = env_parse::<usize>("BLOBKEEP_GC_BLOB_PARALLELISM") {
            builder = builder.blob_parallelism(n);
        }
        if let Some(secs) = env_parse::<u64>("BLOBKEEP_GC_LAST_ACCESS_CUTOFF_SECS") {
            builder = builder.last_access_cutoff(Duration::from_secs(secs));
        }
        if let Some(secs) = env_parse::<u64>("BLOBKEEP_GC_INTERVAL_SECS") {
            builder = builder.interval(Duration::from_secs(secs));
        }
        if let Ok(site) = std::env::var("BLOBKEEP_LOCAL_SITE") {
            builder = builder.local_site(site);
        }
        builder.build()
    }
}

#[derive(Default)]
pub struct GcConfigBuilder {
    config: GcConfig,
}

impl GcConfigBuilder {
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period = grace;
        self
    }

    pub fn max_tail_rescan_records(mut self, records: usize) -> Self {
        self.config.max_tail_rescan_records = records;
        self
    }

    pub fn namespace_parallelism(mut self, n: usize) -> Self {
        self.config.namespace_parallelism = n.max(1);
        self
    }

    pub fn blob_parallelism(mut self, n: usize) -> Self {
        self.config.blob_parallelism = n.max(1);
        self
    }

    pub fn last_access_cutoff(mut self, cutoff: Duration) -> Self {
        self.config.last_access_cutoff = cutoff;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn scan_page_size(mut self, size: usize) -> Self {
        self.config.scan_page_size = size.max(1);
        self
    }

    pub fn local_site(mut self, site: impl Into<String>) -> Self {
        self.config.local_site = site.into();
        self
    }

    pub fn build(self) -> GcConfig {
        self.config
    }
}
