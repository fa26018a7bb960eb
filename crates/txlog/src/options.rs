use std::path::PathBuf;

/// Skipped already-seen events allowed per filtered read.
pub const DEFAULT_MAX_SITE_SKIPS: usize = 1_000;

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory holding one sub-directory per namespace.
    pub root: PathBuf,
    pub max_site_skips: usize,
    /// fsync after every append.
    pub sync_appends: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("blobkeep.logs"),
            max_site_skips: DEFAULT_MAX_SITE_SKIPS,
            sync_appends: true,
        }
    }
}

impl LogOptions {
    pub fn builder(root: impl Into<PathBuf>) -> LogOptionsBuilder {
        LogOptionsBuilder::new(root)
    }

    pub fn from_env() -> Self {
        let root = std::env::var("BLOBKEEP_LOG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("blobkeep.logs"));
        let skips = std::env::var("BLOBKEEP_MAX_SITE_SKIPS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_SITE_SKIPS);
        let sync = std::env::var("BLOBKEEP_SYNC_APPENDS")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "off"))
            .unwrap_or(true);

        LogOptions::builder(root)
            .max_site_skips(skips)
            .sync_appends(sync)
            .build()
    }
}

pub struct LogOptionsBuilder {
    options: LogOptions,
}

impl LogOptionsBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            options: LogOptions {
                root: root.into(),
                ..Default::default()
            },
        }
    }

    pub fn max_site_skips(mut self, skips: usize) -> Self {
        self.options.max_site_skips = skips.max(1);
        self
    }

    pub fn sync_appends(mut self, sync: bool) -> Self {
        self.options.sync_appends = sync;
        self
    }

    pub fn build(self) -> LogOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_skip_cap() {
        let options = LogOptions::builder("/tmp/logs").max_site_skips(0).build();
        assert_eq!(options.max_site_skips, 1);
        assert!(options.sync_appends);
        assert_eq!(options.root, PathBuf::from("/tmp/logs"));
    }
}
