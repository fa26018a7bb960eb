use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, TxLogError};
use crate::event::{SiteMask, MAX_SITES};

/// On-disk format version of the index file.
pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexState {
    version: u32,
    generation_id: Uuid,
    sites: BTreeMap<String, u8>,
    next_free_bit: u8,
}

impl IndexState {
    fn fresh() -> Self {
        Self {
            version: INDEX_VERSION,
            generation_id: Uuid::new_v4(),
            sites: BTreeMap::new(),
            next_free_bit: 0,
        }
    }
}

/// Persisted mapping from replication site name to its bit in [`SiteMask`],
/// plus the generation id of the log it sits next to.
pub struct SiteIndex {
    path: PathBuf,
    state: Mutex<IndexState>,
}

impl SiteIndex {
    /// Load the index at `path`, creating and persisting a fresh one if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let data = fs::read_to_string(&path)?;
            let state: IndexState = serde_json::from_str(&data)?;
            if state.version != INDEX_VERSION {
                return Err(TxLogError::VersionMismatch {
                    expected: INDEX_VERSION,
                    found: state.version,
                });
            }
            state
        } else {
            let state = IndexState::fresh();
            persist(&path, &state)?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn generation_id(&self) -> Result<Uuid> {
        Ok(self.lock()?.generation_id)
    }

    pub fn sites(&self) -> Result<BTreeMap<String, u8>> {
        Ok(self.lock()?.sites.clone())
    }

    pub fn lookup(&self, site: &str) -> Result<Option<u8>> {
        Ok(self.lock()?.sites.get(site).copied())
    }

    /// Bit for `site`, allocating and persisting the next free one on first use.
    pub fn bit_for(&self, site: &str) -> Result<u8> {
        let mut state = self.lock()?;
        if let Some(bit) = state.sites.get(site) {
            return Ok(*bit);
        }

        if state.next_free_bit as usize >= MAX_SITES {
            return Err(TxLogError::SiteLimitExceeded {
                site: site.to_string(),
                limit: MAX_SITES,
            });
        }

        let bit = state.next_free_bit;
        let mut updated = state.clone();
        updated.sites.insert(site.to_string(), bit);
        updated.next_free_bit = bit + 1;
        persist(&self.path, &updated)?;
        *state = updated;

        info!(site, bit, index = %self.path.display(), "registered replication site");
        Ok(bit)
    }

    pub fn mask_for<'a, I>(&self, sites: I) -> Result<SiteMask>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut mask = SiteMask::EMPTY;
        for site in sites {
            mask = mask.with(self.bit_for(site)?);
        }
        Ok(mask)
    }

    /// Forget every site and issue a new generation id.
    pub fn reset(&self) -> Result<Uuid> {
        let mut state = self.lock()?;
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        let fresh = IndexState::fresh();
        persist(&self.path, &fresh)?;
        *state = fresh;
        Ok(state.generation_id)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, IndexState>> {
        self.state
            .lock()
            .map_err(|_| TxLogError::Poisoned("site index"))
    }
}

fn persist(path: &Path, state: &IndexState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_bits_in_order_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = SiteIndex::open(&path).unwrap();
        assert_eq!(index.bit_for("site-a").unwrap(), 0);
        assert_eq!(index.bit_for("site-b").unwrap(), 1);
        assert_eq!(index.bit_for("site-a").unwrap(), 0);
        let generation = index.generation_id().unwrap();
        drop(index);

        let reopened = SiteIndex::open(&path).unwrap();
        assert_eq!(reopened.lookup("site-b").unwrap(), Some(1));
        assert_eq!(reopened.generation_id().unwrap(), generation);
        assert_eq!(reopened.bit_for("site-c").unwrap(), 2);
    }

    #[test]
    fn rejects_the_sixty_fifth_site() {
        let dir = tempfile::tempdir().unwrap();
        let index = SiteIndex::open(dir.path().join("index.json")).unwrap();

        for i in 0..MAX_SITES {
            assert_eq!(index.bit_for(&format!("site-{i}")).unwrap() as usize, i);
        }
        let err = index.bit_for("one-too-many").unwrap_err();
        assert!(matches!(err, TxLogError::SiteLimitExceeded { limit: 64, .. }));
        assert_eq!(index.lookup("one-too-many").unwrap(), None);
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let state = IndexState {
            version: INDEX_VERSION + 1,
            ..IndexState::fresh()
        };
        fs::write(&path, serde_json::to_string(&state).unwrap()).unwrap();

        let err = SiteIndex::open(&path).err().unwrap();
        assert!(matches!(err, TxLogError::VersionMismatch { found: 2, .. }));
    }

    #[test]
    fn reset_issues_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let index = SiteIndex::open(dir.path().join("index.json")).unwrap();
        index.bit_for("site-a").unwrap();
        let before = index.generation_id().unwrap();

        let after = index.reset().unwrap();
        assert_ne!(before, after);
        assert!(index.sites().unwrap().is_empty());
        assert_eq!(index.bit_for("site-z").unwrap(), 0);
    }

    #[test]
    fn mask_for_combines_bits() {
        let dir = tempfile::tempdir().unwrap();
        let index = SiteIndex::open(dir.path().join("index.json")).unwrap();
        let mask = index.mask_for(["a", "b", "c"]).unwrap();
        assert_eq!(mask, SiteMask(0b111));
    }
}
