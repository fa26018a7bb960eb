use common::NamespaceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{checksum, decode_payload, encode_payload, RecordHeader, HEADER_LEN};
use crate::error::{Result, TxLogError};
use crate::event::{LogEntry, SiteMask, TransactionEvent};
use crate::options::LogOptions;
use crate::site_index::SiteIndex;

pub const LOG_FILE: &str = "transactions.log";
pub const INDEX_FILE: &str = "index.json";

/// Result of one bounded read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBatch {
    pub entries: Vec<LogEntry>,
    /// Resume cursor: just past the last record examined, returned or skipped.
    pub next_offset: u64,
    /// Set when a header did not carry its own position; the writer may be
    /// mid-append, so retry later from `next_offset`.
    pub mismatch_at: Option<u64>,
    #[serde(default)]
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDescription {
    pub namespace: NamespaceId,
    pub generation_id: Uuid,
    pub known_sites: BTreeMap<String, u8>,
    pub size_bytes: u64,
}

/// Append-only add/remove log for one namespace.
///
/// Appends go through the single owned writer handle; reads open their own
/// read-only handle and never take the writer lock. A reader that catches up
/// with an in-flight append sees either a short tail (ignored) or a header
/// whose stored offset disagrees with its position (reported as
/// `mismatch_at`).
pub struct TransactionLog {
    namespace: NamespaceId,
    log_path: PathBuf,
    index: SiteIndex,
    writer: Mutex<Option<File>>,
    max_site_skips: usize,
    sync_appends: bool,
}

impl TransactionLog {
    pub fn open<P: AsRef<Path>>(
        namespace: NamespaceId,
        dir: P,
        options: &LogOptions,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let index = SiteIndex::open(dir.join(INDEX_FILE))?;

        Ok(Self {
            namespace,
            log_path: dir.join(LOG_FILE),
            index,
            writer: Mutex::new(None),
            max_site_skips: options.max_site_skips,
            sync_appends: options.sync_appends,
        })
    }

    pub fn namespace(&self) -> &NamespaceId {
        &self.namespace
    }

    pub fn generation_id(&self) -> Result<Uuid> {
        self.index.generation_id()
    }

    /// Resolve site names into a mask, registering unseen sites.
    pub fn site_mask<'a, I>(&self, sites: I) -> Result<SiteMask>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.index.mask_for(sites)
    }

    /// Append `event` and return the offset its record starts at.
    pub fn append(&self, event: &TransactionEvent) -> Result<u64> {
        let payload = encode_payload(event)?;

        let mut writer = self.writer()?;
        if writer.is_none() {
            *writer = Some(
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(&self.log_path)?,
            );
        }
        let file = writer
            .as_mut()
            .ok_or(TxLogError::Poisoned("transaction log writer"))?;

        let offset = file.seek(SeekFrom::End(0))?;
        let header = RecordHeader::for_payload(offset, &payload)?;
        let mut record = Vec::with_capacity(HEADER_LEN + payload.len());
        record.extend_from_slice(&header.to_bytes());
        record.extend_from_slice(&payload);

        if let Err(err) = file.write_all(&record) {
            // Never leave a torn record in front of the next append.
            if let Err(truncate_err) = file.set_len(offset) {
                warn!(
                    namespace = %self.namespace,
                    offset,
                    error = %truncate_err,
                    "failed to truncate torn record"
                );
            }
            return Err(err.into());
        }
        if self.sync_appends {
            file.sync_data()?;
        }

        debug!(
            namespace = %self.namespace,
            offset,
            payload_len = payload.len(),
            key = %event.key(),
            add = event.is_add(),
            "appended transaction event"
        );
        Ok(offset)
    }

    /// Decode up to `max_count` events starting at `from_offset`.
    ///
    /// With `not_seen_at_site`, events already observed by that site are
    /// skipped (the cursor still moves past them), at most `max_site_skips`
    /// per call.
    pub fn read(
        &self,
        from_offset: u64,
        max_count: usize,
        not_seen_at_site: Option<&str>,
    ) -> Result<ReadBatch> {
        let site_bit = match not_seen_at_site {
            Some(site) => Some(self.index.bit_for(site)?),
            None => None,
        };

        let file = match File::open(&self.log_path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TxLogError::EmptyLog {
                    namespace: self.namespace.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(from_offset))?;

        let mut batch = ReadBatch {
            next_offset: from_offset,
            ..ReadBatch::default()
        };
        let mut pos = from_offset;

        while batch.entries.len() < max_count {
            if pos + HEADER_LEN as u64 > file_len {
                break;
            }

            let mut raw_header = [0u8; HEADER_LEN];
            reader.read_exact(&mut raw_header)?;
            let header = RecordHeader::from_bytes(&raw_header);

            if header.offset != pos as i64 {
                debug!(
                    namespace = %self.namespace,
                    position = pos,
                    header_offset = header.offset,
                    "record header does not match its position"
                );
                batch.mismatch_at = Some(pos);
                break;
            }
            if header.payload_len < 0 {
                return Err(TxLogError::Decode {
                    offset: pos,
                    reason: format!("negative payload length {}", header.payload_len),
                });
            }

            let payload_len = header.payload_len as usize;
            let record_end = pos + (HEADER_LEN + payload_len) as u64;
            if record_end > file_len {
                // Header landed, payload still being written.
                break;
            }

            let mut payload = vec![0u8; payload_len];
            reader.read_exact(&mut payload)?;
            let actual = checksum(&payload);
            if actual != header.checksum {
                return Err(TxLogError::ChecksumMismatch {
                    offset: pos,
                    expected: hex::encode(header.checksum),
                    actual: hex::encode(actual),
                });
            }

            let event = decode_payload(&payload, pos)?;
            let offset = pos;
            pos = record_end;
            batch.next_offset = pos;

            if let Some(bit) = site_bit {
                if event.sites().contains(bit) {
                    batch.skipped += 1;
                    if batch.skipped >= self.max_site_skips {
                        break;
                    }
                    continue;
                }
            }

            batch.entries.push(LogEntry {
                offset,
                next_offset: record_end,
                event,
            });
        }

        Ok(batch)
    }

    /// Delete the log and its index, starting over under a new generation.
    pub fn drop_log(&self) -> Result<Uuid> {
        let mut writer = self.writer()?;
        *writer = None;

        match fs::remove_file(&self.log_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let generation = self.index.reset()?;

        info!(namespace = %self.namespace, generation = %generation, "transaction log dropped");
        Ok(generation)
    }

    pub fn describe(&self) -> Result<LogDescription> {
        Ok(LogDescription {
            namespace: self.namespace.clone(),
            generation_id: self.index.generation_id()?,
            known_sites: self.index.sites()?,
            size_bytes: self.size_bytes()?,
        })
    }

    pub fn size_bytes(&self) -> Result<u64> {
        match fs::metadata(&self.log_path) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn writer(&self) -> Result<MutexGuard<'_, Option<File>>> {
        self.writer
            .lock()
            .map_err(|_| TxLogError::Poisoned("transaction log writer"))
    }
}
