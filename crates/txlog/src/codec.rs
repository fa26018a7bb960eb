//! On-disk record framing.
//!
//! A record is a fixed 28-byte header followed by the event payload:
//!
//! ```text
//! offset: i64 LE | checksum: [u8; 16] | payload_len: i32 LE | payload
//! ```
//!
//! The payload starts with an op byte (Add = 0, Remove = 1), then the object
//! name, bucket (varint-length-prefixed UTF-8) and the site mask (u64 LE).
//! Adds continue with a blob count byte, the 20-byte blob hashes, a metadata
//! length (i32 LE, -1 when absent) and the metadata bytes.

use bytes::Bytes;
use common::{BlobId, BucketId, ObjectKey, BLOB_ID_LEN};

use crate::error::{Result, TxLogError};
use crate::event::{SiteMask, TransactionEvent};

pub const HEADER_LEN: usize = 8 + CHECKSUM_LEN + 4;
pub const CHECKSUM_LEN: usize = 16;

const OP_ADD: u8 = 0;
const OP_REMOVE: u8 = 1;
const MAX_BLOBS_PER_EVENT: usize = u8::MAX as usize;
const NO_METADATA: i32 = -1;

/// BLAKE3 of the payload, truncated to 128 bits.
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = blake3::hash(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub offset: i64,
    pub checksum: [u8; CHECKSUM_LEN],
    pub payload_len: i32,
}

impl RecordHeader {
    pub fn for_payload(offset: u64, payload: &[u8]) -> Result<Self> {
        let payload_len = i32::try_from(payload.len())
            .map_err(|_| TxLogError::Encode(format!("payload of {} bytes", payload.len())))?;
        Ok(Self {
            offset: offset as i64,
            checksum: checksum(payload),
            payload_len,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..8 + CHECKSUM_LEN].copy_from_slice(&self.checksum);
        buf[8 + CHECKSUM_LEN..].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[..8]);
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(&buf[8..8 + CHECKSUM_LEN]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&buf[8 + CHECKSUM_LEN..]);
        Self {
            offset: i64::from_le_bytes(offset),
            checksum,
            payload_len: i32::from_le_bytes(len),
        }
    }
}

pub fn encode_payload(event: &TransactionEvent) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    let key = event.key();

    buf.push(if event.is_add() { OP_ADD } else { OP_REMOVE });
    write_string(&mut buf, &key.name);
    write_string(&mut buf, key.bucket.as_str());
    buf.extend_from_slice(&event.sites().bits().to_le_bytes());

    if let TransactionEvent::Add {
        blobs, metadata, ..
    } = event
    {
        if blobs.len() > MAX_BLOBS_PER_EVENT {
            return Err(TxLogError::Encode(format!(
                "{} blobs exceeds the per-event limit of {}",
                blobs.len(),
                MAX_BLOBS_PER_EVENT
            )));
        }
        buf.push(blobs.len() as u8);
        for blob in blobs {
            buf.extend_from_slice(blob.as_bytes());
        }
        match metadata {
            Some(meta) => {
                let len = i32::try_from(meta.len()).map_err(|_| {
                    TxLogError::Encode(format!("metadata of {} bytes", meta.len()))
                })?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(meta);
            }
            None => buf.extend_from_slice(&NO_METADATA.to_le_bytes()),
        }
    }

    Ok(buf)
}

/// Decode a checksum-verified payload. `offset` is only used for error context.
pub fn decode_payload(payload: &[u8], offset: u64) -> Result<TransactionEvent> {
    let mut reader = PayloadReader::new(payload);
    decode_inner(&mut reader).map_err(|reason| TxLogError::Decode { offset, reason })
}

fn decode_inner(reader: &mut PayloadReader<'_>) -> std::result::Result<TransactionEvent, String> {
    let op = reader.u8()?;
    let name = reader.string()?;
    let bucket = reader.string()?;
    let sites = SiteMask(reader.u64()?);
    let key = ObjectKey {
        bucket: BucketId(bucket),
        name,
    };

    let event = match op {
        OP_ADD => {
            let count = reader.u8()? as usize;
            let mut blobs = Vec::with_capacity(count);
            for _ in 0..count {
                let mut hash = [0u8; BLOB_ID_LEN];
                hash.copy_from_slice(reader.take(BLOB_ID_LEN)?);
                blobs.push(BlobId::from_bytes(hash));
            }
            let meta_len = reader.i32()?;
            let metadata = match meta_len {
                NO_METADATA => None,
                len if len < 0 => return Err(format!("negative metadata length {len}")),
                len => Some(Bytes::copy_from_slice(reader.take(len as usize)?)),
            };
            TransactionEvent::Add {
                key,
                blobs,
                sites,
                metadata,
            }
        }
        OP_REMOVE => TransactionEvent::Remove { key, sites },
        other => return Err(format!("unknown op type {other}")),
    };

    if reader.remaining() != 0 {
        return Err(format!("{} trailing bytes", reader.remaining()));
    }
    Ok(event)
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    let mut len = value.len() as u64;
    loop {
        let byte = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
    buf.extend_from_slice(value.as_bytes());
}

struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        if self.remaining() < n {
            return Err(format!(
                "truncated payload: wanted {n} bytes at {}, {} left",
                self.pos,
                self.remaining()
            ));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> std::result::Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn i32(&mut self) -> std::result::Result<i32, String> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    fn varint(&mut self) -> std::result::Result<u64, String> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err("string length varint too long".to_string())
    }

    fn string(&mut self) -> std::result::Result<String, String> {
        let len = self.varint()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|err| format!("invalid utf-8 string: {err}"))
    }
}
