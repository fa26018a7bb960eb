use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

pub mod policy;
pub mod traits;
pub use policy::{CleanupStrategy, NamespacePolicy, PolicyError, StaticPolicyResolver};

/// Width of a blob content hash in bytes.
pub const BLOB_ID_LEN: usize = 20;

/// Isolated logical collection of objects with its own transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub String);

impl NamespaceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespaces name on-disk directories, so they must not escape the log root.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && !self.0.starts_with('.')
            && !self.0.contains(['/', '\\', '\0'])
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NamespaceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NamespaceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(pub String);

impl BucketId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical object inside a namespace: bucket plus object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub bucket: BucketId,
    pub name: String,
}

impl ObjectKey {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: BucketId::new(bucket),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.name)
    }
}

/// Content hash identifying an immutable blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobId([u8; BLOB_ID_LEN]);

impl BlobId {
    pub fn from_bytes(bytes: [u8; BLOB_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the id of a payload: the first 20 bytes of its BLAKE3 digest.
    pub fn of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; BLOB_ID_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..BLOB_ID_LEN]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BLOB_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.to_hex())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for BlobId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s)?;
        let bytes: [u8; BLOB_ID_LEN] = decoded.try_into().map_err(|raw: Vec<u8>| {
            anyhow::anyhow!(
                "blob id must be {} bytes, got {}",
                BLOB_ID_LEN,
                raw.len()
            )
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for BlobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A blob as reported by blob-store enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobListing {
    pub blob: BlobId,
    pub last_modified: SystemTime,
}

/// Current object record held by the reference store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub namespace: NamespaceId,
    pub key: ObjectKey,
    pub blobs: Vec<BlobId>,
    pub last_access: SystemTime,
}

/// Every (namespace, object) pair currently pointing at a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub blob: BlobId,
    pub references: Vec<(NamespaceId, ObjectKey)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_id_hex_roundtrip() {
        let id = BlobId::of(b"payload");
        let parsed: BlobId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_hex().len(), BLOB_ID_LEN * 2);
    }

    #[test]
    fn blob_id_rejects_wrong_width() {
        let err = "abcd".parse::<BlobId>().unwrap_err();
        assert!(err.to_string().contains("20 bytes"));
    }

    #[test]
    fn blob_id_serializes_as_hex_string() {
        let id = BlobId::from_bytes([7u8; BLOB_ID_LEN]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(BLOB_ID_LEN)));
        let back: BlobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn namespace_path_safety() {
        assert!(NamespaceId::new("assets-prod").is_path_safe());
        assert!(!NamespaceId::new("").is_path_safe());
        assert!(!NamespaceId::new("../etc").is_path_safe());
        assert!(!NamespaceId::new("a/b").is_path_safe());
        assert!(!NamespaceId::new(".hidden").is_path_safe());
    }

    #[test]
    fn object_key_display() {
        let key = ObjectKey::new("textures", "rock.png");
        assert_eq!(key.to_string(), "textures/rock.png");
    }
}
