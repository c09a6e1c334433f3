//! Key layout for the fjall keyspace.
//!
//! Partition structure:
//! - `jobs`: job:{uuid} -> Job record (JSON)
//! - `metadata`: meta:{key} -> value (string)

use uuid::Uuid;

/// Encode a job key: job:{uuid}
pub fn encode_job_key(id: &Uuid) -> Vec<u8> {
    format!("job:{id}").into_bytes()
}

/// Decode a job key: job:{uuid} -> uuid
pub fn decode_job_key(key: &[u8]) -> Option<Uuid> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix("job:")?.parse().ok()
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{key}").into_bytes()
}
