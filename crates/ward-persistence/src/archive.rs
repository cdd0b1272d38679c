//! ---
//! ward_section: "03-persistence-logging"
//! ward_subsection: "module"
//! ward_type: "source"
//! ward_scope: "code"
//! ward_description: "Backup blob encoding: CBOR payload, gzip body, SHA-256 header."
//! ward_version: "v0.0.0-prealpha"
//! ward_owner: "tbd"
//! ---
//! Blob layout:
//!
//! ```text
//! +----------+----------------------+------------------+
//! | WARDBK01 | 64 hex checksum bytes | gzip(cbor(body)) |
//! +----------+----------------------+------------------+
//! ```
//!
//! The checksum covers the compressed body and is verified before any
//! decompression happens.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::index::BackupKind;
use crate::model::DataSnapshot;
use crate::BackupError;

/// Current payload schema version.
pub const SCHEMA_VERSION: u32 = 1;
pub const MAGIC: &[u8; 8] = b"WARDBK01";
pub const CHECKSUM_LEN: usize = 64;
pub const HEADER_LEN: usize = MAGIC.len() + CHECKSUM_LEN;

/// Describes the snapshot stored in a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub app_version: String,
    pub kind: BackupKind,
}

/// Versioned unit written to and read from a backup blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub metadata: BackupMetadata,
    pub data: DataSnapshot,
}

impl BackupPayload {
    pub fn new(kind: BackupKind, app_version: impl Into<String>, data: DataSnapshot) -> Self {
        Self {
            metadata: BackupMetadata {
                schema_version: SCHEMA_VERSION,
                created_at: Utc::now(),
                app_version: app_version.into(),
                kind,
            },
            data,
        }
    }
}

/// Encoded blob plus the checksum recorded in the manifest.
#[derive(Debug, Clone)]
pub struct EncodedArchive {
    pub bytes: Vec<u8>,
    pub checksum: String,
}

/// Serialize, compress, and checksum a payload.
pub fn encode(payload: &BackupPayload) -> Result<EncodedArchive, BackupError> {
    let serialized = serde_cbor::to_vec(payload).map_err(BackupError::Encode)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&serialized)?;
    let body = encoder.finish()?;
    let checksum = sha256_hex(&body);

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(checksum.as_bytes());
    bytes.extend_from_slice(&body);
    Ok(EncodedArchive { bytes, checksum })
}

/// Verify and decode a blob. When `expected_checksum` is given, the manifest
/// value must match as well as the header.
pub fn decode(bytes: &[u8], expected_checksum: Option<&str>) -> Result<BackupPayload, BackupError> {
    let (header_checksum, body) = split(bytes)?;
    let actual = sha256_hex(body);
    if actual != header_checksum {
        return Err(BackupError::Corrupted(format!(
            "body checksum {actual} does not match header {header_checksum}"
        )));
    }
    if let Some(expected) = expected_checksum {
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(BackupError::Corrupted(format!(
                "body checksum {actual} does not match manifest {expected}"
            )));
        }
    }

    let mut serialized = Vec::new();
    GzDecoder::new(body)
        .read_to_end(&mut serialized)
        .map_err(|err| BackupError::Corrupted(format!("decompression failed: {err}")))?;
    let payload: BackupPayload = serde_cbor::from_slice(&serialized).map_err(BackupError::Decode)?;
    if payload.metadata.schema_version > SCHEMA_VERSION {
        return Err(BackupError::UnsupportedSchema(payload.metadata.schema_version));
    }
    Ok(payload)
}

/// Read only the header checksum of the blob at `path`.
pub fn read_header_checksum(path: &Path) -> Result<String, BackupError> {
    let mut header = [0u8; HEADER_LEN];
    File::open(path)?
        .read_exact(&mut header)
        .map_err(|err| BackupError::Corrupted(format!("truncated header: {err}")))?;
    let (checksum, _) = split(&header)?;
    Ok(checksum.to_owned())
}

fn split(bytes: &[u8]) -> Result<(&str, &[u8]), BackupError> {
    if bytes.len() < HEADER_LEN {
        return Err(BackupError::Corrupted(format!(
            "blob is {} bytes, shorter than the {HEADER_LEN} byte header",
            bytes.len()
        )));
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(BackupError::Corrupted("bad magic".into()));
    }
    let checksum = std::str::from_utf8(&bytes[MAGIC.len()..HEADER_LEN])
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
        .ok_or_else(|| BackupError::Corrupted("header checksum is not hex".into()))?;
    Ok((checksum, &bytes[HEADER_LEN..]))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Project;

    fn payload() -> BackupPayload {
        BackupPayload::new(
            BackupKind::Manual,
            "test",
            DataSnapshot {
                projects: vec![Project::new("Alpha"), Project::new("Beta")],
                ..Default::default()
            },
        )
    }

    #[test]
    fn decode_reverses_encode() {
        let payload = payload();
        let encoded = encode(&payload).unwrap();
        assert_eq!(encoded.checksum.len(), CHECKSUM_LEN);
        let decoded = decode(&encoded.bytes, Some(&encoded.checksum)).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn every_flipped_byte_is_reported_as_corruption() {
        let encoded = encode(&payload()).unwrap();
        for position in (0..encoded.bytes.len()).step_by(7) {
            let mut bytes = encoded.bytes.clone();
            bytes[position] ^= 0x01;
            let err = decode(&bytes, Some(&encoded.checksum)).unwrap_err();
            assert!(err.is_corruption(), "byte {position}: {err}");
        }
    }

    #[test]
    fn truncated_blob_is_corruption() {
        let encoded = encode(&payload()).unwrap();
        let err = decode(&encoded.bytes[..20], None).unwrap_err();
        assert!(err.is_corruption());
    }
}
