//! Pluggable blob compression.
//!
//! A compressed blob is stored as a tagged wrapper so future reads can
//! recognize it: `{"compressed": true, "codec": "gzip", "payload": "<base64>"}`.
//! Unwrapping is lenient: anything that fails to decode falls back to the
//! raw blob, since an unreadable wrapper is indistinguishable from a plain
//! record that happens to carry the same fields.

use crate::core::{Result, SyncError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::warn;
use serde_json::{Value, json};
use std::io::{Read, Write};

pub const COMPRESSED_FIELD: &str = "compressed";
pub const CODEC_FIELD: &str = "codec";
pub const PAYLOAD_FIELD: &str = "payload";

pub trait Compressor: Send + Sync {
    fn codec(&self) -> &'static str;
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, raw: &[u8]) -> Result<Vec<u8>>;
}

/// Gzip via `flate2`, the default codec.
pub struct GzipCompressor {
    level: Compression,
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl GzipCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Compressor for GzipCompressor {
    fn codec(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(raw)
            .and_then(|_| encoder.finish())
            .map_err(|err| SyncError::Compression(format!("gzip encode: {}", err)))
    }

    fn decompress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(raw);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|err| SyncError::Compression(format!("gzip decode: {}", err)))?;
        Ok(out)
    }
}

pub fn is_wrapped(blob: &Value) -> bool {
    blob.get(COMPRESSED_FIELD).and_then(Value::as_bool) == Some(true)
        && blob.get(PAYLOAD_FIELD).is_some_and(Value::is_string)
}

/// Serialize and compress a record into the tagged wrapper.
pub fn wrap(record: &Value, compressor: &dyn Compressor) -> Result<Value> {
    let raw = serde_json::to_vec(record)?;
    let compressed = compressor.compress(&raw)?;
    Ok(json!({
        COMPRESSED_FIELD: true,
        CODEC_FIELD: compressor.codec(),
        PAYLOAD_FIELD: BASE64.encode(compressed),
    }))
}

/// Undo [`wrap`] if `blob` is a tagged wrapper; otherwise return the blob
/// unchanged. Decode failures fall back to the raw blob with a warning.
pub fn unwrap(blob: Value, compressor: Option<&dyn Compressor>) -> Value {
    if !is_wrapped(&blob) {
        return blob;
    }
    let Some(compressor) = compressor else {
        warn!("compressed blob encountered but no compressor configured; using raw blob");
        return blob;
    };

    match try_unwrap(&blob, compressor) {
        Ok(record) => record,
        Err(err) => {
            warn!("failed to decode compressed blob, using raw blob: {}", err);
            blob
        }
    }
}

fn try_unwrap(blob: &Value, compressor: &dyn Compressor) -> Result<Value> {
    let codec = blob.get(CODEC_FIELD).and_then(Value::as_str).unwrap_or("");
    if !codec.is_empty() && codec != compressor.codec() {
        return Err(SyncError::Compression(format!(
            "codec mismatch: blob is '{}', compressor is '{}'",
            codec,
            compressor.codec()
        )));
    }

    let payload = blob
        .get(PAYLOAD_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Compression("wrapper has no payload".to_string()))?;
    let compressed = BASE64
        .decode(payload)
        .map_err(|err| SyncError::Compression(format!("base64 decode: {}", err)))?;
    let raw = compressor.decompress(&compressed)?;
    Ok(serde_json::from_slice(&raw)?)
}
