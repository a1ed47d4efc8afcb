use crate::config::DEFAULT_MAX_BUNDLE_BYTES;
use crate::error::{BundleError, Result};
use serde_json::Value;
use std::io::Read;

/// Reads one submitted Bundle document from any `Read` source (File, Stdin).
///
/// Only the raw JSON is parsed here; envelope rules are checked by the
/// processor. Sources larger than the configured limit are rejected without
/// being parsed.
pub struct BundleReader<R: Read> {
    source: R,
    max_bytes: usize,
}

impl<R: Read> BundleReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            max_bytes: DEFAULT_MAX_BUNDLE_BYTES,
        }
    }

    pub fn with_limit(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn read(self) -> Result<Value> {
        let limit = self.max_bytes as u64;
        let mut raw = Vec::new();
        self.source.take(limit.saturating_add(1)).read_to_end(&mut raw)?;

        if raw.len() as u64 > limit {
            return Err(BundleError::validation(
                "bundle",
                format!("Bundle exceeds the {} byte size limit", self.max_bytes),
            ));
        }
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(BundleError::validation("bundle", "Bundle missing body"));
        }

        serde_json::from_slice(&raw)
            .map_err(|e| BundleError::validation("bundle", format!("Body is not valid JSON: {}", e)))
    }
}
