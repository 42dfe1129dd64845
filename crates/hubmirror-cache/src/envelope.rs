//! Persisted HTTP response envelopes.
//!
//! An envelope records one upstream response — status, lowercased
//! headers, body — as a single JSON object so a later request can be
//! replayed without contacting the upstream. Writes are atomic-or-absent:
//! the record lands in a temp file first and is renamed into place.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::make_parent_dirs;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("malformed envelope: bad content hex")]
    BadHex(#[from] hex::FromHexError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "content", with = "hex_content")]
    pub content: Vec<u8>,
}

impl Envelope {
    pub fn new(
        status_code: u16,
        headers: impl IntoIterator<Item = (String, String)>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            status_code,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            content,
        }
    }

    /// Case-insensitive header lookup (keys are stored lowercased).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn read(path: &Path) -> Result<Self, EnvelopeError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Writes the envelope via a sibling temp file and rename, so a
    /// crashed write leaves either the old record or nothing.
    pub fn write_atomic(&self, path: &Path) -> Result<(), EnvelopeError> {
        make_parent_dirs(path)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

mod hex_content {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
