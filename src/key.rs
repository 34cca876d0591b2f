// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage key grammar: `entity[:id[:subkey]]`.
//!
//! `entity` selects a logical collection, `id` a single member, `subkey` a
//! nested slice (`project:abc-123:wbs`). Components are percent-encoded so
//! arbitrary identifiers survive the `:` separator.

use crate::error::StorageError;
use std::fmt;

/// Parsed form of a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub entity: String,
    pub id: Option<String>,
    pub subkey: Option<String>,
}

impl StorageKey {
    /// Collection-level key (`projects`).
    pub fn entity(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: None,
            subkey: None,
        }
    }

    /// Record-level key (`project:abc-123`).
    pub fn record(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: Some(id.into()),
            subkey: None,
        }
    }

    /// Parse a raw key, percent-decoding each component.
    ///
    /// Rejects empty keys, empty components, and more than three components.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        if raw.is_empty() {
            return Err(StorageError::InvalidKey(raw.to_string()));
        }
        let mut parts = raw.split(':');
        let entity = parts.next().unwrap_or_default();
        let id = parts.next();
        let subkey = parts.next();
        if parts.next().is_some() {
            return Err(StorageError::InvalidKey(raw.to_string()));
        }
        if entity.is_empty() || id == Some("") || subkey == Some("") {
            return Err(StorageError::InvalidKey(raw.to_string()));
        }
        Ok(Self {
            entity: decode(entity).ok_or_else(|| StorageError::InvalidKey(raw.to_string()))?,
            id: id
                .map(|s| decode(s).ok_or_else(|| StorageError::InvalidKey(raw.to_string())))
                .transpose()?,
            subkey: subkey
                .map(|s| decode(s).ok_or_else(|| StorageError::InvalidKey(raw.to_string())))
                .transpose()?,
        })
    }

    /// True for collection-level keys (`projects` as opposed to `project:p1`).
    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", encode(&self.entity))?;
        if let Some(id) = &self.id {
            write!(f, ":{}", encode(id))?;
        }
        if let Some(sub) = &self.subkey {
            write!(f, ":{}", encode(sub))?;
        }
        Ok(())
    }
}

/// Validate a raw key without keeping the parsed form.
pub fn sanitize(raw: &str) -> Result<String, StorageError> {
    Ok(StorageKey::parse(raw)?.to_string())
}

const UNRESERVED: &[u8] = b"-_.~";

fn encode(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        if byte.is_ascii_alphanumeric() || UNRESERVED.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode(component: &str) -> Option<String> {
    let bytes = component.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hi = (hex[0] as char).to_digit(16)?;
            let lo = (hex[1] as char).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
