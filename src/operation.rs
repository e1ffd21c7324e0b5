//! Operations carried as block payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminator of an [`Operation`].
///
/// `Other` holds a kind this crate does not interpret. It can arrive from a
/// collaborator speaking a newer vocabulary; replay refuses it rather than
/// skipping it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Get,
    Other(String),
}

impl OpKind {
    pub fn as_str(&self) -> &str {
        match self {
            OpKind::Put => "put",
            OpKind::Get => "get",
            OpKind::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub key: String,
    pub value: Option<String>,
}

impl Operation {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Operation {
            kind: OpKind::Put,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Operation {
            kind: OpKind::Get,
            key: key.into(),
            value: None,
        }
    }

    /// Deterministic byte encoding used as digest input.
    ///
    /// Layout: a kind tag (`0` put, `1` get, `2` other followed by the kind
    /// name), the key, then either a `1` marker and the value or a single `0`
    /// marker. Every variable-length field is prefixed with its length as a
    /// little-endian `u32`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.key.len());
        match &self.kind {
            OpKind::Put => out.push(0),
            OpKind::Get => out.push(1),
            OpKind::Other(name) => {
                out.push(2);
                push_field(&mut out, name.as_bytes());
            }
        }
        push_field(&mut out, self.key.as_bytes());
        match &self.value {
            Some(value) => {
                out.push(1);
                push_field(&mut out, value.as_bytes());
            }
            None => out.push(0),
        }
        out
    }
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.kind, &self.value) {
            (OpKind::Put, Some(value)) => write!(f, "Put({}, {})", self.key, value),
            (OpKind::Get, _) => write!(f, "Get({})", self.key),
            (kind, Some(value)) => write!(f, "{}({}, {})", kind.as_str(), self.key, value),
            (kind, None) => write!(f, "{}({})", kind.as_str(), self.key),
        }
    }
}
