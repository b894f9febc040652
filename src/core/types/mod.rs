// src/core/types/mod.rs

use crate::core::HiveError;
use bytes::Bytes;

/// A memcached key or value, stored as raw bytes throughout the core.
pub type Key = Bytes;

pub trait BytesExt {
    fn string_from_bytes(&self) -> Result<String, HiveError>;
    fn to_uppercase_string(&self) -> String;
}

impl BytesExt for Bytes {
    fn string_from_bytes(&self) -> Result<String, HiveError> {
        String::from_utf8(self.to_vec()).map_err(|_| HiveError::Protocol("invalid UTF-8".into()))
    }

    fn to_uppercase_string(&self) -> String {
        String::from_utf8_lossy(self).to_uppercase()
    }
}
