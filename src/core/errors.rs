// src/core/errors.rs

//! Defines the primary error type for the entire application.
//!
//! Variants are grouped to match the error-kind taxonomy of the design's
//! error-handling section: transient capacity, routing, auth/bucket,
//! timeout, protocol, and fatal. `kind()` recovers that grouping so callers
//! can apply the right policy (count a stat, retry, close a connection)
//! without matching on every variant.

use std::sync::Arc;
use thiserror::Error;

/// The coarse error-kind groups used to decide a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientCapacity,
    Routing,
    AuthOrBucket,
    Timeout,
    Protocol,
    Fatal,
    NotFound,
}

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("{0}")]
    IoString(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("CLIENT_ERROR {0}")]
    ClientError(String),

    #[error("SERVER_ERROR out of memory")]
    OutOfMemory,

    #[error("SERVER_ERROR wait queue full")]
    WaitQueueFull,

    #[error("SERVER_ERROR connect error cap reached for downstream")]
    ConnectCapReached,

    #[error("not my vbucket")]
    NotMyVbucket { server_index: usize, vbucket: i32 },

    #[error("retries exhausted after {0} attempt(s)")]
    RetriesExhausted(u32),

    #[error("NOAUTH authentication required")]
    AuthRequired,

    #[error("WRONGPASS invalid SASL credentials")]
    InvalidPassword,

    #[error("downstream auth or bucket-select failed for {0}")]
    DownstreamAuthFailed(String),

    #[error("timed out waiting for a downstream reservation")]
    WaitQueueTimeout,

    #[error("timed out connecting to downstream {0}")]
    ConnectTimeout(String),

    #[error("downstream operation timed out")]
    DownstreamTimeout,

    #[error("bucket '{0}' not found")]
    BucketNotFound(String),

    #[error("bucket '{0}' already exists (state: {1})")]
    BucketAlreadyExists(String, String),

    #[error("invalid bucket name '{0}'")]
    InvalidBucketName(String),

    #[error("bucket '{0}' is shutting down")]
    BucketNotRunning(String),

    #[error("failed to load engine module '{0}': {1}")]
    EngineLoadFailed(String, String),

    #[error("pool '{0}' not found")]
    PoolNotFound(String),

    #[error("invalid node locator '{0}', expected 'ketama' or 'vbucket'")]
    InvalidNodeLocator(String),

    #[error("invalid configuration document: {0}")]
    InvalidConfig(String),

    #[error("administrative command rejected: {0}")]
    AdminForbidden(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HiveError::OutOfMemory | HiveError::WaitQueueFull | HiveError::ConnectCapReached => {
                ErrorKind::TransientCapacity
            }
            HiveError::NotMyVbucket { .. } | HiveError::RetriesExhausted(_) => ErrorKind::Routing,
            HiveError::AuthRequired
            | HiveError::InvalidPassword
            | HiveError::DownstreamAuthFailed(_)
            | HiveError::AdminForbidden(_) => ErrorKind::AuthOrBucket,
            HiveError::WaitQueueTimeout
            | HiveError::ConnectTimeout(_)
            | HiveError::DownstreamTimeout => ErrorKind::Timeout,
            HiveError::Protocol(_) | HiveError::ClientError(_) => ErrorKind::Protocol,
            HiveError::BucketNotFound(_) | HiveError::PoolNotFound(_) => ErrorKind::NotFound,
            HiveError::Internal(_) => ErrorKind::Fatal,
            _ => ErrorKind::Protocol,
        }
    }

    /// Renders a protocol-appropriate ASCII reply line for this error, per
    /// the policy table in the error-handling design.
    pub fn to_ascii_reply(&self) -> String {
        match self {
            HiveError::Protocol(_) | HiveError::ClientError(_) => {
                format!("CLIENT_ERROR {self}\r\n")
            }
            HiveError::OutOfMemory => "SERVER_ERROR out of memory storing object\r\n".to_string(),
            HiveError::WaitQueueFull | HiveError::ConnectCapReached => {
                format!("SERVER_ERROR {self}\r\n")
            }
            HiveError::WaitQueueTimeout
            | HiveError::ConnectTimeout(_)
            | HiveError::DownstreamTimeout => format!("SERVER_ERROR {self}\r\n"),
            HiveError::RetriesExhausted(_) | HiveError::NotMyVbucket { .. } => {
                format!("SERVER_ERROR {self}\r\n")
            }
            HiveError::AuthRequired => "CLIENT_ERROR authentication required\r\n".to_string(),
            _ => format!("SERVER_ERROR {self}\r\n"),
        }
    }
}

// Manual Clone because `std::io::Error` is not cloneable; shared via `Arc`.
impl Clone for HiveError {
    fn clone(&self) -> Self {
        match self {
            HiveError::Io(e) => HiveError::Io(Arc::clone(e)),
            HiveError::IoString(s) => HiveError::IoString(s.clone()),
            HiveError::Protocol(s) => HiveError::Protocol(s.clone()),
            HiveError::ClientError(s) => HiveError::ClientError(s.clone()),
            HiveError::OutOfMemory => HiveError::OutOfMemory,
            HiveError::WaitQueueFull => HiveError::WaitQueueFull,
            HiveError::ConnectCapReached => HiveError::ConnectCapReached,
            HiveError::NotMyVbucket {
                server_index,
                vbucket,
            } => HiveError::NotMyVbucket {
                server_index: *server_index,
                vbucket: *vbucket,
            },
            HiveError::RetriesExhausted(n) => HiveError::RetriesExhausted(*n),
            HiveError::AuthRequired => HiveError::AuthRequired,
            HiveError::InvalidPassword => HiveError::InvalidPassword,
            HiveError::DownstreamAuthFailed(s) => HiveError::DownstreamAuthFailed(s.clone()),
            HiveError::WaitQueueTimeout => HiveError::WaitQueueTimeout,
            HiveError::ConnectTimeout(s) => HiveError::ConnectTimeout(s.clone()),
            HiveError::DownstreamTimeout => HiveError::DownstreamTimeout,
            HiveError::BucketNotFound(s) => HiveError::BucketNotFound(s.clone()),
            HiveError::BucketAlreadyExists(s, st) => {
                HiveError::BucketAlreadyExists(s.clone(), st.clone())
            }
            HiveError::InvalidBucketName(s) => HiveError::InvalidBucketName(s.clone()),
            HiveError::BucketNotRunning(s) => HiveError::BucketNotRunning(s.clone()),
            HiveError::EngineLoadFailed(s, e) => HiveError::EngineLoadFailed(s.clone(), e.clone()),
            HiveError::PoolNotFound(s) => HiveError::PoolNotFound(s.clone()),
            HiveError::InvalidNodeLocator(s) => HiveError::InvalidNodeLocator(s.clone()),
            HiveError::InvalidConfig(s) => HiveError::InvalidConfig(s.clone()),
            HiveError::AdminForbidden(s) => HiveError::AdminForbidden(s.clone()),
            HiveError::Internal(s) => HiveError::Internal(s.clone()),
        }
    }
}

impl PartialEq for HiveError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HiveError::Io(a), HiveError::Io(b)) => a.to_string() == b.to_string(),
            (HiveError::IoString(a), HiveError::IoString(b)) => a == b,
            (HiveError::Protocol(a), HiveError::Protocol(b)) => a == b,
            (HiveError::BucketNotFound(a), HiveError::BucketNotFound(b)) => a == b,
            (HiveError::PoolNotFound(a), HiveError::PoolNotFound(b)) => a == b,
            (
                HiveError::NotMyVbucket {
                    server_index: s1,
                    vbucket: v1,
                },
                HiveError::NotMyVbucket {
                    server_index: s2,
                    vbucket: v2,
                },
            ) => s1 == s2 && v1 == v2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for HiveError {
    fn from(e: std::io::Error) -> Self {
        HiveError::Io(Arc::new(e))
    }
}

impl From<String> for HiveError {
    fn from(s: String) -> Self {
        HiveError::IoString(s)
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(e: serde_json::Error) -> Self {
        HiveError::InvalidConfig(e.to_string())
    }
}

impl From<toml::de::Error> for HiveError {
    fn from(e: toml::de::Error) -> Self {
        HiveError::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_groups_match_the_policy_table() {
        assert_eq!(HiveError::OutOfMemory.kind(), ErrorKind::TransientCapacity);
        assert_eq!(
            HiveError::NotMyVbucket {
                server_index: 2,
                vbucket: 37
            }
            .kind(),
            ErrorKind::Routing
        );
        assert_eq!(HiveError::WaitQueueTimeout.kind(), ErrorKind::Timeout);
        assert_eq!(HiveError::AuthRequired.kind(), ErrorKind::AuthOrBucket);
    }

    #[test]
    fn ascii_reply_uses_client_error_for_protocol_violations() {
        let e = HiveError::ClientError("bad command line format".into());
        assert!(e.to_ascii_reply().starts_with("CLIENT_ERROR"));
    }
}
