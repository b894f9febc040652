// src/core/proxy/downstream/conn_set.rs

//! The Downstream Connection Set (§4.D): one slot per server in the
//! routing table, each holding an absent/unavailable-sentinel/live-
//! connection state, with per-server behaviors (timeouts, weights,
//! protocols, credentials) and quiet-binary corking.
//!
//! Generalizes the teacher's per-shard `Arc<DbShard>` array
//! (`core/storage/db/shard.rs`) from "one shard of keyspace" to "one
//! downstream server slot," each independently locked.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::errors::HiveError;
use crate::core::metrics;
use crate::core::protocol::binary::{
    BinaryCodec, BinaryHeader, BinaryRequest, BinaryResponseDecoder, MAGIC_REQUEST, Opcode, Status,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ascii,
    Binary,
}

/// Per-server behavior pushed by the reconfiguration pipeline (§6): host,
/// port, protocol, timeouts, credentials, connect-error policy.
#[derive(Debug, Clone)]
pub struct ServerBehavior {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub connect_timeout: Duration,
    pub downstream_timeout: Duration,
    pub connect_max_errors: u32,
    pub connect_retry_interval: Duration,
    /// SASL username/password for downstream auth; `None` if the pool has
    /// no `saslPassword` configured.
    pub sasl_credentials: Option<(String, String)>,
    pub bucket_select: Option<String>,
}

/// The live/absent/unavailable state of one connection-set slot.
pub enum ConnState {
    Absent,
    /// Connect failed recently; suppressed until `retry_after`.
    Unavailable {
        consecutive_errors: u32,
        retry_after: Instant,
    },
    Live(LiveConnection),
}

pub struct LiveConnection {
    pub stream: TcpStream,
    /// Requests accumulated for quiet opcodes (SETQ/DELETEQ/GETQ), paged
    /// out as a single batch by `uncork`.
    cork_buf: BytesMut,
}

impl LiveConnection {
    /// Appends bytes to the cork buffer instead of writing immediately,
    /// preserving submission order for later `uncork`.
    pub fn cork(&mut self, bytes: &[u8]) {
        self.cork_buf.extend_from_slice(bytes);
    }

    /// Flushes accumulated quiet requests immediately before the next
    /// verbal operation, returning the bytes the caller must now write.
    pub fn uncork(&mut self) -> BytesMut {
        std::mem::take(&mut self.cork_buf)
    }

    pub fn has_corked(&self) -> bool {
        !self.cork_buf.is_empty()
    }
}

/// Performs SASL PLAIN auth and/or bucket-select against a freshly-dialed
/// downstream, per §4.D: "connect is not considered complete until they
/// succeed." A behavior with neither configured is a no-op success.
async fn authenticate(stream: &mut TcpStream, behavior: &ServerBehavior) -> Result<(), HiveError> {
    if let Some((user, password)) = &behavior.sasl_credentials {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&[0]);
        payload.extend_from_slice(user.as_bytes());
        payload.extend_from_slice(&[0]);
        payload.extend_from_slice(password.as_bytes());
        binary_round_trip(
            stream,
            Opcode::SaslAuth,
            Bytes::from_static(b"PLAIN"),
            payload.freeze(),
            behavior.downstream_timeout,
        )
        .await
        .map_err(|_| HiveError::DownstreamAuthFailed(behavior.host.clone()))?;
    }

    if let Some(bucket) = &behavior.bucket_select {
        binary_round_trip(
            stream,
            Opcode::SelectBucket,
            Bytes::copy_from_slice(bucket.as_bytes()),
            Bytes::new(),
            behavior.downstream_timeout,
        )
        .await
        .map_err(|_| HiveError::DownstreamAuthFailed(behavior.host.clone()))?;
    }

    Ok(())
}

/// Writes one binary request and waits for its response, succeeding only on
/// `Status::Success`. Used solely for the connect-time handshake above; the
/// steady-state dispatch path has its own framing in `reservation.rs`.
async fn binary_round_trip(
    stream: &mut TcpStream,
    opcode: Opcode,
    key: Bytes,
    value: Bytes,
    timeout: Duration,
) -> Result<(), HiveError> {
    let req = BinaryRequest {
        header: BinaryHeader {
            magic: MAGIC_REQUEST,
            opcode,
            key_length: key.len() as u16,
            extras_length: 0,
            data_type: 0,
            vbucket_or_status: 0,
            total_body_length: (key.len() + value.len()) as u32,
            opaque: 0,
            cas: 0,
        },
        extras: Bytes::new(),
        key,
        value,
    };

    let mut codec = BinaryCodec::default();
    let mut out = BytesMut::new();
    Encoder::<BinaryRequest>::encode(&mut codec, req, &mut out)?;

    tokio::time::timeout(timeout, async {
        stream.write_all(&out).await.map_err(HiveError::from)?;
        let mut decoder = BinaryResponseDecoder::default();
        let mut buf = BytesMut::new();
        loop {
            if let Some(resp) = decoder.decode(&mut buf)? {
                return if resp.status() == Status::Success {
                    Ok(())
                } else {
                    Err(HiveError::Protocol(format!("handshake rejected: {:?}", resp.status())))
                };
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.map_err(HiveError::from)?;
            if n == 0 {
                return Err(HiveError::DownstreamTimeout);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .map_err(|_| HiveError::DownstreamTimeout)?
}

/// One slot per server; lock held only for the duration of connect/write,
/// not for the lifetime of a reservation's use of the connection (that
/// borrowing discipline lives in the reservation itself per §4.E step 3).
pub struct DownstreamConnSet {
    slots: Vec<Mutex<ConnState>>,
    behaviors: Vec<ServerBehavior>,
}

impl DownstreamConnSet {
    pub fn new(behaviors: Vec<ServerBehavior>) -> Self {
        let slots = behaviors.iter().map(|_| Mutex::new(ConnState::Absent)).collect();
        Self { slots, behaviors }
    }

    pub fn server_count(&self) -> usize {
        self.behaviors.len()
    }

    pub fn behavior(&self, server_index: usize) -> Option<&ServerBehavior> {
        self.behaviors.get(server_index)
    }

    /// Ensures `server_index`'s slot holds a live, authenticated connection,
    /// connecting (and SASL-auth'ing / bucket-selecting) on demand if
    /// absent. Returns an error without mutating the slot state further if
    /// the per-behavior `connect_max_errors` cap is currently enforcing a
    /// retry-interval suppression.
    pub async fn ensure_connected(&self, server_index: usize) -> Result<(), HiveError> {
        let behavior = self
            .behaviors
            .get(server_index)
            .ok_or_else(|| HiveError::Internal(format!("no such server slot {server_index}")))?;
        let slot = self
            .slots
            .get(server_index)
            .ok_or_else(|| HiveError::Internal(format!("no such server slot {server_index}")))?;

        let mut guard = slot.lock().await;
        match &*guard {
            ConnState::Live(_) => return Ok(()),
            ConnState::Unavailable {
                consecutive_errors,
                retry_after,
            } if *consecutive_errors >= behavior.connect_max_errors && Instant::now() < *retry_after => {
                return Err(HiveError::ConnectCapReached);
            }
            _ => {}
        }

        let addr = format!("{}:{}", behavior.host, behavior.port);
        let connect = tokio::time::timeout(behavior.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| HiveError::ConnectTimeout(addr.clone()))?;

        match connect {
            Ok(mut stream) => {
                if let Err(e) = authenticate(&mut stream, behavior).await {
                    let consecutive_errors = match &*guard {
                        ConnState::Unavailable {
                            consecutive_errors, ..
                        } => consecutive_errors + 1,
                        _ => 1,
                    };
                    metrics::DOWNSTREAM_AUTH_FAILURES_TOTAL.inc();
                    let retry_after = if consecutive_errors >= behavior.connect_max_errors {
                        Instant::now() + behavior.connect_retry_interval
                    } else {
                        Instant::now()
                    };
                    *guard = ConnState::Unavailable {
                        consecutive_errors,
                        retry_after,
                    };
                    return Err(e);
                }
                *guard = ConnState::Live(LiveConnection {
                    stream,
                    cork_buf: BytesMut::new(),
                });
                Ok(())
            }
            Err(e) => {
                let consecutive_errors = match &*guard {
                    ConnState::Unavailable {
                        consecutive_errors, ..
                    } => consecutive_errors + 1,
                    _ => 1,
                };
                metrics::DOWNSTREAM_CONNECT_ERRORS_TOTAL
                    .with_label_values(&[&addr])
                    .inc();
                // Only the cap itself starts the suppression window; below
                // it a caller may retry on its very next reservation cycle.
                let retry_after = if consecutive_errors >= behavior.connect_max_errors {
                    Instant::now() + behavior.connect_retry_interval
                } else {
                    Instant::now()
                };
                *guard = ConnState::Unavailable {
                    consecutive_errors,
                    retry_after,
                };
                Err(HiveError::from(e))
            }
        }
    }

    /// Borrows the live connection in `server_index`'s slot for the
    /// duration of one reservation's dispatch + collect step (§4.E), holding
    /// the slot lock only across that borrow rather than the reservation's
    /// entire lifetime.
    pub async fn with_live<F, R>(&self, server_index: usize, f: F) -> Result<R, HiveError>
    where
        F: FnOnce(&mut LiveConnection) -> Pin<Box<dyn Future<Output = Result<R, HiveError>> + Send + '_>>,
    {
        let slot = self
            .slots
            .get(server_index)
            .ok_or_else(|| HiveError::Internal(format!("no such server slot {server_index}")))?;
        let mut guard = slot.lock().await;
        match &mut *guard {
            ConnState::Live(conn) => f(conn).await,
            _ => Err(HiveError::Internal(format!(
                "server slot {server_index} is not connected"
            ))),
        }
    }

    /// Marks `server_index` unavailable, e.g. after a downstream auth
    /// failure (§7 "Auth/bucket" policy: close the downstream, count the
    /// failure).
    pub async fn mark_unavailable(&self, server_index: usize) {
        if let Some(slot) = self.slots.get(server_index) {
            let behavior = self.behaviors.get(server_index);
            let retry_interval = behavior
                .map(|b| b.connect_retry_interval)
                .unwrap_or(Duration::from_secs(1));
            *slot.lock().await = ConnState::Unavailable {
                consecutive_errors: u32::MAX,
                retry_after: Instant::now() + retry_interval,
            };
            metrics::DOWNSTREAM_AUTH_FAILURES_TOTAL.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::binary::BinaryResponse;
    use tokio::net::TcpListener;

    fn behavior(addr: std::net::SocketAddr, sasl: Option<(String, String)>, bucket: Option<String>) -> ServerBehavior {
        ServerBehavior {
            host: addr.ip().to_string(),
            port: addr.port(),
            protocol: Protocol::Ascii,
            connect_timeout: Duration::from_millis(200),
            downstream_timeout: Duration::from_millis(200),
            connect_max_errors: 3,
            connect_retry_interval: Duration::from_millis(50),
            sasl_credentials: sasl,
            bucket_select: bucket,
        }
    }

    /// Reads one binary request off `stream` and replies with `status`.
    async fn respond_once(stream: &mut TcpStream, opcode: Opcode, status: Status) {
        let mut codec = BinaryCodec::default();
        let mut buf = BytesMut::new();
        loop {
            if codec.decode(&mut buf).unwrap().is_some() {
                break;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        let resp = BinaryResponse::new(opcode, status, 0, Bytes::new(), Bytes::new(), Bytes::new());
        let mut out = BytesMut::new();
        Encoder::<BinaryResponse>::encode(&mut codec, resp, &mut out).unwrap();
        stream.write_all(&out).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_connected_marks_live_only_after_sasl_auth_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            respond_once(&mut stream, Opcode::SaslAuth, Status::Success).await;
        });

        let conn_set = DownstreamConnSet::new(vec![behavior(addr, Some(("alice".into(), "secret".into())), None)]);
        conn_set.ensure_connected(0).await.unwrap();
        assert!(conn_set.with_live(0, |_| Box::pin(async { Ok(()) })).await.is_ok());
    }

    #[tokio::test]
    async fn ensure_connected_never_goes_live_when_sasl_auth_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            respond_once(&mut stream, Opcode::SaslAuth, Status::AuthError).await;
        });

        let conn_set = DownstreamConnSet::new(vec![behavior(addr, Some(("alice".into(), "wrong".into())), None)]);
        assert!(conn_set.ensure_connected(0).await.is_err());
        assert!(conn_set.with_live(0, |_| Box::pin(async { Ok(()) })).await.is_err());
    }
}
