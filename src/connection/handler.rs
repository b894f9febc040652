// src/connection/handler.rs

//! Per-connection command loops (§2): the base listener speaks the binary
//! protocol and serves admin opcodes plus direct bucket-engine pass-through
//! once a connection has SELECT_BUCKET-attached a bucket; a pool listener
//! speaks the ASCII protocol and proxies every command downstream through
//! that `Pool`'s reservation machinery (§4.E-H). These are the two parallel
//! listener modes §2 describes, never a chained pipeline between them.
//!
//! Generalizes the teacher's single `ConnectionHandler::run` command loop
//! (one upstream protocol, one local keyspace) into two loops sharing the
//! same `Framed`/codec idiom but dispatching to entirely different cores.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::connection::guard::ConnectionGuard;
use crate::connection::session::SessionState;
use crate::core::admin::{self, AdminAuthState};
use crate::core::bucket::cookie::ConnectionCookie;
use crate::core::bucket::engine::GetResult;
use crate::core::bucket::handle::BucketHandle;
use crate::core::errors::{ErrorKind, HiveError};
use crate::core::metrics;
use crate::core::protocol::WireProtocol;
use crate::core::protocol::ascii::{AsciiCodec, Command, Reply};
use crate::core::protocol::binary::{BinaryCodec, BinaryRequest, BinaryResponse, Opcode, Status};
use crate::core::proxy::pool::Pool;
use crate::core::state::{AppState, ClientInfo};
use crate::core::types::Key;

/// Which of the two listener modes a connection belongs to (§2).
pub enum ListenerRole {
    /// The base/admin listener: binary protocol, admin opcodes, direct
    /// bucket-engine pass-through.
    Base,
    /// A pool listener: ASCII protocol, proxied downstream through this
    /// `Pool`.
    Pool(Arc<Pool>),
}

/// Owns one accepted connection's socket and dispatches it to the command
/// loop matching its `ListenerRole`.
pub struct ConnectionHandler {
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<AppState>,
    role: ListenerRole,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, addr: SocketAddr, state: Arc<AppState>, role: ListenerRole) -> Self {
        Self {
            stream,
            addr,
            state,
            role,
        }
    }

    /// Registers the session, runs its command loop to completion, and
    /// tears the session down via `ConnectionGuard` regardless of how the
    /// loop exits (clean QUIT, protocol error, or the socket closing).
    pub async fn run(self) {
        let ConnectionHandler { stream, addr, state, role } = self;

        let session_id = state.next_session_id();
        let protocol = match &role {
            ListenerRole::Base => WireProtocol::Binary,
            ListenerRole::Pool(_) => WireProtocol::Ascii,
        };
        let session = SessionState::new(session_id, addr, protocol);
        let cookie = Arc::clone(&session.cookie);

        let (shutdown_tx, _rx) = broadcast::channel(1);
        let info = ClientInfo {
            addr,
            session_id,
            name: None,
            created: Instant::now(),
            last_command_time: Instant::now(),
        };
        state.clients.insert(session_id, (Arc::new(Mutex::new(info)), shutdown_tx));
        metrics::CONNECTED_CLIENTS.inc();
        metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
        state.stats.increment_total_connections();

        let _guard = ConnectionGuard::new(Arc::clone(&state), session_id, addr, cookie);

        let result = match role {
            ListenerRole::Base => run_base(stream, &state, &session).await,
            ListenerRole::Pool(pool) => run_pool(stream, &state, &session, &pool).await,
        };

        if let Err(e) = result {
            debug!(addr = %addr, session = session_id, error = %e, "connection loop ended");
        }
    }
}

/// The base listener's command loop: binary framing throughout, admin
/// opcodes gated by SASL, everything else requiring a bucket already
/// attached via SELECT_BUCKET.
async fn run_base(stream: TcpStream, state: &Arc<AppState>, session: &SessionState) -> Result<(), HiveError> {
    let mut framed = Framed::new(stream, BinaryCodec::default());

    while let Some(decoded) = framed.next().await {
        let req = match decoded {
            Ok(req) => req,
            Err(e) => {
                warn!(addr = %session.addr, error = %e, "binary protocol error, closing connection");
                return Err(e);
            }
        };

        if matches!(req.opcode(), Opcode::Quit | Opcode::QuitQ) {
            return Ok(());
        }

        state.stats.increment_total_commands();
        let resp = dispatch_base_request(state, session, &req);
        let suppress = req.opcode().is_quiet() && resp.status() == Status::Success;
        if !suppress {
            framed.send(resp).await?;
        }
    }
    Ok(())
}

fn dispatch_base_request(state: &Arc<AppState>, session: &SessionState, req: &BinaryRequest) -> BinaryResponse {
    let opcode = req.opcode();
    if opcode.is_admin() {
        return admin::dispatch(&state.bucket_registry, &session.cookie, &session.admin_auth, req);
    }

    match opcode {
        Opcode::SaslListMechs => BinaryResponse::new(
            opcode,
            Status::Success,
            req.header.opaque,
            Bytes::new(),
            Bytes::new(),
            Bytes::from_static(b"PLAIN"),
        ),
        Opcode::SaslAuth => handle_sasl_auth(state, &session.admin_auth, req),
        Opcode::SaslStep => error_response(req, Status::UnknownCommand, "multi-step SASL is not supported"),
        Opcode::Noop => BinaryResponse::new(opcode, Status::Success, req.header.opaque, Bytes::new(), Bytes::new(), Bytes::new()),
        _ => dispatch_bucket_op(&session.cookie, req),
    }
}

fn handle_sasl_auth(state: &Arc<AppState>, auth: &AdminAuthState, req: &BinaryRequest) -> BinaryResponse {
    if admin::verify_sasl_plain(&state.admin_credentials, &req.value) {
        auth.mark_authenticated();
        BinaryResponse::new(req.opcode(), Status::Success, req.header.opaque, Bytes::new(), Bytes::new(), Bytes::new())
    } else {
        error_response(req, Status::AuthError, "invalid SASL credentials")
    }
}

fn error_response(req: &BinaryRequest, status: Status, message: &str) -> BinaryResponse {
    BinaryResponse::new(
        req.opcode(),
        status,
        req.header.opaque,
        Bytes::new(),
        Bytes::new(),
        Bytes::copy_from_slice(message.as_bytes()),
    )
}

/// Runs a data-plane binary opcode straight through to the engine vtable of
/// whichever bucket this connection has selected, per §3's dispatch-to-vtable
/// data path. No bucket attached is a protocol error here; the base listener
/// carries no routing of its own.
fn dispatch_bucket_op(cookie: &ConnectionCookie, req: &BinaryRequest) -> BinaryResponse {
    let Some(handle) = cookie.current_bucket() else {
        return error_response(req, Status::AuthError, "no bucket selected; issue SELECT_BUCKET first");
    };

    let guard = match handle.begin_call() {
        Ok(guard) => guard,
        Err(e) => return error_response(req, Status::InvalidArguments, &e.to_string()),
    };
    let resp = run_engine_op(&handle, req);
    drop(guard);
    resp
}

fn run_engine_op(handle: &Arc<BucketHandle>, req: &BinaryRequest) -> BinaryResponse {
    let opcode = req.opcode();
    match opcode {
        Opcode::Get | Opcode::GetQ | Opcode::GetK | Opcode::GetKQ => {
            let key: Key = req.key.clone();
            handle.stats.gets.fetch_add(1, Ordering::Relaxed);
            match handle.with_engine(|e| e.get(&key)) {
                Some(Ok(GetResult { value, flags, cas })) => {
                    handle.stats.hits.fetch_add(1, Ordering::Relaxed);
                    let extras = Bytes::copy_from_slice(&flags.to_be_bytes());
                    let key_out = if matches!(opcode, Opcode::GetK | Opcode::GetKQ) {
                        req.key.clone()
                    } else {
                        Bytes::new()
                    };
                    let mut resp = BinaryResponse::new(opcode, Status::Success, req.header.opaque, extras, key_out, value);
                    resp.header.cas = cas;
                    resp
                }
                Some(Err(_)) | None => {
                    handle.stats.misses.fetch_add(1, Ordering::Relaxed);
                    error_response(req, Status::KeyNotFound, "not found")
                }
            }
        }
        Opcode::Set | Opcode::SetQ | Opcode::Add | Opcode::AddQ | Opcode::Replace => {
            let (flags, exptime) = parse_store_extras(&req.extras);
            let key: Key = req.key.clone();
            match handle.with_engine(|e| e.store(&key, req.value.clone(), flags, exptime)) {
                Some(Ok(cas)) => {
                    handle.stats.sets.fetch_add(1, Ordering::Relaxed);
                    let mut resp = BinaryResponse::new(opcode, Status::Success, req.header.opaque, Bytes::new(), Bytes::new(), Bytes::new());
                    resp.header.cas = cas;
                    resp
                }
                Some(Err(e)) => error_response(req, status_for(&e), &e.to_string()),
                None => error_response(req, Status::InternalError, "no engine loaded"),
            }
        }
        Opcode::Delete | Opcode::DeleteQ => {
            let key: Key = req.key.clone();
            match handle.with_engine(|e| e.remove(&key)) {
                Some(Ok(())) => {
                    handle.stats.deletes.fetch_add(1, Ordering::Relaxed);
                    BinaryResponse::new(opcode, Status::Success, req.header.opaque, Bytes::new(), Bytes::new(), Bytes::new())
                }
                Some(Err(_)) | None => error_response(req, Status::KeyNotFound, "not found"),
            }
        }
        Opcode::Incr | Opcode::IncrQ | Opcode::Decr | Opcode::DecrQ => {
            let delta = req.extras.get(0..8).map(|b| u64::from_be_bytes(b.try_into().unwrap())).unwrap_or(1);
            let incr = matches!(opcode, Opcode::Incr | Opcode::IncrQ);
            let key: Key = req.key.clone();
            match handle.with_engine(|e| e.arithmetic(&key, delta as i64, incr)) {
                Some(Ok(value)) => BinaryResponse::new(
                    opcode,
                    Status::Success,
                    req.header.opaque,
                    Bytes::new(),
                    Bytes::new(),
                    Bytes::copy_from_slice(&value.to_be_bytes()),
                ),
                Some(Err(_)) | None => error_response(req, Status::KeyNotFound, "not found"),
            }
        }
        Opcode::FlushAll | Opcode::FlushQ => match handle.with_engine(|e| e.flush(0)) {
            Some(Ok(())) => BinaryResponse::new(opcode, Status::Success, req.header.opaque, Bytes::new(), Bytes::new(), Bytes::new()),
            _ => error_response(req, Status::InternalError, "no engine loaded"),
        },
        Opcode::Stat => match handle.with_engine(|e| e.aggregate_stats()) {
            Some(stats) => {
                let body = format!("curr_items={} bytes={} evictions={}", stats.curr_items, stats.bytes, stats.evictions);
                BinaryResponse::new(opcode, Status::Success, req.header.opaque, Bytes::new(), Bytes::new(), Bytes::from(body.into_bytes()))
            }
            None => error_response(req, Status::InternalError, "no engine loaded"),
        },
        other => error_response(req, Status::UnknownCommand, &format!("unsupported opcode {other:?}")),
    }
}

fn status_for(e: &HiveError) -> Status {
    match e.kind() {
        ErrorKind::TransientCapacity => Status::OutOfMemory,
        ErrorKind::AuthOrBucket => Status::AuthError,
        ErrorKind::NotFound => Status::KeyNotFound,
        _ => Status::InternalError,
    }
}

/// memcached binary storage extras: a 4-byte flags field followed by a
/// 4-byte expiration, both big-endian.
fn parse_store_extras(extras: &Bytes) -> (u32, u32) {
    let flags = extras.get(0..4).map(|b| u32::from_be_bytes(b.try_into().unwrap())).unwrap_or(0);
    let exptime = extras.get(4..8).map(|b| u32::from_be_bytes(b.try_into().unwrap())).unwrap_or(0);
    (flags, exptime)
}

/// A pool listener's command loop (§4.G): ASCII framing, every command
/// proxied downstream through `pool.execute`, the upstream's session id
/// doubling as the selector §4.F needs to pick a worker's concurrency slot.
async fn run_pool(stream: TcpStream, state: &Arc<AppState>, session: &SessionState, pool: &Arc<Pool>) -> Result<(), HiveError> {
    let mut framed = Framed::new(stream, AsciiCodec::default());

    while let Some(decoded) = framed.next().await {
        let cmd = match decoded {
            Ok(cmd) => cmd,
            Err(e) => {
                framed.send(protocol_error_reply(&e)).await?;
                continue;
            }
        };

        if matches!(cmd, Command::Quit) {
            return Ok(());
        }

        state.stats.increment_total_commands();
        let noreply = command_noreply(&cmd);
        match pool.execute(cmd, session.session_id).await {
            Ok(replies) => {
                if !noreply {
                    for reply in replies {
                        framed.send(reply).await?;
                    }
                }
            }
            Err(e) => {
                if e.kind() == ErrorKind::Timeout {
                    metrics::RESERVATION_TIMEOUTS_TOTAL.inc();
                }
                if !noreply {
                    framed.send(protocol_error_reply(&e)).await?;
                }
            }
        }
    }
    Ok(())
}

fn command_noreply(cmd: &Command) -> bool {
    match cmd {
        Command::Set { noreply, .. }
        | Command::Add { noreply, .. }
        | Command::Replace { noreply, .. }
        | Command::Append { noreply, .. }
        | Command::Prepend { noreply, .. }
        | Command::Delete { noreply, .. }
        | Command::Incr { noreply, .. }
        | Command::Decr { noreply, .. }
        | Command::FlushAll { noreply, .. } => *noreply,
        _ => false,
    }
}

fn protocol_error_reply(e: &HiveError) -> Reply {
    match e.kind() {
        ErrorKind::Protocol => Reply::ClientError(e.to_string()),
        _ => Reply::ServerError(e.to_string()),
    }
}
