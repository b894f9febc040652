// src/core/proxy/downstream/reservation.rs

//! The Downstream Reservation (§4.E): the Acquire -> Bind -> Dispatch ->
//! Collect -> Retry -> Release lifecycle for one upstream operation, drawn
//! against the connection set (D) and cooperating with the front cache (B)
//! and multiget de-duplicator (C).
//!
//! Three independent timers bound a reservation: the wait-queue timer
//! (acquiring a connection slot, below), the connect timer (owned by
//! `DownstreamConnSet::ensure_connected`), and the downstream operation timer
//! (the round trip once a request is on the wire). Each surfaces as its own
//! `HiveError` timeout variant so a caller can apply the right policy without
//! inspecting which timer fired.
//!
//! Generalizes the teacher's per-command dispatch loop
//! (`core/commands/dispatch.rs`) from "run one command against the local
//! keyspace" to "run one command against a remote, possibly-retried,
//! possibly-fanned-out downstream server."

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::errors::HiveError;
use crate::core::metrics;
use crate::core::protocol::ascii::{AsciiCodec, Command, Reply, ReplyDecoder};
use crate::core::protocol::binary::{
    BinaryCodec, BinaryHeader, BinaryRequest, BinaryResponseDecoder, MAGIC_REQUEST, Opcode, Status,
};
use crate::core::proxy::downstream::conn_set::{DownstreamConnSet, Protocol};
use crate::core::proxy::front_cache::{AdmissionMatcher, FrontCache};
use crate::core::proxy::multiget::MultigetMap;
use crate::core::proxy::selector::ServerSelector;

/// Coarse operation category (§4.E step 3: routed vs. broadcast dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Arithmetic,
    Broadcast,
}

impl OpKind {
    pub fn of(cmd: &Command) -> Self {
        match cmd {
            Command::Get { .. } | Command::Gets { .. } | Command::Version => OpKind::Read,
            Command::Set { .. }
            | Command::Add { .. }
            | Command::Replace { .. }
            | Command::Append { .. }
            | Command::Prepend { .. }
            | Command::Delete { .. } => OpKind::Write,
            Command::Incr { .. } | Command::Decr { .. } => OpKind::Arithmetic,
            Command::FlushAll { .. } | Command::Stats { .. } => OpKind::Broadcast,
            Command::Quit => OpKind::Read,
        }
    }
}

/// One pool's worth of routing and connection state. Fields are owned
/// (`ServerSelector` is a cheap `Arc<ArcSwap<_>>` handle, `conn_set` and
/// `front_cache` are `Arc`s shared with the `Pool`) so a reservation can be
/// handed to a detached task for SET-optimization's fire-and-forget
/// downstream write (§4.E) without borrowing from the pool across an
/// `.await` the pool itself doesn't wait on.
#[derive(Clone)]
pub struct DownstreamReservation {
    pub selector: ServerSelector,
    pub conn_set: Arc<DownstreamConnSet>,
    pub front_cache: Option<Arc<FrontCache>>,
    pub wait_queue_timeout: Duration,
    pub downstream_timeout: Duration,
    pub max_retries: u32,
    /// Front-cache entry TTL in milliseconds, applied as the exptime on
    /// every cache insert this reservation performs (§8 scenario 4).
    pub front_cache_lifespan_ms: i64,
    /// SET-optimization admission (§4.E): a SET whose key this matcher
    /// admits replies STORED to the upstream immediately, with the actual
    /// downstream write continuing in the background.
    pub optimize_set: AdmissionMatcher,
}

impl DownstreamReservation {
    /// Runs `cmd` to completion, returning every reply line it should
    /// produce to the upstream (more than one only for multiget and
    /// broadcast operations).
    pub async fn execute(&self, cmd: Command, upstream_id: u64) -> Result<Vec<Reply>, HiveError> {
        match &cmd {
            Command::Get { keys } | Command::Gets { keys } if keys.len() > 1 => {
                self.execute_multiget(keys.clone(), upstream_id).await
            }
            Command::Get { keys } | Command::Gets { keys } => {
                let key = keys.first().cloned().ok_or_else(|| {
                    HiveError::ClientError("get requires at least one key".into())
                })?;
                self.execute_get(key).await
            }
            Command::FlushAll { delay, .. } => self.execute_flush_all(*delay).await,
            Command::Stats { arg } => self.execute_stats(arg.clone()).await,
            Command::Set { key, .. } if self.admits_optimize_set(key) => {
                Ok(vec![self.execute_set_optimized(cmd).await])
            }
            _ => {
                let key = cmd
                    .keys()
                    .into_iter()
                    .next()
                    .ok_or_else(|| HiveError::Internal("command carries no key".into()))?;
                let reply = self.execute_single(cmd, &key).await?;
                Ok(vec![reply])
            }
        }
    }

    /// Single-key GET: checks the front cache first (B), falling through to
    /// a routed downstream round trip and populating the cache on a hit.
    async fn execute_get(&self, key: Bytes) -> Result<Vec<Reply>, HiveError> {
        if let Some(cache) = self.front_cache.as_deref()
            && let Ok(key_str) = std::str::from_utf8(&key)
            && let Some(item) = cache.get(key_str)
        {
            return Ok(vec![
                Reply::Value {
                    key,
                    flags: item.flags,
                    data: item.value,
                    cas: None,
                },
                Reply::End,
            ]);
        }

        let reply = self
            .execute_single(Command::Get { keys: vec![key.clone()] }, &key)
            .await?;
        if let (Reply::Value { flags, data, .. }, Some(cache)) = (&reply, self.front_cache.as_deref())
            && let Ok(key_str) = std::str::from_utf8(&key)
        {
            cache.set(key_str, data.clone(), *flags, self.front_cache_lifespan_ms, false);
        }
        Ok(vec![reply, Reply::End])
    }

    /// Multiget (§4.C): dedupes keys into a `MultigetMap`, groups the unique
    /// keys by the server each routes to, and dispatches one `get` per
    /// server rather than one round trip per key. A shard that comes back
    /// not-my-vbucket has its routing entry invalidated and its still-
    /// outstanding keys re-dispatched on the next pass, bounded by
    /// `max_retries`, mirroring `execute_single`'s per-key retry (§4.E step
    /// 5, §4.C).
    async fn execute_multiget(&self, keys: Vec<Bytes>, upstream_id: u64) -> Result<Vec<Reply>, HiveError> {
        let mut map = MultigetMap::new();
        for key in &keys {
            map.record(key.clone(), upstream_id, None);
        }

        let mut replies = Vec::new();

        for _ in 0..=self.max_retries {
            let outstanding = map.outstanding_keys();
            if outstanding.is_empty() {
                break;
            }

            let mut by_server: std::collections::HashMap<usize, Vec<Bytes>> = std::collections::HashMap::new();
            for key in outstanding {
                let (server_index, _) = self.selector.select(&key);
                by_server.entry(server_index).or_default().push(key);
            }

            let mut any_nmv = false;
            for (server_index, server_keys) in by_server {
                let protocol = self
                    .conn_set
                    .behavior(server_index)
                    .map(|b| b.protocol)
                    .unwrap_or(Protocol::Ascii);

                let batch = if protocol == Protocol::Binary {
                    self.try_once_binary_multiget(&server_keys, server_index).await
                } else {
                    let cmd = Command::Get { keys: server_keys.clone() };
                    self.try_once(&cmd, server_index).await
                };

                let batch = match batch {
                    Ok(batch) => batch,
                    Err(e) => {
                        // A single server's failure doesn't fail the whole
                        // multiget; its keys simply count as misses below.
                        metrics::DOWNSTREAM_RETRIES_TOTAL.inc();
                        let _ = e;
                        continue;
                    }
                };

                if batch.iter().any(is_not_my_vbucket) {
                    any_nmv = true;
                    for key in &server_keys {
                        let (s, vbucket) = self.selector.select(key);
                        self.selector.invalidate(s, vbucket);
                    }
                    metrics::DOWNSTREAM_RETRIES_TOTAL.inc();
                    continue;
                }

                for r in batch {
                    if let Reply::Value { key, .. } = &r {
                        map.on_value(key);
                        replies.push(r);
                    }
                }
            }

            if !any_nmv {
                break;
            }
        }

        map.drain_misses();
        replies.push(Reply::End);
        Ok(replies)
    }

    /// Fans a command out to every server in the connection set, merging
    /// replies rather than routing by key (§4.E step 3).
    async fn execute_flush_all(&self, delay: Option<i64>) -> Result<Vec<Reply>, HiveError> {
        if let Some(cache) = self.front_cache.as_deref() {
            cache.flush_all(delay.unwrap_or(0) * 1000);
        }
        let mut last = Reply::Ok;
        for server_index in 0..self.conn_set.server_count() {
            let cmd = Command::FlushAll { delay, noreply: false };
            if let Ok(batch) = self.try_once(&cmd, server_index).await
                && let Some(r) = batch.into_iter().next()
            {
                last = r;
            }
        }
        Ok(vec![last])
    }

    /// Broadcasts `stats[ arg]` to every server and merges the results: a
    /// STAT merger that sums values for keys it recognizes as counters and
    /// otherwise keeps the first server's value, prefixed per-server when the
    /// values genuinely differ by server identity.
    async fn execute_stats(&self, arg: Option<String>) -> Result<Vec<Reply>, HiveError> {
        let mut merged: indexmap::IndexMap<String, String> = indexmap::IndexMap::new();
        for server_index in 0..self.conn_set.server_count() {
            let cmd = Command::Stats { arg: arg.clone() };
            let Ok(batch) = self.try_once(&cmd, server_index).await else {
                continue;
            };
            for r in batch {
                if let Reply::Stat(k, v) = r {
                    merge_stat(&mut merged, k, v);
                }
            }
        }
        let mut replies: Vec<Reply> = merged.into_iter().map(|(k, v)| Reply::Stat(k, v)).collect();
        replies.push(Reply::StatEnd);
        Ok(replies)
    }

    fn admits_optimize_set(&self, key: &Bytes) -> bool {
        std::str::from_utf8(key).is_ok_and(|k| self.optimize_set.admits(k))
    }

    /// SET-optimization (§4.E, §8 scenario 6): replies STORED to the
    /// upstream immediately and continues the real downstream write on a
    /// detached task. A failed downstream write only increments `err_oom`;
    /// it never reaches the upstream, which has already moved on.
    async fn execute_set_optimized(&self, cmd: Command) -> Reply {
        metrics::OPTIMIZE_SET_TOTAL.inc();
        let reservation = self.clone();
        tokio::spawn(async move {
            let key = match cmd.keys().into_iter().next() {
                Some(k) => k,
                None => return,
            };
            if let Err(e) = reservation.execute_single(cmd, &key).await {
                metrics::ERR_OOM_TOTAL.inc();
                tracing::warn!(
                    error = %e,
                    "optimized SET failed downstream after STORED was already sent upstream"
                );
            }
        });
        Reply::Stored
    }

    /// Routed single-key operation with not-my-vbucket retry: an
    /// invalidated `(server, vbucket)` is excluded from the next selection
    /// attempt, bounded by `max_retries` (§4.A, §7 "Routing" policy).
    async fn execute_single(&self, cmd: Command, key: &Bytes) -> Result<Reply, HiveError> {
        if let Some(over) = DownstreamOverride::parse(key) {
            return self.execute_override(cmd, &over).await;
        }

        let mut last_err = None;
        for _ in 0..=self.max_retries {
            let (server_index, vbucket) = self.selector.select(key);
            match self.try_once(&cmd, server_index).await {
                Ok(mut batch) => {
                    let reply = batch.pop().unwrap_or(Reply::End);
                    if is_not_my_vbucket(&reply) {
                        self.selector.invalidate(server_index, vbucket);
                        metrics::DOWNSTREAM_RETRIES_TOTAL.inc();
                        last_err = Some(HiveError::NotMyVbucket { server_index, vbucket });
                        continue;
                    }
                    if let Some(cache) = self.front_cache.as_deref() {
                        apply_cache_side_effect(cache, &cmd, &reply, self.front_cache_lifespan_ms);
                    }
                    return Ok(reply);
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or(HiveError::RetriesExhausted(self.max_retries)))
    }

    /// Runs a single-key operation against an `A:`/`B:` override address
    /// (§7 "Downstream protocol override"), bypassing both the selector and
    /// the pool's pooled connection set: the override is rare enough (a
    /// debugging/migration escape hatch, not steady-state traffic) that a
    /// fresh connection per call is the right tradeoff over adding a second
    /// connection-pool discipline next to `DownstreamConnSet`.
    async fn execute_override(&self, cmd: Command, over: &DownstreamOverride) -> Result<Reply, HiveError> {
        if over.protocol != Protocol::Ascii {
            return Err(HiveError::ClientError(
                "binary downstream override is not supported on an ASCII upstream".into(),
            ));
        }

        let addr = format!("{}:{}", over.host, over.port);
        let mut stream = tokio::time::timeout(self.downstream_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| HiveError::ConnectTimeout(addr.clone()))?
            .map_err(HiveError::from)?;

        let rewritten = over.rewrite(cmd);
        let mut codec = AsciiCodec::default();
        let mut out = BytesMut::new();
        Encoder::<Command>::encode(&mut codec, rewritten, &mut out)?;

        let outcome = tokio::time::timeout(self.downstream_timeout, async {
            stream.write_all(&out).await.map_err(HiveError::from)?;
            let mut decoder = ReplyDecoder::default();
            let mut buf = BytesMut::new();
            loop {
                if let Some(reply) = decoder.decode(&mut buf)? {
                    return Ok(reply);
                }
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await.map_err(HiveError::from)?;
                if n == 0 {
                    return Err(HiveError::DownstreamTimeout);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(HiveError::DownstreamTimeout),
        }
    }

    /// Acquire + Bind + Dispatch + Collect for one attempt against one
    /// server, holding the slot's connection lock only for the duration of
    /// the write and the read of its reply (§4.D's borrowing discipline).
    async fn try_once(&self, cmd: &Command, server_index: usize) -> Result<Vec<Reply>, HiveError> {
        tokio::time::timeout(self.wait_queue_timeout, self.conn_set.ensure_connected(server_index))
            .await
            .map_err(|_| HiveError::WaitQueueTimeout)??;

        let behavior = self
            .conn_set
            .behavior(server_index)
            .ok_or_else(|| HiveError::Internal(format!("no such server slot {server_index}")))?;
        let _ = behavior;

        let outcome = tokio::time::timeout(self.downstream_timeout, self.run_on_slot(cmd, server_index)).await;
        match outcome {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(e)) => {
                self.conn_set.mark_unavailable(server_index).await;
                Err(e)
            }
            Err(_) => {
                self.conn_set.mark_unavailable(server_index).await;
                Err(HiveError::DownstreamTimeout)
            }
        }
    }

    async fn run_on_slot(&self, cmd: &Command, server_index: usize) -> Result<Vec<Reply>, HiveError> {
        // `DownstreamConnSet` only exposes connect/mark-unavailable through
        // its own lock; the raw slot access needed to read/write bytes here
        // mirrors that same per-slot mutex discipline one level down.
        self.conn_set.with_live(server_index, |conn| {
            Box::pin(async move {
                let mut codec = AsciiCodec::default();
                let mut out = BytesMut::new();
                Encoder::<Command>::encode(&mut codec, cmd.clone(), &mut out)?;
                conn.stream.write_all(&out).await.map_err(HiveError::from)?;

                let multi = matches!(cmd, Command::Get { keys } | Command::Gets { keys } if keys.len() > 1);
                let mut decoder = ReplyDecoder::default();
                let mut buf = BytesMut::new();
                let mut replies = Vec::new();
                loop {
                    while let Some(reply) = decoder.decode(&mut buf)? {
                        let is_end = matches!(reply, Reply::End);
                        replies.push(reply);
                        if !multi || is_end {
                            return Ok(replies);
                        }
                    }
                    let mut chunk = [0u8; 4096];
                    let n = conn.stream.read(&mut chunk).await.map_err(HiveError::from)?;
                    if n == 0 {
                        return Err(HiveError::DownstreamTimeout);
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
            })
        })
        .await
    }

    /// Binary-protocol counterpart of `try_once` for a multiget shard (§4.D
    /// quiet-op corking, §4.E step 3): one attempt against one server
    /// speaking the binary protocol.
    async fn try_once_binary_multiget(&self, keys: &[Bytes], server_index: usize) -> Result<Vec<Reply>, HiveError> {
        tokio::time::timeout(self.wait_queue_timeout, self.conn_set.ensure_connected(server_index))
            .await
            .map_err(|_| HiveError::WaitQueueTimeout)??;

        let outcome = tokio::time::timeout(
            self.downstream_timeout,
            self.run_binary_multiget_on_slot(keys, server_index),
        )
        .await;
        match outcome {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(e)) => {
                self.conn_set.mark_unavailable(server_index).await;
                Err(e)
            }
            Err(_) => {
                self.conn_set.mark_unavailable(server_index).await;
                Err(HiveError::DownstreamTimeout)
            }
        }
    }

    /// Corks a GETKQ per key plus a terminating NOOP into the connection's
    /// cork buffer, writes them as one batch (§4.D, §5 "quiet binary
    /// operations preserve submission order"), then reads responses until
    /// the NOOP reply closes the batch.
    async fn run_binary_multiget_on_slot(&self, keys: &[Bytes], server_index: usize) -> Result<Vec<Reply>, HiveError> {
        let keys: Vec<Bytes> = keys.to_vec();
        self.conn_set
            .with_live(server_index, move |conn| {
                Box::pin(async move {
                    let mut codec = BinaryCodec::default();
                    for key in &keys {
                        let req = binary_request(Opcode::GetKQ, key.clone(), Bytes::new());
                        let mut out = BytesMut::new();
                        Encoder::<BinaryRequest>::encode(&mut codec, req, &mut out)?;
                        conn.cork(&out);
                    }
                    let noop = binary_request(Opcode::Noop, Bytes::new(), Bytes::new());
                    let mut noop_bytes = BytesMut::new();
                    Encoder::<BinaryRequest>::encode(&mut codec, noop, &mut noop_bytes)?;
                    conn.cork(&noop_bytes);

                    let batch = conn.uncork();
                    conn.stream.write_all(&batch).await.map_err(HiveError::from)?;

                    let mut decoder = BinaryResponseDecoder::default();
                    let mut buf = BytesMut::new();
                    let mut replies = Vec::new();
                    loop {
                        while let Some(resp) = decoder.decode(&mut buf)? {
                            if resp.header.opcode == Opcode::Noop {
                                return Ok(replies);
                            }
                            match resp.status() {
                                Status::Success => replies.push(Reply::Value {
                                    key: resp.key.clone(),
                                    flags: extract_flags(&resp.extras),
                                    data: resp.value.clone(),
                                    cas: Some(resp.header.cas),
                                }),
                                Status::NotMyVbucket => {
                                    replies.push(Reply::ServerError("not my vbucket".into()))
                                }
                                _ => {}
                            }
                        }
                        let mut chunk = [0u8; 4096];
                        let n = conn.stream.read(&mut chunk).await.map_err(HiveError::from)?;
                        if n == 0 {
                            return Err(HiveError::DownstreamTimeout);
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                })
            })
            .await
    }
}

/// An `A:host:port:realkey` / `B:host:port:realkey` key prefix (moxi
/// `cproxy.h`): forces a specific downstream address and wire protocol for
/// this one operation instead of routing it through the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamOverride {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub real_key: Bytes,
}

impl DownstreamOverride {
    pub fn parse(key: &Bytes) -> Option<Self> {
        if key.len() < 2 || key[1] != b':' {
            return None;
        }
        let protocol = match key[0] {
            b'A' => Protocol::Ascii,
            b'B' => Protocol::Binary,
            _ => return None,
        };
        let mut parts = key[2..].splitn(3, |&b| b == b':');
        let host = parts.next()?;
        let port = parts.next()?;
        let real_key = parts.next()?;
        if host.is_empty() || real_key.is_empty() {
            return None;
        }
        let port: u16 = std::str::from_utf8(port).ok()?.parse().ok()?;
        Some(Self {
            protocol,
            host: String::from_utf8_lossy(host).to_string(),
            port,
            real_key: Bytes::copy_from_slice(real_key),
        })
    }

    /// Substitutes the override's real key back into `cmd`, stripping the
    /// `A:host:port:` prefix before the command is sent downstream.
    fn rewrite(&self, cmd: Command) -> Command {
        let key = self.real_key.clone();
        match cmd {
            Command::Get { .. } => Command::Get { keys: vec![key] },
            Command::Gets { .. } => Command::Gets { keys: vec![key] },
            Command::Set { flags, exptime, data, noreply, .. } => {
                Command::Set { key, flags, exptime, data, noreply }
            }
            Command::Add { flags, exptime, data, noreply, .. } => {
                Command::Add { key, flags, exptime, data, noreply }
            }
            Command::Replace { flags, exptime, data, noreply, .. } => {
                Command::Replace { key, flags, exptime, data, noreply }
            }
            Command::Append { data, noreply, .. } => Command::Append { key, data, noreply },
            Command::Prepend { data, noreply, .. } => Command::Prepend { key, data, noreply },
            Command::Delete { noreply, .. } => Command::Delete { key, noreply },
            Command::Incr { delta, noreply, .. } => Command::Incr { key, delta, noreply },
            Command::Decr { delta, noreply, .. } => Command::Decr { key, delta, noreply },
            other => other,
        }
    }
}

fn binary_request(opcode: Opcode, key: Bytes, value: Bytes) -> BinaryRequest {
    BinaryRequest {
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
    }
}

/// The binary GET family's extras block is a 4-byte big-endian flags word.
fn extract_flags(extras: &Bytes) -> u32 {
    if extras.len() >= 4 {
        u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
    } else {
        0
    }
}

fn is_not_my_vbucket(reply: &Reply) -> bool {
    match reply {
        Reply::ServerError(msg) | Reply::ClientError(msg) => {
            msg.to_ascii_lowercase().contains("not my vbucket")
        }
        Reply::Raw(bytes) => String::from_utf8_lossy(bytes).to_ascii_lowercase().contains("not my vbucket"),
        _ => false,
    }
}

fn apply_cache_side_effect(cache: &FrontCache, cmd: &Command, reply: &Reply, lifespan_ms: i64) {
    let stored = matches!(reply, Reply::Stored);
    match cmd {
        Command::Set { key, flags, data, .. } if stored => {
            if let Ok(k) = std::str::from_utf8(key) {
                cache.set(k, data.clone(), *flags, lifespan_ms, false);
            }
        }
        Command::Add { key, flags, data, .. } if stored => {
            if let Ok(k) = std::str::from_utf8(key) {
                cache.set(k, data.clone(), *flags, lifespan_ms, true);
            }
        }
        Command::Delete { key, .. } if matches!(reply, Reply::Deleted) => {
            if let Ok(k) = std::str::from_utf8(key) {
                cache.delete(k);
            }
        }
        _ => {}
    }
}

/// Sums values for the well-known counter stats that are meaningful summed
/// across servers; every other key keeps the first server's value, since
/// e.g. `version` or `pid` differ per server but aren't worth per-server
/// qualification for a proxy-level `stats` reply.
fn merge_stat(merged: &mut indexmap::IndexMap<String, String>, key: String, value: String) {
    const SUMMED: &[&str] = &["curr_items", "total_items", "bytes", "cmd_get", "cmd_set", "get_hits", "get_misses"];
    if SUMMED.contains(&key.as_str())
        && let (Some(existing), Ok(new_val)) = (merged.get(&key).cloned(), value.parse::<i64>())
        && let Ok(existing_val) = existing.parse::<i64>()
    {
        merged.insert(key, (existing_val + new_val).to_string());
        return;
    }
    merged.entry(key).or_insert(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_kind_classifies_broadcast_commands() {
        assert_eq!(OpKind::of(&Command::FlushAll { delay: None, noreply: false }), OpKind::Broadcast);
        assert_eq!(OpKind::of(&Command::Stats { arg: None }), OpKind::Broadcast);
        assert_eq!(
            OpKind::of(&Command::Delete { key: Bytes::from_static(b"k"), noreply: false }),
            OpKind::Write
        );
    }

    #[test]
    fn merge_stat_sums_known_counters_and_keeps_first_for_others() {
        let mut merged = indexmap::IndexMap::new();
        merge_stat(&mut merged, "curr_items".into(), "3".into());
        merge_stat(&mut merged, "curr_items".into(), "4".into());
        merge_stat(&mut merged, "version".into(), "1.6.0".into());
        merge_stat(&mut merged, "version".into(), "1.6.1".into());
        assert_eq!(merged.get("curr_items"), Some(&"7".to_string()));
        assert_eq!(merged.get("version"), Some(&"1.6.0".to_string()));
    }

    #[test]
    fn not_my_vbucket_is_recognized_from_a_server_error_line() {
        assert!(is_not_my_vbucket(&Reply::ServerError("not my vbucket".into())));
        assert!(!is_not_my_vbucket(&Reply::Stored));
    }

    fn test_reservation(optimize_set: AdmissionMatcher) -> DownstreamReservation {
        use crate::core::proxy::selector::{RoutingTable, ServerSelector};
        DownstreamReservation {
            selector: ServerSelector::new(RoutingTable::new_ketama(&[(0, 1)])),
            conn_set: Arc::new(DownstreamConnSet::new(Vec::new())),
            front_cache: None,
            wait_queue_timeout: Duration::from_millis(50),
            downstream_timeout: Duration::from_millis(50),
            max_retries: 0,
            front_cache_lifespan_ms: 30_000,
            optimize_set,
        }
    }

    #[test]
    fn optimize_set_admits_only_matching_prefixes() {
        let r = test_reservation(AdmissionMatcher::new("tmp:", ""));
        assert!(r.admits_optimize_set(&Bytes::from_static(b"tmp:k")));
        assert!(!r.admits_optimize_set(&Bytes::from_static(b"perm:k")));
    }

    #[tokio::test]
    async fn optimize_set_replies_stored_without_waiting_on_a_live_downstream() {
        // No connection set slots exist, so the background write is
        // guaranteed to fail (no server to dial) - the upstream still gets
        // an immediate STORED per the scenario 6 contract.
        let r = test_reservation(AdmissionMatcher::new("tmp:", ""));
        let cmd = Command::Set {
            key: Bytes::from_static(b"tmp:k"),
            flags: 0,
            exptime: 0,
            data: Bytes::from_static(b"v"),
            noreply: false,
        };
        let replies = r.execute(cmd, 1).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], Reply::Stored));
    }

    /// §8 scenario 4: a 100ms front-cache lifespan must make an entry
    /// invisible by the time 150ms have passed, instead of riding on a
    /// fixed 30s TTL.
    #[test]
    fn apply_cache_side_effect_honors_a_short_configured_lifespan() {
        let cache = FrontCache::new(AdmissionMatcher::default(), false);
        cache.start(16);
        let cmd = Command::Set {
            key: Bytes::from_static(b"k"),
            flags: 0,
            exptime: 0,
            data: Bytes::from_static(b"v"),
            noreply: false,
        };
        apply_cache_side_effect(&cache, &cmd, &Reply::Stored, 100);
        assert!(cache.get("k").is_some());
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get("k").is_none());
    }

    /// §4.C / §4.E step 5: a shard that returns not-my-vbucket has its
    /// outstanding keys retried on a fresh selection rather than leaking the
    /// error line straight through to the upstream.
    #[tokio::test]
    async fn multiget_retries_outstanding_keys_after_a_not_my_vbucket_reply() {
        use crate::core::proxy::downstream::conn_set::ServerBehavior;
        use crate::core::proxy::selector::{RoutingTable, ServerSelector};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // First pass: reject everything as not-my-vbucket.
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"SERVER_ERROR not my vbucket\r\nEND\r\n")
                .await
                .unwrap();
            // Retry pass: serve both keys for real.
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"VALUE k1 0 1\r\nv\r\nVALUE k2 0 1\r\nv\r\nEND\r\n")
                .await
                .unwrap();
        });

        let behavior = ServerBehavior {
            host: addr.ip().to_string(),
            port: addr.port(),
            protocol: Protocol::Ascii,
            connect_timeout: Duration::from_millis(200),
            downstream_timeout: Duration::from_millis(200),
            connect_max_errors: 3,
            connect_retry_interval: Duration::from_millis(50),
            sasl_credentials: None,
            bucket_select: None,
        };
        let r = DownstreamReservation {
            selector: ServerSelector::new(RoutingTable::new_ketama(&[(0, 1)])),
            conn_set: Arc::new(DownstreamConnSet::new(vec![behavior])),
            front_cache: None,
            wait_queue_timeout: Duration::from_millis(200),
            downstream_timeout: Duration::from_millis(200),
            max_retries: 1,
            front_cache_lifespan_ms: 30_000,
            optimize_set: AdmissionMatcher::default(),
        };

        let replies = r
            .execute(
                Command::Get {
                    keys: vec![Bytes::from_static(b"k1"), Bytes::from_static(b"k2")],
                },
                1,
            )
            .await
            .unwrap();
        assert!(replies.iter().any(|rep| matches!(rep, Reply::Value { key, .. } if key == &Bytes::from_static(b"k1"))));
        assert!(replies.iter().any(|rep| matches!(rep, Reply::Value { key, .. } if key == &Bytes::from_static(b"k2"))));
        assert!(!replies.iter().any(is_not_my_vbucket));
    }
}
