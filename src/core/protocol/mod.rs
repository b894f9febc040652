// src/core/protocol/mod.rs

//! Minimal memcached ASCII + binary wire framing (§6 "Memcached wire
//! protocol"). spec.md treats the exact wire bytes as understood and
//! out of scope; this module implements just enough of both protocols to
//! drive GET/multiget/SET/broadcast/admin end to end, following the
//! teacher's `Encoder`/`Decoder` `Framed` idiom (`core/protocol/resp_frame.rs`)
//! generalized from a single RESP frame type to the two memcached framings.

pub mod ascii;
pub mod binary;

pub use ascii::{AsciiCodec, Command, Reply, ReplyDecoder};
pub use binary::{
    BinaryCodec, BinaryHeader, BinaryRequest, BinaryResponse, BinaryResponseDecoder, Opcode, Status,
};

/// Which wire protocol an upstream or downstream connection speaks. Distinct
/// from `downstream::conn_set::Protocol`, which is the per-server behavior
/// declaration; this one tags an actual decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Ascii,
    Binary,
}
