// src/core/protocol/binary.rs

//! The binary memcached protocol: a fixed 24-byte header followed by extras,
//! key, and value. Framed with the same `Encoder`/`Decoder` idiom as
//! `ascii.rs` and the teacher's `resp_frame.rs`, but length-prefixed rather
//! than line-oriented, so `decode` only needs the header's `total_body_length`
//! field to know how many bytes to wait for.
//!
//! Carries the four administrative opcodes (§6) at their historical
//! bucket_engine addresses, each with the deprecated alias it shipped with
//! before the opcode space was renumbered.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::errors::HiveError;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;
const HEADER_LEN: usize = 24;

/// Standard data-manipulation opcodes plus the four bucket-administration
/// opcodes this proxy adds at the addresses the original bucket_engine
/// module used, each shipped alongside the deprecated alias it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Get,
    Set,
    Add,
    Replace,
    Delete,
    Incr,
    Decr,
    Quit,
    FlushAll,
    GetQ,
    Noop,
    Stat,
    SetQ,
    AddQ,
    DeleteQ,
    IncrQ,
    DecrQ,
    QuitQ,
    FlushQ,
    GetK,
    GetKQ,
    Append,
    Prepend,
    AppendQ,
    PrependQ,
    /// 0x85, deprecated alias 0x25.
    CreateBucket,
    /// 0x86, deprecated alias 0x26.
    DeleteBucket,
    /// 0x87, deprecated alias 0x27.
    ListBuckets,
    /// 0x89, deprecated alias 0x29.
    SelectBucket,
    SaslListMechs,
    SaslAuth,
    SaslStep,
    Unknown(u8),
}

impl Opcode {
    pub fn from_u8(b: u8) -> Self {
        match b {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Incr,
            0x06 => Opcode::Decr,
            0x07 => Opcode::Quit,
            0x08 => Opcode::FlushAll,
            0x09 => Opcode::GetQ,
            0x0a => Opcode::Noop,
            0x10 => Opcode::Stat,
            0x11 => Opcode::SetQ,
            0x12 => Opcode::AddQ,
            0x14 => Opcode::DeleteQ,
            0x15 => Opcode::IncrQ,
            0x16 => Opcode::DecrQ,
            0x17 => Opcode::QuitQ,
            0x18 => Opcode::FlushQ,
            0x0c => Opcode::GetK,
            0x0d => Opcode::GetKQ,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x19 => Opcode::AppendQ,
            0x1a => Opcode::PrependQ,
            0x85 | 0x25 => Opcode::CreateBucket,
            0x86 | 0x26 => Opcode::DeleteBucket,
            0x87 | 0x27 => Opcode::ListBuckets,
            0x89 | 0x29 => Opcode::SelectBucket,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            other => Opcode::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Opcode::Get => 0x00,
            Opcode::Set => 0x01,
            Opcode::Add => 0x02,
            Opcode::Replace => 0x03,
            Opcode::Delete => 0x04,
            Opcode::Incr => 0x05,
            Opcode::Decr => 0x06,
            Opcode::Quit => 0x07,
            Opcode::FlushAll => 0x08,
            Opcode::GetQ => 0x09,
            Opcode::Noop => 0x0a,
            Opcode::Stat => 0x10,
            Opcode::SetQ => 0x11,
            Opcode::AddQ => 0x12,
            Opcode::DeleteQ => 0x14,
            Opcode::IncrQ => 0x15,
            Opcode::DecrQ => 0x16,
            Opcode::QuitQ => 0x17,
            Opcode::FlushQ => 0x18,
            Opcode::GetK => 0x0c,
            Opcode::GetKQ => 0x0d,
            Opcode::Append => 0x0e,
            Opcode::Prepend => 0x0f,
            Opcode::AppendQ => 0x19,
            Opcode::PrependQ => 0x1a,
            Opcode::CreateBucket => 0x85,
            Opcode::DeleteBucket => 0x86,
            Opcode::ListBuckets => 0x87,
            Opcode::SelectBucket => 0x89,
            Opcode::SaslListMechs => 0x20,
            Opcode::SaslAuth => 0x21,
            Opcode::SaslStep => 0x22,
            Opcode::Unknown(b) => b,
        }
    }

    /// "Quiet" opcodes suppress their response on success, so the caller
    /// corks them into the connection's cork buffer (§4.D) rather than
    /// waiting for a reply per request.
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            Opcode::GetQ
                | Opcode::SetQ
                | Opcode::AddQ
                | Opcode::DeleteQ
                | Opcode::IncrQ
                | Opcode::DecrQ
                | Opcode::QuitQ
                | Opcode::FlushQ
                | Opcode::GetKQ
                | Opcode::AppendQ
                | Opcode::PrependQ
        )
    }

    pub fn is_admin(self) -> bool {
        matches!(
            self,
            Opcode::CreateBucket | Opcode::DeleteBucket | Opcode::ListBuckets | Opcode::SelectBucket
        )
    }
}

/// Status codes carried in a response header's vbucket/status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NotMyVbucket,
    AuthError,
    UnknownCommand,
    OutOfMemory,
    /// EWOULDBLOCK-equivalent (§7): the command was accepted but cannot
    /// complete synchronously, e.g. a `DELETE_BUCKET` deferred behind
    /// draining callers. The caller is expected to retry.
    Busy,
    InternalError,
    Other(u16),
}

impl Status {
    pub fn to_u16(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::NotMyVbucket => 0x0007,
            Status::AuthError => 0x0020,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::Busy => 0x0085,
            Status::InternalError => 0x0084,
            Status::Other(v) => v,
        }
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0007 => Status::NotMyVbucket,
            0x0020 => Status::AuthError,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0085 => Status::Busy,
            0x0084 => Status::InternalError,
            other => Status::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BinaryHeader {
    pub magic: u8,
    pub opcode: Opcode,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    /// Request: vbucket id. Response: status code.
    pub vbucket_or_status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl BinaryHeader {
    fn body_len(&self) -> usize {
        self.total_body_length as usize
    }
}

#[derive(Debug, Clone)]
pub struct BinaryRequest {
    pub header: BinaryHeader,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl BinaryRequest {
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    pub fn vbucket(&self) -> u16 {
        self.header.vbucket_or_status
    }
}

#[derive(Debug, Clone)]
pub struct BinaryResponse {
    pub header: BinaryHeader,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl BinaryResponse {
    pub fn new(opcode: Opcode, status: Status, opaque: u32, extras: Bytes, key: Bytes, value: Bytes) -> Self {
        let total_body_length = (extras.len() + key.len() + value.len()) as u32;
        Self {
            header: BinaryHeader {
                magic: MAGIC_RESPONSE,
                opcode,
                key_length: key.len() as u16,
                extras_length: extras.len() as u8,
                data_type: 0,
                vbucket_or_status: status.to_u16(),
                total_body_length,
                opaque,
                cas: 0,
            },
            extras,
            key,
            value,
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u16(self.header.vbucket_or_status)
    }
}

fn parse_header(src: &[u8]) -> Result<BinaryHeader, HiveError> {
    debug_assert!(src.len() >= HEADER_LEN);
    let magic = src[0];
    if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
        return Err(HiveError::Protocol(format!("bad binary magic byte 0x{magic:02x}")));
    }
    Ok(BinaryHeader {
        magic,
        opcode: Opcode::from_u8(src[1]),
        key_length: u16::from_be_bytes([src[2], src[3]]),
        extras_length: src[4],
        data_type: src[5],
        vbucket_or_status: u16::from_be_bytes([src[6], src[7]]),
        total_body_length: u32::from_be_bytes([src[8], src[9], src[10], src[11]]),
        opaque: u32::from_be_bytes([src[12], src[13], src[14], src[15]]),
        cas: u64::from_be_bytes([
            src[16], src[17], src[18], src[19], src[20], src[21], src[22], src[23],
        ]),
    })
}

fn write_header(dst: &mut BytesMut, h: &BinaryHeader) {
    dst.extend_from_slice(&[h.magic, h.opcode.to_u8()]);
    dst.extend_from_slice(&h.key_length.to_be_bytes());
    dst.extend_from_slice(&[h.extras_length, h.data_type]);
    dst.extend_from_slice(&h.vbucket_or_status.to_be_bytes());
    dst.extend_from_slice(&h.total_body_length.to_be_bytes());
    dst.extend_from_slice(&h.opaque.to_be_bytes());
    dst.extend_from_slice(&h.cas.to_be_bytes());
}

#[derive(Default)]
pub struct BinaryCodec {
    header: Option<BinaryHeader>,
}

impl Decoder for BinaryCodec {
    type Item = BinaryRequest;
    type Error = HiveError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.header.is_none() {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            self.header = Some(parse_header(&src[..HEADER_LEN])?);
            src.advance(HEADER_LEN);
        }
        let header = self.header.as_ref().expect("just populated");
        let body_len = header.body_len();
        if src.len() < body_len {
            return Ok(None);
        }
        let extras_len = header.extras_length as usize;
        let key_len = header.key_length as usize;
        if extras_len + key_len > body_len {
            let header = self.header.take().expect("checked above");
            src.advance(body_len);
            return Err(HiveError::Protocol(format!(
                "opcode 0x{:02x}: extras+key length exceeds body length",
                header.opcode.to_u8()
            )));
        }
        let extras = Bytes::copy_from_slice(&src[..extras_len]);
        let key = Bytes::copy_from_slice(&src[extras_len..extras_len + key_len]);
        let value = Bytes::copy_from_slice(&src[extras_len + key_len..body_len]);
        src.advance(body_len);
        let header = self.header.take().expect("checked above");
        Ok(Some(BinaryRequest {
            header,
            extras,
            key,
            value,
        }))
    }
}

impl Encoder<BinaryResponse> for BinaryCodec {
    type Error = HiveError;

    fn encode(&mut self, item: BinaryResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_header(dst, &item.header);
        dst.extend_from_slice(&item.extras);
        dst.extend_from_slice(&item.key);
        dst.extend_from_slice(&item.value);
        Ok(())
    }
}

/// Encodes a request, used when the proxy itself speaks binary downstream.
impl Encoder<BinaryRequest> for BinaryCodec {
    type Error = HiveError;

    fn encode(&mut self, item: BinaryRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_header(dst, &item.header);
        dst.extend_from_slice(&item.extras);
        dst.extend_from_slice(&item.key);
        dst.extend_from_slice(&item.value);
        Ok(())
    }
}

/// Decodes a response read back from a downstream binary connection.
#[derive(Default)]
pub struct BinaryResponseDecoder {
    header: Option<BinaryHeader>,
}

impl Decoder for BinaryResponseDecoder {
    type Item = BinaryResponse;
    type Error = HiveError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.header.is_none() {
            if src.len() < HEADER_LEN {
                return Ok(None);
            }
            self.header = Some(parse_header(&src[..HEADER_LEN])?);
            src.advance(HEADER_LEN);
        }
        let header = self.header.as_ref().expect("just populated");
        let body_len = header.body_len();
        if src.len() < body_len {
            return Ok(None);
        }
        let extras_len = header.extras_length as usize;
        let key_len = header.key_length as usize;
        let extras = Bytes::copy_from_slice(&src[..extras_len]);
        let key = Bytes::copy_from_slice(&src[extras_len..extras_len + key_len]);
        let value = Bytes::copy_from_slice(&src[extras_len + key_len..body_len]);
        src.advance(body_len);
        let header = self.header.take().expect("checked above");
        Ok(Some(BinaryResponse {
            header,
            extras,
            key,
            value,
        }))
    }
}

/// Builds the extras block for CREATE_BUCKET / DELETE_BUCKET (§6): a
/// null-terminated config string following the key (bucket name). The
/// teacher's bucket_engine protocol packs `force` as a single flag byte in
/// DELETE_BUCKET's extras; we follow the same layout.
pub fn delete_bucket_extras(force: bool) -> Bytes {
    Bytes::from(vec![if force { 1u8 } else { 0u8 }])
}

pub fn is_delete_forced(extras: &Bytes) -> bool {
    extras.first().copied() == Some(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_get_request() -> BytesMut {
        let mut buf = BytesMut::new();
        write_header(
            &mut buf,
            &BinaryHeader {
                magic: MAGIC_REQUEST,
                opcode: Opcode::Get,
                key_length: 3,
                extras_length: 0,
                data_type: 0,
                vbucket_or_status: 0,
                total_body_length: 3,
                opaque: 7,
                cas: 0,
            },
        );
        buf.extend_from_slice(b"abc");
        buf
    }

    #[test]
    fn decodes_a_complete_get_request() {
        let mut codec = BinaryCodec::default();
        let mut buf = sample_get_request();
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.opcode(), Opcode::Get);
        assert_eq!(req.key, Bytes::from_static(b"abc"));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_a_split_header() {
        let mut codec = BinaryCodec::default();
        let full = sample_get_request();
        let mut buf = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[10..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn admin_opcode_aliases_map_to_the_same_variant() {
        assert_eq!(Opcode::from_u8(0x85), Opcode::CreateBucket);
        assert_eq!(Opcode::from_u8(0x25), Opcode::CreateBucket);
        assert_eq!(Opcode::from_u8(0x89), Opcode::SelectBucket);
        assert_eq!(Opcode::from_u8(0x29), Opcode::SelectBucket);
        assert!(Opcode::CreateBucket.is_admin());
        assert!(!Opcode::Get.is_admin());
    }

    #[test]
    fn quiet_opcodes_are_flagged() {
        assert!(Opcode::GetQ.is_quiet());
        assert!(Opcode::SetQ.is_quiet());
        assert!(!Opcode::Get.is_quiet());
    }
}
