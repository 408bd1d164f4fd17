//! Control channel framing.
//!
//! A logical message is a sequence of tagged items ending in an
//! end-of-message marker:
//!
//! | Tag    | Item           | Payload                                      |
//! |--------|----------------|----------------------------------------------|
//! | `0x01` | integer        | 8 bytes, big-endian `i64`                     |
//! | `0x02` | record         | 4-byte big-endian length + JSON object bytes  |
//! | `0x03` | descriptor     | none; one descriptor rides on this byte as `SCM_RIGHTS` |
//! | `0x04` | end-of-message | none                                          |
//!
//! Decoding is incremental: a message is taken out of the receive buffer only
//! once all of its bytes and descriptors have arrived, so a partial read never
//! consumes anything.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::VecDeque, os::fd::OwnedFd};
use thiserror::Error;

use super::error_stack::ErrorEntry;

pub const TAG_INT: u8 = 0x01;
pub const TAG_RECORD: u8 = 0x02;
pub const TAG_FD: u8 = 0x03;
pub const TAG_EOM: u8 = 0x04;

const INT_LEN: usize = 8;
const RECORD_LEN_LEN: usize = 4;

pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

/// `Status` values of a result record.
pub const STATUS_SUCCESS: i64 = 0;
pub const STATUS_FAILURE: i64 = 1;

#[repr(i64)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    Alive = 1,
    Stop = 2,
    Handle = 3,
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Alive => write!(f, "ALIVE"),
            Opcode::Stop => write!(f, "STOP"),
            Opcode::Handle => write!(f, "HANDLE"),
        }
    }
}

impl TryFrom<i64> for Opcode {
    type Error = DecodeError;
    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        match raw {
            1 => Ok(Opcode::Alive),
            2 => Ok(Opcode::Stop),
            3 => Ok(Opcode::Handle),
            _ => Err(DecodeError::UnknownOpcode(raw)),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(i64),
    #[error("expected {expected}, found item tag {found:#04x}")]
    UnexpectedItem { expected: &'static str, found: u8 },
    #[error("record of {len} bytes exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },
    #[error("invalid record: {0}")]
    Record(#[from] serde_json::Error),
    #[error("descriptor item arrived without a descriptor")]
    MissingDescriptor,
    #[error("{extra} descriptors arrived beyond the one allowed per descriptor item")]
    SurplusDescriptors { extra: usize },
}

impl DecodeError {
    /// The stream can no longer be resynchronized: the payload size of an
    /// unknown opcode is unknown.
    #[must_use]
    pub fn is_desync(&self) -> bool {
        matches!(self, DecodeError::UnknownOpcode(_))
    }
}

/// Work request attributes sent by the parent with `HANDLE`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "AuthMethods")]
    pub auth_methods: String,
    #[serde(rename = "AuthTimeout")]
    pub auth_timeout: i64,
    #[serde(
        rename = "KeyInfoProtocol",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub key_info_protocol: Option<String>,
    #[serde(rename = "KeyInfoData", default, skip_serializing_if = "Option::is_none")]
    pub key_info_data: Option<String>,
    #[serde(rename = "ErrorStack", default, skip_serializing_if = "Vec::is_empty")]
    pub error_stack: Vec<ErrorEntry>,
}

/// Result attributes sent back to the parent with `HANDLE`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(rename = "MethodUsed", default, skip_serializing_if = "Option::is_none")]
    pub method_used: Option<String>,
    #[serde(rename = "Status")]
    pub status: i64,
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "ErrorStack", default)]
    pub error_stack: Vec<ErrorEntry>,
    #[serde(rename = "ConnectionState")]
    pub connection_state: String,
}

/// A complete parent-to-worker message.
#[derive(Debug)]
pub enum ControlMessage {
    Alive,
    Stop,
    Handle {
        request: RequestRecord,
        descriptor: OwnedFd,
    },
}

/// A complete worker-to-parent `HANDLE` response (preamble and body).
#[derive(Debug)]
pub struct HandleResponse {
    pub record: ResultRecord,
    pub descriptor: OwnedFd,
}

pub fn put_int(buf: &mut BytesMut, value: i64) {
    buf.put_u8(TAG_INT);
    buf.put_i64(value);
}

pub fn put_eom(buf: &mut BytesMut) {
    buf.put_u8(TAG_EOM);
}

/// Append a record item.
/// # Errors
/// Returns an error if the record cannot be serialized or does not fit the length prefix.
pub fn put_record<T: Serialize>(buf: &mut BytesMut, record: &T) -> Result<(), DecodeError> {
    let json = serde_json::to_vec(record)?;
    let len = u32::try_from(json.len()).map_err(|_| DecodeError::RecordTooLarge {
        len: json.len(),
        max: u32::MAX as usize,
    })?;
    buf.put_u8(TAG_RECORD);
    buf.put_u32(len);
    buf.put_slice(&json);
    Ok(())
}

/// Encode a payload-less control message (`ALIVE` or `STOP`).
#[must_use]
pub fn encode_simple(opcode: Opcode) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + INT_LEN + 1);
    put_int(&mut buf, opcode as i64);
    put_eom(&mut buf);
    buf
}

enum Partial {
    NeedMore,
    Invalid(DecodeError),
}

impl From<DecodeError> for Partial {
    fn from(err: DecodeError) -> Self {
        Partial::Invalid(err)
    }
}

impl From<serde_json::Error> for Partial {
    fn from(err: serde_json::Error) -> Self {
        Partial::Invalid(DecodeError::Record(err))
    }
}

/// Cursor over the receive buffer that never consumes.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    descriptors_available: usize,
    descriptors_used: usize,
    max_record_bytes: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], descriptors_available: usize, max_record_bytes: usize) -> Self {
        Self {
            buf,
            pos: 0,
            descriptors_available,
            descriptors_used: 0,
            max_record_bytes,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Partial> {
        let end = self.pos.checked_add(len).ok_or(Partial::NeedMore)?;
        if self.buf.len() < end {
            return Err(Partial::NeedMore);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn tag(&mut self, want: u8, expected: &'static str) -> Result<(), Partial> {
        let found = self.take(1)?[0];
        if found != want {
            return Err(DecodeError::UnexpectedItem { expected, found }.into());
        }
        Ok(())
    }

    fn int(&mut self) -> Result<i64, Partial> {
        self.tag(TAG_INT, "integer")?;
        let mut raw = self.take(INT_LEN)?;
        Ok(raw.get_i64())
    }

    fn record<T: DeserializeOwned>(&mut self) -> Result<T, Partial> {
        self.tag(TAG_RECORD, "record")?;
        let mut raw_len = self.take(RECORD_LEN_LEN)?;
        let len = raw_len.get_u32() as usize;
        if len > self.max_record_bytes {
            return Err(DecodeError::RecordTooLarge {
                len,
                max: self.max_record_bytes,
            }
            .into());
        }
        let body = self.take(len)?;
        Ok(serde_json::from_slice(body)?)
    }

    fn descriptor(&mut self) -> Result<(), Partial> {
        self.tag(TAG_FD, "descriptor")?;
        // The descriptor travels with its tag byte, so it is already queued.
        if self.descriptors_used >= self.descriptors_available {
            return Err(DecodeError::MissingDescriptor.into());
        }
        self.descriptors_used += 1;
        Ok(())
    }

    fn eom(&mut self) -> Result<(), Partial> {
        self.tag(TAG_EOM, "end-of-message")
    }
}

enum Parsed {
    Alive,
    Stop,
    Handle(RequestRecord),
}

fn parse_control(reader: &mut Reader<'_>) -> Result<Parsed, Partial> {
    let opcode = Opcode::try_from(reader.int()?)?;
    match opcode {
        Opcode::Alive => {
            reader.eom()?;
            Ok(Parsed::Alive)
        }
        Opcode::Stop => {
            reader.eom()?;
            Ok(Parsed::Stop)
        }
        Opcode::Handle => {
            let request = reader.record()?;
            reader.descriptor()?;
            reader.eom()?;
            Ok(Parsed::Handle(request))
        }
    }
}

/// Take one complete parent-to-worker message out of the receive buffer.
///
/// Returns `Ok(None)` when more bytes are needed.
/// # Errors
/// Returns an error if the buffered bytes cannot start a valid message.
pub fn try_decode_control(
    buf: &mut BytesMut,
    descriptors: &mut VecDeque<OwnedFd>,
    max_record_bytes: usize,
) -> Result<Option<ControlMessage>, DecodeError> {
    let mut reader = Reader::new(&buf[..], descriptors.len(), max_record_bytes);
    let parsed = match parse_control(&mut reader) {
        Ok(parsed) => parsed,
        Err(Partial::NeedMore) => return Ok(None),
        Err(Partial::Invalid(err)) => return Err(err),
    };
    let consumed = reader.pos;
    buf.advance(consumed);

    let message = match parsed {
        Parsed::Alive => ControlMessage::Alive,
        Parsed::Stop => ControlMessage::Stop,
        Parsed::Handle(request) => {
            let descriptor = descriptors
                .pop_front()
                .ok_or(DecodeError::MissingDescriptor)?;
            ControlMessage::Handle {
                request,
                descriptor,
            }
        }
    };
    Ok(Some(message))
}

fn parse_response(reader: &mut Reader<'_>) -> Result<ResultRecord, Partial> {
    let opcode = Opcode::try_from(reader.int()?)?;
    if opcode != Opcode::Handle {
        return Err(DecodeError::UnknownOpcode(opcode as i64).into());
    }
    reader.eom()?;
    let record = reader.record()?;
    reader.descriptor()?;
    reader.eom()?;
    Ok(record)
}

/// Parent side: take one complete `HANDLE` response out of the receive buffer.
/// # Errors
/// Returns an error if the buffered bytes cannot start a valid response.
pub fn try_decode_response(
    buf: &mut BytesMut,
    descriptors: &mut VecDeque<OwnedFd>,
    max_record_bytes: usize,
) -> Result<Option<HandleResponse>, DecodeError> {
    let mut reader = Reader::new(&buf[..], descriptors.len(), max_record_bytes);
    let record = match parse_response(&mut reader) {
        Ok(record) => record,
        Err(Partial::NeedMore) => return Ok(None),
        Err(Partial::Invalid(err)) => return Err(err),
    };
    let consumed = reader.pos;
    buf.advance(consumed);
    let descriptor = descriptors
        .pop_front()
        .ok_or(DecodeError::MissingDescriptor)?;
    Ok(Some(HandleResponse { record, descriptor }))
}
