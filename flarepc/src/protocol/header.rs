use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, SerializerType};

pub const MAGIC: u16 = 0xbabe;
pub const HEADER_SIZE: usize = 16;

/// Kind of frame, carried in the low nibble of the sign byte.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum MessageCode {
    Request = 0x01,
    Response = 0x02,
    PublishService = 0x03,
    PublishCancelService = 0x04,
    SubscribeService = 0x05,
    OfflineNotice = 0x06,
    Ack = 0x07,
    Heartbeat = 0x0f,
}

impl MessageCode {
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => MessageCode::Request,
            0x02 => MessageCode::Response,
            0x03 => MessageCode::PublishService,
            0x04 => MessageCode::PublishCancelService,
            0x05 => MessageCode::SubscribeService,
            0x06 => MessageCode::OfflineNotice,
            0x07 => MessageCode::Ack,
            0x0f => MessageCode::Heartbeat,
            _ => return None,
        })
    }

    /// Frames whose body is encoded with the serializer named in the sign byte.
    #[must_use]
    pub fn has_body(self) -> bool {
        !matches!(self, MessageCode::Ack | MessageCode::Heartbeat)
    }
}

/// Outcome of a call, carried in the status byte of RESPONSE frames.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Status {
    #[default]
    Ok = 0x20,
    ClientError = 0x30,
    ClientTimeout = 0x31,
    ServerTimeout = 0x32,
    BadRequest = 0x40,
    ServiceNotFound = 0x44,
    ServerError = 0x50,
    ServerBusy = 0x51,
    ServiceExpectedError = 0x52,
    ServiceUnexpectedError = 0x53,
    DeserializationFail = 0x60,
}

impl Status {
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x20 => Status::Ok,
            0x30 => Status::ClientError,
            0x31 => Status::ClientTimeout,
            0x32 => Status::ServerTimeout,
            0x40 => Status::BadRequest,
            0x44 => Status::ServiceNotFound,
            0x50 => Status::ServerError,
            0x51 => Status::ServerBusy,
            0x52 => Status::ServiceExpectedError,
            0x53 => Status::ServiceUnexpectedError,
            0x60 => Status::DeserializationFail,
            _ => return None,
        })
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The error kind a caller observes for this status, `None` for `Ok`.
    #[must_use]
    pub fn error_kind(self) -> Option<ErrorKind> {
        Some(match self {
            Status::Ok => return None,
            Status::ClientError => ErrorKind::ClientError,
            Status::ClientTimeout => ErrorKind::ClientTimeout,
            Status::ServerTimeout => ErrorKind::ServerTimeout,
            Status::BadRequest => ErrorKind::BadRequest,
            Status::ServiceNotFound => ErrorKind::ServiceNotFound,
            Status::ServerError => ErrorKind::ServerError,
            Status::ServerBusy => ErrorKind::ServerBusy,
            Status::ServiceExpectedError => ErrorKind::ServiceExpectedError,
            Status::ServiceUnexpectedError => ErrorKind::ServiceUnexpectedError,
            Status::DeserializationFail => ErrorKind::DeserializationFail,
        })
    }
}

/// The fixed 16-byte frame header.
///
/// ```text
/// | 2 bytes | 1 byte | 1 byte | 8 bytes | 4 bytes  |
/// | magic   | sign   | status | id      | body len |
/// ```
///
/// The sign byte holds the message code in its low nibble and the serializer code in its
/// high nibble.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Header {
    pub code: MessageCode,
    pub serializer: SerializerType,
    pub status: u8,
    pub id: u64,
    pub body_len: u32,
}

impl Header {
    #[must_use]
    pub fn new(code: MessageCode, serializer: SerializerType, id: u64) -> Self {
        Self {
            code,
            serializer,
            status: 0,
            id,
            body_len: 0,
        }
    }

    #[must_use]
    pub fn sign(&self) -> u8 {
        (self.serializer.code() << 4) | (self.code as u8 & 0x0f)
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(MAGIC);
        buf.put_u8(self.sign());
        buf.put_u8(self.status);
        buf.put_u64(self.id);
        buf.put_u32(self.body_len);
    }

    /// Parses the sign byte into message and serializer codes.
    pub(crate) fn parse_sign(sign: u8) -> Option<(MessageCode, SerializerType)> {
        let code = MessageCode::from_code(sign & 0x0f)?;
        let serializer = match SerializerType::from_code(sign >> 4) {
            Some(serializer) => serializer,
            // control frames carry no body, so their serializer nibble is not meaningful.
            None if !code.has_body() => SerializerType::default(),
            None => return None,
        };
        Some((code, serializer))
    }

    /// Reads the remaining 14 bytes after a verified magic.
    pub(crate) fn read_after_magic<B: Buf>(buf: &mut B) -> Option<Self> {
        let (code, serializer) = Self::parse_sign(buf.get_u8())?;
        Some(Self {
            code,
            serializer,
            status: buf.get_u8(),
            id: buf.get_u64(),
            body_len: buf.get_u32(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_layout() {
        let header = Header::new(MessageCode::PublishService, SerializerType::Json, 1);
        assert_eq!(header.sign(), 0x23);
        assert_eq!(
            Header::parse_sign(0x23),
            Some((MessageCode::PublishService, SerializerType::Json))
        );
        assert_eq!(
            Header::parse_sign(0x07),
            Some((MessageCode::Ack, SerializerType::MessagePack))
        );
        assert_eq!(Header::parse_sign(0x01), None);
        assert_eq!(Header::parse_sign(0x18), None);
    }

    #[test]
    fn test_status_codes() {
        for code in 0u8..=0xff {
            if let Some(status) = Status::from_code(code) {
                assert_eq!(status.code(), code);
                assert_eq!(status.error_kind().is_none(), status == Status::Ok);
            }
        }
        assert_eq!(
            Status::ServerTimeout.error_kind(),
            Some(ErrorKind::ServerTimeout)
        );
    }
}
