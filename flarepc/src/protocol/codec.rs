use bytes::{Buf, Bytes, BytesMut};

use super::header::{HEADER_SIZE, Header, MAGIC, MessageCode};
use crate::{Error, ErrorKind, SerializerType};

/// A decoded frame: header plus its body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

/// Reasons the decoder refuses a byte stream. Any of them is fatal to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    IllegalMagic(u16),
    IllegalSign(u8),
    BodyTooLarge(usize),
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::IllegalMagic(magic) => {
                Error::new(ErrorKind::IllegalMagic, format!("magic {magic:#06x}"))
            }
            DecodeError::IllegalSign(sign) => {
                Error::new(ErrorKind::IllegalSign, format!("sign {sign:#04x}"))
            }
            DecodeError::BodyTooLarge(len) => {
                Error::new(ErrorKind::BodyTooLarge, format!("body length {len}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    ReadHeader,
    ReadBody(Header),
}

/// Resumable frame parser. Feed it the connection's read buffer after every read.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    max_body: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_body: usize) -> Self {
        Self {
            state: DecodeState::ReadHeader,
            max_body,
        }
    }

    /// Consumes at most one frame from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; the decoder remembers how far it got.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] on a bad magic, an unknown sign or an oversized body.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        loop {
            match self.state {
                DecodeState::ReadHeader => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let magic = u16::from_be_bytes([buf[0], buf[1]]);
                    if magic != MAGIC {
                        return Err(DecodeError::IllegalMagic(magic));
                    }
                    let sign = buf[2];
                    buf.advance(2);
                    let header = Header::read_after_magic(buf)
                        .ok_or(DecodeError::IllegalSign(sign))?;
                    let len = header.body_len as usize;
                    if len > self.max_body {
                        return Err(DecodeError::BodyTooLarge(len));
                    }
                    self.state = DecodeState::ReadBody(header);
                }
                DecodeState::ReadBody(header) => {
                    let len = header.body_len as usize;
                    if buf.len() < len {
                        buf.reserve(len - buf.len());
                        return Ok(None);
                    }
                    self.state = DecodeState::ReadHeader;
                    let body = buf.split_to(len).freeze();
                    return Ok(Some(Frame { header, body }));
                }
            }
        }
    }
}

/// Encodes a complete frame. The body length field is derived from `body`.
///
/// # Errors
///
/// Returns `BodyTooLarge` when the body does not fit the 32-bit length field.
pub fn encode_frame(mut header: Header, body: &[u8]) -> crate::Result<Bytes> {
    header.body_len = u32::try_from(body.len())
        .map_err(|_| Error::new(ErrorKind::BodyTooLarge, format!("body length {}", body.len())))?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// An ACK for registry message `sequence`.
#[must_use]
pub fn ack_frame(sequence: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    Header::new(MessageCode::Ack, SerializerType::default(), sequence).write_to(&mut buf);
    buf.freeze()
}

#[must_use]
pub fn heartbeat_frame() -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    Header::new(MessageCode::Heartbeat, SerializerType::default(), 0).write_to(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64, body: &[u8]) -> Bytes {
        encode_frame(
            Header::new(MessageCode::Request, SerializerType::Json, id),
            body,
        )
        .unwrap()
    }

    #[test]
    fn test_resumes_across_partial_reads() {
        let bytes = request(42, b"{\"a\":1}");
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&bytes[..10]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[10..HEADER_SIZE + 2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(matches!(decoder.state, DecodeState::ReadBody(_)));
        buf.extend_from_slice(&bytes[HEADER_SIZE + 2..]);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.id, 42);
        assert_eq!(frame.header.code, MessageCode::Request);
        assert_eq!(&frame.body[..], b"{\"a\":1}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&request(1, b"x"));
        buf.extend_from_slice(&ack_frame(9));
        buf.extend_from_slice(&heartbeat_frame());

        let mut decoder = FrameDecoder::new(1024);
        let ids: Vec<_> = std::iter::from_fn(|| decoder.decode(&mut buf).unwrap())
            .map(|f| (f.header.code, f.header.id))
            .collect();
        assert_eq!(
            ids,
            vec![
                (MessageCode::Request, 1),
                (MessageCode::Ack, 9),
                (MessageCode::Heartbeat, 0)
            ]
        );
    }

    #[test]
    fn test_protocol_errors() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&[0u8; HEADER_SIZE][..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            DecodeError::IllegalMagic(0)
        );

        let mut bytes = BytesMut::from(&request(1, b"")[..]);
        bytes[2] = 0x3e;
        let mut decoder = FrameDecoder::new(1024);
        assert_eq!(
            decoder.decode(&mut bytes).unwrap_err(),
            DecodeError::IllegalSign(0x3e)
        );

        let mut buf = BytesMut::from(&request(1, &[0u8; 64])[..]);
        let mut decoder = FrameDecoder::new(16);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            DecodeError::BodyTooLarge(64)
        );
    }
}
