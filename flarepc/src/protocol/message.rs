use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{
    codec::encode_frame,
    header::{HEADER_SIZE, Header, MessageCode, Status},
};
use crate::{
    Error, ErrorKind, Result, SerializerType, meta::ServiceMeta,
};

/// Routing envelope of a request: who calls what.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct RequestMeta {
    pub app_name: String,
    pub service: ServiceMeta,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<u64>,
}

/// An outbound or inbound call.
///
/// Body layout:
///
/// ```text
/// | 4 bytes  | N bytes     | M bytes |
/// | meta_len | RequestMeta | args    |
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    pub invoke_id: u64,
    pub serializer: SerializerType,
    pub meta: RequestMeta,
    pub args: Bytes,
    pub timestamp: Instant,
}

impl Request {
    /// # Errors
    ///
    /// Returns an error if `args` cannot be serialized.
    pub fn new<A: Serialize + ?Sized>(
        invoke_id: u64,
        serializer: SerializerType,
        meta: RequestMeta,
        args: &A,
    ) -> Result<Self> {
        Ok(Self {
            invoke_id,
            serializer,
            meta,
            args: serializer.serialize(args)?,
            timestamp: Instant::now(),
        })
    }

    /// Encodes the complete frame, header included.
    ///
    /// # Errors
    ///
    /// Returns an error if the routing envelope cannot be serialized.
    pub fn encode(&self) -> Result<Bytes> {
        const S: usize = std::mem::size_of::<u32>();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 128 + self.args.len());
        buf.put_bytes(0, HEADER_SIZE);

        let meta_offset = buf.len();
        buf.put_u32(0);
        self.serializer.serialize_into(&self.meta, &mut buf)?;
        let meta_len = u32::try_from(buf.len() - meta_offset - S)?;
        buf[meta_offset..meta_offset + S].copy_from_slice(&meta_len.to_be_bytes());
        buf.extend_from_slice(&self.args);

        let mut header = Header::new(MessageCode::Request, self.serializer, self.invoke_id);
        header.body_len = u32::try_from(buf.len() - HEADER_SIZE)?;
        let mut head = &mut buf[..HEADER_SIZE];
        header.write_to(&mut head);
        Ok(buf.freeze())
    }

    /// Parses a REQUEST body.
    ///
    /// # Errors
    ///
    /// Returns `DeserializeFailed` if the body is truncated or the envelope is malformed.
    pub fn decode(header: &Header, mut body: Bytes) -> Result<Self> {
        const S: usize = std::mem::size_of::<u32>();
        let len = body.len();
        let Some(prefix) = body.get(..S) else {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid request length: {len}"),
            ));
        };
        let meta_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let offset = S + meta_len;
        if meta_len == 0 || offset > len {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid meta length: {meta_len}, request length: {len}"),
            ));
        }
        let meta: RequestMeta = header.serializer.deserialize(&body[S..offset])?;
        let args = body.split_off(offset);
        Ok(Self {
            invoke_id: header.id,
            serializer: header.serializer,
            meta,
            args,
            timestamp: Instant::now(),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the arguments do not decode as `A`.
    pub fn args<A: DeserializeOwned>(&self) -> Result<A> {
        self.serializer.deserialize(&self.args)
    }
}

/// A call outcome as it travels back to the consumer.
///
/// For `Status::Ok` the payload is the serialized result; for every other status it is the
/// serialized [`Error`], or empty when the status alone says everything.
#[derive(Debug, Clone)]
pub struct Response {
    pub invoke_id: u64,
    pub status: Status,
    pub serializer: SerializerType,
    pub payload: Bytes,
}

impl Response {
    #[must_use]
    pub fn new(invoke_id: u64, status: Status, serializer: SerializerType, payload: Bytes) -> Self {
        Self {
            invoke_id,
            status,
            serializer,
            payload,
        }
    }

    /// A response generated on the consumer itself (timeouts, write failures).
    #[must_use]
    pub fn local(invoke_id: u64, status: Status) -> Self {
        Self::new(invoke_id, status, SerializerType::default(), Bytes::new())
    }

    /// A failed response whose payload carries `error`.
    #[must_use]
    pub fn failure(
        invoke_id: u64,
        status: Status,
        serializer: SerializerType,
        error: &Error,
    ) -> Self {
        let payload = serializer.serialize(error).unwrap_or_else(|e| {
            tracing::error!("serialize error payload failed: {e}");
            Bytes::new()
        });
        Self::new(invoke_id, status, serializer, payload)
    }

    /// # Errors
    ///
    /// Returns `BodyTooLarge` if the payload does not fit in a frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut header = Header::new(MessageCode::Response, self.serializer, self.invoke_id);
        header.status = self.status.code();
        encode_frame(header, &self.payload)
    }

    /// # Errors
    ///
    /// Returns `DeserializeFailed` for an unknown status byte.
    pub fn decode(header: &Header, body: Bytes) -> Result<Self> {
        let status = Status::from_code(header.status).ok_or_else(|| {
            Error::new(
                ErrorKind::DeserializeFailed,
                format!("unknown status {:#04x}", header.status),
            )
        })?;
        Ok(Self::new(header.id, status, header.serializer, body))
    }

    /// Turns the response into the value a caller observes.
    ///
    /// Non-OK statuses become an error of the matching kind. A provider's business error
    /// (`ServiceExpectedError`) is surfaced as the provider produced it.
    #[must_use]
    pub fn into_outcome(self, remote: Option<&str>) -> Result<Bytes> {
        let Some(kind) = self.status.error_kind() else {
            return Ok(self.payload);
        };
        let carried: Option<Error> = if self.payload.is_empty() {
            None
        } else {
            self.serializer.deserialize(&self.payload).ok()
        };
        let mut error = match (self.status, carried) {
            (Status::ServiceExpectedError, Some(error)) => error,
            (_, Some(error)) => Error::new(kind, error.to_string()),
            (_, None) => Error::new(kind, format!("invoke id {}", self.invoke_id)),
        };
        if let Some(remote) = remote {
            error.remote = Some(remote.to_string());
        }
        Err(error)
    }
}
