use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, ErrorKind, Result};

/// Object serializer selected per call, carried in the high nibble of the sign byte.
#[derive(
    Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Clone, Copy, clap::ValueEnum,
)]
pub enum SerializerType {
    #[default]
    MessagePack = 0x01,
    Json = 0x02,
}

impl SerializerType {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(SerializerType::MessagePack),
            0x02 => Some(SerializerType::Json),
            _ => None,
        }
    }

    /// Appends the encoding of `value` to `buf`.
    ///
    /// # Errors
    ///
    /// Returns `SerializeFailed` (or `SerdeJsonError`) when `value` cannot be encoded.
    pub fn serialize_into<T: Serialize + ?Sized>(self, value: &T, buf: &mut BytesMut) -> Result<()> {
        let mut writer = buf.writer();
        match self {
            SerializerType::MessagePack => rmp_serde::encode::write_named(&mut writer, value)?,
            SerializerType::Json => serde_json::to_writer(&mut writer, value)?,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `SerializeFailed` (or `SerdeJsonError`) when `value` cannot be encoded.
    pub fn serialize<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        self.serialize_into(value, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes `bytes`. An empty slice decodes as the null value, so `()` and `Option<T>`
    /// results survive body-less responses.
    ///
    /// # Errors
    ///
    /// Returns `DeserializeFailed` (or `SerdeJsonError`) when `bytes` is not a valid encoding of `T`.
    pub fn deserialize<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            return serde_json::from_value(serde_json::Value::Null).map_err(|e| {
                Error::new(
                    ErrorKind::DeserializeFailed,
                    format!("empty payload is not a valid value: {e}"),
                )
            });
        }
        match self {
            SerializerType::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
            SerializerType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl std::fmt::Display for SerializerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
