use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    Result, SerializerType,
    meta::{Address, RegisterMeta, ServiceMeta},
    protocol::{Frame, Header, MessageCode, encode_frame},
};

/// Body of a registry protocol frame.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub enum RegistryData {
    /// Client to node: publish or cancel one provider address.
    Register(RegisterMeta),
    /// Client to node.
    Subscribe(ServiceMeta),
    /// Node to client: members added to a service.
    Publish {
        service: ServiceMeta,
        metas: Vec<RegisterMeta>,
    },
    /// Node to client: a member removed from a service.
    Cancel {
        service: ServiceMeta,
        meta: RegisterMeta,
    },
    /// Node to client: an address went away.
    Offline(Address),
}

/// A registry protocol message. The sequence doubles as the frame id and is what the
/// receiver acknowledges.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct RegistryMessage {
    pub sequence: u64,
    /// Membership version this message was built for; zero for client-originated messages.
    #[serde(default)]
    pub version: u64,
    pub data: RegistryData,
}

impl RegistryMessage {
    #[must_use]
    pub fn new(sequence: u64, version: u64, data: RegistryData) -> Self {
        Self {
            sequence,
            version,
            data,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    pub fn encode(&self, code: MessageCode, serializer: SerializerType) -> Result<Bytes> {
        let body = serializer.serialize(self)?;
        encode_frame(Header::new(code, serializer, self.sequence), &body)
    }

    /// # Errors
    ///
    /// Returns an error if the frame body is not a registry message.
    pub fn decode(frame: &Frame) -> Result<Self> {
        frame.header.serializer.deserialize(&frame.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameDecoder;
    use bytes::BytesMut;

    #[test]
    fn test_frame_id_is_sequence() {
        let service = ServiceMeta::new("g", "svc", "1.0");
        let meta = RegisterMeta::new(Address::new("10.0.0.1", 9000), service.clone());
        let message = RegistryMessage::new(
            17,
            3,
            RegistryData::Publish {
                service,
                metas: vec![meta],
            },
        );

        let bytes = message
            .encode(MessageCode::PublishService, SerializerType::MessagePack)
            .unwrap();
        let mut buf = BytesMut::from(&bytes[..]);
        let frame = FrameDecoder::new(1 << 20).decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.id, 17);
        assert_eq!(frame.header.code, MessageCode::PublishService);
        assert_eq!(RegistryMessage::decode(&frame).unwrap(), message);
    }
}
