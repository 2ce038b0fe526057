//! # JSON <-> Protobuf Codec
//!
//! Implements `tonic::codec::Codec` so that `tonic` transports `serde_json::Value` directly.
//!
//! A codec is built for one end of one method:
//!
//! * [`JsonCodec::client`] writes the method's requests and reads its responses;
//! * [`JsonCodec::server`] reads the requests and writes the responses.
//!
//! Messages are validated against their descriptor through `prost_reflect::DynamicMessage`.
//! Who is to blame for a message that does not fit decides the status: a caller sending a bad
//! request gets `invalid_argument` on either end, while a handler reply or a server response
//! that does not match the schema is an `internal` fault.
use prost::{Message, bytes::Buf};
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use tonic::{
    Status,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
};

/// The end of the call a codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// A Codec that bridges `serde_json::Value` and the Protobuf binary format.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    side: Side,
    /// Schema of the messages this side writes.
    encode_desc: MessageDescriptor,
    /// Schema of the messages this side reads.
    decode_desc: MessageDescriptor,
}

impl JsonCodec {
    /// Encodes the requests of `method` and decodes its responses.
    pub fn client(method: &MethodDescriptor) -> Self {
        Self {
            side: Side::Client,
            encode_desc: method.input(),
            decode_desc: method.output(),
        }
    }

    /// Decodes the requests of `method` and encodes its responses.
    pub fn server(method: &MethodDescriptor) -> Self {
        Self {
            side: Side::Server,
            encode_desc: method.output(),
            decode_desc: method.input(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

impl Codec for JsonCodec {
    type Encode = serde_json::Value;
    type Decode = serde_json::Value;

    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        JsonEncoder {
            side: self.side,
            desc: self.encode_desc.clone(),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        JsonDecoder {
            side: self.side,
            desc: self.decode_desc.clone(),
        }
    }
}

/// Encodes a JSON value into Protobuf bytes.
#[derive(Debug)]
pub struct JsonEncoder {
    side: Side,
    desc: MessageDescriptor,
}

impl Encoder for JsonEncoder {
    type Item = serde_json::Value;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        to_message(&self.desc, self.side, item)?.encode_raw(dst);
        Ok(())
    }
}

/// Decodes Protobuf bytes into a JSON value.
#[derive(Debug)]
pub struct JsonDecoder {
    side: Side,
    desc: MessageDescriptor,
}

impl Decoder for JsonDecoder {
    type Item = serde_json::Value;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        from_bytes(&self.desc, self.side, src).map(Some)
    }
}

fn to_message(
    desc: &MessageDescriptor,
    side: Side,
    item: serde_json::Value,
) -> Result<DynamicMessage, Status> {
    DynamicMessage::deserialize(desc.clone(), item).map_err(|e| match side {
        Side::Client => Status::invalid_argument(format!(
            "Request does not match the '{}' schema: {e}",
            desc.full_name()
        )),
        Side::Server => Status::internal(format!(
            "Handler reply does not match the '{}' schema: {e}",
            desc.full_name()
        )),
    })
}

fn from_bytes(
    desc: &MessageDescriptor,
    side: Side,
    src: impl Buf,
) -> Result<serde_json::Value, Status> {
    let mut msg = DynamicMessage::new(desc.clone());
    msg.merge(src).map_err(|e| match side {
        Side::Client => Status::internal(format!(
            "Failed to decode '{}' response: {e}",
            desc.full_name()
        )),
        Side::Server => Status::invalid_argument(format!(
            "Malformed '{}' request: {e}",
            desc.full_name()
        )),
    })?;

    serde_json::to_value(&msg)
        .map_err(|e| Status::internal(format!("Failed to map message to JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tonic::Code;

    fn get_product() -> MethodDescriptor {
        catalog_service::catalog_service()
            .methods()
            .find(|m| m.name() == "GetProduct")
            .unwrap()
    }

    #[test]
    fn test_sides_swap_descriptors() {
        let method = get_product();
        let mut client = JsonCodec::client(&method);
        let mut server = JsonCodec::server(&method);

        assert_eq!(client.encoder().desc, method.input());
        assert_eq!(client.decoder().desc, method.output());
        assert_eq!(server.encoder().desc, method.output());
        assert_eq!(server.decoder().desc, method.input());
    }

    #[test]
    fn test_mismatched_messages_are_blamed_on_their_author() {
        let method = get_product();
        let bad = json!({ "sku": ["A1"] });

        let request = to_message(&method.input(), Side::Client, bad.clone()).unwrap_err();
        assert_eq!(request.code(), Code::InvalidArgument);

        let reply = to_message(&method.output(), Side::Server, bad).unwrap_err();
        assert_eq!(reply.code(), Code::Internal);
        assert!(reply.message().contains("catalog.Product"));
    }

    #[test]
    fn test_undecodable_bytes() {
        let method = get_product();
        let garbage: &[u8] = &[0xff, 0xff];

        let request = from_bytes(&method.input(), Side::Server, garbage).unwrap_err();
        assert_eq!(request.code(), Code::InvalidArgument);

        let response = from_bytes(&method.output(), Side::Client, garbage).unwrap_err();
        assert_eq!(response.code(), Code::Internal);
    }

    #[test]
    fn test_valid_message_round_trips() {
        let method = get_product();
        let product = json!({ "sku": "A1", "name": "Anvil", "category": "tools", "stock": 3 });

        let bytes = to_message(&method.output(), Side::Server, product.clone())
            .unwrap()
            .encode_to_vec();
        let decoded = from_bytes(&method.output(), Side::Client, bytes.as_slice()).unwrap();

        assert_eq!(decoded, product);
    }
}
