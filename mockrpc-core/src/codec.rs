//! Server-side `DynamicMessage` codec for `tonic::server::Grpc`.
//!
//! Adapted from the teacher's client-oriented `DynamicCodec`: there, the
//! encoder sends the request and the decoder parses the response. Serving
//! traffic runs the opposite direction — the decoder parses the incoming
//! request (needs `request_desc` to know which message type to build) and
//! the encoder just writes out a `DynamicMessage` that already carries its
//! own descriptor.

use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::codec::{BufferSettings, Codec, Decoder, Encoder};
use tonic::Status;

pub struct DynamicCodec {
    request_desc: MessageDescriptor,
    response_desc: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(request_desc: MessageDescriptor, response_desc: MessageDescriptor) -> Self {
        DynamicCodec { request_desc, response_desc }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder {
            _response_desc: self.response_desc.clone(),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            request_desc: self.request_desc.clone(),
        }
    }
}

pub struct DynamicEncoder {
    _response_desc: MessageDescriptor,
}

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut tonic::codec::EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))?;
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

pub struct DynamicDecoder {
    request_desc: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut tonic::codec::DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let msg = DynamicMessage::decode(self.request_desc.clone(), src)
            .map_err(|e| Status::invalid_argument(format!("failed to decode request: {e}")))?;
        Ok(Some(msg))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}
