//! Opaque byte codec for transparent gRPC proxying.
//!
//! Marshalling and unmarshalling treat every message as an uninterpreted
//! byte string, so the proxy bridges arbitrary methods without knowing any
//! proto schema. The gRPC framing layer still handles the length-prefixed
//! message boundaries; this codec only moves the payload bytes through.

use bytes::{Buf, BufMut, Bytes};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Codec whose encode and decode sides both pass raw [`Bytes`] through.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        // The framing layer hands us exactly one message worth of bytes;
        // zero-length messages are valid (empty proto requests).
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}
