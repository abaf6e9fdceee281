//! Generic encoding and decoding.
//!
//! This module contains the generic [`Codec`] trait, a JSON codec based on
//! serde (the default), a compact binary codec based on bincode, and the
//! length-prefixed framing used by gRPC-compatible transports.

mod decode;
mod framing;

#[cfg(test)]
mod tests;

pub use self::decode::Streaming;
pub use self::framing::{pack, FrameParser, HEADER_SIZE};

use std::marker::PhantomData;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::Status;

/// Trait that knows how to encode and decode messages.
///
/// A codec is instantiated per call and selected per method at contract
/// construction; `Encode` is the locally produced message type and `Decode`
/// the locally consumed one, so a caller and a responder use mirrored
/// instantiations of the same codec.
pub trait Codec: Default + Send + 'static {
    /// The encodable message.
    type Encode: Send + 'static;
    /// The decodable message.
    type Decode: Send + 'static;

    /// Codec name, advertised as `application/grpc+{NAME}`.
    const NAME: &'static str;

    /// Encode a message to bytes.
    fn encode(&mut self, item: &Self::Encode) -> Result<Bytes, Status>;

    /// Decode a message from bytes.
    fn decode(&mut self, buf: Bytes) -> Result<Self::Decode, Status>;
}

/// A [`Codec`] for `application/grpc+json` via serde_json.
#[derive(Debug, Clone)]
pub struct JsonCodec<T, U> {
    _pd: PhantomData<(T, U)>,
}

impl<T, U> Default for JsonCodec<T, U> {
    fn default() -> Self {
        Self { _pd: PhantomData }
    }
}

impl<T, U> Codec for JsonCodec<T, U>
where
    T: Serialize + Send + 'static,
    U: DeserializeOwned + Send + 'static,
{
    type Encode = T;
    type Decode = U;

    const NAME: &'static str = "json";

    fn encode(&mut self, item: &T) -> Result<Bytes, Status> {
        serde_json::to_vec(item)
            .map(Bytes::from)
            .map_err(|err| Status::internal(format!("error encoding message: {err}")))
    }

    fn decode(&mut self, buf: Bytes) -> Result<U, Status> {
        serde_json::from_slice(&buf)
            .map_err(|err| Status::invalid_argument(format!("error decoding message: {err}")))
    }
}

/// A [`Codec`] for `application/grpc+bincode`: compact, not self-describing.
#[derive(Debug, Clone)]
pub struct BincodeCodec<T, U> {
    _pd: PhantomData<(T, U)>,
}

impl<T, U> Default for BincodeCodec<T, U> {
    fn default() -> Self {
        Self { _pd: PhantomData }
    }
}

impl<T, U> Codec for BincodeCodec<T, U>
where
    T: Serialize + Send + 'static,
    U: DeserializeOwned + Send + 'static,
{
    type Encode = T;
    type Decode = U;

    const NAME: &'static str = "bincode";

    fn encode(&mut self, item: &T) -> Result<Bytes, Status> {
        bincode::serialize(item)
            .map(Bytes::from)
            .map_err(|err| Status::internal(format!("error encoding message: {err}")))
    }

    fn decode(&mut self, buf: Bytes) -> Result<U, Status> {
        bincode::deserialize(&buf)
            .map_err(|err| Status::invalid_argument(format!("error decoding message: {err}")))
    }
}
