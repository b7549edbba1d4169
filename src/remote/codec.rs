//! Length-prefixed JSON frame codec.
//!
//! Each frame is a 4-byte big-endian payload length followed by a UTF-8
//! JSON document.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large (max {MAX_FRAME_LEN} bytes)")]
    TooLarge,
}

impl From<io::Error> for FrameError {
    fn from(error: io::Error) -> Self {
        let oversized = error
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if oversized {
            Self::TooLarge
        } else {
            Self::Io(error)
        }
    }
}

/// Codec decoding `D` frames and encoding `E` frames.
///
/// Framing is left to [`LengthDelimitedCodec`]; this layer only maps
/// payloads to and from JSON.
pub struct JsonFrameCodec<D, E> {
    frames: LengthDelimitedCodec,
    _marker: PhantomData<fn(E) -> D>,
}

impl<D, E> JsonFrameCodec<D, E> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for JsonFrameCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for JsonFrameCodec<D, E> {
    type Item = D;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

impl<D, E: Serialize> Encoder<E> for JsonFrameCodec<D, E> {
    type Error = FrameError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = Bytes::from(serde_json::to_vec(&item)?);
        self.frames.encode(payload, dst)?;
        Ok(())
    }
}
