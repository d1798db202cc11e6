//! Payload codecs, the only place where payload bytes are given a meaning.

use std::io;

/// Turns payloads into bytes and back for crossing the wire.
pub trait Codec<P> {
    /// Encodes `payload` into an owned byte buffer.
    fn encode(&self, payload: &P) -> Vec<u8>;

    /// Decodes a payload previously produced by `encode`.
    ///
    /// # Returns
    /// The decoded payload or an `InvalidData` io error.
    fn decode(&self, bytes: &[u8]) -> io::Result<P>;
}

/// Codec for flat `f32` buffers, the native layout of every model's weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct F32Codec;

impl Codec<Vec<f32>> for F32Codec {
    fn encode(&self, payload: &Vec<f32>) -> Vec<u8> {
        bytemuck::cast_slice(payload.as_slice()).to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> io::Result<Vec<f32>> {
        if bytes.len() % size_of::<f32>() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "payload of {} bytes is not a whole amount of f32 values",
                    bytes.len()
                ),
            ));
        }

        // The wire bytes carry no alignment guarantee, so they are collected into a fresh buffer.
        Ok(bytemuck::allocation::pod_collect_to_vec(bytes))
    }
}
