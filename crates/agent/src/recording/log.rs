//! On-disk encoding of a recording: one frame per chunk, each frame holding a
//! MessagePack-encoded [`RecordedChunk`].

use protocol::{Frame, FrameCodec, ProtocolError};

use super::{RecordedChunk, StoreError};

/// Encode a chunk as a self-delimiting frame.
pub fn encode_chunk(codec: &FrameCodec, chunk: &RecordedChunk) -> Result<Vec<u8>, StoreError> {
    let payload =
        rmp_serde::to_vec_named(chunk).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    codec
        .encode(&Frame::new(payload))
        .map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Decode every chunk of a recording log.
///
/// A torn final frame, left behind when the agent died mid-write, ends the
/// log; any other damage is an error.
pub fn decode_log(codec: &FrameCodec, key: &str, bytes: &[u8]) -> Result<Vec<RecordedChunk>, StoreError> {
    let mut chunks = Vec::new();
    for frame in codec.frames(bytes) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(ProtocolError::Framing(reason)) => {
                tracing::warn!(recording = %key, reason = %reason, "Ignoring torn tail of recording");
                break;
            }
            Err(e) => return Err(StoreError::Corrupt(e.to_string())),
        };
        let chunk: RecordedChunk = rmp_serde::from_slice(&frame.payload)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}
