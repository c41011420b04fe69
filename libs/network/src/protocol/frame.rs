//! Length-Prefixed Framing
//!
//! Each frame is a 4-byte big-endian body length followed by one encoded
//! [`Envelope`] body. The decoder accumulates partial reads and yields
//! complete frames; a length above the configured maximum is a protocol
//! error and the connection must be dropped.

use super::{Envelope, WireFormat};
use crate::{Result, TransportError};
use bytes::{Buf, Bytes, BytesMut};

/// Encode an envelope as one length-prefixed frame
pub fn encode_frame(envelope: &Envelope, max_frame_size: usize) -> Result<Bytes> {
    let body = envelope.to_bytes()?;
    if body.len() > max_frame_size {
        return Err(TransportError::FrameTooLarge {
            len: body.len(),
            max: max_frame_size,
        });
    }

    let mut frame = BytesMut::with_capacity(WireFormat::LENGTH_PREFIX_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Incremental frame decoder over a byte stream
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Read target for `AsyncReadExt::read_buf`
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes held that do not yet form a complete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Split off the next complete frame body, if one is buffered
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < WireFormat::LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buffer[..WireFormat::LENGTH_PREFIX_SIZE]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;

        if body_len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < WireFormat::LENGTH_PREFIX_SIZE + body_len {
            self.buffer
                .reserve(WireFormat::LENGTH_PREFIX_SIZE + body_len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(WireFormat::LENGTH_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(body_len).freeze()))
    }

    /// Decode the next complete envelope, if one is buffered
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        match self.next_frame()? {
            Some(body) => Envelope::from_bytes(&body).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(WireFormat::MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorAddress, ActorUid, PoolId};
    use proptest::prelude::*;

    fn envelope(payload: Vec<u8>) -> Envelope {
        Envelope::tell(
            ActorAddress::new("127.0.0.1:7100", PoolId::new("main"), ActorUid::new("sink")),
            payload,
        )
    }

    #[test]
    fn test_frame_prefix_matches_body() {
        let env = envelope(vec![1, 2, 3]);
        let frame = encode_frame(&env, WireFormat::MAX_FRAME_SIZE).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(len, env.encoded_len());
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let env = envelope(vec![0u8; 512]);
        assert!(matches!(
            encode_frame(&env, 256),
            Err(TransportError::FrameTooLarge { max: 256, .. })
        ));
    }

    #[test]
    fn test_decoder_rejects_oversized_length() {
        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&(4096u32).to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(TransportError::FrameTooLarge { len: 4096, max: 1024 })
        ));
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let env = envelope(vec![9; 100]);
        let frame = encode_frame(&env, WireFormat::MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::default();
        decoder.extend(&frame[..frame.len() - 1]);
        assert!(decoder.next_envelope().unwrap().is_none());

        decoder.extend(&frame[frame.len() - 1..]);
        let decoded = decoder.next_envelope().unwrap().unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let first = envelope(vec![1]);
        let second = envelope(vec![2, 2]);
        let mut decoder = FrameDecoder::default();
        decoder.extend(&encode_frame(&first, WireFormat::MAX_FRAME_SIZE).unwrap());
        decoder.extend(&encode_frame(&second, WireFormat::MAX_FRAME_SIZE).unwrap());

        assert_eq!(decoder.next_envelope().unwrap().unwrap(), first);
        assert_eq!(decoder.next_envelope().unwrap().unwrap(), second);
        assert!(decoder.next_envelope().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_any_chunking_yields_same_envelopes(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..8),
            chunk in 1usize..64,
        ) {
            let envelopes: Vec<Envelope> = payloads.into_iter().map(envelope).collect();
            let mut stream = Vec::new();
            for env in &envelopes {
                stream.extend_from_slice(&encode_frame(env, WireFormat::MAX_FRAME_SIZE).unwrap());
            }

            let mut decoder = FrameDecoder::default();
            let mut decoded = Vec::new();
            for piece in stream.chunks(chunk) {
                decoder.extend(piece);
                while let Some(env) = decoder.next_envelope().unwrap() {
                    decoded.push(env);
                }
            }

            prop_assert_eq!(decoded, envelopes);
            prop_assert_eq!(decoder.buffered(), 0);
        }
    }
}
