use bytes::{Bytes, BytesMut};
use tracing::error;

use crate::codec::{decode_frame, HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;

/// Accumulates arbitrary-sized socket reads and slices out complete frames.
///
/// Unread data is bounded: once the bytes left over after draining every
/// complete frame exceed one maximum frame, the whole buffer is dropped and
/// [`FrameError::Overflow`] is reported. A header announcing a payload larger
/// than the maximum is handled the same way, since that frame can never
/// complete. The buffer stays usable afterwards.
#[derive(Debug)]
pub struct RecvBuffer {
    buf: BytesMut,
    max_payload: usize,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_LEN)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_payload,
        }
    }

    /// Append `chunk` and move every complete payload into `out`, in order.
    ///
    /// Payloads completed before an overflow are still delivered.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) -> Result<()> {
        self.buf.extend_from_slice(chunk);

        loop {
            match decode_frame(&mut self.buf, self.max_payload) {
                Ok(Some(payload)) => out.push(payload),
                Ok(None) => break,
                Err(FrameError::PayloadTooLarge { .. }) => return Err(self.discard()),
                Err(err) => return Err(err),
            }
        }

        if self.buf.len() > self.max_payload + HEADER_SIZE {
            return Err(self.discard());
        }

        Ok(())
    }

    /// Number of unread bytes currently held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn discard(&mut self) -> FrameError {
        let buffered = self.buf.len();
        error!(buffered, "receiving buffer is full, discarding all data in it");
        self.buf.clear();

        FrameError::Overflow {
            buffered,
            max: self.max_payload + HEADER_SIZE,
        }
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::codec::encode_frame;

    fn wire(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for payload in payloads {
            encode_frame(payload, MAX_PAYLOAD_LEN, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn arbitrary_chunking_preserves_payload_order() {
        let payloads: Vec<Vec<u8>> = (0..40u8)
            .map(|i| vec![i; (i as usize * 37) % 300])
            .collect();
        let refs: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
        let bytes = wire(&refs);

        for chunk_size in [1usize, 2, 3, 4, 5, 7, 64, 1000, bytes.len()] {
            let mut recv = RecvBuffer::new();
            let mut out = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                recv.push(chunk, &mut out).unwrap();
            }

            assert_eq!(out.len(), payloads.len(), "chunk size {chunk_size}");
            for (got, expected) in out.iter().zip(&payloads) {
                assert_eq!(got.as_ref(), expected.as_slice());
            }
            assert!(recv.is_empty());
        }
    }

    #[test]
    fn uneven_chunk_boundaries_split_headers() {
        let bytes = wire(&[b"alpha", b"", b"gamma-delta"]);
        let boundaries = [1usize, 6, 9, 10, bytes.len()];

        let mut recv = RecvBuffer::new();
        let mut out = Vec::new();
        let mut start = 0;
        for end in boundaries {
            recv.push(&bytes[start..end], &mut out).unwrap();
            start = end;
        }

        let got: Vec<&[u8]> = out.iter().map(|b| b.as_ref()).collect();
        assert_eq!(got, vec![&b"alpha"[..], b"", b"gamma-delta"]);
    }

    #[test]
    fn partial_frame_is_kept_until_complete() {
        let bytes = wire(&[b"complete", b"partial"]);
        let split = bytes.len() - 3;

        let mut recv = RecvBuffer::new();
        let mut out = Vec::new();
        recv.push(&bytes[..split], &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(recv.len(), HEADER_SIZE + b"partial".len() - 3);

        recv.push(&bytes[split..], &mut out).unwrap();
        assert_eq!(out[1].as_ref(), b"partial");
    }

    #[test]
    fn more_than_four_mib_without_boundary_is_discarded() {
        let mut recv = RecvBuffer::new();
        let mut out = Vec::new();

        // 5 MiB of bytes whose would-be length prefix announces more than the
        // maximum payload: no frame boundary can ever be found.
        let chunk = vec![0xFFu8; 1024 * 1024];
        let mut overflows = 0;
        for _ in 0..5 {
            match recv.push(&chunk, &mut out) {
                Ok(()) => {}
                Err(FrameError::Overflow { .. }) => overflows += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(overflows, 5);
        assert!(out.is_empty());
        assert!(recv.is_empty());
    }

    #[test]
    fn largest_legal_frame_is_not_treated_as_overflow() {
        let mut recv = RecvBuffer::new();
        let mut out = Vec::new();

        let payload = vec![0x5Au8; MAX_PAYLOAD_LEN];
        let bytes = wire(&[payload.as_slice()]);
        for chunk in bytes.chunks(1024 * 1024) {
            recv.push(chunk, &mut out).unwrap();
        }

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), MAX_PAYLOAD_LEN);
        assert!(recv.is_empty());
    }

    #[test]
    fn oversized_length_prefix_discards_buffer() {
        let mut recv = RecvBuffer::with_max_payload(16);
        let mut out = Vec::new();

        let mut bytes = BytesMut::from(wire(&[b"ok"]).as_slice());
        bytes.put_u32_ne(17);
        bytes.put_slice(b"junk");

        let err = recv.push(&bytes, &mut out).unwrap_err();
        assert!(matches!(err, FrameError::Overflow { .. }));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"ok");
        assert!(recv.is_empty());
    }

    #[test]
    fn buffer_recovers_after_overflow() {
        let mut recv = RecvBuffer::with_max_payload(8);
        let mut out = Vec::new();

        let mut junk = BytesMut::new();
        junk.put_u32_ne(1_000);
        assert!(recv.push(&junk, &mut out).is_err());

        recv.push(&wire(&[b"fresh"]), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"fresh");
    }
}
