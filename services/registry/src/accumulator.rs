//! Resumable SHA-256.
//!
//! `sha2::Sha256` cannot export its mid-stream state, so this keeps the
//! chaining value, the total length and the unprocessed tail itself and
//! drives the block function directly. The encoded form can be stored
//! between requests and decoded in a different process.

use sha2::digest::generic_array::GenericArray;
use storage::Digest;

const BLOCK: usize = 64;
const TAG: &[u8; 5] = b"s256\x01";
const HEADER: usize = TAG.len() + 32 + 8;

const INITIAL: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// An encoded accumulator could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[allow(missing_docs)]
pub enum InvalidState {
    #[error("digest state is {0} bytes, too short")]
    Truncated(usize),

    #[error("digest state has an unknown tag")]
    UnknownTag,

    #[error("digest state tail is {actual} bytes, length implies {expected}")]
    TailMismatch { expected: usize, actual: usize },
}

/// Incremental SHA-256 whose state survives encode/decode.
#[derive(Clone, PartialEq, Eq)]
pub struct DigestAccumulator {
    chain: [u32; 8],
    length: u64,
    tail: Vec<u8>,
}

impl std::fmt::Debug for DigestAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestAccumulator")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl Default for DigestAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

fn compress(chain: &mut [u32; 8], blocks: &[u8]) {
    debug_assert_eq!(blocks.len() % BLOCK, 0);
    for block in blocks.chunks_exact(BLOCK) {
        sha2::compress256(chain, std::slice::from_ref(GenericArray::from_slice(block)));
    }
}

impl DigestAccumulator {
    /// State before any bytes have been absorbed.
    pub fn new() -> Self {
        Self {
            chain: INITIAL,
            length: 0,
            tail: Vec::with_capacity(BLOCK),
        }
    }

    /// Total number of bytes absorbed.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether no bytes have been absorbed.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Feed the next bytes of the stream.
    pub fn absorb(&mut self, mut bytes: &[u8]) {
        self.length += bytes.len() as u64;

        if !self.tail.is_empty() {
            let take = (BLOCK - self.tail.len()).min(bytes.len());
            self.tail.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.tail.len() < BLOCK {
                return;
            }
            compress(&mut self.chain, &self.tail);
            self.tail.clear();
        }

        let whole = bytes.len() - bytes.len() % BLOCK;
        compress(&mut self.chain, &bytes[..whole]);
        self.tail.extend_from_slice(&bytes[whole..]);
    }

    /// Digest of everything absorbed so far. The accumulator can keep absorbing.
    pub fn finalize(&self) -> Digest {
        let mut chain = self.chain;

        let mut last = Vec::with_capacity(2 * BLOCK);
        last.extend_from_slice(&self.tail);
        last.push(0x80);
        let padded = if last.len() > BLOCK - 8 { 2 * BLOCK } else { BLOCK };
        last.resize(padded - 8, 0);
        last.extend_from_slice(&(self.length.wrapping_mul(8)).to_be_bytes());
        compress(&mut chain, &last);

        let mut out = [0u8; 32];
        for (word, bytes) in chain.iter().zip(out.chunks_exact_mut(4)) {
            bytes.copy_from_slice(&word.to_be_bytes());
        }
        Digest::sha256(out)
    }

    /// Opaque binary form: tag, chaining words, length, then the tail.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER + self.tail.len());
        out.extend_from_slice(TAG);
        for word in self.chain {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.tail);
        out
    }

    /// Restore a state produced by [`DigestAccumulator::encode`].
    pub fn decode(raw: &[u8]) -> Result<Self, InvalidState> {
        if raw.len() < HEADER {
            return Err(InvalidState::Truncated(raw.len()));
        }
        let (tag, rest) = raw.split_at(TAG.len());
        if tag != TAG {
            return Err(InvalidState::UnknownTag);
        }

        let (words, rest) = rest.split_at(32);
        let mut chain = [0u32; 8];
        for (word, bytes) in chain.iter_mut().zip(words.chunks_exact(4)) {
            *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }

        let (length, tail) = rest.split_at(8);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(length);
        let length = u64::from_be_bytes(buf);

        let expected = (length % BLOCK as u64) as usize;
        if tail.len() != expected {
            return Err(InvalidState::TailMismatch {
                expected,
                actual: tail.len(),
            });
        }

        let mut restored = Vec::with_capacity(BLOCK);
        restored.extend_from_slice(tail);
        Ok(Self {
            chain,
            length,
            tail: restored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest as _;

    fn oneshot(data: &[u8]) -> Digest {
        Digest::sha256(sha2::Sha256::digest(data).into())
    }

    #[test]
    fn hello_world_in_two_requests() {
        let mut first = DigestAccumulator::new();
        first.absorb(b"hello ");
        let stored = first.encode();

        let mut second = DigestAccumulator::decode(&stored).unwrap();
        second.absorb(b"world");

        let digest = second.finalize();
        assert_eq!(
            digest.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(digest, oneshot(b"hello world"));
    }

    #[test]
    fn empty_stream() {
        let acc = DigestAccumulator::new();
        assert!(acc.is_empty());
        assert_eq!(
            acc.finalize().to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn padding_boundaries() {
        for len in [55, 56, 57, 63, 64, 65, 119, 120, 128] {
            let data = vec![0x5a; len];
            let mut acc = DigestAccumulator::new();
            acc.absorb(&data);
            assert_eq!(acc.finalize(), oneshot(&data), "length {len}");
        }
    }

    #[test]
    fn every_split_with_round_trips() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 7 + 3) as u8).collect();
        let expected = oneshot(&data);

        for a in (0..data.len()).step_by(7) {
            for b in (a..data.len()).step_by(13) {
                let mut acc = DigestAccumulator::new();
                for fragment in [&data[..a], &data[a..b], &data[b..]] {
                    acc = DigestAccumulator::decode(&acc.encode()).unwrap();
                    acc.absorb(fragment);
                }
                assert_eq!(acc.finalize(), expected, "split at {a}/{b}");
                assert_eq!(acc.len(), data.len() as u64);
            }
        }
    }

    #[test]
    fn finalize_does_not_consume() {
        let mut acc = DigestAccumulator::new();
        acc.absorb(b"abc");
        let early = acc.finalize();
        assert_eq!(early, oneshot(b"abc"));

        acc.absorb(b"def");
        assert_eq!(acc.finalize(), oneshot(b"abcdef"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(
            DigestAccumulator::decode(b"short"),
            Err(InvalidState::Truncated(5))
        );

        let mut raw = DigestAccumulator::new().encode();
        raw[0] = b'x';
        assert_eq!(
            DigestAccumulator::decode(&raw),
            Err(InvalidState::UnknownTag)
        );

        let mut acc = DigestAccumulator::new();
        acc.absorb(b"abc");
        let mut raw = acc.encode();
        raw.pop();
        assert_eq!(
            DigestAccumulator::decode(&raw),
            Err(InvalidState::TailMismatch {
                expected: 3,
                actual: 2
            })
        );
    }
}
