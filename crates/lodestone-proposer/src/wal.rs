//! In-memory WAL tail shared between the proposer core and its links.
//!
//! The core appends chunks arriving from the WAL source; each link reads
//! from its own position so members can lag independently. The tail is
//! trimmed once every member has flushed past a position; long-term WAL
//! storage belongs to an external collaborator, not this core.
//!
//! Single-writer discipline: only the coordinator task appends or trims;
//! links take read locks for short, non-blocking copies.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use lodestone_types::Lsn;

use crate::error::ProposerError;

/// One gap-free run of WAL bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalChunk {
    pub begin_lsn: Lsn,
    pub data: Bytes,
}

impl WalChunk {
    pub fn new(begin_lsn: Lsn, data: Bytes) -> Self {
        Self { begin_lsn, data }
    }

    /// Position one past the last byte of this chunk.
    pub fn end_lsn(&self) -> Lsn {
        self.begin_lsn + self.data.len() as u64
    }
}

/// The retained suffix of the WAL stream.
#[derive(Debug)]
pub struct WalTail {
    /// Everything below this position has been trimmed.
    start_lsn: Lsn,
    /// Next position the source will append at.
    end_lsn: Lsn,
    chunks: VecDeque<WalChunk>,
}

impl WalTail {
    /// An empty tail beginning at the elected start position.
    pub fn new(start_lsn: Lsn) -> Self {
        Self {
            start_lsn,
            end_lsn: start_lsn,
            chunks: VecDeque::new(),
        }
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Position one past the last appended byte.
    pub fn end_lsn(&self) -> Lsn {
        self.end_lsn
    }

    /// Appends the next chunk from the WAL source.
    ///
    /// The source contract is an ordered, gap-free stream: the chunk must
    /// begin exactly at the current end.
    pub fn append(&mut self, chunk: WalChunk) -> Result<(), ProposerError> {
        if chunk.begin_lsn != self.end_lsn {
            return Err(ProposerError::WalGap {
                expected: self.end_lsn,
                got: chunk.begin_lsn,
            });
        }
        if chunk.data.is_empty() {
            return Ok(());
        }
        self.end_lsn = chunk.end_lsn();
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// Copies up to `max_bytes` starting at `from`, or `None` if `from` is
    /// at (or beyond) the end of the tail.
    ///
    /// `from` below the trim floor means the caller needs bytes this core
    /// no longer holds; trimming only advances past positions every member
    /// has flushed, so that indicates a caller bug.
    pub fn read_from(&self, from: Lsn, max_bytes: usize) -> Option<WalChunk> {
        debug_assert!(from >= self.start_lsn, "read below trimmed floor");
        if from < self.start_lsn || from >= self.end_lsn {
            return None;
        }

        let mut out = BytesMut::with_capacity(max_bytes.min(64 * 1024));
        let mut cursor = from;
        for chunk in &self.chunks {
            if out.len() >= max_bytes {
                break;
            }
            if chunk.end_lsn() <= cursor {
                continue;
            }
            let skip = cursor
                .checked_sub(chunk.begin_lsn)
                .map_or(0, |bytes| bytes as usize);
            let available = &chunk.data[skip..];
            let take = available.len().min(max_bytes - out.len());
            out.extend_from_slice(&available[..take]);
            cursor += take as u64;
        }

        if out.is_empty() {
            None
        } else {
            Some(WalChunk::new(from, out.freeze()))
        }
    }

    /// Drops whole chunks entirely below `up_to`.
    ///
    /// Safe once every member has flushed past `up_to`. Partial chunks are
    /// kept; the floor only advances on chunk boundaries.
    pub fn trim(&mut self, up_to: Lsn) {
        while let Some(front) = self.chunks.front() {
            if front.end_lsn() <= up_to {
                self.start_lsn = front.end_lsn();
                self.chunks.pop_front();
            } else {
                break;
            }
        }
        if self.chunks.is_empty() && up_to >= self.end_lsn {
            self.start_lsn = self.end_lsn;
        }
    }

    /// Bytes currently retained.
    pub fn retained_bytes(&self) -> u64 {
        self.end_lsn
            .checked_sub(self.start_lsn)
            .expect("tail end below tail start")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(begin: u64, bytes: &'static [u8]) -> WalChunk {
        WalChunk::new(Lsn::new(begin), Bytes::from_static(bytes))
    }

    #[test]
    fn append_requires_contiguity() {
        let mut tail = WalTail::new(Lsn::new(100));

        tail.append(chunk(100, b"abcde")).unwrap();
        assert_eq!(tail.end_lsn(), Lsn::new(105));

        let err = tail.append(chunk(110, b"xyz")).unwrap_err();
        assert!(matches!(
            err,
            ProposerError::WalGap { expected, got }
                if expected == Lsn::new(105) && got == Lsn::new(110)
        ));
    }

    #[test]
    fn read_spans_chunk_boundaries() {
        let mut tail = WalTail::new(Lsn::new(0));
        tail.append(chunk(0, b"aaa")).unwrap();
        tail.append(chunk(3, b"bbb")).unwrap();
        tail.append(chunk(6, b"ccc")).unwrap();

        let read = tail.read_from(Lsn::new(1), 16).unwrap();
        assert_eq!(read.begin_lsn, Lsn::new(1));
        assert_eq!(&read.data[..], b"aabbbccc");

        let read = tail.read_from(Lsn::new(4), 3).unwrap();
        assert_eq!(&read.data[..], b"bbc");
    }

    #[test]
    fn read_at_end_is_none() {
        let mut tail = WalTail::new(Lsn::new(10));
        assert!(tail.read_from(Lsn::new(10), 8).is_none());

        tail.append(chunk(10, b"xy")).unwrap();
        assert!(tail.read_from(Lsn::new(12), 8).is_none());
    }

    #[test]
    fn trim_advances_on_chunk_boundaries() {
        let mut tail = WalTail::new(Lsn::new(0));
        tail.append(chunk(0, b"aaaa")).unwrap();
        tail.append(chunk(4, b"bbbb")).unwrap();
        tail.append(chunk(8, b"cccc")).unwrap();

        tail.trim(Lsn::new(6));
        assert_eq!(tail.start_lsn(), Lsn::new(4));
        assert_eq!(tail.retained_bytes(), 8);

        // Data past the floor is still readable.
        let read = tail.read_from(Lsn::new(5), 16).unwrap();
        assert_eq!(&read.data[..], b"bbbcccc");

        tail.trim(Lsn::new(12));
        assert_eq!(tail.start_lsn(), Lsn::new(12));
        assert_eq!(tail.retained_bytes(), 0);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut tail = WalTail::new(Lsn::new(5));
        tail.append(WalChunk::new(Lsn::new(5), Bytes::new())).unwrap();
        assert_eq!(tail.end_lsn(), Lsn::new(5));
        assert_eq!(tail.retained_bytes(), 0);
    }
}
