//! Read side of the transport.
//!
//! Bytes land in pooled blocks and are exposed as a [`SequenceReader`].
//! Parsers report how far they got with two marks: `consumed` bytes are
//! released, `examined` bytes were looked at without being enough to make
//! progress. Parsing is only retried once data beyond the examined mark
//! arrives.

use std::fmt;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::http::pool::MemoryPool;
use crate::http::reader::SequenceReader;

pub struct Input {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    pool: MemoryPool,
    blocks: Vec<BytesMut>,
    /// Consumed bytes at the front of `blocks[0]`.
    head: usize,
    buffered: usize,
    /// Examined mark, relative to `head`.
    examined: usize,
    completed: bool,
}

impl Input {
    pub fn new(reader: Box<dyn AsyncRead + Unpin + Send>, pool: MemoryPool) -> Self {
        Self {
            reader,
            pool,
            blocks: Vec::new(),
            head: 0,
            buffered: 0,
            examined: 0,
            completed: false,
        }
    }

    /// Unconsumed bytes currently held.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Whether the transport has signalled end of stream.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether bytes past the examined mark are waiting to be parsed.
    pub fn has_unexamined(&self) -> bool {
        self.buffered > self.examined
    }

    pub fn reader(&self) -> SequenceReader<'_, BytesMut> {
        SequenceReader::with_offset(&self.blocks, self.head)
    }

    /// Releases `consumed` bytes and records that `examined` bytes were looked at.
    pub fn advance_to(&mut self, consumed: usize, examined: usize) {
        debug_assert!(consumed <= examined && examined <= self.buffered);
        let consumed = consumed.min(self.buffered);
        self.examined = examined.clamp(consumed, self.buffered) - consumed;
        self.buffered -= consumed;
        self.head += consumed;

        loop {
            let count = self.blocks.len();
            let Some(first) = self.blocks.first_mut() else {
                break;
            };
            if self.head < first.len() {
                break;
            }
            self.head -= first.len();
            if count == 1 {
                first.clear();
                self.head = 0;
                break;
            }
            let block = self.blocks.remove(0);
            self.pool.give_back(block);
        }
    }

    /// Reads once from the transport. Returns the byte count, 0 at end of stream.
    pub async fn fill(&mut self) -> std::io::Result<usize> {
        if self.completed {
            return Ok(0);
        }
        let needs_block = self
            .blocks
            .last()
            .is_none_or(|block| block.len() == block.capacity());
        if needs_block {
            self.blocks.push(self.pool.rent());
        }
        let Some(tail) = self.blocks.last_mut() else {
            return Ok(0);
        };

        let n = self.reader.read_buf(tail).await?;
        if n == 0 {
            self.completed = true;
        }
        self.buffered += n;
        Ok(n)
    }

    /// Gives every block back to the pool. Buffered bytes are discarded.
    pub fn release(&mut self) {
        for block in self.blocks.drain(..) {
            self.pool.give_back(block);
        }
        self.head = 0;
        self.buffered = 0;
        self.examined = 0;
    }
}

impl Drop for Input {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input")
            .field("blocks", &self.blocks.len())
            .field("buffered", &self.buffered)
            .field("examined", &self.examined)
            .field("completed", &self.completed)
            .finish()
    }
}
