//! Cursor over a possibly discontiguous run of byte segments.
//!
//! The reader never mutates the underlying buffers. Its only state is a
//! position, so cloning it is a cheap checkpoint. Running out of data is not
//! an error: every `try_*` method returns `None` (or `false`) and leaves the
//! position untouched, so parsers can be re-entered once more bytes arrive.

use std::borrow::Cow;

pub struct SequenceReader<'a, B> {
    segments: &'a [B],
    seg: usize,
    offset: usize,
    consumed: usize,
    len: usize,
}

impl<B> Clone for SequenceReader<'_, B> {
    fn clone(&self) -> Self {
        Self {
            segments: self.segments,
            seg: self.seg,
            offset: self.offset,
            consumed: self.consumed,
            len: self.len,
        }
    }
}

impl<'a, B: AsRef<[u8]>> SequenceReader<'a, B> {
    pub fn new(segments: &'a [B]) -> Self {
        Self::with_offset(segments, 0)
    }

    /// Starts `start` bytes into the first segment.
    pub fn with_offset(segments: &'a [B], start: usize) -> Self {
        let total: usize = segments.iter().map(|s| s.as_ref().len()).sum();
        debug_assert!(segments.first().map_or(start == 0, |s| start <= s.as_ref().len()));
        let mut reader = Self {
            segments,
            seg: 0,
            offset: start,
            consumed: 0,
            len: total.saturating_sub(start),
        };
        reader.skip_exhausted();
        reader
    }

    /// Bytes moved past since the reader was created.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn remaining(&self) -> usize {
        self.len - self.consumed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_end(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread part of the current segment.
    pub fn unread_span(&self) -> &'a [u8] {
        let segments: &'a [B] = self.segments;
        match segments.get(self.seg) {
            Some(segment) => &segment.as_ref()[self.offset..],
            None => &[],
        }
    }

    pub fn peek(&self) -> Option<u8> {
        self.unread_span().first().copied()
    }

    /// Moves forward `n` bytes. Returns `false` without moving if fewer remain.
    pub fn advance(&mut self, n: usize) -> bool {
        if n > self.remaining() {
            return false;
        }
        self.advance_unchecked(n);
        true
    }

    /// Whether the unread bytes start with `prefix`. `false` when too few remain.
    pub fn is_next(&self, prefix: &[u8]) -> bool {
        if self.remaining() < prefix.len() {
            return false;
        }
        let mut probe = self.clone();
        for &expected in prefix {
            if probe.peek() != Some(expected) {
                return false;
            }
            probe.advance_unchecked(1);
        }
        true
    }

    /// Returns the bytes before the next `delimiter` and moves past the
    /// delimiter. Borrows when the bytes sit in one segment, copies otherwise.
    pub fn try_read_to(&mut self, delimiter: &[u8]) -> Option<Cow<'a, [u8]>> {
        let first = *delimiter.first()?;
        let mut probe = self.clone();
        loop {
            let span = probe.unread_span();
            if span.is_empty() {
                return None;
            }
            match span.iter().position(|&b| b == first) {
                Some(i) => {
                    probe.advance_unchecked(i);
                    if probe.is_next(delimiter) {
                        let data = self.take(probe.consumed - self.consumed);
                        self.advance_unchecked(delimiter.len());
                        return Some(data);
                    }
                    if probe.remaining() < delimiter.len() {
                        return None;
                    }
                    probe.advance_unchecked(1);
                }
                None => probe.advance_unchecked(span.len()),
            }
        }
    }

    /// Copies as many bytes as fit into `dst`, returning the count.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let span = self.unread_span();
            if span.is_empty() {
                break;
            }
            let step = span.len().min(dst.len() - copied);
            dst[copied..copied + step].copy_from_slice(&span[..step]);
            copied += step;
            self.advance_unchecked(step);
        }
        copied
    }

    fn take(&mut self, n: usize) -> Cow<'a, [u8]> {
        let span = self.unread_span();
        if span.len() >= n {
            self.advance_unchecked(n);
            return Cow::Borrowed(&span[..n]);
        }
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let span = self.unread_span();
            let step = (n - out.len()).min(span.len());
            out.extend_from_slice(&span[..step]);
            self.advance_unchecked(step);
        }
        Cow::Owned(out)
    }

    fn advance_unchecked(&mut self, mut n: usize) {
        self.consumed += n;
        while n > 0 {
            let step = n.min(self.unread_span().len());
            self.offset += step;
            n -= step;
            self.skip_exhausted();
        }
    }

    fn skip_exhausted(&mut self) {
        while let Some(segment) = self.segments.get(self.seg) {
            if self.offset < segment.as_ref().len() {
                break;
            }
            self.seg += 1;
            self.offset = 0;
        }
    }
}
