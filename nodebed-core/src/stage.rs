//! Staged framing: a session reads fixed-size frames, each frame deciding the
//! size and handler of the next one.
use bytes::{Bytes, BytesMut};

/// The next read a session expects: `len` bytes, handed to the handler
/// selected by `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub len: usize,
    pub step: u16,
}

impl Stage {
    pub const fn new(len: usize, step: u16) -> Self {
        Self { len, step }
    }
}

/// Result of handling one complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Continue { reply: Option<Bytes>, next: Stage },
    Close { reply: Option<Bytes> },
}

impl Transition {
    pub fn next(next: Stage) -> Self {
        Transition::Continue { reply: None, next }
    }

    pub fn reply_and_next(reply: Bytes, next: Stage) -> Self {
        Transition::Continue {
            reply: Some(reply),
            next,
        }
    }

    pub fn close() -> Self {
        Transition::Close { reply: None }
    }

    pub fn reply_and_close(reply: Bytes) -> Self {
        Transition::Close { reply: Some(reply) }
    }
}

/// Accumulates bytes until exactly `expected` are buffered.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    expected: usize,
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            buf: BytesMut::with_capacity(expected),
        }
    }

    /// Discard anything buffered and wait for a frame of `expected` bytes.
    pub fn reset(&mut self, expected: usize) {
        self.buf.clear();
        self.buf.reserve(expected);
        self.expected = expected;
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.expected - self.buf.len()
    }

    pub fn is_complete(&self) -> bool {
        self.buf.len() == self.expected
    }

    /// Copy as much of `input` as the current frame still needs and return
    /// the number of bytes consumed.
    pub fn fill(&mut self, input: &[u8]) -> usize {
        let take = self.remaining().min(input.len());
        self.buf.extend_from_slice(&input[..take]);
        take
    }

    /// Hand out the complete frame, leaving the buffer empty.
    pub fn take_frame(&mut self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        Some(self.buf.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_released_only_when_complete() {
        let mut fb = FrameBuffer::new(6);
        assert_eq!(fb.fill(&[1, 2]), 2);
        assert!(fb.take_frame().is_none());
        assert_eq!(fb.fill(&[3, 4, 5]), 3);
        assert_eq!(fb.remaining(), 1);
        assert!(fb.take_frame().is_none());
        assert_eq!(fb.fill(&[6, 7, 8]), 1);
        assert_eq!(&fb.take_frame().unwrap()[..], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(fb.buffered(), 0);
    }

    #[test]
    fn zero_length_frame_is_immediately_complete() {
        let mut fb = FrameBuffer::new(0);
        assert!(fb.is_complete());
        assert_eq!(fb.fill(&[9]), 0);
        assert_eq!(fb.take_frame().unwrap().len(), 0);
    }

    #[test]
    fn reset_discards_partial_data() {
        let mut fb = FrameBuffer::new(4);
        fb.fill(&[1, 2]);
        fb.reset(2);
        assert_eq!(fb.remaining(), 2);
        fb.fill(&[7, 8]);
        assert_eq!(&fb.take_frame().unwrap()[..], &[7, 8]);
    }
}
