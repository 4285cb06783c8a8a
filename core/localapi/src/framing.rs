//! Splits a byte stream of concatenated JSON objects into frames.
//!
//! Frames end at the closing brace that returns nesting depth to zero. Braces
//! inside string literals are ignored, so pretty-printed output (where inner
//! objects also close on a line of their own) frames correctly. Bytes outside
//! any object, such as newlines or shell noise, are dropped.

use crate::MAX_FRAME_BYTES;

#[derive(Debug)]
pub struct FrameSplitter {
    buffer: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Current object outgrew the limit; track nesting but keep nothing.
    discarding: bool,
    discarded: usize,
    max_frame_bytes: usize,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }

    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            depth: 0,
            in_string: false,
            escaped: false,
            discarding: false,
            discarded: 0,
            max_frame_bytes,
        }
    }

    /// Bytes of the frame currently being assembled.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of oversized frames skipped so far.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Feeds bytes and returns every frame completed by them.
    ///
    /// A frame longer than the limit is skipped whole: its nesting is still
    /// followed to its closing brace, so frames before and after it survive.
    pub fn push(&mut self, input: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();

        for &byte in input {
            if self.depth == 0 {
                if byte == b'{' {
                    self.depth = 1;
                    self.buffer.push(byte);
                }
                continue;
            }

            if !self.discarding {
                self.buffer.push(byte);
                if self.buffer.len() > self.max_frame_bytes {
                    tracing::warn!(
                        limit = self.max_frame_bytes,
                        "Skipping oversized watch frame"
                    );
                    self.discarding = true;
                    self.buffer = Vec::new();
                }
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        self.finish_frame(&mut frames);
                    }
                }
                _ => {}
            }
        }

        frames
    }

    fn finish_frame(&mut self, frames: &mut Vec<String>) {
        if self.discarding {
            self.discarding = false;
            self.discarded += 1;
        } else {
            frames.push(String::from_utf8_lossy(&self.buffer).into_owned());
        }
        self.buffer.clear();
    }
}
