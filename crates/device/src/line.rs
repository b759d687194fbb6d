//! Assembling command lines from serial input.

use heapless::String;
use rotoplot_protocol::MAX_LINE_LEN;

pub type Line = String<MAX_LINE_LEN>;

/// A line that couldn't be used: too long, or not ASCII.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Garbled;

#[derive(Default)]
pub struct LineBuffer {
    buf: Line,
    garbled: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds in one byte. When a line terminator arrives, returns the
    /// completed line (without the terminator). Empty lines are skipped, so
    /// `\r\n` terminators produce one line, not two.
    pub fn push(&mut self, byte: u8) -> Option<Result<Line, Garbled>> {
        if byte == b'\n' || byte == b'\r' {
            let line = core::mem::take(&mut self.buf);
            if core::mem::take(&mut self.garbled) {
                return Some(Err(Garbled));
            }
            return (!line.is_empty()).then_some(Ok(line));
        }

        if !self.garbled && (!byte.is_ascii() || self.buf.push(byte as char).is_err()) {
            self.garbled = true;
        }
        None
    }
}
