//! Response framing for the GPIB byte stream.
//!
//! The bridge delivers bytes in arbitrary chunks: one reply may span several reads and
//! several replies may arrive in one read. [`ResponseFramer`] accumulates the raw input
//! and cuts exactly one payload per outstanding command, using the [`FramingRule`] the
//! command kind implies:
//!
//! - [`FramingRule::Line`]: ASCII up to `\n`; the payload excludes the terminator.
//! - [`FramingRule::Block`]: `#6` marker, six ASCII digits of length, then that many
//!   binary bytes. The 8-byte header is stripped. The `\n` the instrument sends after
//!   the block is discarded and not counted, even when it arrives in a later chunk.
//! - [`FramingRule::MultiPart`]: `;`-separated ASCII fields up to `\n`.
//!
//! Bytes left over after a payload stay buffered as the start of the next reply.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Line terminator of every ASCII reply and of binary blocks.
pub const TERMINATOR: u8 = b'\n';

/// Marker that opens a length-prefixed block.
pub const BLOCK_MARKER: &[u8; 2] = b"#6";

/// Marker plus six length digits.
pub const BLOCK_HEADER_LEN: usize = 8;

/// How a reply is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingRule {
    /// Newline-terminated ASCII
    Line,
    /// `#6NNNNNN` length-prefixed binary block
    Block,
    /// `;`-separated ASCII fields closed by a newline
    MultiPart,
}

/// Byte sequence that violates the framing rule of the outstanding command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Something other than `#6` at the start of a block reply.
    #[error("expected #6 block marker, found {0:?}")]
    MissingBlockMarker(String),
    /// Length field is not six decimal digits.
    #[error("block length field {0:?} is not six decimal digits")]
    InvalidBlockLength(String),
    /// Terminator arrived before the block header was complete.
    #[error("terminator before block header was complete")]
    PrematureTerminator,
    /// Multi-part reply with no fields.
    #[error("empty multi-part response")]
    EmptyResponse,
}

/// Accumulates raw bytes and emits complete payloads.
#[derive(Debug, Default)]
pub struct ResponseFramer {
    buffer: BytesMut,
    /// Parsed block length once the header of the current block has been consumed.
    expected_len: Option<usize>,
    /// A block was just emitted; its trailing newline may still be in flight.
    skip_block_terminator: bool,
}

impl ResponseFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk delivered by the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet emitted.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Expected payload length of the block being received, if its header was seen.
    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    /// Whether no input is pending.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.expected_len.is_none()
    }

    /// Drop all accumulated state, including buffered input.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = None;
        self.skip_block_terminator = false;
    }

    /// Drop input no command is waiting for and return how many bytes went.
    ///
    /// The newline owed by the last block is consumed without being counted.
    pub fn discard_unsolicited(&mut self) -> usize {
        self.skip_pending_terminator();
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.expected_len = None;
        dropped
    }

    /// Cut the next payload under `rule`, or `None` if more bytes are needed.
    pub fn next_frame(&mut self, rule: FramingRule) -> Result<Option<Bytes>, FramingError> {
        self.skip_pending_terminator();

        match rule {
            FramingRule::Line => Ok(self.take_line()),
            FramingRule::MultiPart => match self.take_line() {
                Some(payload) if payload.iter().all(u8::is_ascii_whitespace) => {
                    Err(FramingError::EmptyResponse)
                }
                other => Ok(other),
            },
            FramingRule::Block => self.take_block(),
        }
    }

    fn skip_pending_terminator(&mut self) {
        if self.skip_block_terminator && !self.buffer.is_empty() {
            if self.buffer[0] == TERMINATOR {
                self.buffer.advance(1);
            }
            self.skip_block_terminator = false;
        }
    }

    fn take_line(&mut self) -> Option<Bytes> {
        let pos = self.buffer.iter().position(|&b| b == TERMINATOR)?;
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        Some(line.freeze())
    }

    fn take_block(&mut self) -> Result<Option<Bytes>, FramingError> {
        let expected = match self.expected_len {
            Some(len) => len,
            None => {
                let len = self.parse_block_header()?;
                match len {
                    Some(len) => len,
                    None => return Ok(None),
                }
            }
        };

        if self.buffer.len() < expected {
            return Ok(None);
        }

        let payload = self.buffer.split_to(expected).freeze();
        self.expected_len = None;
        self.skip_block_terminator = true;
        Ok(Some(payload))
    }

    /// Validate and strip the `#6NNNNNN` header; `None` while it is incomplete.
    fn parse_block_header(&mut self) -> Result<Option<usize>, FramingError> {
        let available = self.buffer.len().min(BLOCK_HEADER_LEN);
        let head = &self.buffer[..available];

        if let Some(pos) = head.iter().position(|&b| b == TERMINATOR) {
            if pos < BLOCK_MARKER.len() && head[..pos] == BLOCK_MARKER[..pos] {
                return Err(FramingError::PrematureTerminator);
            }
            if pos >= BLOCK_MARKER.len() && head[..2] == BLOCK_MARKER[..] {
                return Err(FramingError::PrematureTerminator);
            }
        }

        let marker_len = available.min(BLOCK_MARKER.len());
        if head[..marker_len] != BLOCK_MARKER[..marker_len] {
            return Err(FramingError::MissingBlockMarker(
                String::from_utf8_lossy(head).into_owned(),
            ));
        }

        if available < BLOCK_HEADER_LEN {
            return Ok(None);
        }

        let digits = &head[BLOCK_MARKER.len()..BLOCK_HEADER_LEN];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(FramingError::InvalidBlockLength(
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }
        let len = digits
            .iter()
            .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));

        self.buffer.advance(BLOCK_HEADER_LEN);
        self.expected_len = Some(len);
        Ok(Some(len))
    }
}
