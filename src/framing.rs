use crate::protocol::EventRecord;
use serde_json::Value;

pub const DEFAULT_MAX_PENDING_CHARS: usize = 1_000_000;
const MALFORMED_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Record(EventRecord),
    Malformed { fragment: String, reason: String },
    Overflow { discarded_chars: usize },
}

/// Splits worker output into newline-delimited JSON records.
///
/// The unterminated tail of the stream is held in `pending` until a later
/// chunk completes it. `pending` never contains `\n`.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: String,
    pending_chars: usize,
    utf8_tail: Vec<u8>,
    max_pending_chars: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_CHARS)
    }
}

impl FrameDecoder {
    pub fn new(max_pending_chars: usize) -> Self {
        Self {
            pending: String::new(),
            pending_chars: 0,
            utf8_tail: Vec::new(),
            max_pending_chars,
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        let offset = self.pending.len();
        self.pending.push_str(chunk);

        match chunk.rfind('\n') {
            Some(idx) => {
                let remainder = self.pending.split_off(offset + idx + 1);
                let complete = std::mem::replace(&mut self.pending, remainder);
                for line in complete.split('\n') {
                    decode_line(line, &mut frames);
                }
                self.pending_chars = chunk[idx + 1..].chars().count();
            }
            None => self.pending_chars += chunk.chars().count(),
        }

        if self.pending_chars > self.max_pending_chars {
            frames.push(Frame::Overflow {
                discarded_chars: self.pending_chars,
            });
            self.pending.clear();
            self.pending_chars = 0;
        }

        frames
    }

    /// Like [`FrameDecoder::feed`] for raw pipe reads. A multi-byte character
    /// cut at the end of `bytes` is completed by the next call.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut input = std::mem::take(&mut self.utf8_tail);
        input.extend_from_slice(bytes);

        let mut text = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(error) => {
                    let valid_up_to = error.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match error.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + len..];
                        }
                        None => {
                            self.utf8_tail = rest[valid_up_to..].to_vec();
                            break;
                        }
                    }
                }
            }
        }

        self.feed(&text)
    }

    /// Drops any buffered partial line and returns how many characters were lost.
    pub fn reset(&mut self) -> usize {
        let discarded = self.pending_chars;
        self.pending.clear();
        self.pending_chars = 0;
        self.utf8_tail.clear();
        discarded
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }
}

fn decode_line(line: &str, frames: &mut Vec<Frame>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<Value>(line) {
        Ok(value) => {
            if let Some(record) = EventRecord::from_value(value) {
                frames.push(Frame::Record(record));
            }
        }
        Err(error) => frames.push(Frame::Malformed {
            fragment: preview(line),
            reason: error.to_string(),
        }),
    }
}

fn preview(line: &str) -> String {
    match line.char_indices().nth(MALFORMED_PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}…", &line[..idx]),
        None => line.to_string(),
    }
}
