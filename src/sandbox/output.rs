//! Bounded capture of sandbox output streams

/// Appended after the kept prefix when a stream exceeded its cap
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Text captured from one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    /// True when bytes past the cap were discarded
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn new(text: impl Into<String>) -> Self {
        CapturedOutput {
            text: text.into(),
            truncated: false,
        }
    }

    /// Text as stored on the job, with the marker when truncated
    pub fn render(&self) -> String {
        if self.truncated {
            format!("{}{}", self.text, TRUNCATION_MARKER)
        } else {
            self.text.clone()
        }
    }
}

/// Accumulates raw bytes up to a fixed cap.
///
/// Chunks past the cap are dropped on the floor; pushing never blocks and
/// never grows the buffer beyond `cap`.
#[derive(Debug)]
pub struct BoundedBuffer {
    bytes: Vec<u8>,
    cap: usize,
    overflowed: bool,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        BoundedBuffer {
            bytes: Vec::with_capacity(cap.min(8192)),
            cap,
            overflowed: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.overflowed = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Decode what was kept. A multi-byte character cut by the cap is dropped.
    pub fn finish(self) -> CapturedOutput {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.overflowed && text.ends_with(char::REPLACEMENT_CHARACTER) {
            text.pop();
        }
        CapturedOutput {
            text,
            truncated: self.overflowed,
        }
    }
}

/// Cut `text` to at most `cap` bytes on a character boundary
pub fn truncate_to_cap(text: &str, cap: usize) -> CapturedOutput {
    if text.len() <= cap {
        return CapturedOutput::new(text);
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    CapturedOutput {
        text: text[..end].to_string(),
        truncated: true,
    }
}
