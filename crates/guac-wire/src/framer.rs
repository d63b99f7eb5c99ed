//! Stateful decoder for the length-prefixed instruction stream.
//!
//! Instructions arrive as text fragments of arbitrary, transport-chunk-sized
//! length. Each instruction is one or more `<decimal-length>.<element>`
//! units joined by `,` and terminated by `;`. Element lengths count Unicode
//! code points, not bytes.

use thiserror::Error;

/// Default cap on buffered, not-yet-parseable input.
pub const MAX_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("instruction buffer exceeded {max} bytes")]
    BufferOverflow { max: usize },
}

/// One decoded instruction: opcode plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new<O, A>(opcode: O, args: A) -> Self
    where
        O: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            opcode: opcode.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Encode back to wire form: `3.arg` units, comma-joined, `;`-terminated.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, element) in std::iter::once(&self.opcode).chain(self.args.iter()).enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&element.chars().count().to_string());
            out.push('.');
            out.push_str(element);
        }
        out.push(';');
        out
    }
}

/// Accumulating instruction decoder.
///
/// Fed fragments are appended to an internal buffer; complete instructions
/// are extracted from the head and returned in arrival order. Anything that
/// cannot yet be decided, including a byte that does not fit the grammar, is
/// left buffered until more input arrives. The buffer is only consumed once
/// a full instruction is confirmed, so a fragment boundary can fall anywhere.
pub struct Framer {
    buf: String,
    max_buffer: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_buffer(MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buf: String::new(),
            max_buffer,
        }
    }

    /// Bytes currently buffered awaiting more input.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a fragment and drain every complete instruction from the head.
    pub fn feed(&mut self, fragment: &str) -> Result<Vec<Instruction>, FramingError> {
        self.buf.push_str(fragment);

        let mut out = Vec::new();
        while let Some((instruction, consumed)) = take_instruction(&self.buf) {
            self.buf.drain(..consumed);
            out.push(instruction);
        }

        if self.buf.len() > self.max_buffer {
            return Err(FramingError::BufferOverflow {
                max: self.max_buffer,
            });
        }
        Ok(out)
    }
}

/// Try to read one full instruction from the head of `buf`.
///
/// Returns the instruction and the number of bytes it occupied, or `None`
/// when the buffer does not yet contain enough data to decide.
fn take_instruction(buf: &str) -> Option<(Instruction, usize)> {
    let mut pos = 0usize;
    let mut elements: Vec<String> = Vec::new();

    loop {
        let rest = &buf[pos..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || digits == rest.len() {
            // No length prefix to read yet, or it is not terminated yet.
            return None;
        }
        let length: usize = rest[..digits].parse().ok()?;
        if rest.as_bytes()[digits] != b'.' {
            return None;
        }

        let body = &rest[digits + 1..];
        let element_bytes = char_span(body, length)?;
        let element = &body[..element_bytes];

        let delimiter = *body.as_bytes().get(element_bytes)?;
        pos += digits + 1 + element_bytes + 1;
        match delimiter {
            b',' => elements.push(element.to_string()),
            b';' => {
                elements.push(element.to_string());
                let mut parts = elements.into_iter();
                let opcode = parts.next().unwrap_or_default();
                return Some((
                    Instruction {
                        opcode,
                        args: parts.collect(),
                    },
                    pos,
                ));
            }
            _ => return None,
        }
    }
}

/// Byte length of the first `count` chars of `s`, or `None` if `s` holds fewer.
fn char_span(s: &str, count: usize) -> Option<usize> {
    if count == 0 {
        return Some(0);
    }
    let mut seen = 0;
    for (idx, ch) in s.char_indices() {
        seen += 1;
        if seen == count {
            return Some(idx + ch.len_utf8());
        }
    }
    None
}
