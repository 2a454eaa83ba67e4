//! Text framing for the remote-desktop gateway wire protocol.
//!
//! An instruction is one or more elements joined by `,` and terminated by
//! `;`. Each element is encoded as `<len>.<value>` where `len` is the
//! decimal byte length of `value`. Element values are opaque UTF-8; `,`,
//! `;` and `.` inside a value carry no meaning because the length prefix
//! decides where the value ends.

use thiserror::Error;

/// Largest accepted element length. Length prefixes must fit in an i32.
pub const MAX_ELEMENT_LEN: usize = (i32::MAX) as usize;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("read timed out before a full instruction arrived")]
    ShortRead,
    #[error("malformed instruction: {0}")]
    Malformed(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single decoded gateway instruction.
///
/// The first element is the opcode, the rest are its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    elements: Vec<String>,
}

impl Instruction {
    pub fn new(elements: Vec<String>) -> Self {
        debug_assert!(!elements.is_empty(), "instruction needs an opcode");
        Self { elements }
    }

    pub fn of<S: Into<String>>(opcode: S, args: Vec<String>) -> Self {
        let mut elements = Vec::with_capacity(1 + args.len());
        elements.push(opcode.into());
        elements.extend(args);
        Self { elements }
    }

    pub fn opcode(&self) -> &str {
        self.elements.first().map(String::as_str).unwrap_or("")
    }

    pub fn args(&self) -> &[String] {
        self.elements.get(1..).unwrap_or(&[])
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    pub fn into_elements(self) -> Vec<String> {
        self.elements
    }

    /// Serializes the full instruction, terminator included.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(element.len().to_string().as_bytes());
            out.push(b'.');
            out.extend_from_slice(element.as_bytes());
        }
        out.push(b';');
        out
    }

    fn encoded_len(&self) -> usize {
        self.elements
            .iter()
            .map(|e| e.len() + 12)
            .sum::<usize>()
            .max(1)
    }

    /// Tries to decode one instruction from the front of `buf`.
    ///
    /// Returns `Ok(Some((instruction, consumed)))` on success,
    /// `Ok(None)` when `buf` holds only a prefix of an instruction, and
    /// `Err(WireError::Malformed)` when the bytes can never parse.
    pub fn decode(buf: &[u8]) -> Result<Option<(Instruction, usize)>, WireError> {
        let mut pos = 0usize;
        let mut elements = Vec::new();

        loop {
            // length prefix
            let digits_start = pos;
            while pos < buf.len() && buf[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos == buf.len() {
                return Ok(None);
            }
            if pos == digits_start {
                return Err(WireError::Malformed(format!(
                    "expected length digit, found 0x{:02x}",
                    buf[pos]
                )));
            }
            if buf[pos] != b'.' {
                return Err(WireError::Malformed(format!(
                    "expected '.' after length, found 0x{:02x}",
                    buf[pos]
                )));
            }
            let len: usize = std::str::from_utf8(&buf[digits_start..pos])
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|len| *len <= MAX_ELEMENT_LEN)
                .ok_or_else(|| WireError::Malformed("length prefix out of range".into()))?;
            pos += 1;

            // value plus the element terminator
            if buf.len() < pos + len + 1 {
                return Ok(None);
            }
            let value = std::str::from_utf8(&buf[pos..pos + len])
                .map_err(|_| WireError::Malformed("element is not valid UTF-8".into()))?;
            elements.push(value.to_string());
            pos += len;

            match buf[pos] {
                b',' => pos += 1,
                b';' => return Ok(Some((Instruction { elements }, pos + 1))),
                other => {
                    return Err(WireError::Malformed(format!(
                        "expected ',' or ';' after element, found 0x{:02x}",
                        other
                    )));
                }
            }
        }
    }
}
