//! Pass-through parser for unrecognised payloads

use super::{Parser, ParserType};
use crate::Result;
use crate::sink::hexdump;

/// Treats every fragment as a complete message.
///
/// Printable payloads are shown as text up to the first NUL byte, anything
/// else as a hex dump.
#[derive(Debug, Default)]
pub struct DefaultParser {
    buffer: Vec<u8>,
    done: bool,
}

impl DefaultParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Parser for DefaultParser {
    fn name(&self) -> &'static str {
        "DefaultParser"
    }

    fn parser_type(&self) -> ParserType {
        ParserType::Null
    }

    fn write(&mut self, payload: &[u8]) -> Result<usize> {
        self.buffer.extend_from_slice(payload);
        self.done = true;
        Ok(payload.len())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn display(&self) -> Vec<u8> {
        match self.buffer.first() {
            None => Vec::new(),
            Some(&first) if !(32..=126).contains(&first) => hexdump(&self.buffer).into_bytes(),
            Some(_) => {
                let end = self.buffer.iter().position(|&b| b == 0).unwrap_or(self.buffer.len());
                self.buffer[..end].to_vec()
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.done = false;
    }
}
