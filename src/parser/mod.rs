//! Incremental application-protocol parsers.
//!
//! A worker never decodes protocols itself. It asks a [`ParserFactory`] to pick
//! a parser from the first fragment of a message, then feeds every fragment of
//! that message into it until [`Parser::is_done`] reports completion.
//!
//! Detection is total: bytes no variant recognises get a [`DefaultParser`].

mod default;
mod http;

pub use default::DefaultParser;
pub use http::{HttpDirection, HttpParser};

use std::fmt;

use crate::Result;
use crate::types::PacketType;

/// Protocol variant of a parser, with a stable numeric code for output records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParserType {
    /// Catch-all pass-through
    Null = 0,
    HttpRequest = 1,
    HttpResponse = 3,
}

impl ParserType {
    /// Numeric code carried in output records
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ParserType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Incremental parser for one message of one flow.
///
/// Owned exclusively by a single worker task, so implementations need `Send`
/// but never `Sync`.
pub trait Parser: Send {
    /// Parser name for output records (e.g. "HTTPRequest")
    fn name(&self) -> &'static str;

    fn parser_type(&self) -> ParserType;

    /// Classification of the bytes accumulated so far
    fn packet_type(&self) -> PacketType {
        PacketType::Unknown
    }

    /// Append payload bytes to the message being accumulated
    ///
    /// Returns the number of bytes consumed, or a parse error when the bytes
    /// cannot belong to this protocol.
    fn write(&mut self, payload: &[u8]) -> Result<usize>;

    /// Whether the accumulated message is complete
    fn is_done(&self) -> bool;

    /// Render the accumulated message; empty when there is nothing to show
    fn display(&self) -> Vec<u8>;

    /// Drop accumulated state so the instance can start a new message
    fn reset(&mut self);
}

/// Selects a parser variant by inspecting the first fragment of a message.
///
/// Detection only looks at the bytes; the caller still writes them into the
/// returned parser.
pub trait ParserFactory: Send + Sync + 'static {
    fn detect(&self, payload: &[u8]) -> Box<dyn Parser>;
}

/// The built-in variants: HTTP/1.x requests and responses, then pass-through.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinParsers;

impl ParserFactory for BuiltinParsers {
    fn detect(&self, payload: &[u8]) -> Box<dyn Parser> {
        detect(payload)
    }
}

/// Pick a built-in parser for `payload`. Never fails.
pub fn detect(payload: &[u8]) -> Box<dyn Parser> {
    if HttpParser::detect_request(payload) {
        Box::new(HttpParser::request())
    } else if HttpParser::detect_response(payload) {
        Box::new(HttpParser::response())
    } else {
        Box::new(DefaultParser::new())
    }
}
