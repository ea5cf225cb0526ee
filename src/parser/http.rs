//! HTTP/1.x message parser.
//!
//! Headers are parsed with httparse once the head is complete. Completion of
//! the body is decided by, in order:
//! - chunked transfer encoding (terminating zero-size chunk seen)
//! - Content-Length
//! - bodyless messages (requests without a length, 1xx/204/304 responses)
//!
//! A response with neither length nor chunking runs until the connection goes
//! quiet, so it is only ever emitted by the worker's idle flush.

use httparse::{EMPTY_HEADER, Header, Request, Response, Status};

use super::{Parser, ParserType};
use crate::types::PacketType;
use crate::{ReassemblyError, Result};

/// Maximum number of headers parsed per message.
const MAX_HEADERS: usize = 64;

const METHODS: [&[u8]; 9] =
    [b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"CONNECT", b"TRACE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpDirection {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

/// What the message head tells us about the body.
#[derive(Debug, Default)]
struct HeadInfo {
    content_length: Option<usize>,
    chunked: bool,
    gzip: bool,
    websocket: bool,
}

impl HeadInfo {
    fn scan(headers: &[Header<'_>], context: &str) -> Result<Self> {
        let mut info = HeadInfo::default();
        for header in headers.iter().filter(|h| !h.name.is_empty()) {
            let value = String::from_utf8_lossy(header.value);
            let value = value.trim();
            if header.name.eq_ignore_ascii_case("content-length") {
                let len = value.parse::<usize>().map_err(|_| {
                    ReassemblyError::parse_error(context, format!("invalid Content-Length {value:?}"))
                })?;
                info.content_length = Some(len);
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                info.chunked = value.to_ascii_lowercase().contains("chunked");
            } else if header.name.eq_ignore_ascii_case("content-encoding") {
                info.gzip = value.to_ascii_lowercase().contains("gzip");
            } else if header.name.eq_ignore_ascii_case("upgrade") {
                info.websocket = value.eq_ignore_ascii_case("websocket");
            }
        }
        Ok(info)
    }
}

/// Accumulates one HTTP/1.x request or response.
#[derive(Debug)]
pub struct HttpParser {
    direction: HttpDirection,
    buffer: Vec<u8>,
    /// Length of the head once it has been fully received
    head_len: Option<usize>,
    framing: BodyFraming,
    /// Body offset of the first chunk not yet fully received
    chunk_offset: usize,
    packet_type: PacketType,
    done: bool,
}

impl HttpParser {
    pub fn new(direction: HttpDirection) -> Self {
        Self {
            direction,
            buffer: Vec::new(),
            head_len: None,
            framing: BodyFraming::Empty,
            chunk_offset: 0,
            packet_type: PacketType::Unknown,
            done: false,
        }
    }

    pub fn request() -> Self {
        Self::new(HttpDirection::Request)
    }

    pub fn response() -> Self {
        Self::new(HttpDirection::Response)
    }

    pub fn direction(&self) -> HttpDirection {
        self.direction
    }

    /// Whether `payload` starts like an HTTP/1.x request line
    pub fn detect_request(payload: &[u8]) -> bool {
        METHODS
            .iter()
            .any(|method| payload.starts_with(method) && payload.get(method.len()) == Some(&b' '))
    }

    /// Whether `payload` starts like an HTTP/1.x status line
    pub fn detect_response(payload: &[u8]) -> bool {
        payload.starts_with(b"HTTP/1.")
    }

    /// Parse the head if it is complete, returning its length and body framing.
    fn parse_head(&self) -> Result<Option<(usize, HeadInfo, BodyFraming)>> {
        let context = self.name();
        let mut headers = [EMPTY_HEADER; MAX_HEADERS];

        match self.direction {
            HttpDirection::Request => {
                let mut req = Request::new(&mut headers);
                match req.parse(&self.buffer) {
                    Ok(Status::Complete(len)) => {
                        let info = HeadInfo::scan(req.headers, context)?;
                        let framing = if info.chunked {
                            BodyFraming::Chunked
                        } else {
                            info.content_length.map_or(BodyFraming::Empty, BodyFraming::Length)
                        };
                        Ok(Some((len, info, framing)))
                    }
                    Ok(Status::Partial) => Ok(None),
                    Err(e) => Err(ReassemblyError::parse_error(context, e.to_string())),
                }
            }
            HttpDirection::Response => {
                let mut resp = Response::new(&mut headers);
                match resp.parse(&self.buffer) {
                    Ok(Status::Complete(len)) => {
                        let info = HeadInfo::scan(resp.headers, context)?;
                        let code = resp.code.unwrap_or(200);
                        let framing = if (100..200).contains(&code) || code == 204 || code == 304 {
                            BodyFraming::Empty
                        } else if info.chunked {
                            BodyFraming::Chunked
                        } else {
                            info.content_length.map_or(BodyFraming::UntilClose, BodyFraming::Length)
                        };
                        Ok(Some((len, info, framing)))
                    }
                    Ok(Status::Partial) => Ok(None),
                    Err(e) => Err(ReassemblyError::parse_error(context, e.to_string())),
                }
            }
        }
    }

    fn advance(&mut self) -> Result<()> {
        let head_len = match self.head_len {
            Some(len) => len,
            None => match self.parse_head()? {
                Some((len, info, framing)) => {
                    self.packet_type = if info.websocket {
                        PacketType::WebSocket
                    } else if info.gzip {
                        PacketType::Gzip
                    } else {
                        PacketType::Unknown
                    };
                    self.framing = framing;
                    self.head_len = Some(len);
                    len
                }
                None => return Ok(()),
            },
        };

        let context = self.name();
        let body = &self.buffer[head_len..];
        self.done = match self.framing {
            BodyFraming::Empty => true,
            BodyFraming::Length(expected) => body.len() >= expected,
            BodyFraming::Chunked => match scan_chunks(body, self.chunk_offset, context)? {
                ChunkScan::Complete => true,
                ChunkScan::Partial { resume } => {
                    self.chunk_offset = resume;
                    false
                }
            },
            BodyFraming::UntilClose => false,
        };
        Ok(())
    }
}

impl Parser for HttpParser {
    fn name(&self) -> &'static str {
        match self.direction {
            HttpDirection::Request => "HTTPRequest",
            HttpDirection::Response => "HTTPResponse",
        }
    }

    fn parser_type(&self) -> ParserType {
        match self.direction {
            HttpDirection::Request => ParserType::HttpRequest,
            HttpDirection::Response => ParserType::HttpResponse,
        }
    }

    fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    fn write(&mut self, payload: &[u8]) -> Result<usize> {
        self.buffer.extend_from_slice(payload);
        self.advance()?;
        Ok(payload.len())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn display(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.head_len = None;
        self.framing = BodyFraming::Empty;
        self.chunk_offset = 0;
        self.packet_type = PacketType::Unknown;
        self.done = false;
    }
}

/// Outcome of scanning a chunked body.
#[derive(Debug, PartialEq, Eq)]
enum ChunkScan {
    /// Terminating chunk and trailers received
    Complete,
    /// More data needed; scanning resumes at this body offset
    Partial { resume: usize },
}

/// Walk chunks starting at `pos`, which must be the start of a chunk-size line.
fn scan_chunks(data: &[u8], mut pos: usize, context: &str) -> Result<ChunkScan> {
    loop {
        let partial = ChunkScan::Partial { resume: pos };
        let line_end = match data[pos..].windows(2).position(|w| w == b"\r\n") {
            Some(p) => pos + p,
            None => return Ok(partial),
        };

        let line = String::from_utf8_lossy(&data[pos..line_end]);
        // chunk extensions follow a semicolon
        let size = line.split(';').next().unwrap_or_default().trim();
        let chunk_size = usize::from_str_radix(size, 16).map_err(|_| {
            ReassemblyError::parse_error(context, format!("invalid chunk size {size:?}"))
        })?;

        let data_start = line_end + 2;

        if chunk_size == 0 {
            let rest = &data[data_start..];
            // trailers, if any, end with an empty line
            let complete = rest.starts_with(b"\r\n") || rest.windows(4).any(|w| w == b"\r\n\r\n");
            return Ok(if complete { ChunkScan::Complete } else { partial });
        }

        let chunk_end = data_start
            .checked_add(chunk_size)
            .and_then(|end| end.checked_add(2))
            .ok_or_else(|| ReassemblyError::parse_error(context, "chunk size too large"))?;

        if data.len() < chunk_end {
            return Ok(partial);
        }

        if &data[chunk_end - 2..chunk_end] != b"\r\n" {
            return Err(ReassemblyError::parse_error(context, "chunk data not terminated by CRLF"));
        }

        pos = chunk_end;
    }
}
