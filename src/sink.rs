//! Output sinks for reassembled messages.
//!
//! A worker emits one [`MessageRecord`] per flush. Sinks are shared by every
//! worker of a registry, so they must be `Send + Sync`; workers call them
//! synchronously from their own task.

use std::fmt::{self, Write as _};
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::parser::ParserType;
use crate::types::{FlowId, PacketType};
use crate::{ReassemblyError, Result};

/// One flushed message of one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub flow_id: FlowId,
    pub parser_name: &'static str,
    pub parser_type: ParserType,
    pub packet_type: PacketType,
    /// Rendered body (already hex-dumped when the registry is configured so)
    pub body: Vec<u8>,
}

impl MessageRecord {
    /// Length of the rendered body
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Body as text, replacing invalid UTF-8
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl fmt::Display for MessageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flow:{}, Name:{}, Type:{}, Length:{}\n{}",
            self.flow_id,
            self.parser_name,
            self.parser_type,
            self.len(),
            self.body_lossy()
        )
    }
}

/// Destination for flushed messages.
pub trait OutputSink: Send + Sync + 'static {
    fn emit(&self, record: &MessageRecord) -> Result<()>;
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn emit(&self, record: &MessageRecord) -> Result<()> {
        info!(
            flow_id = %record.flow_id,
            parser = record.parser_name,
            parser_type = record.parser_type.code(),
            packet_type = record.packet_type.as_str(),
            length = record.len(),
            "\n{}",
            record.body_lossy()
        );
        Ok(())
    }
}

/// Writes each record as text to any `std::io::Write`.
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }

    /// Recover the inner writer
    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send + 'static> OutputSink for WriterSink<W> {
    fn emit(&self, record: &MessageRecord) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ReassemblyError::sink_error("writer lock poisoned", None))?;
        writeln!(writer, "{record}")
            .and_then(|_| writer.flush())
            .map_err(|e| ReassemblyError::sink_error("failed to write record", Some(e)))
    }
}

/// Forwards records to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MessageRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiver that yields its records
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MessageRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn emit(&self, record: &MessageRecord) -> Result<()> {
        self.tx
            .send(record.clone())
            .map_err(|_| ReassemblyError::sink_error("record receiver dropped", None))
    }
}

/// Canonical hex dump: offset, 16 bytes in two groups of eight, ASCII column.
///
/// ```text
/// 00000000  47 45 54 20 2f 20 48 54  54 50 2f 31 2e 31 0d 0a  |GET / HTTP/1.1..|
/// ```
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(16) * 79);

    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &byte in chunk {
            out.push(if (32..=126).contains(&byte) { byte as char } else { '.' });
        }
        out.push_str("|\n");
    }

    out
}
