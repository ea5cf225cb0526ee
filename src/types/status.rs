//! Worker lifecycle and message classification tags

/// Parsing status of a flow worker.
///
/// `Done` is transient: it is held while a completed message is flushed and
/// the worker then returns to `Init` for the next message on the same flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessStatus {
    /// No message in progress, next fragment triggers detection
    #[default]
    Init,
    /// A parser is accumulating bytes
    Processing,
    /// Message complete, being flushed
    Done,
}

/// Classification of the message currently buffered by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketType {
    /// Nothing buffered
    #[default]
    None,
    Unknown,
    /// Body is gzip content-encoded
    Gzip,
    /// Connection upgrade to WebSocket
    WebSocket,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::None => "none",
            PacketType::Unknown => "unknown",
            PacketType::Gzip => "gzip",
            PacketType::WebSocket => "websocket",
        }
    }
}
