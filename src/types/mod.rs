//! Core data types shared by workers, parsers and sinks.

pub mod fragment;
pub mod status;

pub use fragment::{FlowId, Fragment};
pub use status::{PacketType, ProcessStatus};
