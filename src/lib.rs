//! Per-flow reassembly of captured payload fragments.
//!
//! Flowstitch takes a stream of payload fragments, each tagged with an opaque
//! flow identifier, and turns every flow into complete application-layer
//! messages.
//!
//! # Architecture
//!
//! - **Workers**: one tokio task per flow, with a bounded inbound queue, an idle
//!   timer and an incremental parser
//! - **Parsers**: detected from the first bytes of each message; HTTP/1.x
//!   built in, anything else passes through
//! - **Registry**: routes fragments by flow id, creates and reclaims workers
//! - **Sinks**: receive one record per reassembled (or idle-flushed) message
//!
//! A flow that stays silent for `max_idle_ticks` timer periods (1 second by
//! default) is flushed and evicted, so partial messages are never lost and
//! dead flows never accumulate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowstitch::{ChannelSource, Fragment, Pipeline, TracingSink, WorkerConfig, WorkerRegistry};
//!
//! #[tokio::main]
//! async fn main() -> flowstitch::Result<()> {
//!     let config = WorkerConfig::default().with_hex_dump(false);
//!     let registry = WorkerRegistry::new(config, Arc::new(TracingSink))?;
//!
//!     let (tx, source) = ChannelSource::new(1024);
//!     let pipeline = Pipeline::spawn(source, registry);
//!
//!     tx.send(Fragment::new("10.0.0.2:51000-10.0.0.1:80", b"GET / HTTP/1.1\r\n\r\n".to_vec()))
//!         .await
//!         .ok();
//!     drop(tx);
//!
//!     pipeline.finish().await;
//!     Ok(())
//! }
//! ```

mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

pub mod config;
pub mod parser;
pub mod pipeline;
pub mod registry;
pub mod sink;
pub mod types;
pub mod worker;

pub use error::*;

pub use config::WorkerConfig;
pub use parser::{BuiltinParsers, DefaultParser, HttpParser, Parser, ParserFactory, ParserType};
pub use pipeline::{ChannelSource, FragmentSource, Pipeline, PipelineHandle, StreamSource};
pub use registry::{WorkerEvent, WorkerRegistry};
pub use sink::{ChannelSink, MessageRecord, OutputSink, TracingSink, WriterSink, hexdump};
pub use types::{FlowId, Fragment, PacketType, ProcessStatus};
pub use worker::{EventWorker, ExitReason, WorkerExit, WorkerState};
