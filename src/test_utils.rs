//! Test doubles for exercising workers and registries.
//!
//! - [`RecordingSink`] keeps every emitted record in memory
//! - [`ScriptedParsers`] hands out parsers whose completion is driven by a
//!   write count, records every write in order, and can park the first write
//!   behind a [`Gate`] to hold a worker busy

#![cfg(any(test, feature = "benchmark"))]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::parser::{Parser, ParserFactory, ParserType};
use crate::sink::{MessageRecord, OutputSink};
use crate::{ReassemblyError, Result};

/// Sink that stores records for later assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<MessageRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<MessageRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records emitted for one flow, in emission order
    pub fn records_for(&self, flow_id: &str) -> Vec<MessageRecord> {
        self.records().into_iter().filter(|r| r.flow_id.as_str() == flow_id).collect()
    }
}

impl OutputSink for RecordingSink {
    fn emit(&self, record: &MessageRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| ReassemblyError::sink_error("recording sink poisoned", None))?
            .push(record.clone());
        Ok(())
    }
}

/// Blocks the first parser write until released.
#[derive(Debug, Default)]
pub struct Gate {
    entered: AtomicBool,
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    /// Whether a write is parked at the gate (or has passed it)
    pub fn entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if let Ok(mut open) = self.open.lock() {
            *open = true;
        }
        self.cv.notify_all();
    }

    fn pass(&self) {
        if self.entered.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(mut open) = self.open.lock() else {
            return;
        };
        while !*open {
            open = match self.cv.wait(open) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    writes: Mutex<Vec<Vec<u8>>>,
    detections: AtomicUsize,
}

/// Factory for [`ScriptedParser`]s sharing one write log.
///
/// A message completes after `writes_per_message` writes. A payload starting
/// with `!bad` is rejected with a parse error, one starting with `!panic`
/// makes the parser panic.
#[derive(Debug, Clone)]
pub struct ScriptedParsers {
    writes_per_message: usize,
    script: Arc<Script>,
    gate: Option<Arc<Gate>>,
}

impl ScriptedParsers {
    pub fn new(writes_per_message: usize) -> Self {
        Self { writes_per_message, script: Arc::default(), gate: None }
    }

    /// Like [`ScriptedParsers::new`], with the first write parked behind the returned gate
    pub fn gated(writes_per_message: usize) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        let parsers = Self { gate: Some(Arc::clone(&gate)), ..Self::new(writes_per_message) };
        (parsers, gate)
    }

    /// Every accepted write, across all parsers, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.script.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Number of parsers handed out
    pub fn detections(&self) -> usize {
        self.script.detections.load(Ordering::SeqCst)
    }
}

impl ParserFactory for ScriptedParsers {
    fn detect(&self, _payload: &[u8]) -> Box<dyn Parser> {
        self.script.detections.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedParser {
            writes_per_message: self.writes_per_message,
            script: Arc::clone(&self.script),
            gate: self.gate.clone(),
            buffer: Vec::new(),
            writes: 0,
        })
    }
}

/// Parser produced by [`ScriptedParsers`].
#[derive(Debug)]
pub struct ScriptedParser {
    writes_per_message: usize,
    script: Arc<Script>,
    gate: Option<Arc<Gate>>,
    buffer: Vec<u8>,
    writes: usize,
}

impl Parser for ScriptedParser {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    fn parser_type(&self) -> ParserType {
        ParserType::Null
    }

    fn write(&mut self, payload: &[u8]) -> Result<usize> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if payload.starts_with(b"!panic") {
            panic!("scripted parser panic");
        }
        if payload.starts_with(b"!bad") {
            return Err(ReassemblyError::parse_error(self.name(), "scripted rejection"));
        }
        if let Ok(mut writes) = self.script.writes.lock() {
            writes.push(payload.to_vec());
        }
        self.buffer.extend_from_slice(payload);
        self.writes += 1;
        Ok(payload.len())
    }

    fn is_done(&self) -> bool {
        self.writes >= self.writes_per_message
    }

    fn display(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.writes = 0;
    }
}
