//! Flow identifiers and captured payload fragments

use std::fmt;
use std::sync::Arc;

/// Opaque identifier of a captured flow.
///
/// Assigned by the capture layer; the registry uses it as the routing key.
/// Cloning is a reference-count bump.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(Arc<str>);

impl FlowId {
    /// Create a flow identifier
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowId {
    fn from(id: &str) -> Self {
        Self(Arc::from(id))
    }
}

impl From<String> for FlowId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl AsRef<str> for FlowId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One unit of captured payload belonging to a flow.
///
/// The payload buffer is shared (zero-copy via Arc) and never mutated. The
/// logical length may be shorter than the buffer when the capture layer hands
/// over a fixed-size record.
#[derive(Debug, Clone)]
pub struct Fragment {
    flow_id: FlowId,
    payload: Arc<[u8]>,
    len: usize,
}

impl Fragment {
    /// Create a fragment whose logical length is the whole payload
    pub fn new(flow_id: impl Into<FlowId>, payload: impl Into<Arc<[u8]>>) -> Self {
        let payload = payload.into();
        let len = payload.len();
        Self { flow_id: flow_id.into(), payload, len }
    }

    /// Create a fragment with an explicit logical length
    ///
    /// Lengths beyond the buffer are clamped to the buffer size.
    pub fn with_len(flow_id: impl Into<FlowId>, payload: impl Into<Arc<[u8]>>, len: usize) -> Self {
        let payload = payload.into();
        let len = len.min(payload.len());
        Self { flow_id: flow_id.into(), payload, len }
    }

    /// Flow this fragment belongs to
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Payload truncated to the logical length
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.len]
    }

    /// Full captured buffer, including bytes past the logical length
    pub fn raw(&self) -> &[u8] {
        &self.payload
    }

    /// Logical length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
