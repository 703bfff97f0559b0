//! CRDT Document
//!
//! The room's storage state is an opaque byte sequence. The pod never parses
//! update bytes; it delegates merge and snapshot to a kernel selected at
//! build time. The kernel must be deterministic, commutative over input
//! sets, and idempotent under duplicate apply.

use thiserror::Error;

#[cfg(not(feature = "loro-kernel"))]
compile_error!("select a CRDT kernel at build time: enable the `loro-kernel` feature");

/// Document failures.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The kernel rejected an update as unreadable.
    #[error("kernel rejected update: {0}")]
    Apply(String),

    /// The kernel could not produce a snapshot.
    #[error("kernel snapshot failed: {0}")]
    Snapshot(String),
}

/// A conflict-free merge kernel over opaque update bytes.
pub trait CrdtKernel: Send + 'static {
    /// Merge an update into the document. Duplicate updates are no-ops.
    fn apply(&mut self, update: &[u8]) -> Result<(), DocumentError>;

    /// A self-contained update representing the full state.
    fn snapshot(&self) -> Result<Vec<u8>, DocumentError>;
}

/// Loro-backed kernel: clients and pods exchange Loro update bytes.
#[cfg(feature = "loro-kernel")]
pub struct LoroKernel {
    doc: loro::LoroDoc,
}

#[cfg(feature = "loro-kernel")]
impl LoroKernel {
    /// Empty document. The pod only stores and merges what clients send;
    /// it never creates containers of its own.
    pub fn new() -> Self {
        Self {
            doc: loro::LoroDoc::new(),
        }
    }
}

#[cfg(feature = "loro-kernel")]
impl Default for LoroKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "loro-kernel")]
impl CrdtKernel for LoroKernel {
    fn apply(&mut self, update: &[u8]) -> Result<(), DocumentError> {
        self.doc
            .import(update)
            .map(|_| ())
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    fn snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        self.doc
            .export(loro::ExportMode::Snapshot)
            .map_err(|e| DocumentError::Snapshot(e.to_string()))
    }
}

/// The per-room document: a kernel plus apply accounting.
pub struct CrdtDoc {
    kernel: Box<dyn CrdtKernel>,
    applied_bytes: usize,
}

impl CrdtDoc {
    /// Document over an explicit kernel.
    pub fn with_kernel(kernel: Box<dyn CrdtKernel>) -> Self {
        Self {
            kernel,
            applied_bytes: 0,
        }
    }

    /// Document over the build-time default kernel.
    #[cfg(feature = "loro-kernel")]
    pub fn new() -> Self {
        Self::with_kernel(Box::new(LoroKernel::new()))
    }

    /// Merge an opaque update.
    pub fn apply(&mut self, update: &[u8]) -> Result<(), DocumentError> {
        self.kernel.apply(update)?;
        self.applied_bytes = self.applied_bytes.saturating_add(update.len());
        Ok(())
    }

    /// Full-state snapshot bytes.
    pub fn snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        self.kernel.snapshot()
    }

    /// Rough size signal: total update bytes merged so far.
    pub fn size_hint(&self) -> usize {
        self.applied_bytes
    }
}

#[cfg(feature = "loro-kernel")]
impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}
