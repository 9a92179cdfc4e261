use std::fmt;
use std::sync::Arc;

use objloader_ring::SharedRegion;

/// Default byte capacity of each ring buffer across a worker boundary.
pub const DEFAULT_WORKER_BUFFER_CAPACITY: usize = 16 * 1024;

/// Why a worker could not start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitFailureKind {
    /// The platform lacks what shared ring buffers need.
    UnsupportedEnvironment,
    /// Anything else: bad regions, a failed store, a panic during setup.
    Internal,
}

impl InitFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedEnvironment => "unsupported-environment",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for InitFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control messages between a loader and a background worker thread.
///
/// Data never travels here: bulk traffic goes through the ring buffers whose
/// regions `Init` hands over.
#[derive(Clone, Debug)]
pub enum WorkerMessage {
    /// Loader to worker: attach to these regions. `inbound` carries traffic
    /// to the worker, `outbound` traffic back to the loader.
    Init {
        inbound: Arc<SharedRegion>,
        inbound_capacity: usize,
        outbound: Arc<SharedRegion>,
        outbound_capacity: usize,
    },
    /// Worker to loader: both queues attached, processing has started.
    Ready,
    /// Worker to loader: setup failed; the worker has exited.
    InitFailed { kind: InitFailureKind, error: String },
    /// Loader to worker: finish the current unit of work and stop.
    Dispose,
    /// Worker to loader: stopped.
    Disposed,
}

impl WorkerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "Init",
            Self::Ready => "Ready",
            Self::InitFailed { .. } => "InitFailed",
            Self::Dispose => "Dispose",
            Self::Disposed => "Disposed",
        }
    }

    /// Build an `Init` for two regions of the same capacity.
    pub fn init(inbound: Arc<SharedRegion>, outbound: Arc<SharedRegion>, capacity: usize) -> Self {
        Self::Init {
            inbound,
            inbound_capacity: capacity,
            outbound,
            outbound_capacity: capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        let region = SharedRegion::new(8);
        let init = WorkerMessage::init(region.clone(), region, 8);
        assert_eq!(init.type_name(), "Init");
        assert_eq!(WorkerMessage::Ready.type_name(), "Ready");
        assert_eq!(
            WorkerMessage::InitFailed {
                kind: InitFailureKind::Internal,
                error: "x".into()
            }
            .type_name(),
            "InitFailed"
        );
        assert_eq!(WorkerMessage::Dispose.type_name(), "Dispose");
        assert_eq!(WorkerMessage::Disposed.type_name(), "Disposed");
    }

    #[test]
    fn failure_kind_display() {
        assert_eq!(
            InitFailureKind::UnsupportedEnvironment.to_string(),
            "unsupported-environment"
        );
    }
}
