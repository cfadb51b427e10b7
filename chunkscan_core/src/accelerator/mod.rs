//! Device abstraction: memory, asynchronous execution streams and the three
//! format-specific scan kernels.

pub mod emulator;
pub mod kernel;

use std::{fmt::Display, ops::Range, sync::Arc};

use thiserror::Error;

use crate::core::{
    chunk::ChunkBuffer,
    page::Page,
    program::ScanProgram,
    storage_providers::traits::BlockStorage,
    tuple::Datum,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemory {
    pub id: u64,
    pub length: usize,
    /// Allocated from the window reachable by direct storage transfer.
    pub io_mapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    QualsRow,
    QualsBlock,
    QualsColumn,
}

impl KernelKind {
    pub fn name(&self) -> &'static str {
        match self {
            KernelKind::QualsRow => "gpuscan_exec_quals_row",
            KernelKind::QualsBlock => "gpuscan_exec_quals_block",
            KernelKind::QualsColumn => "gpuscan_exec_quals_column",
        }
    }
}

impl Display for KernelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Status reported by a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KernelErrorCode {
    #[default]
    Success,
    /// The destination buffer ran out of room.
    DataStoreNoSpace,
    /// The device cannot decide some tuple exactly; the host has to.
    CpuReCheck,
    Fault,
}

impl KernelErrorCode {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KernelErrorCode::DataStoreNoSpace | KernelErrorCode::CpuReCheck)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccelError {
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("device fault: {0}")]
    Fault(String),

    #[error("invalid device memory handle {0}")]
    InvalidHandle(u64),
}

pub type AccelResult<T> = std::result::Result<T, AccelError>;

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub kind: KernelKind,
    pub program: Arc<ScanProgram>,
    pub params: Vec<Datum>,
    pub src: DeviceMemory,
    /// Destination ROW buffer, staged beforehand with [`StreamOp::CopyToDevice`].
    pub dst: Option<DeviceMemory>,
    /// Result index array, used when there is no destination buffer.
    pub results: Option<DeviceMemory>,
}

pub enum StreamOp {
    CopyToDevice {
        mem: DeviceMemory,
        chunk: ChunkBuffer,
    },
    /// Fills the not-yet-resident page slots of the chunk in `mem` straight
    /// from storage.
    TransferFromStorage {
        mem: DeviceMemory,
        storage: Arc<dyn BlockStorage>,
    },
    Launch(LaunchRequest),
    /// Brings the destination buffer or the result index back to the host.
    CopyResultsToHost {
        mem: DeviceMemory,
    },
    /// Writes back the page slots `slots` of the chunk in `mem`.
    CopyPagesToHost {
        mem: DeviceMemory,
        slots: Range<usize>,
    },
}

impl std::fmt::Debug for StreamOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamOp::CopyToDevice { mem, chunk } => write!(f, "CopyToDevice({}, {} {} items)", mem.id, chunk.format(), chunk.nitems()),
            StreamOp::TransferFromStorage { mem, .. } => write!(f, "TransferFromStorage({})", mem.id),
            StreamOp::Launch(req) => write!(f, "Launch({})", req.kind),
            StreamOp::CopyResultsToHost { mem } => write!(f, "CopyResultsToHost({})", mem.id),
            StreamOp::CopyPagesToHost { mem, slots } => write!(f, "CopyPagesToHost({}, {:?})", mem.id, slots),
        }
    }
}

/// Per-task queue of asynchronous device operations. Nothing runs until the
/// stream is handed to [`Accelerator::synchronize`].
#[derive(Debug, Default)]
pub struct ExecStream {
    ops: Vec<StreamOp>,
}

impl ExecStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, op: StreamOp) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<StreamOp> {
        self.ops
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelOutcome {
    pub nitems_in: u64,
    pub nitems_out: u64,
    /// Variable-length bytes written by the projection.
    pub extra_size: u64,
    pub error: KernelErrorCode,
}

/// Everything a synchronized stream handed back to the host.
#[derive(Debug, Default)]
pub struct StreamOutput {
    pub kernel: Option<KernelOutcome>,
    pub dst: Option<ChunkBuffer>,
    pub results: Option<Vec<u32>>,
    pub pages: Vec<(usize, Page)>,
}

pub trait Accelerator: Send + Sync {
    fn mem_alloc(&self, length: usize) -> AccelResult<DeviceMemory>;

    /// Allocates from the small window that storage can write into directly.
    fn mem_alloc_io_map(&self, length: usize) -> AccelResult<DeviceMemory>;

    fn mem_free(&self, mem: DeviceMemory) -> AccelResult<()>;

    /// Runs every queued operation in order and blocks until they finish.
    fn synchronize(&self, stream: ExecStream) -> AccelResult<StreamOutput>;

    fn name(&self) -> &str {
        "accelerator"
    }
}
