use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use log::{debug, trace};

use crate::core::chunk::{ChunkBuffer, ChunkFormat};

use super::{
    AccelError, AccelResult, Accelerator, DeviceMemory, ExecStream, KernelKind,
    KernelOutcome, LaunchRequest, StreamOp, StreamOutput,
    kernel::{self, KernelOutput},
};

pub const DEFAULT_DEVICE_MEMORY: usize = 256 * 1024 * 1024;
pub const DEFAULT_IO_MAP_MEMORY: usize = 64 * 1024 * 1024;

enum DeviceContent {
    Uninit,
    Chunk(ChunkBuffer),
    ResultIndex(Vec<u32>),
}

struct DeviceSlot {
    mem: DeviceMemory,
    content: DeviceContent,
}

/// Emulated device running the scan kernels on the calling thread.
///
/// Device memory is a byte budget; every allocation is tracked so that a
/// leaked buffer shows up in [`HostAccelerator::allocated`].
pub struct HostAccelerator {
    capacity: usize,
    io_map_capacity: usize,
    used: AtomicUsize,
    io_map_used: AtomicUsize,
    slots: DashMap<u64, DeviceSlot, ahash::RandomState>,
    next_id: AtomicU64,
    launches: AtomicU64,
    syncs: AtomicU64,
}

impl Default for HostAccelerator {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICE_MEMORY, DEFAULT_IO_MAP_MEMORY)
    }
}

impl HostAccelerator {
    pub fn new(capacity: usize, io_map_capacity: usize) -> Self {
        HostAccelerator {
            capacity,
            io_map_capacity,
            used: AtomicUsize::new(0),
            io_map_used: AtomicUsize::new(0),
            slots: DashMap::with_hasher(ahash::RandomState::new()),
            next_id: AtomicU64::new(1),
            launches: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    /// Live allocations.
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire) + self.io_map_used.load(Ordering::Acquire)
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    fn reserve(counter: &AtomicUsize, capacity: usize, length: usize) -> AccelResult<()> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used + length <= capacity).then_some(used + length)
            })
            .map(|_| ())
            .map_err(|used| AccelError::OutOfMemory {
                requested: length,
                available: capacity.saturating_sub(used),
            })
    }

    fn allocate(&self, length: usize, io_mapped: bool) -> AccelResult<DeviceMemory> {
        if io_mapped {
            Self::reserve(&self.io_map_used, self.io_map_capacity, length)?;
        } else {
            Self::reserve(&self.used, self.capacity, length)?;
        }

        let mem = DeviceMemory {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            length,
            io_mapped,
        };
        self.slots.insert(
            mem.id,
            DeviceSlot {
                mem,
                content: DeviceContent::Uninit,
            },
        );
        trace!("device alloc {} ({} bytes, io_mapped={})", mem.id, length, io_mapped);
        Ok(mem)
    }

    fn check(&self, mem: &DeviceMemory) -> AccelResult<()> {
        match self.slots.get(&mem.id) {
            Some(slot) if slot.mem == *mem => Ok(()),
            _ => Err(AccelError::InvalidHandle(mem.id)),
        }
    }

    fn run(&self, op: StreamOp, output: &mut StreamOutput) -> AccelResult<()> {
        match op {
            StreamOp::CopyToDevice { mem, chunk } => {
                let mut slot = self.slots.get_mut(&mem.id).ok_or(AccelError::InvalidHandle(mem.id))?;
                slot.content = DeviceContent::Chunk(chunk);
            }
            StreamOp::TransferFromStorage { mem, storage } => {
                if !mem.io_mapped {
                    return Err(AccelError::Fault(format!(
                        "direct transfer into buffer {} outside the io-mapped window",
                        mem.id
                    )));
                }
                let mut slot = self.slots.get_mut(&mem.id).ok_or(AccelError::InvalidHandle(mem.id))?;
                let DeviceContent::Chunk(chunk) = &mut slot.content else {
                    return Err(AccelError::Fault(format!("buffer {} holds no chunk", mem.id)));
                };

                let range = chunk.uncached_range();
                let blocks = chunk.uncached_block_nums();
                let mut pages = vec![None; blocks.len()];
                storage
                    .transfer(&mut pages, &blocks)
                    .map_err(|e| AccelError::Fault(format!("direct transfer failed: {}", e)))?;

                for (slot, page) in range.zip(pages) {
                    if let Some(page) = page {
                        chunk
                            .install_page(slot, page)
                            .map_err(|e| AccelError::Fault(e.to_string()))?;
                    }
                }
                chunk.mark_resident().map_err(|e| AccelError::Fault(e.to_string()))?;
            }
            StreamOp::Launch(req) => {
                self.launches.fetch_add(1, Ordering::Relaxed);
                output.kernel = Some(self.launch(&req)?);
            }
            StreamOp::CopyResultsToHost { mem } => {
                let slot = self.slots.get(&mem.id).ok_or(AccelError::InvalidHandle(mem.id))?;
                match &slot.content {
                    DeviceContent::Chunk(chunk) => output.dst = Some(chunk.clone()),
                    DeviceContent::ResultIndex(items) => output.results = Some(items.clone()),
                    DeviceContent::Uninit => {
                        return Err(AccelError::Fault(format!("buffer {} was never written", mem.id)));
                    }
                }
            }
            StreamOp::CopyPagesToHost { mem, slots } => {
                let slot = self.slots.get(&mem.id).ok_or(AccelError::InvalidHandle(mem.id))?;
                let DeviceContent::Chunk(chunk) = &slot.content else {
                    return Err(AccelError::Fault(format!("buffer {} holds no chunk", mem.id)));
                };
                for index in slots {
                    let page = chunk.page(index).cloned().ok_or_else(|| {
                        AccelError::Fault(format!("page slot {} is empty on the device", index))
                    })?;
                    output.pages.push((index, page));
                }
            }
        }
        Ok(())
    }

    fn launch(&self, req: &LaunchRequest) -> AccelResult<KernelOutcome> {
        // Take the output buffer out of its slot first; holding a reference to
        // the source while mutating another entry of the same shard would block.
        let out_mem = req.dst.or(req.results).ok_or_else(|| {
            AccelError::Fault(format!("{} launched without an output buffer", req.kind))
        })?;
        let mut out_content = {
            let mut slot = self
                .slots
                .get_mut(&out_mem.id)
                .ok_or(AccelError::InvalidHandle(out_mem.id))?;
            std::mem::replace(&mut slot.content, DeviceContent::Uninit)
        };

        let outcome = {
            let src_slot = self.slots.get(&req.src.id).ok_or(AccelError::InvalidHandle(req.src.id))?;
            let DeviceContent::Chunk(src) = &src_slot.content else {
                return Err(AccelError::Fault(format!("source buffer {} holds no chunk", req.src.id)));
            };

            let expected = match src.format() {
                ChunkFormat::Row => KernelKind::QualsRow,
                ChunkFormat::Block => KernelKind::QualsBlock,
                ChunkFormat::Column => KernelKind::QualsColumn,
            };
            if expected != req.kind {
                return Err(AccelError::Fault(format!("{} cannot run on a {} chunk", req.kind, src.format())));
            }

            if !matches!(out_content, DeviceContent::Chunk(_)) {
                out_content = DeviceContent::ResultIndex(Vec::with_capacity(src.nitems()));
            }
            let out = match &mut out_content {
                DeviceContent::Chunk(dst) => KernelOutput::Rows(dst),
                DeviceContent::ResultIndex(items) => KernelOutput::Indexes(items),
                DeviceContent::Uninit => {
                    return Err(AccelError::Fault(format!("output buffer {} is unusable", out_mem.id)));
                }
            };

            match req.kind {
                KernelKind::QualsRow => kernel::exec_quals_row(req, src, out),
                KernelKind::QualsBlock => kernel::exec_quals_block(req, src, out),
                KernelKind::QualsColumn => kernel::exec_quals_column(req, src, out),
            }
        };

        if let Some(mut slot) = self.slots.get_mut(&out_mem.id) {
            slot.content = out_content;
        }

        debug!(
            "{}: nitems_in={} nitems_out={} extra={} status={:?}",
            req.kind, outcome.nitems_in, outcome.nitems_out, outcome.extra_size, outcome.error
        );
        Ok(outcome)
    }
}

impl Accelerator for HostAccelerator {
    fn mem_alloc(&self, length: usize) -> AccelResult<DeviceMemory> {
        self.allocate(length, false)
    }

    fn mem_alloc_io_map(&self, length: usize) -> AccelResult<DeviceMemory> {
        self.allocate(length, true)
    }

    fn mem_free(&self, mem: DeviceMemory) -> AccelResult<()> {
        self.check(&mem)?;
        self.slots.remove(&mem.id);
        let counter = if mem.io_mapped { &self.io_map_used } else { &self.used };
        counter.fetch_sub(mem.length, Ordering::AcqRel);
        Ok(())
    }

    fn synchronize(&self, stream: ExecStream) -> AccelResult<StreamOutput> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        let mut output = StreamOutput::default();
        for op in stream.into_ops() {
            self.run(op, &mut output)?;
        }
        Ok(output)
    }

    fn name(&self) -> &str {
        "host emulator"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        accelerator::KernelErrorCode,
        core::{
            db_type::DbType,
            expression::{ComparerOperation, Expr},
            program::ScanProgram,
            schema::{Attribute, TupleDesc},
            support_types::ItemPointer,
            tuple::Datum,
        },
        memory_pool::BufferPool,
    };

    fn row_chunk(pool: &Arc<BufferPool>, desc: &Arc<TupleDesc>, n: i32) -> ChunkBuffer {
        let mut chunk = ChunkBuffer::new_row(pool, desc.clone(), 1, n as usize, 64 * 1024);
        for i in 0..n {
            chunk
                .append_row_values(ItemPointer::new(0, i as u16), &[Datum::I32(i)])
                .unwrap();
        }
        chunk
    }

    #[test]
    fn test_out_of_memory() {
        let accel = HostAccelerator::new(100, 10);
        let a = accel.mem_alloc(60).unwrap();
        assert!(matches!(accel.mem_alloc(60), Err(AccelError::OutOfMemory { available: 40, .. })));
        assert!(accel.mem_alloc_io_map(11).is_err());
        accel.mem_free(a).unwrap();
        assert!(accel.mem_alloc(60).is_ok());
        assert!(matches!(accel.mem_free(a), Err(AccelError::InvalidHandle(_))));
    }

    #[test]
    fn test_row_kernel_result_index() {
        let pool = BufferPool::new();
        let desc = Arc::new(TupleDesc::new(vec![Attribute::new("v", DbType::I32)]));
        let quals = Expr::compare(ComparerOperation::Less, Expr::col(0), Expr::constant(Datum::I32(3)));
        let program = Arc::new(ScanProgram::new(desc.clone(), Some(quals), None, &[]).unwrap());
        let chunk = row_chunk(&pool, &desc, 10);

        let accel = HostAccelerator::default();
        let src = accel.mem_alloc(chunk.length()).unwrap();
        let results = accel.mem_alloc(40).unwrap();

        let mut stream = ExecStream::new();
        stream.enqueue(StreamOp::CopyToDevice { mem: src, chunk });
        stream.enqueue(StreamOp::Launch(LaunchRequest {
            kind: KernelKind::QualsRow,
            program,
            params: vec![],
            src,
            dst: None,
            results: Some(results),
        }));
        stream.enqueue(StreamOp::CopyResultsToHost { mem: results });
        assert_eq!(accel.launches(), 0);

        let output = accel.synchronize(stream).unwrap();
        let kernel = output.kernel.unwrap();
        assert_eq!((kernel.nitems_in, kernel.nitems_out), (10, 3));
        assert_eq!(kernel.error, KernelErrorCode::Success);
        assert_eq!(output.results.unwrap(), vec![0, 1, 2]);

        accel.mem_free(src).unwrap();
        accel.mem_free(results).unwrap();
        assert_eq!(accel.allocated(), 0);
        assert_eq!(accel.used(), 0);
    }

    #[test]
    fn test_kernel_format_mismatch_is_fault() {
        let pool = BufferPool::new();
        let desc = Arc::new(TupleDesc::new(vec![Attribute::new("v", DbType::I32)]));
        let program = Arc::new(ScanProgram::new(desc.clone(), None, None, &[]).unwrap());
        let accel = HostAccelerator::default();
        let src = accel.mem_alloc(1).unwrap();
        let results = accel.mem_alloc(1).unwrap();

        let mut stream = ExecStream::new();
        stream.enqueue(StreamOp::CopyToDevice { mem: src, chunk: row_chunk(&pool, &desc, 1) });
        stream.enqueue(StreamOp::Launch(LaunchRequest {
            kind: KernelKind::QualsBlock,
            program,
            params: vec![],
            src,
            dst: None,
            results: Some(results),
        }));
        assert!(matches!(accel.synchronize(stream), Err(AccelError::Fault(_))));
    }
}
