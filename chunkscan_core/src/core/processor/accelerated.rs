use std::sync::Arc;

use log::{debug, error, warn};
use smallvec::SmallVec;

use crate::{
    accelerator::{
        AccelError, Accelerator, DeviceMemory, ExecStream, KernelErrorCode, KernelKind, LaunchRequest, StreamOp,
    },
    core::{
        chunk::ChunkFormat,
        error::{Result, ScanError},
        program::ScanProgram,
        storage_providers::traits::BlockStorage,
    },
};

use super::{
    shared_state::SharedScanState,
    task::{ResultIndex, ScanTask, TaskState},
};

/// Device buffers of one task, freed when the task leaves the executor.
struct DeviceAllocation<'a> {
    accelerator: &'a dyn Accelerator,
    mems: SmallVec<[DeviceMemory; 3]>,
}

impl<'a> DeviceAllocation<'a> {
    fn new(accelerator: &'a dyn Accelerator) -> Self {
        DeviceAllocation {
            accelerator,
            mems: SmallVec::new(),
        }
    }

    fn track(&mut self, mem: DeviceMemory) -> DeviceMemory {
        self.mems.push(mem);
        mem
    }
}

impl Drop for DeviceAllocation<'_> {
    fn drop(&mut self) {
        for mem in self.mems.drain(..) {
            if let Err(e) = self.accelerator.mem_free(mem) {
                warn!("failed to release device buffer {}: {}", mem.id, e);
            }
        }
    }
}

/// How a task's source chunk reaches the device.
enum Staging {
    Ready(DeviceMemory),
    /// Device memory ran out; the task has to go through fallback.
    Exhausted(AccelError),
}

/// Runs tasks on the accelerator. Every call queues the whole task on one
/// stream and blocks exactly once, in `synchronize`.
pub struct AcceleratedExecutor {
    accelerator: Arc<dyn Accelerator>,
    storage: Arc<dyn BlockStorage>,
    program: Arc<ScanProgram>,
    shared: Arc<SharedScanState>,
    cpu_fallback: bool,
}

impl AcceleratedExecutor {
    pub fn new(
        accelerator: Arc<dyn Accelerator>,
        storage: Arc<dyn BlockStorage>,
        program: Arc<ScanProgram>,
        shared: Arc<SharedScanState>,
        cpu_fallback: bool,
    ) -> Self {
        AcceleratedExecutor {
            accelerator,
            storage,
            program,
            shared,
            cpu_fallback,
        }
    }

    pub fn execute(&self, task: &mut ScanTask) -> Result<TaskState> {
        task.transition(TaskState::AccelRunning)?;
        let mut device = DeviceAllocation::new(self.accelerator.as_ref());

        let src_mem = match self.stage_source(task, &mut device) {
            Ok(Staging::Ready(mem)) => mem,
            Ok(Staging::Exhausted(err)) => return self.recover(task, KernelErrorCode::DataStoreNoSpace, None, err),
            Err(err) => return Self::abort(task, err),
        };

        let (dst_mem, results_mem) = if let Some(dst) = &task.dst {
            match self.accelerator.mem_alloc(dst.length()) {
                Ok(mem) => (Some(device.track(mem)), None),
                Err(err @ AccelError::OutOfMemory { .. }) => {
                    return self.recover(task, KernelErrorCode::DataStoreNoSpace, Some(src_mem), err);
                }
                Err(err) => return Self::abort(task, err.into()),
            }
        } else {
            let nrooms = task.results.as_ref().map_or(task.src.nitems(), |r| r.nrooms);
            match self.accelerator.mem_alloc(4 * nrooms) {
                Ok(mem) => (None, Some(device.track(mem))),
                Err(err @ AccelError::OutOfMemory { .. }) => {
                    return self.recover(task, KernelErrorCode::DataStoreNoSpace, Some(src_mem), err);
                }
                Err(err) => return Self::abort(task, err.into()),
            }
        };

        let kind = match task.src.format() {
            ChunkFormat::Row => KernelKind::QualsRow,
            ChunkFormat::Block => KernelKind::QualsBlock,
            ChunkFormat::Column => KernelKind::QualsColumn,
        };

        let mut stream = ExecStream::new();
        stream.enqueue(StreamOp::CopyToDevice {
            mem: src_mem,
            chunk: task.src.clone(),
        });
        if src_mem.io_mapped && task.src.nblocks_uncached() > 0 {
            stream.enqueue(StreamOp::TransferFromStorage {
                mem: src_mem,
                storage: self.storage.clone(),
            });
        }
        if let (Some(mem), Some(dst)) = (dst_mem, task.dst.take()) {
            stream.enqueue(StreamOp::CopyToDevice { mem, chunk: dst });
        }
        stream.enqueue(StreamOp::Launch(LaunchRequest {
            kind,
            program: self.program.clone(),
            params: task.params.clone(),
            src: src_mem,
            dst: dst_mem,
            results: results_mem,
        }));
        if let Some(mem) = dst_mem.or(results_mem) {
            stream.enqueue(StreamOp::CopyResultsToHost { mem });
        }

        debug!("task {}: {} queued {} stream ops", task.id, kind, stream.len());

        let output = match self.accelerator.synchronize(stream) {
            Ok(output) => output,
            Err(err) => return Self::abort(task, err.into()),
        };
        let Some(outcome) = output.kernel else {
            return Self::abort(
                task,
                AccelError::Fault(format!("task {}: stream finished without a kernel outcome", task.id)).into(),
            );
        };

        task.nitems_in = outcome.nitems_in;
        task.nitems_out = outcome.nitems_out;
        task.extra_size = outcome.extra_size;

        match outcome.error {
            KernelErrorCode::Success => {
                self.shared
                    .stats()
                    .add_filtered(outcome.nitems_in.saturating_sub(outcome.nitems_out));
                task.dst = output.dst;
                if let Some(items) = output.results {
                    let nrooms = task.results.as_ref().map_or(items.len(), |r| r.nrooms);
                    task.results = Some(ResultIndex { nrooms, items });
                }
                task.transition(TaskState::AccelDone)?;
                debug!(
                    "task {}: {} of {} tuples passed, {} extra bytes",
                    task.id, outcome.nitems_out, outcome.nitems_in, outcome.extra_size
                );
                Ok(TaskState::AccelDone)
            }
            code if code.is_recoverable() => {
                let err = AccelError::Fault(format!("kernel {} reported {:?}", kind, code));
                self.recover(task, code, Some(src_mem), err)
            }
            code => {
                task.error = Some(code);
                Self::abort(
                    task,
                    AccelError::Fault(format!("kernel {} failed with {:?}", kind, code)).into(),
                )
            }
        }
    }

    /// Allocates the source buffer. BLOCK chunks with pages still in storage
    /// go to the io-mapped window when direct transfer is on; if that window
    /// is full the pages are read on the host and the task stays on host copy.
    fn stage_source(&self, task: &mut ScanTask, device: &mut DeviceAllocation<'_>) -> Result<Staging> {
        let length = task.src.length();

        if task.src.nblocks_uncached() > 0 {
            if task.with_direct_transfer {
                match self.accelerator.mem_alloc_io_map(length) {
                    Ok(mem) => return Ok(Staging::Ready(device.track(mem))),
                    Err(AccelError::OutOfMemory { requested, available }) => {
                        debug!(
                            "task {}: io-mapped window exhausted ({} requested, {} free); reading {} blocks on the host",
                            task.id,
                            requested,
                            available,
                            task.src.nblocks_uncached()
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
                task.with_direct_transfer = false;
            }
            task.src.fill_uncached(self.storage.as_ref())?;
        }

        match self.accelerator.mem_alloc(length) {
            Ok(mem) => Ok(Staging::Ready(device.track(mem))),
            Err(err @ AccelError::OutOfMemory { .. }) => Ok(Staging::Exhausted(err)),
            Err(err) => Err(err.into()),
        }
    }

    /// Hands the task to CPU fallback, or fails it when fallback is off. Any
    /// page that only reached the device is written back first.
    fn recover(
        &self,
        task: &mut ScanTask,
        code: KernelErrorCode,
        src_mem: Option<DeviceMemory>,
        cause: AccelError,
    ) -> Result<TaskState> {
        if !self.cpu_fallback {
            task.error = Some(code);
            return Self::abort(task, cause.into());
        }

        warn!("task {}: out of resource ({:?}), falling back to CPU: {}", task.id, code, cause);
        task.error = None;
        task.cpu_fallback = true;
        task.dst = None;
        task.results = None;

        if task.src.nblocks_uncached() > 0 {
            if let Err(err) = self.write_back_pages(task, src_mem) {
                return Self::abort(task, err);
            }
        }

        task.transition(TaskState::AccelFailedRecoverable)?;
        Ok(TaskState::AccelFailedRecoverable)
    }

    fn write_back_pages(&self, task: &mut ScanTask, src_mem: Option<DeviceMemory>) -> Result<()> {
        match src_mem.filter(|mem| mem.io_mapped) {
            Some(mem) => {
                let slots = task.src.uncached_range();
                let mut stream = ExecStream::new();
                stream.enqueue(StreamOp::CopyPagesToHost { mem, slots });
                let output = self.accelerator.synchronize(stream)?;
                for (slot, page) in output.pages {
                    task.src.install_page(slot, page)?;
                }
                task.src.mark_resident()
            }
            None => task.src.fill_uncached(self.storage.as_ref()),
        }
    }

    fn abort(task: &mut ScanTask, err: ScanError) -> Result<TaskState> {
        if task.error.is_none() && matches!(err, ScanError::Accelerator(_)) {
            task.error = Some(KernelErrorCode::Fault);
        }
        if let Err(e) = task.transition(TaskState::AccelFailedFatal) {
            warn!("task {}: {}", task.id, e);
        }
        error!("task {}: accelerator execution failed: {}", task.id, err);
        Err(err)
    }
}
