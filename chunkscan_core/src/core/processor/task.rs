use std::fmt::Display;

use smallvec::{SmallVec, smallvec};

use crate::{
    accelerator::KernelErrorCode,
    core::{
        chunk::{ChunkBuffer, ChunkCursor},
        error::{Result, ScanError},
        tuple::{Datum, ScanTuple},
    },
};

use super::fallback::FallbackExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    AccelRunning,
    AccelDone,
    AccelFailedRecoverable,
    AccelFailedFatal,
    FallbackRunning,
    FallbackDone,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, AccelRunning)
                | (AccelRunning, AccelDone)
                | (AccelRunning, AccelFailedRecoverable)
                | (AccelRunning, AccelFailedFatal)
                | (AccelFailedRecoverable, FallbackRunning)
                | (FallbackRunning, FallbackDone)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::AccelDone | TaskState::FallbackDone | TaskState::AccelFailedFatal
        )
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TaskState::Created => "CREATED",
            TaskState::AccelRunning => "ACCEL_RUNNING",
            TaskState::AccelDone => "ACCEL_DONE",
            TaskState::AccelFailedRecoverable => "ACCEL_FAILED_RECOVERABLE",
            TaskState::AccelFailedFatal => "ACCEL_FAILED_FATAL",
            TaskState::FallbackRunning => "FALLBACK_RUNNING",
            TaskState::FallbackDone => "FALLBACK_DONE",
        })
    }
}

/// Indexes into a ROW source chunk of the tuples that passed the filter.
#[derive(Debug, Clone, Default)]
pub struct ResultIndex {
    pub nrooms: usize,
    pub items: Vec<u32>,
}

impl ResultIndex {
    pub fn new(nrooms: usize) -> Self {
        ResultIndex {
            nrooms,
            items: Vec::new(),
        }
    }
}

/// One unit of dispatch: a source chunk plus everything needed to evaluate
/// it without touching buffers of any other task.
#[derive(Debug)]
pub struct ScanTask {
    pub id: u64,
    state: TaskState,
    history: SmallVec<[TaskState; 6]>,
    pub src: ChunkBuffer,
    pub dst: Option<ChunkBuffer>,
    pub results: Option<ResultIndex>,
    pub params: Vec<Datum>,
    /// Estimated number of result tuples the output can take.
    pub output_capacity: usize,
    pub with_direct_transfer: bool,
    /// Set when results must come from host re-evaluation.
    pub cpu_fallback: bool,
    /// Error slot for the last kernel status that was not cleared.
    pub error: Option<KernelErrorCode>,
    pub nitems_in: u64,
    pub nitems_out: u64,
    pub extra_size: u64,
    pub(crate) fallback_cursor: ChunkCursor,
    result_pos: usize,
}

impl ScanTask {
    pub fn new(id: u64, src: ChunkBuffer, params: Vec<Datum>) -> Self {
        ScanTask {
            id,
            state: TaskState::Created,
            history: smallvec![TaskState::Created],
            src,
            dst: None,
            results: None,
            params,
            output_capacity: 0,
            with_direct_transfer: false,
            cpu_fallback: false,
            error: None,
            nitems_in: 0,
            nitems_out: 0,
            extra_size: 0,
            fallback_cursor: ChunkCursor::new(),
            result_pos: 0,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Every state the task went through, starting with `Created`.
    pub fn history(&self) -> &[TaskState] {
        &self.history
    }

    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ScanError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Next result tuple for the consumer: fallback output when flagged,
    /// else the destination buffer, else the result index into the source.
    pub fn next_result_tuple(&mut self, fallback: &FallbackExecutor) -> Result<Option<ScanTuple>> {
        if self.cpu_fallback {
            return fallback.next_fallback_tuple(self);
        }

        if let Some(dst) = &self.dst {
            let tuple = dst.row_tuple(self.result_pos)?;
            if tuple.is_some() {
                self.result_pos += 1;
            }
            return Ok(tuple);
        }

        if let Some(results) = &self.results {
            let Some(&index) = results.items.get(self.result_pos) else {
                return Ok(None);
            };
            self.result_pos += 1;
            return match self.src.row_tuple(index as usize)? {
                Some(tuple) => Ok(Some(tuple)),
                None => Err(ScanError::InvalidData(format!("result index {} out of range", index))),
            };
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{core::schema::TupleDesc, memory_pool::BufferPool};

    #[test]
    fn test_state_machine() {
        let pool = BufferPool::new();
        let chunk = ChunkBuffer::new_row(&pool, Arc::new(TupleDesc::default()), 1, 1, 64);
        let mut task = ScanTask::new(1, chunk, vec![]);

        assert!(task.transition(TaskState::FallbackRunning).is_err());
        task.transition(TaskState::AccelRunning).unwrap();
        task.transition(TaskState::AccelFailedRecoverable).unwrap();
        task.transition(TaskState::FallbackRunning).unwrap();
        task.transition(TaskState::FallbackDone).unwrap();
        assert!(task.state().is_terminal());
        assert_eq!(
            task.history(),
            &[
                TaskState::Created,
                TaskState::AccelRunning,
                TaskState::AccelFailedRecoverable,
                TaskState::FallbackRunning,
                TaskState::FallbackDone
            ]
        );

        let err = task.transition(TaskState::AccelRunning).unwrap_err();
        assert!(matches!(
            err,
            ScanError::InvalidTransition {
                from: TaskState::FallbackDone,
                to: TaskState::AccelRunning
            }
        ));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::AccelFailedFatal.is_terminal());
        assert!(!TaskState::AccelFailedRecoverable.is_terminal());
        assert!(!TaskState::AccelDone.can_transition_to(TaskState::FallbackRunning));
        assert_eq!(TaskState::AccelFailedRecoverable.to_string(), "ACCEL_FAILED_RECOVERABLE");
    }
}
