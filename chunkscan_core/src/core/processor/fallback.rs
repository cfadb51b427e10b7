use std::sync::Arc;

use log::debug;

use crate::core::{
    error::Result,
    program::ScanProgram,
    tuple::{Datum, ScanTuple},
};

use super::{
    shared_state::SharedScanState,
    task::{ScanTask, TaskState},
};

/// Host-side evaluation of a task the accelerator could not finish.
///
/// Runs the same [`ScanProgram`] the kernels run, so it reaches the same
/// pass/reject decisions and the same projected values.
pub struct FallbackExecutor {
    program: Arc<ScanProgram>,
    shared: Arc<SharedScanState>,
}

impl FallbackExecutor {
    pub fn new(program: Arc<ScanProgram>, shared: Arc<SharedScanState>) -> Self {
        FallbackExecutor { program, shared }
    }

    /// Next passing tuple of the task's source chunk, or `None` once the
    /// chunk is exhausted. Rejected tuples are added to the filtered count.
    pub fn next_fallback_tuple(&self, task: &mut ScanTask) -> Result<Option<ScanTuple>> {
        if task.state() == TaskState::AccelFailedRecoverable {
            task.transition(TaskState::FallbackRunning)?;
            task.fallback_cursor.reset();
            task.nitems_in = 0;
            task.nitems_out = 0;
            debug!("task {}: CPU fallback over {} {} items", task.id, task.src.nitems(), task.src.format());
        } else if task.state() == TaskState::FallbackDone {
            return Ok(None);
        }

        loop {
            let Some(tuple) = task.fallback_cursor.next_tuple(&task.src)? else {
                task.transition(TaskState::FallbackDone)?;
                debug!(
                    "task {}: fallback done, {} of {} tuples passed",
                    task.id, task.nitems_out, task.nitems_in
                );
                return Ok(None);
            };
            task.nitems_in += 1;

            match self.evaluate(tuple, &task.params)? {
                Some(tuple) => {
                    task.nitems_out += 1;
                    return Ok(Some(tuple));
                }
                None => self.shared.stats().add_filtered(1),
            }
        }
    }

    /// Re-evaluates one base tuple, returning its projected form when it
    /// still passes the filter.
    pub fn recheck(&self, tuple: &ScanTuple, params: &[Datum]) -> Result<Option<ScanTuple>> {
        self.evaluate(tuple.clone(), params)
    }

    fn evaluate(&self, tuple: ScanTuple, params: &[Datum]) -> Result<Option<ScanTuple>> {
        if !self.program.eval_quals_host(&tuple.values, params)? {
            return Ok(None);
        }
        if !self.program.has_projection() {
            return Ok(Some(tuple));
        }
        let values = self.program.project(&tuple.values, params)?;
        Ok(Some(ScanTuple::new(tuple.ctid, values)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            chunk::ChunkBuffer,
            db_type::DbType,
            error::ScanError,
            expression::{ComparerOperation, Expr, MathOperation},
            schema::{Attribute, TupleDesc},
            support_types::ItemPointer,
        },
        memory_pool::BufferPool,
    };

    fn desc() -> Arc<TupleDesc> {
        Arc::new(TupleDesc::new(vec![
            Attribute::new("id", DbType::I32),
            Attribute::new("qty", DbType::I32),
        ]))
    }

    fn task(rows: &[(i32, i32)]) -> ScanTask {
        let pool = BufferPool::new();
        let mut chunk = ChunkBuffer::new_row(&pool, desc(), 1, 128, 8192);
        for (i, (id, qty)) in rows.iter().enumerate() {
            chunk
                .append_row_values(ItemPointer::new(0, i as u16), &[Datum::I32(*id), Datum::I32(*qty)])
                .unwrap();
        }
        let mut task = ScanTask::new(1, chunk, vec![Datum::I32(2)]);
        task.transition(TaskState::AccelRunning).unwrap();
        task.transition(TaskState::AccelFailedRecoverable).unwrap();
        task.cpu_fallback = true;
        task
    }

    fn executor(quals: Expr, projection: Option<Vec<(String, Expr)>>) -> (FallbackExecutor, Arc<SharedScanState>) {
        let program = Arc::new(ScanProgram::new(desc(), Some(quals), projection, &[Datum::I32(2)]).unwrap());
        let shared = Arc::new(SharedScanState::new());
        (FallbackExecutor::new(program, shared.clone()), shared)
    }

    #[test]
    fn test_fallback_filters_projects_and_counts() {
        let quals = Expr::compare(ComparerOperation::Greater, Expr::col(1), Expr::param(0));
        let projection = vec![(
            "total".to_string(),
            Expr::math(MathOperation::Multiply, Expr::col(0), Expr::col(1)),
        )];
        let (fallback, shared) = executor(quals, Some(projection));
        let mut task = task(&[(1, 1), (2, 3), (3, 2), (4, 5)]);

        let mut out = Vec::new();
        while let Some(tuple) = fallback.next_fallback_tuple(&mut task).unwrap() {
            out.push(tuple.values[0].clone());
        }

        assert_eq!(out, vec![Datum::I32(6), Datum::I32(20)]);
        assert_eq!(task.state(), TaskState::FallbackDone);
        assert_eq!((task.nitems_in, task.nitems_out), (4, 2));
        assert_eq!(shared.stats().nitems_filtered(), 2);
        assert_eq!(
            task.history(),
            &[
                TaskState::Created,
                TaskState::AccelRunning,
                TaskState::AccelFailedRecoverable,
                TaskState::FallbackRunning,
                TaskState::FallbackDone,
            ]
        );

        // a finished task stays finished
        assert!(fallback.next_fallback_tuple(&mut task).unwrap().is_none());
    }

    #[test]
    fn test_host_evaluation_error_is_fatal() {
        let quals = Expr::compare(
            ComparerOperation::Equals,
            Expr::math(MathOperation::Divide, Expr::col(0), Expr::col(1)),
            Expr::constant(Datum::I32(1)),
        );
        let (fallback, _) = executor(quals, None);
        let mut task = task(&[(1, 0)]);
        assert!(matches!(fallback.next_fallback_tuple(&mut task), Err(ScanError::Evaluation(_))));
    }

    #[test]
    fn test_recheck() {
        let quals = Expr::compare(ComparerOperation::Less, Expr::col(0), Expr::constant(Datum::I32(10)));
        let (fallback, _) = executor(quals, None);
        let pass = ScanTuple::new(ItemPointer::new(3, 1), vec![Datum::I32(4), Datum::I32(0)]);
        let fail = ScanTuple::new(ItemPointer::new(3, 2), vec![Datum::I32(40), Datum::I32(0)]);
        assert_eq!(fallback.recheck(&pass, &[]).unwrap(), Some(pass.clone()));
        assert_eq!(fallback.recheck(&fail, &[]).unwrap(), None);
    }
}
