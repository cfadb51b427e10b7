//! Host implementations of the device scan kernels. Each entry point walks
//! its chunk format, evaluates the device form of the program and writes
//! passing tuples to the destination buffer or their indexes to the result
//! array.

use log::trace;

use crate::core::{
    chunk::{ChunkBuffer, ChunkCursor},
    tuple::{Datum, ScanTuple},
};

use super::{KernelErrorCode, KernelOutcome, LaunchRequest};

pub enum KernelOutput<'a> {
    Rows(&'a mut ChunkBuffer),
    Indexes(&'a mut Vec<u32>),
}

pub fn exec_quals_row(req: &LaunchRequest, src: &ChunkBuffer, mut out: KernelOutput<'_>) -> KernelOutcome {
    let mut outcome = KernelOutcome::default();

    for index in 0..src.nitems() {
        let tuple = match src.row_tuple(index) {
            Ok(Some(tuple)) => tuple,
            Ok(None) => break,
            Err(_) => return fail(outcome, KernelErrorCode::Fault),
        };
        outcome.nitems_in += 1;

        match req.program.eval_quals_device(&tuple.values, &req.params) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(code) => return fail(outcome, code),
        }

        let status = match &mut out {
            KernelOutput::Indexes(results) => {
                results.push(index as u32);
                KernelErrorCode::Success
            }
            KernelOutput::Rows(dst) => emit(req, dst, &tuple, &mut outcome),
        };
        if status != KernelErrorCode::Success {
            return fail(outcome, status);
        }
        outcome.nitems_out += 1;
    }

    outcome
}

pub fn exec_quals_block(req: &LaunchRequest, src: &ChunkBuffer, out: KernelOutput<'_>) -> KernelOutcome {
    exec_quals_cursor(req, src, out)
}

pub fn exec_quals_column(req: &LaunchRequest, src: &ChunkBuffer, out: KernelOutput<'_>) -> KernelOutcome {
    exec_quals_cursor(req, src, out)
}

fn exec_quals_cursor(req: &LaunchRequest, src: &ChunkBuffer, out: KernelOutput<'_>) -> KernelOutcome {
    let mut outcome = KernelOutcome::default();

    // BLOCK and COLUMN sources always project into a destination buffer.
    let KernelOutput::Rows(dst) = out else {
        return fail(outcome, KernelErrorCode::Fault);
    };

    let mut cursor = ChunkCursor::new();
    loop {
        let tuple = match cursor.next_tuple(src) {
            Ok(Some(tuple)) => tuple,
            Ok(None) => break,
            Err(_) => return fail(outcome, KernelErrorCode::Fault),
        };
        outcome.nitems_in += 1;

        match req.program.eval_quals_device(&tuple.values, &req.params) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(code) => return fail(outcome, code),
        }

        let status = emit(req, dst, &tuple, &mut outcome);
        if status != KernelErrorCode::Success {
            return fail(outcome, status);
        }
        outcome.nitems_out += 1;
    }

    outcome
}

fn emit(req: &LaunchRequest, dst: &mut ChunkBuffer, tuple: &ScanTuple, outcome: &mut KernelOutcome) -> KernelErrorCode {
    let values = match req.program.project_device(&tuple.values, &req.params) {
        Ok(values) => values,
        Err(code) => return code,
    };

    match dst.append_row_values(tuple.ctid, &values) {
        Ok(true) => {
            outcome.extra_size += values
                .iter()
                .map(|v| match v {
                    Datum::Text(s) => s.len() as u64,
                    _ => 0,
                })
                .sum::<u64>();
            KernelErrorCode::Success
        }
        Ok(false) => KernelErrorCode::DataStoreNoSpace,
        Err(_) => KernelErrorCode::Fault,
    }
}

fn fail(mut outcome: KernelOutcome, code: KernelErrorCode) -> KernelOutcome {
    trace!("kernel stopped with {:?} after {} tuples", code, outcome.nitems_in);
    outcome.error = code;
    outcome
}
