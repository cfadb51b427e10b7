use std::sync::Arc;

use itertools::Itertools;

use crate::{
    BLCKSZ,
    accelerator::KernelErrorCode,
    core::db_type::DEFAULT_VARLENA_WIDTH,
};

use super::{
    error::{Result, ScanError},
    expression::{EvalError, Expr},
    page::{LINE_POINTER_SIZE, PAGE_HEADER_SIZE},
    schema::{AttrSet, Attribute, TupleDesc},
    tuple::Datum,
};

/// Executable form of a scan's filter and projection.
///
/// The same program drives the device kernels and the host fallback, so both
/// paths reach identical pass/reject decisions and projected values.
#[derive(Debug, Clone)]
pub struct ScanProgram {
    scan_desc: Arc<TupleDesc>,
    quals: Option<Expr>,
    projection: Option<Vec<Expr>>,
    proj_desc: Arc<TupleDesc>,
    proj_tuple_sz: u32,
    proj_extra_sz: u32,
    referenced: AttrSet,
    nrows_per_block: u32,
    device_executable: bool,
}

impl ScanProgram {
    /// `projection` holds `(output name, expression)` pairs; `None` returns
    /// the scanned tuple as is.
    pub fn new(
        scan_desc: Arc<TupleDesc>,
        quals: Option<Expr>,
        projection: Option<Vec<(String, Expr)>>,
        params: &[Datum],
    ) -> Result<Self> {
        let mut referenced = AttrSet::new();
        if let Some(quals) = &quals {
            quals.referenced_columns(&mut referenced);
        }

        let (proj_desc, proj_tuple_sz, proj_extra_sz, projection) = match projection {
            None => {
                referenced = AttrSet::all(scan_desc.natts());
                let width = scan_desc.estimated_width();
                (scan_desc.clone(), width, 0, None)
            }
            Some(targets) => {
                let mut attrs = Vec::with_capacity(targets.len());
                let mut extra_sz = 0u32;

                for (name, expr) in &targets {
                    expr.referenced_columns(&mut referenced);
                    let db_type = expr.result_type(&scan_desc, params).ok_or_else(|| {
                        ScanError::InvalidData(format!(
                            "cannot infer the type of projection {}",
                            expr.deparse(&scan_desc)
                        ))
                    })?;

                    let width = match expr {
                        Expr::Column(attno) => scan_desc
                            .attr(*attno)
                            .map(|a| a.avg_width)
                            .unwrap_or_else(|| db_type.default_width()),
                        Expr::Const(value) => value.encoded_size() as u32,
                        _ => match db_type.get_size() {
                            Some(size) => size,
                            None => {
                                // computed varlena lands in the extra region
                                let width = 4 + DEFAULT_VARLENA_WIDTH;
                                extra_sz += width;
                                width
                            }
                        },
                    };
                    attrs.push(Attribute::new(name, db_type).with_width(width));
                }

                let proj_desc = TupleDesc::new(attrs);
                let width = proj_desc.estimated_width();
                let exprs = targets.into_iter().map(|(_, e)| e).collect_vec();
                (Arc::new(proj_desc), width, extra_sz, Some(exprs))
            }
        };

        let device_executable = quals.iter().chain(projection.iter().flatten()).all(Expr::is_device_executable);

        let per_tuple = scan_desc.estimated_width() as usize + LINE_POINTER_SIZE;
        let nrows_per_block = ((BLCKSZ - PAGE_HEADER_SIZE) / per_tuple.max(1)).max(1) as u32;

        Ok(ScanProgram {
            scan_desc,
            quals,
            projection,
            proj_desc,
            proj_tuple_sz,
            proj_extra_sz,
            referenced,
            nrows_per_block,
            device_executable,
        })
    }

    /// Overrides the rows-per-block estimate used to size BLOCK chunk output.
    pub fn with_nrows_per_block(mut self, nrows_per_block: u32) -> Self {
        self.nrows_per_block = nrows_per_block.max(1);
        self
    }

    pub fn scan_desc(&self) -> &Arc<TupleDesc> {
        &self.scan_desc
    }

    pub fn proj_desc(&self) -> &Arc<TupleDesc> {
        &self.proj_desc
    }

    pub fn quals(&self) -> Option<&Expr> {
        self.quals.as_ref()
    }

    pub fn projection(&self) -> Option<&[Expr]> {
        self.projection.as_deref()
    }

    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }

    pub fn proj_tuple_sz(&self) -> u32 {
        self.proj_tuple_sz
    }

    pub fn proj_extra_sz(&self) -> u32 {
        self.proj_extra_sz
    }

    /// Attributes the program reads. This is the set requested from the
    /// columnar cache.
    pub fn referenced_attrs(&self) -> &AttrSet {
        &self.referenced
    }

    pub fn nrows_per_block(&self) -> u32 {
        self.nrows_per_block
    }

    pub fn device_executable(&self) -> bool {
        self.device_executable
    }

    pub fn eval_quals_host(&self, values: &[Datum], params: &[Datum]) -> std::result::Result<bool, EvalError> {
        let Some(quals) = &self.quals else {
            return Ok(true);
        };
        match quals.eval(values, params)? {
            Datum::Bool(b) => Ok(b),
            Datum::Null => Ok(false),
            other => Err(EvalError::TypeMismatch(format!("filter returned {}", other))),
        }
    }

    /// Device form of the filter. Anything the device cannot decide exactly
    /// comes back as a recheck request.
    pub fn eval_quals_device(
        &self,
        values: &[Datum],
        params: &[Datum],
    ) -> std::result::Result<bool, KernelErrorCode> {
        if !self.device_executable {
            return Err(KernelErrorCode::CpuReCheck);
        }
        self.eval_quals_host(values, params)
            .map_err(|_| KernelErrorCode::CpuReCheck)
    }

    pub fn project(&self, values: &[Datum], params: &[Datum]) -> std::result::Result<Vec<Datum>, EvalError> {
        match &self.projection {
            None => Ok(values.to_vec()),
            Some(exprs) => exprs.iter().map(|e| e.eval(values, params)).collect(),
        }
    }

    pub fn project_device(
        &self,
        values: &[Datum],
        params: &[Datum],
    ) -> std::result::Result<Vec<Datum>, KernelErrorCode> {
        if !self.device_executable {
            return Err(KernelErrorCode::CpuReCheck);
        }
        self.project(values, params)
            .map_err(|_| KernelErrorCode::CpuReCheck)
    }

    pub fn deparse_quals(&self) -> Option<String> {
        self.quals.as_ref().map(|q| q.deparse(&self.scan_desc))
    }

    pub fn deparse_projection(&self) -> Option<String> {
        self.projection
            .as_ref()
            .map(|exprs| exprs.iter().map(|e| e.deparse(&self.scan_desc)).join(", "))
    }
}
