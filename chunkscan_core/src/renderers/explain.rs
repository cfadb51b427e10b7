use std::fmt::Display;

use crate::core::{processor::scan::ScanCounters, program::ScanProgram, stats::StatsSnapshot};

/// Text EXPLAIN of an accelerated scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainOutput {
    pub projection: Option<String>,
    pub filter: Option<String>,
    pub device_executable: bool,
    pub rows_removed: Option<u64>,
    pub ccache_chunks: u64,
    pub fallback_tasks: u64,
    pub direct_transfer: bool,
}

impl ExplainOutput {
    pub fn new(program: &ScanProgram, stats: StatsSnapshot, counters: ScanCounters, direct_transfer: bool) -> Self {
        let filter = program.deparse_quals();
        // filtered rows are reported per loop
        let rows_removed = filter.as_ref().map(|_| {
            let nloops = counters.nloops.max(1);
            (stats.nitems_filtered as f64 / nloops as f64).round() as u64
        });

        ExplainOutput {
            projection: program.deparse_projection(),
            filter,
            device_executable: program.device_executable(),
            rows_removed,
            ccache_chunks: stats.ccache_count,
            fallback_tasks: counters.fallback_tasks,
            direct_transfer,
        }
    }

    /// Label/value pairs in display order.
    pub fn properties(&self) -> Vec<(&'static str, String)> {
        let mut props = Vec::new();
        if let Some(projection) = &self.projection {
            props.push(("GPU Projection", projection.clone()));
        }
        if let Some(filter) = &self.filter {
            props.push(("GPU Filter", filter.clone()));
        }
        if let Some(rows) = self.rows_removed {
            props.push(("Rows Removed by GPU Filter", rows.to_string()));
        }
        if !self.device_executable {
            props.push(("GPU Recheck", "host".to_string()));
        }
        if self.ccache_chunks > 0 {
            props.push(("Columnar Cache Chunks", self.ccache_chunks.to_string()));
        }
        props.push(("CPU Fallback Tasks", self.fallback_tasks.to_string()));
        if self.direct_transfer {
            props.push(("Direct Transfer", "enabled".to_string()));
        }
        props
    }
}

impl Display for ExplainOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Custom Scan (GpuScan)")?;
        for (label, value) in self.properties() {
            writeln!(f, "  {}: {}", label, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::{
        db_type::DbType,
        expression::{ComparerOperation, Expr},
        schema::{Attribute, TupleDesc},
        tuple::Datum,
    };

    fn program(quals: Option<Expr>) -> ScanProgram {
        let desc = Arc::new(TupleDesc::new(vec![
            Attribute::new("id", DbType::I32),
            Attribute::new("name", DbType::STRING),
        ]));
        let projection = vec![("name".to_string(), Expr::col(1))];
        ScanProgram::new(desc, quals, Some(projection), &[]).unwrap()
    }

    #[test]
    fn test_rows_removed_is_per_loop() {
        let quals = Expr::compare(ComparerOperation::Less, Expr::col(0), Expr::constant(Datum::I32(5)));
        let stats = StatsSnapshot {
            nitems_filtered: 30,
            ccache_count: 2,
        };
        let counters = ScanCounters {
            nloops: 3,
            fallback_tasks: 1,
            ..Default::default()
        };
        let explain = ExplainOutput::new(&program(Some(quals)), stats, counters, true);
        assert_eq!(explain.rows_removed, Some(10));

        let text = explain.to_string();
        assert_eq!(
            text,
            "Custom Scan (GpuScan)\n  GPU Projection: name\n  GPU Filter: (id < 5)\n  \
             Rows Removed by GPU Filter: 10\n  Columnar Cache Chunks: 2\n  CPU Fallback Tasks: 1\n  \
             Direct Transfer: enabled\n"
        );
    }

    #[test]
    fn test_pattern_filter_is_marked_for_host_recheck() {
        let quals = Expr::compare(
            ComparerOperation::StartsWith,
            Expr::col(1),
            Expr::constant(Datum::Text("a".into())),
        );
        let explain = ExplainOutput::new(&program(Some(quals)), StatsSnapshot::default(), ScanCounters::default(), false);
        assert!(explain.properties().contains(&("GPU Recheck", "host".to_string())));
        assert!(!explain.to_string().contains("Direct Transfer"));
    }

    #[test]
    fn test_no_filter() {
        let explain = ExplainOutput::new(&program(None), StatsSnapshot::default(), ScanCounters::default(), false);
        assert!(explain.rows_removed.is_none());
        assert!(!explain.to_string().contains("GPU Filter"));
    }
}
