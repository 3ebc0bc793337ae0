//! CSV export of batch results.

use std::io;
use std::path::Path;

use serde::Serialize;

use crate::batch::{signature, BatchTestResult};
use crate::error::ReportError;

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
struct Row<'a> {
    server_path: String,
    success: bool,
    duration_ms: u64,
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    failure_type: Option<&'a str>,
    failed_stage: Option<&'a str>,
    signature: Option<String>,
}

/// Writes one row per server of `batch` to `writer`.
///
/// # Errors
///
/// Returns [`ReportError::Csv`] if a row cannot be written.
pub fn write_batch_rows<W: io::Write>(batch: &BatchTestResult, writer: W) -> Result<(), ReportError> {
    let mut csv = csv::Writer::from_writer(writer);
    for (path, result) in &batch.server_results {
        let counts = result.test_result.counts;
        csv.serialize(Row {
            server_path: path.display().to_string(),
            success: result.success,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            total: counts.total,
            passed: counts.passed,
            failed: counts.failed,
            skipped: counts.skipped,
            failure_type: result.test_result.failure_type.map(|f| f.as_str()),
            failed_stage: result.first_failed_stage().map(|s| s.name.as_str()),
            signature: (!result.success).then(|| signature(result)),
        })?;
    }
    csv.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Writes the batch CSV to `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_batch_csv(batch: &BatchTestResult, path: &Path) -> Result<(), ReportError> {
    let file = std::fs::File::create(path).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    write_batch_rows(batch, file)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::batch::BatchRunner;
    use crate::cancel::CancelSignal;
    use crate::config::TestConfig;
    use crate::error::{FailureType, StageError};
    use crate::pipeline::{Pipeline, Stage, StageExecutor};
    use crate::suite::{GroupOutput, RunContext};

    struct FailsBad;

    #[async_trait]
    impl StageExecutor for FailsBad {
        async fn execute(&self, ctx: &RunContext) -> Result<GroupOutput, StageError> {
            if ctx.server_path().ends_with("bad") {
                Err(StageError::Fatal {
                    kind: FailureType::Dependency,
                    message: "missing go.sum entry".to_string(),
                })
            } else {
                Ok(GroupOutput::Empty)
            }
        }
    }

    #[tokio::test]
    async fn one_row_per_server() {
        let pipeline =
            Pipeline::new(Arc::new(TestConfig::default())).add_stage(Stage::new("validation", FailsBad));
        let paths = vec!["/srv/good".into(), "/srv/bad".into()];
        let batch = BatchRunner::new(pipeline).run(&paths, &CancelSignal::new()).await;

        let mut buf = Vec::new();
        write_batch_rows(&batch, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("server_path,success,duration_ms"));
        assert!(lines[1].starts_with("/srv/good,true,"));
        assert!(lines[2].starts_with("/srv/bad,false,"));
        assert!(lines[2].ends_with("dependency_error,validation,dependency_error@validation"));
    }
}
