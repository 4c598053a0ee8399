//! Run reports: the JSON file written after each batch and a flat table for
//! terminal display.

use std::path::Path;

use crate::error::Result;
use crate::io::atomic_write;
use crate::orchestrator::{BatchRun, RowStatus, RunSummary};

pub const ROW_HEADERS: [&str; 6] = ["ROW", "STATUS", "REASON", "ATTEMPTS", "TARGETS", "DETAIL"];

/// Write the run as pretty JSON, replacing any previous report at `path`.
pub fn write_json(run: &BatchRun, path: &Path) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(run)?;
    data.push(b'\n');
    atomic_write(path, &data)
}

pub fn summary(run: &BatchRun) -> RunSummary {
    run.summary()
}

/// One row per outcome, aligned with [`ROW_HEADERS`].
pub fn rows_table(run: &BatchRun) -> Vec<Vec<String>> {
    run.rows
        .iter()
        .map(|row| {
            let (status, reason) = match row.status {
                RowStatus::Success => ("success", ""),
                RowStatus::Failed(r) => ("failed", r.as_str()),
                RowStatus::Skipped(r) => ("skipped", r.as_str()),
            };
            let mut targets: Vec<String> = row.master_id.iter().map(ToString::to_string).collect();
            targets.extend(row.target_ids.iter().map(ToString::to_string));
            vec![
                row.row_index.to_string(),
                status.to_string(),
                reason.to_string(),
                row.attempts.to_string(),
                if targets.is_empty() { "-".to_string() } else { targets.join(" <- ") },
                row.detail.clone(),
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{FailureReason, RowOutcome, SkipReason};
    use dataverse_client::RecordId;
    use tempfile::TempDir;

    fn sample_run() -> BatchRun {
        let master: RecordId = "11111111-1111-4111-8111-111111111111".parse().unwrap();
        let dup: RecordId = "22222222-2222-4222-8222-222222222222".parse().unwrap();
        let mut run = BatchRun::start("merge");
        run.append(
            RowOutcome::success(0, "merged")
                .with_attempts(1)
                .with_master(master)
                .with_targets([dup]),
        );
        run.append(RowOutcome::skipped(1, SkipReason::NotFound, "no match"));
        run.append(RowOutcome::failed(2, FailureReason::Transport, "timed out").with_attempts(3));
        run.complete();
        run
    }

    #[test]
    fn table_rows_follow_headers() {
        let table = rows_table(&sample_run());
        assert_eq!(table.len(), 3);
        assert!(table.iter().all(|r| r.len() == ROW_HEADERS.len()));
        assert_eq!(
            table[0][4],
            "11111111-1111-4111-8111-111111111111 <- 22222222-2222-4222-8222-222222222222"
        );
        assert_eq!(table[1][1..3], ["skipped".to_string(), "not-found".to_string()]);
        assert_eq!(table[1][4], "-");
        assert_eq!(table[2][3], "3");
    }

    #[test]
    fn json_report_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".dvops/runs/report.json");
        let run = sample_run();
        write_json(&run, &path).unwrap();

        let back: BatchRun = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, run);
        let s = summary(&back);
        assert_eq!((s.success, s.failed, s.skipped), (1, 1, 1));
    }
}
