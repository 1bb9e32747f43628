use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::AppResult;
use crate::store::{NewSubmission, Store};

/// Submissions shorter than this are excluded upstream of the pipeline.
pub const MIN_FEEDBACK_CHARS: usize = 50;

/// One row of the upstream exporter's CSV. The schema is fixed; there is no
/// column-name sniffing.
#[derive(Debug, Deserialize)]
struct ExportRow {
    submission_id: i64,
    feedback: String,
    program_name: String,
    assignment_name: String,
    created_at: String,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestSummary {
    pub ingested: usize,
    pub skipped_short: usize,
}

/// Parse the exporter CSV, dropping near-empty feedback.
pub fn read_submissions<R: Read>(reader: R) -> AppResult<(Vec<NewSubmission>, usize)> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for record in csv_reader.deserialize::<ExportRow>() {
        let record = record?;
        if record.feedback.trim().chars().count() <= MIN_FEEDBACK_CHARS {
            skipped += 1;
            continue;
        }
        rows.push(NewSubmission {
            submission_id: record.submission_id,
            feedback: record.feedback,
            program_name: record.program_name,
            assignment_name: record.assignment_name,
            created_at: record.created_at,
        });
    }
    Ok((rows, skipped))
}

/// Load an exporter CSV into the store. Safe to re-run: rows are upserted on
/// `submission_id`, so repeated ingestion of the same export is a no-op for
/// the row count.
#[tracing::instrument(name = "Ingesting feedback export", level = "info", skip(store))]
pub async fn run_ingest<P: AsRef<Path> + std::fmt::Debug>(
    store: &Store,
    csv_path: P,
) -> AppResult<IngestSummary> {
    let file = File::open(csv_path.as_ref())?;
    let (rows, skipped_short) = read_submissions(file)?;
    debug!("Parsed {} usable rows ({} too short)", rows.len(), skipped_short);

    store.upsert_submissions(&rows).await?;
    info!(
        "Ingested {} submissions, skipped {} below the length threshold",
        rows.len(),
        skipped_short
    );
    Ok(IngestSummary {
        ingested: rows.len(),
        skipped_short,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "submission_id,feedback,program_name,assignment_name,created_at\n";

    fn long_text(tag: &str) -> String {
        format!("{tag}: this feedback comment is comfortably longer than the fifty character floor")
    }

    #[test]
    fn short_feedback_is_filtered_out() {
        let csv = format!(
            "{HEADER}1,\"{}\",Chicago,Board meeting,2025-05-01\n2,too short,Chicago,Board meeting,2025-05-01\n",
            long_text("one")
        );
        let (rows, skipped) = read_submissions(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped, 1);
        assert_eq!(rows[0].submission_id, 1);
    }

    #[tokio::test]
    async fn repeated_ingestion_keeps_row_count_stable() {
        let store = Store::open_in_memory().await.unwrap();
        let csv = format!(
            "{HEADER}1,\"{}\",Chicago,Board meeting,2025-05-01\n2,\"{}\",Detroit,Court watch,2025-05-02\n",
            long_text("one"),
            long_text("two")
        );

        let (rows, _) = read_submissions(csv.as_bytes()).unwrap();
        store.upsert_submissions(&rows).await.unwrap();
        store.upsert_submissions(&rows).await.unwrap();

        assert_eq!(store.total_rows().await.unwrap(), 2);
    }
}
