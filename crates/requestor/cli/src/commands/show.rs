//! Per-activity report of a run

use crate::commands::{open_store, resolve_run};
use crate::config::StorageConfig;
use crate::error::CliResult;
use crate::output::{self, print_info, OutputFormat};
use requestor_state::{ActivityRollup, RunStore};
use serde::Serialize;
use tabled::Tabled;

#[derive(Debug, Serialize, Tabled)]
pub struct ActivityRow {
    #[tabled(rename = "ACTIVITY")]
    pub activity: String,
    #[tabled(rename = "AGREEMENT")]
    pub agreement: String,
    #[tabled(rename = "STATUS")]
    pub status: String,
    #[tabled(rename = "STOP REASON")]
    pub stop_reason: String,
    #[tabled(rename = "BATCHES")]
    pub batches: u64,
    #[tabled(rename = "COST")]
    pub cost: String,
    #[tabled(rename = "RESULTS")]
    pub results: u64,
    #[tabled(rename = "CREATED")]
    pub created: String,
}

impl From<&ActivityRollup> for ActivityRow {
    fn from(row: &ActivityRollup) -> Self {
        Self {
            activity: row.activity_id.to_string(),
            agreement: row.agreement_id.to_string(),
            status: row.status.to_string(),
            stop_reason: row
                .stop_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
            batches: row.batches,
            cost: format!("{:.6}", row.cost),
            results: row.results,
            created: row.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

pub async fn execute(storage: &StorageConfig, run_id: Option<&str>, format: OutputFormat) -> CliResult<()> {
    let store = open_store(storage).await?;
    let run = resolve_run(&store, run_id).await?;
    let rows: Vec<ActivityRow> = store.rollup(&run.id).await?.iter().map(ActivityRow::from).collect();

    if format == OutputFormat::Table {
        print_info(&format!("{} started {}", run.id, run.started_at.format("%Y-%m-%d %H:%M:%S")));
    }
    output::print_output(&rows, format)
}
