//! One-line summary of a run

use crate::commands::{open_store, resolve_run};
use crate::config::StorageConfig;
use crate::error::{CliError, CliResult};
use crate::output::{self, format_duration, OutputFormat};
use requestor_state::{RunStore, RunSummary};
use serde::Serialize;
use tabled::Tabled;

#[derive(Debug, Serialize, Tabled)]
pub struct SummaryRow {
    #[tabled(rename = "RUN")]
    pub run_id: String,
    #[tabled(rename = "STARTED")]
    pub started: String,
    #[tabled(rename = "ELAPSED")]
    pub elapsed: String,
    #[tabled(rename = "ACTIVITIES")]
    pub activities: u64,
    #[tabled(rename = "RESULTS")]
    pub results: u64,
    #[tabled(rename = "TOTAL COST")]
    pub total_cost: String,
    #[tabled(rename = "COST PER RESULT")]
    pub cost_per_result: String,
}

impl From<&RunSummary> for SummaryRow {
    fn from(summary: &RunSummary) -> Self {
        Self {
            run_id: summary.run_id.as_uuid().to_string(),
            started: summary.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            elapsed: format_duration(summary.elapsed()),
            activities: summary.activities,
            results: summary.results,
            total_cost: format!("{:.6}", summary.total_cost),
            cost_per_result: summary
                .cost_per_result()
                .map(|c| format!("{:.6}", c))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub async fn execute(storage: &StorageConfig, run_id: Option<&str>, format: OutputFormat) -> CliResult<()> {
    let store = open_store(storage).await?;
    let run = resolve_run(&store, run_id).await?;
    let summary = store
        .summary(&run.id)
        .await?
        .ok_or_else(|| CliError::NotFound(run.id.to_string()))?;
    output::print_output(&[SummaryRow::from(&summary)], format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use requestor_types::RunId;
    use rust_decimal::Decimal;

    #[test]
    fn test_summary_row() {
        let started_at = Utc::now() - Duration::seconds(90);
        let row = SummaryRow::from(&RunSummary {
            run_id: RunId::generate(),
            started_at,
            last_update: started_at + Duration::seconds(90),
            activities: 2,
            results: 4,
            total_cost: Decimal::new(5, 1),
        });
        assert_eq!(row.elapsed, "1m 30s");
        assert_eq!(row.cost_per_result, "0.125000");

        let empty = SummaryRow::from(&RunSummary {
            run_id: RunId::generate(),
            started_at,
            last_update: started_at,
            activities: 0,
            results: 0,
            total_cost: Decimal::ZERO,
        });
        assert_eq!(empty.cost_per_result, "-");
    }
}
