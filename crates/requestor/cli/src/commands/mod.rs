//! CLI command implementations

pub mod install;
pub mod run;
pub mod show;
pub mod summary;

use crate::config::StorageConfig;
use crate::error::{CliError, CliResult};
use requestor_state::{RunRecord, RunStore, SqliteRunStore};
use requestor_types::RunId;

/// Open the run store, creating the schema when missing.
pub async fn open_store(storage: &StorageConfig) -> CliResult<SqliteRunStore> {
    let store = SqliteRunStore::connect(&storage.url, storage.max_connections).await?;
    store.install().await?;
    Ok(store)
}

/// The run named by `run_id`, or the most recent one.
pub async fn resolve_run(store: &dyn RunStore, run_id: Option<&str>) -> CliResult<RunRecord> {
    match run_id {
        Some(raw) => {
            let id = RunId::parse(raw)
                .map_err(|e| CliError::InvalidInput(format!("run id {}: {}", raw, e)))?;
            store
                .get_run(&id)
                .await?
                .ok_or_else(|| CliError::NotFound(id.to_string()))
        }
        None => store
            .latest_run()
            .await?
            .ok_or_else(|| CliError::NotFound("no runs recorded".to_string())),
    }
}
