//! Run store installation

use crate::commands::open_store;
use crate::config::StorageConfig;
use crate::error::CliResult;
use crate::output::print_success;

/// Create the run store schema. Safe to repeat.
pub async fn execute(storage: &StorageConfig) -> CliResult<()> {
    open_store(storage).await?;
    print_success(&format!("Run store ready at {}", storage.url));
    Ok(())
}
