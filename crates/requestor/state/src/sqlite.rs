//! SQLite run store

use crate::error::{StateError, StateResult};
use crate::records::*;
use crate::store::RunStore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use requestor_types::{AgreementState, ResourceId, RunId, StopReason};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};

/// SQLite-backed run store
#[derive(Debug, Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

fn query_error(e: sqlx::Error) -> StateError {
    StateError::Query(e.to_string())
}

/// Foreign key violations mean the parent row is missing.
fn insert_error(table: &str, e: sqlx::Error) -> StateError {
    match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => {
            StateError::NotFound(format!("parent of {} row", table))
        }
        _ => query_error(e),
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> StateResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StateError::InvalidData(format!("timestamp {}: {}", value, e)))
}

/// Amounts are kept as decimal text so sums stay exact.
fn parse_amount(value: &str) -> StateResult<Decimal> {
    Decimal::from_str(value).map_err(|e| StateError::InvalidData(format!("amount {}: {}", value, e)))
}

fn parse_run_id(value: &str) -> StateResult<RunId> {
    RunId::parse(value).map_err(|e| StateError::InvalidData(format!("run id {}: {}", value, e)))
}

fn run_key(id: &RunId) -> String {
    id.as_uuid().to_string()
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> StateResult<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(query_error)
}

fn stop_reason(value: Option<String>) -> StateResult<Option<StopReason>> {
    value
        .map(|v| StopReason::parse(&v).ok_or_else(|| StateError::InvalidData(format!("stop reason {}", v))))
        .transpose()
}

fn activity_status(value: &str) -> StateResult<ActivityStatus> {
    ActivityStatus::parse(value)
        .ok_or_else(|| StateError::InvalidData(format!("activity status {}", value)))
}

fn run_from_row(row: &SqliteRow) -> StateResult<RunRecord> {
    Ok(RunRecord {
        id: parse_run_id(&get::<String>(row, "id")?)?,
        started_at: parse_ts(&get::<String>(row, "start_ts")?)?,
    })
}

fn activity_from_row(row: &SqliteRow) -> StateResult<ActivityRecord> {
    Ok(ActivityRecord {
        id: ResourceId::new(get::<String>(row, "id")?),
        agreement_id: ResourceId::new(get::<String>(row, "agreement_id")?),
        status: activity_status(&get::<String>(row, "status")?)?,
        stop_reason: stop_reason(get(row, "stop_reason")?)?,
        created_at: parse_ts(&get::<String>(row, "created_ts")?)?,
    })
}

fn rollup_from_row(row: &SqliteRow, cost: Decimal) -> StateResult<ActivityRollup> {
    Ok(ActivityRollup {
        activity_id: ResourceId::new(get::<String>(row, "activity_id")?),
        agreement_id: ResourceId::new(get::<String>(row, "agreement_id")?),
        status: activity_status(&get::<String>(row, "status")?)?,
        stop_reason: stop_reason(get(row, "stop_reason")?)?,
        batches: get::<i64>(row, "batches")?.max(0) as u64,
        cost,
        results: get::<i64>(row, "results")?.max(0) as u64,
        created_at: parse_ts(&get::<String>(row, "created_ts")?)?,
        last_batch_at: get::<Option<String>>(row, "last_batch_ts")?
            .as_deref()
            .map(parse_ts)
            .transpose()?,
    })
}

const RUN_ACTIVITIES: &str = r#"
    SELECT activity.id, activity.agreement_id, activity.status, activity.stop_reason, activity.created_ts
    FROM activity
    JOIN agreement ON agreement.id = activity.agreement_id
    JOIN proposal ON proposal.id = agreement.proposal_id
    JOIN demand ON demand.id = proposal.demand_id
    WHERE demand.run_id = ?
    ORDER BY activity.created_ts, activity.id
"#;

impl SqliteRunStore {
    /// Open a pool on `url`, creating the database file when missing.
    ///
    /// An in-memory database lives in a single connection that is never
    /// recycled.
    pub async fn connect(url: &str, max_connections: u32) -> StateResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StateError::Connection(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        debug!(url, in_memory, "Connected to run store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize_schema(&self) -> StateResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS run (
                id TEXT PRIMARY KEY,
                start_ts TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS demand (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES run(id) ON DELETE CASCADE,
                created_ts TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS proposal (
                id TEXT PRIMARY KEY,
                demand_id TEXT NOT NULL REFERENCES demand(id) ON DELETE CASCADE,
                initial INTEGER NOT NULL,
                data TEXT NOT NULL,
                created_ts TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS agreement (
                id TEXT PRIMARY KEY,
                proposal_id TEXT NOT NULL REFERENCES proposal(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                created_ts TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS activity (
                id TEXT PRIMARY KEY,
                agreement_id TEXT NOT NULL REFERENCES agreement(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                stop_reason TEXT,
                created_ts TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS batch (
                id TEXT PRIMARY KEY,
                activity_id TEXT NOT NULL REFERENCES activity(id) ON DELETE CASCADE,
                created_ts TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS debit_note (
                id TEXT PRIMARY KEY,
                activity_id TEXT NOT NULL REFERENCES activity(id) ON DELETE CASCADE,
                amount TEXT NOT NULL,
                created_ts TEXT NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS results (
                id TEXT PRIMARY KEY REFERENCES activity(id) ON DELETE CASCADE,
                run_id TEXT NOT NULL REFERENCES run(id) ON DELETE CASCADE,
                cnt INTEGER NOT NULL,
                created_ts TEXT NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS demand_run_id ON demand(run_id);"#,
            r#"CREATE INDEX IF NOT EXISTS proposal_demand_id ON proposal(demand_id);"#,
            r#"CREATE INDEX IF NOT EXISTS agreement_proposal_id ON agreement(proposal_id);"#,
            r#"CREATE INDEX IF NOT EXISTS activity_agreement_id ON activity(agreement_id);"#,
            r#"CREATE INDEX IF NOT EXISTS batch_activity_id ON batch(activity_id);"#,
            r#"CREATE INDEX IF NOT EXISTS debit_note_activity_id ON debit_note(activity_id);"#,
            r#"
            CREATE VIEW IF NOT EXISTS run_rollup AS
            SELECT
                demand.run_id AS run_id,
                activity.id AS activity_id,
                activity.agreement_id AS agreement_id,
                activity.status AS status,
                activity.stop_reason AS stop_reason,
                activity.created_ts AS created_ts,
                (SELECT COUNT(*) FROM batch WHERE batch.activity_id = activity.id) AS batches,
                (SELECT MAX(batch.created_ts) FROM batch WHERE batch.activity_id = activity.id) AS last_batch_ts,
                (SELECT COUNT(*) FROM debit_note WHERE debit_note.activity_id = activity.id) AS debit_notes,
                (SELECT COALESCE(SUM(results.cnt), 0) FROM results WHERE results.id = activity.id) AS results
            FROM activity
            JOIN agreement ON agreement.id = activity.agreement_id
            JOIN proposal ON proposal.id = agreement.proposal_id
            JOIN demand ON demand.id = proposal.demand_id;
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(query_error)?;
        }

        Ok(())
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn install(&self) -> StateResult<()> {
        self.initialize_schema().await?;
        info!("Run store schema ready");
        Ok(())
    }

    async fn create_run(&self, id: RunId, started_at: DateTime<Utc>) -> StateResult<RunRecord> {
        sqlx::query("INSERT INTO run (id, start_ts) VALUES (?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(run_key(&id))
            .bind(ts(started_at))
            .execute(&self.pool)
            .await
            .map_err(query_error)?;

        self.get_run(&id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("run {}", id)))
    }

    async fn get_run(&self, id: &RunId) -> StateResult<Option<RunRecord>> {
        let row = sqlx::query("SELECT id, start_ts FROM run WHERE id = ?")
            .bind(run_key(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn latest_run(&self) -> StateResult<Option<RunRecord>> {
        let row = sqlx::query("SELECT id, start_ts FROM run ORDER BY start_ts DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn delete_run(&self, id: &RunId) -> StateResult<bool> {
        let result = sqlx::query("DELETE FROM run WHERE id = ?")
            .bind(run_key(id))
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_demand(&self, record: DemandRecord) -> StateResult<()> {
        sqlx::query("INSERT INTO demand (id, run_id, created_ts) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(record.id.as_str())
            .bind(run_key(&record.run_id))
            .bind(ts(record.created_at))
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error("demand", e))?;
        Ok(())
    }

    async fn insert_proposal(&self, record: ProposalRecord) -> StateResult<()> {
        let data = serde_json::to_string(&record.data)
            .map_err(|e| StateError::InvalidData(e.to_string()))?;
        sqlx::query(
            "INSERT INTO proposal (id, demand_id, initial, data, created_ts) VALUES (?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(record.id.as_str())
        .bind(record.demand_id.as_str())
        .bind(record.initial)
        .bind(data)
        .bind(ts(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("proposal", e))?;
        Ok(())
    }

    async fn insert_agreement(&self, record: AgreementRecord) -> StateResult<()> {
        sqlx::query(
            "INSERT INTO agreement (id, proposal_id, status, created_ts) VALUES (?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(record.id.as_str())
        .bind(record.proposal_id.as_str())
        .bind(record.status.as_str())
        .bind(ts(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("agreement", e))?;
        Ok(())
    }

    async fn insert_activity(&self, record: ActivityRecord) -> StateResult<()> {
        sqlx::query(
            "INSERT INTO activity (id, agreement_id, status, stop_reason, created_ts) VALUES (?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(record.id.as_str())
        .bind(record.agreement_id.as_str())
        .bind(record.status.as_str())
        .bind(record.stop_reason.map(|r| r.as_str()))
        .bind(ts(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("activity", e))?;
        Ok(())
    }

    async fn insert_batch(&self, record: BatchRecord) -> StateResult<()> {
        sqlx::query("INSERT INTO batch (id, activity_id, created_ts) VALUES (?, ?, ?) ON CONFLICT(id) DO NOTHING")
            .bind(record.id.as_str())
            .bind(record.activity_id.as_str())
            .bind(ts(record.created_at))
            .execute(&self.pool)
            .await
            .map_err(|e| insert_error("batch", e))?;
        Ok(())
    }

    async fn insert_debit_note(&self, record: DebitNoteRecord) -> StateResult<()> {
        sqlx::query(
            "INSERT INTO debit_note (id, activity_id, amount, created_ts) VALUES (?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(record.id.as_str())
        .bind(record.activity_id.as_str())
        .bind(record.amount.to_string())
        .bind(ts(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error("debit_note", e))?;
        Ok(())
    }

    async fn update_agreement_status(&self, id: &ResourceId, status: AgreementState) -> StateResult<()> {
        let result = sqlx::query("UPDATE agreement SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(StateError::NotFound(format!("agreement {}", id)));
        }
        Ok(())
    }

    async fn update_activity_status(
        &self,
        id: &ResourceId,
        status: ActivityStatus,
        stop_reason: Option<StopReason>,
    ) -> StateResult<()> {
        let result = sqlx::query(
            "UPDATE activity SET status = ?, stop_reason = COALESCE(?, stop_reason) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(stop_reason.map(|r| r.as_str()))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(StateError::NotFound(format!("activity {}", id)));
        }
        Ok(())
    }

    async fn add_results(&self, run_id: &RunId, activity_id: &ResourceId, count: u64) -> StateResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO results (id, run_id, cnt, created_ts)
            SELECT activity.id, demand.run_id, ?, ?
            FROM activity
            JOIN agreement ON agreement.id = activity.agreement_id
            JOIN proposal ON proposal.id = agreement.proposal_id
            JOIN demand ON demand.id = proposal.demand_id
            WHERE activity.id = ? AND demand.run_id = ?
            ON CONFLICT(id) DO UPDATE SET cnt = cnt + excluded.cnt
            "#,
        )
        .bind(count as i64)
        .bind(ts(Utc::now()))
        .bind(activity_id.as_str())
        .bind(run_key(run_id))
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(StateError::NotFound(format!("activity {} of run {}", activity_id, run_id)));
        }
        Ok(())
    }

    async fn agreements(&self, run_id: &RunId) -> StateResult<Vec<AgreementRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT agreement.id, agreement.proposal_id, agreement.status, agreement.created_ts
            FROM agreement
            JOIN proposal ON proposal.id = agreement.proposal_id
            JOIN demand ON demand.id = proposal.demand_id
            WHERE demand.run_id = ?
            ORDER BY agreement.created_ts, agreement.id
            "#,
        )
        .bind(run_key(run_id))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                let status: String = get(row, "status")?;
                Ok(AgreementRecord {
                    id: ResourceId::new(get::<String>(row, "id")?),
                    proposal_id: ResourceId::new(get::<String>(row, "proposal_id")?),
                    status: AgreementState::parse(&status)
                        .ok_or_else(|| StateError::InvalidData(format!("agreement status {}", status)))?,
                    created_at: parse_ts(&get::<String>(row, "created_ts")?)?,
                })
            })
            .collect()
    }

    async fn activities(&self, run_id: &RunId) -> StateResult<Vec<ActivityRecord>> {
        let rows = sqlx::query(RUN_ACTIVITIES)
            .bind(run_key(run_id))
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?;
        rows.iter().map(activity_from_row).collect()
    }

    async fn debit_notes(&self, run_id: &RunId, since: Option<DateTime<Utc>>) -> StateResult<Vec<DebitNoteRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT debit_note.id, debit_note.activity_id, debit_note.amount, debit_note.created_ts
            FROM debit_note
            JOIN activity ON activity.id = debit_note.activity_id
            JOIN agreement ON agreement.id = activity.agreement_id
            JOIN proposal ON proposal.id = agreement.proposal_id
            JOIN demand ON demand.id = proposal.demand_id
            WHERE demand.run_id = ? AND (? IS NULL OR debit_note.created_ts >= ?)
            ORDER BY debit_note.created_ts
            "#,
        )
        .bind(run_key(run_id))
        .bind(since.map(ts))
        .bind(since.map(ts))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                Ok(DebitNoteRecord {
                    id: ResourceId::new(get::<String>(row, "id")?),
                    activity_id: ResourceId::new(get::<String>(row, "activity_id")?),
                    amount: parse_amount(&get::<String>(row, "amount")?)?,
                    created_at: parse_ts(&get::<String>(row, "created_ts")?)?,
                })
            })
            .collect()
    }

    async fn rollup(&self, run_id: &RunId) -> StateResult<Vec<ActivityRollup>> {
        let rows = sqlx::query(
            "SELECT * FROM run_rollup WHERE run_id = ? ORDER BY created_ts, activity_id",
        )
        .bind(run_key(run_id))
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        let mut costs: HashMap<ResourceId, Decimal> = HashMap::new();
        for note in self.debit_notes(run_id, None).await? {
            *costs.entry(note.activity_id).or_default() += note.amount;
        }
        rows.iter()
            .map(|row| {
                let activity_id = ResourceId::new(get::<String>(row, "activity_id")?);
                rollup_from_row(row, costs.get(&activity_id).copied().unwrap_or_default())
            })
            .collect()
    }

    async fn summary(&self, run_id: &RunId) -> StateResult<Option<RunSummary>> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let rollup = self.rollup(run_id).await?;
        let results: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(cnt), 0) FROM results WHERE run_id = ?")
            .bind(run_key(run_id))
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(Some(RunSummary::build(&run, &rollup, results.max(0) as u64)))
    }
}
