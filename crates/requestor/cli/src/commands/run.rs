//! Execute a work source

use crate::commands::open_store;
use crate::config::RequestorConfig;
use crate::error::{CliError, CliResult};
use crate::output::{print_info, print_success, print_warning, OutputFormat};
use chrono::Utc;
use clap::Args;
use requestor_core::{
    price_scorer, DefaultNegotiation, HttpDaemonApi, Negotiator, RequestorError, Session,
};
use requestor_payment::PaymentMonitor;
use requestor_state::RunStore;
use requestor_tasks::{Distributor, QueueTaskSource, RunOutcome, WorkSource};
use requestor_types::RunId;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How long a provider gets to answer our counter-offer
const COUNTER_OFFER_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Work source file (YAML, or JSON with a .json extension)
    pub source: PathBuf,

    /// Run id to use; a stored run is resumed, an unknown one is started under this id
    #[arg(long, visible_alias = "run-id")]
    pub resume: Option<String>,

    /// Concurrent activities
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Spending cap per trailing hour
    #[arg(long)]
    pub budget: Option<Decimal>,

    /// Highest acceptable cost per result
    #[arg(long)]
    pub max_price: Option<Decimal>,

    /// Subnet used when the work source names none
    #[arg(long)]
    pub subnet_tag: Option<String>,
}

/// Id for this run. A stored run is resumed; an unknown id is kept and
/// the run is created under it when it starts.
async fn run_id_for(store: &dyn RunStore, raw: Option<&str>) -> CliResult<RunId> {
    let Some(raw) = raw else {
        return Ok(RunId::generate());
    };
    let id = RunId::parse(raw).map_err(|e| CliError::InvalidInput(format!("run id {}: {}", raw, e)))?;
    match store.get_run(&id).await? {
        Some(run) => info!(run_id = %id, started_at = %run.started_at, "Resuming stored run"),
        None => info!(run_id = %id, "No stored run with this id, starting it"),
    }
    Ok(id)
}

/// Run until the work is done, the budget runs out or Ctrl-C.
pub async fn execute(args: RunArgs, config: &RequestorConfig, format: OutputFormat) -> CliResult<RunOutcome> {
    let source = WorkSource::from_path(&args.source)?;

    let mut run = config.run.clone();
    if let Some(workers) = args.workers {
        run.workers = workers;
    }
    if let Some(budget) = args.budget {
        run.budget_per_hour = budget;
    }
    if args.max_price.is_some() {
        run.max_price = args.max_price;
    }
    if args.subnet_tag.is_some() {
        run.subnet_tag = args.subnet_tag;
    }

    let store: Arc<dyn RunStore> = Arc::new(open_store(&config.storage).await?);
    let run_id = run_id_for(store.as_ref(), args.resume.as_deref()).await?;

    let api = HttpDaemonApi::new(config.daemon.clone()).map_err(RequestorError::from)?;
    let session = Session::new(Arc::new(api), run.session());

    let expiration = Utc::now() + chrono::Duration::seconds(run.demand_expiration_secs as i64);
    let demand = source.demand.to_demand(expiration, run.subnet_tag.as_deref());
    let negotiator = Arc::new(Negotiator::new(
        price_scorer(run.max_hourly_price),
        Arc::new(DefaultNegotiation {
            demand: demand.clone(),
            constraints: run.pricing.clone(),
            response_timeout: COUNTER_OFFER_TIMEOUT,
        }),
        run.negotiation(),
    ));
    let payments = PaymentMonitor::new(session.clone(), run.payment());
    let task_count = source.tasks.len();
    let tasks = Arc::new(QueueTaskSource::new(source.tasks, run.max_task_attempts));

    let distributor = Distributor::new(
        run_id,
        session,
        store,
        payments,
        negotiator,
        tasks,
        demand,
        run.distributor(),
    );

    info!(%run_id, tasks = task_count, workers = run.workers, budget = %run.budget_per_hour, "Starting run");
    if format == OutputFormat::Table {
        print_info(&format!("Run {} ({} tasks, {} workers)", run_id.as_uuid(), task_count, run.workers));
    }

    let outcome = distributor
        .run(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;

    match format {
        OutputFormat::Table => {
            let line = format!(
                "{}: {} completed, {} failed",
                outcome.cause, outcome.tasks_completed, outcome.tasks_failed
            );
            if outcome.cause.is_success() {
                print_success(&line);
            } else {
                print_warning(&line);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(&outcome)?),
    }
    Ok(outcome)
}
