// Keel samples runner
//
// Starts a worker for the sample task queue (plus one for the remote queue),
// runs the chosen samples one after another and logs how each ends.
// Configure the store through KEEL_* variables or a .env file.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use keel_durable::config::EngineSettings;
use keel_durable::{Client, ClientError, Engine, StartWorkflowOptions, Worker, Workflow};
use keel_samples::{
    register_remote, register_samples, ExceptionInChildWorkflow, ExceptionWorkflow,
    GreetingWorkflow, NonRetryableExceptionWorkflow, RemoteActivityWorkflow,
    ReturnErrorInChildWorkflow, ReturnErrorWorkflow, REMOTE_TASK_QUEUE, TASK_QUEUE, WORKFLOW_ID,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Sample {
    Greeting,
    Exception,
    NonRetryable,
    ChildException,
    ReturnError,
    ChildReturnError,
    RemoteActivity,
}

#[derive(Parser)]
#[command(name = "keel-samples")]
#[command(about = "Run the keel exception and error samples")]
#[command(version)]
struct Cli {
    /// Samples to run, in order (all when omitted)
    #[arg(value_enum)]
    samples: Vec<Sample>,

    /// Name passed to every workflow
    #[arg(long, default_value = "World")]
    name: String,

    /// Task queue the sample worker polls
    #[arg(long, env = "KEEL_TASK_QUEUE", default_value = TASK_QUEUE)]
    task_queue: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_samples=info,keel_durable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut settings = EngineSettings::from_env().context("Invalid engine settings")?;
    settings.task_queue = cli.task_queue.clone();

    let store = settings
        .open_store()
        .context("Failed to open event store")?;
    let engine = Arc::new(Engine::new(store));
    let report = engine.recover().await.context("Recovery failed")?;
    tracing::info!(
        executions = report.executions,
        activities = report.activities_requeued,
        "engine ready"
    );

    let mut worker = Worker::new(engine.clone(), settings.worker_config());
    register_samples(&mut worker);
    let mut remote = Worker::new(
        engine.clone(),
        settings.worker_config().with_task_queue(REMOTE_TASK_QUEUE),
    );
    register_remote(&mut remote);

    worker.start().context("Failed to start sample worker")?;
    remote.start().context("Failed to start remote worker")?;

    let samples = if cli.samples.is_empty() {
        Sample::value_variants().to_vec()
    } else {
        cli.samples.clone()
    };

    let client = Client::new(engine);
    for sample in samples {
        let outcome = run_sample(&client, sample, &cli).await;
        match outcome {
            Ok(result) => tracing::info!(?sample, %result, "workflow completed"),
            Err(ClientError::WorkflowFailed(e)) => {
                tracing::error!(?sample, error = %format!("{:#}", e), "Error executing workflow");
                tracing::info!(?sample, root_cause = %e.root_cause().message(), "unwrapped failure");
            }
            Err(e) => return Err(e).context("Client error"),
        }
    }

    for w in [&worker, &remote] {
        if let Err(e) = w.shutdown().await {
            tracing::warn!(worker_id = %w.worker_id(), error = %e, "worker shutdown incomplete");
        }
    }
    Ok(())
}

async fn run_sample(
    client: &Client,
    sample: Sample,
    cli: &Cli,
) -> Result<serde_json::Value, ClientError> {
    let name = cli.name.clone();
    match sample {
        Sample::Greeting => execute::<GreetingWorkflow>(client, name, cli).await,
        Sample::Exception => execute::<ExceptionWorkflow>(client, name, cli).await,
        Sample::NonRetryable => execute::<NonRetryableExceptionWorkflow>(client, name, cli).await,
        Sample::ChildException => execute::<ExceptionInChildWorkflow>(client, name, cli).await,
        Sample::ReturnError => execute::<ReturnErrorWorkflow>(client, name, cli).await,
        Sample::ChildReturnError => execute::<ReturnErrorInChildWorkflow>(client, name, cli).await,
        Sample::RemoteActivity => execute::<RemoteActivityWorkflow>(client, name, cli).await,
    }
}

async fn execute<W: Workflow<Input = String>>(
    client: &Client,
    name: String,
    cli: &Cli,
) -> Result<serde_json::Value, ClientError> {
    let options = StartWorkflowOptions::new()
        .with_id(WORKFLOW_ID)
        .with_task_queue(cli.task_queue.clone());
    let output = client.execute_workflow::<W>(name, options).await?;
    Ok(serde_json::to_value(output)?)
}
