//! CLI for jobrelay
//!
//! Subcommands:
//! - `worker`: consume jobs from the broker and run the pipeline for each
//! - `submit`: send one job and print its reply

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use jobrelay::client::JobClient;
use jobrelay::config::{Settings, load_config};
use jobrelay::job::JobPayload;
use jobrelay::notify::StompNotifier;
use jobrelay::transport::amqp::AmqpConnector;
use jobrelay::utils::logging;
use jobrelay::worker::{CommandExecutor, Worker};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "jobrelay")]
enum Command {
    /// Run the job worker until Ctrl-C
    Worker,
    /// Submit a job document and wait for its reply
    Submit {
        /// JSON file holding the job payload
        #[arg(long)]
        file: PathBuf,
        /// Seconds to wait for the reply (default: client.reply_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(2);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cmd {
        Command::Worker => run_worker(settings).await,
        Command::Submit { file, timeout } => run_submit(settings, &file, timeout).await,
    };
    if let Err(e) = result {
        error!("jobrelay failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_worker(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let executor = CommandExecutor::new(
        settings.pipeline.command.clone(),
        settings.pipeline.args.clone(),
    );
    let mut worker = Worker::new(
        Arc::new(AmqpConnector),
        settings.worker_options(),
        Arc::new(executor),
    );
    if let Some(url) = &settings.notifier.url {
        worker = worker.with_notifier(Arc::new(StompNotifier::new(
            url.clone(),
            settings.notifier.destination.clone(),
            Duration::from_secs(settings.notifier.timeout_secs),
        )));
    }

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received. Stopping worker.");
            shutdown.trigger();
        }
    });

    worker.run().await;
    Ok(())
}

async fn run_submit(
    settings: Settings,
    file: &Path,
    timeout: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read(file).await?;
    let payload = JobPayload::decode(&raw)?;
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.reply_timeout());

    let client = JobClient::connect(
        &AmqpConnector,
        &settings.connect_options(),
        settings.topology(),
    )
    .await?;
    let reply = client.submit_with_timeout(&payload, timeout).await;
    client.close().await?;

    let reply = reply?;
    println!("{}", String::from_utf8(reply.encode()?)?);
    Ok(())
}
