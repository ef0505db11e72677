//! Sensorbus Daemon
//!
//! Polls sensor files, carries the readings through a broker and serves the
//! resulting gauges on a Prometheus endpoint.

mod pipeline;
mod web;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipeline::Pipeline;
use sensorbus_core::{
    poll_once, Consumer, ConsumerConfig, InitialOffset, MemoryBroker, MetricRegistry,
    PublisherConfig, SensorFile,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum CliInitialOffset {
    /// Only messages produced after joining
    #[default]
    Newest,
    /// Replay everything the broker retains
    Oldest,
}

impl From<CliInitialOffset> for InitialOffset {
    fn from(offset: CliInitialOffset) -> Self {
        match offset {
            CliInitialOffset::Newest => InitialOffset::Newest,
            CliInitialOffset::Oldest => InitialOffset::Oldest,
        }
    }
}

#[derive(Parser)]
#[command(name = "sensorbusd")]
#[command(about = "Sensor polling and Prometheus export over a message broker")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Sensor document (TOML, or JSON for .json paths)
    #[arg(
        short,
        long,
        global = true,
        env = "SENSORBUS_CONFIG",
        default_value = "config/sensors.toml"
    )]
    config: PathBuf,

    /// Topic carrying the measurements
    #[arg(long, global = true, env = "KAFKA_TOPIC", default_value = "sensors")]
    topic: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll, propagate and export in one process over an in-memory broker
    Run {
        #[command(flatten)]
        publish: PublishArgs,
        #[command(flatten)]
        export: ExportArgs,
        /// Partitions per topic
        #[arg(long, default_value_t = 4)]
        partitions: usize,
    },
    /// Poll sensors and publish to Kafka
    Produce {
        #[command(flatten)]
        kafka: KafkaArgs,
        #[command(flatten)]
        publish: PublishArgs,
    },
    /// Consume from Kafka and serve the metrics endpoint
    Export {
        #[command(flatten)]
        kafka: KafkaArgs,
        #[command(flatten)]
        export: ExportArgs,
        /// Where to start partitions the group has no offset for
        #[arg(long, default_value = "newest", value_enum)]
        initial_offset: CliInitialOffset,
    },
    /// Validate the sensor document and print one poll as JSON lines
    Check,
}

#[derive(Args)]
#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
struct KafkaArgs {
    /// Bootstrap brokers, comma-separated
    #[arg(long, env = "KAFKA_BROKERS", value_delimiter = ',', required = true)]
    brokers: Vec<String>,
}

#[derive(Args)]
struct PublishArgs {
    /// Measurements buffered before pollers block
    #[arg(long, default_value_t = 1024)]
    buffer: usize,

    /// Send retries before a measurement is dropped
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

impl PublishArgs {
    fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            buffer: self.buffer,
            retries: self.retries,
            ..PublisherConfig::default()
        }
    }
}

#[derive(Args)]
struct ExportArgs {
    /// Metrics endpoint listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Consumer group name
    #[arg(long, env = "KAFKA_CONSUMER_GROUP", default_value = "sensorbus")]
    group: String,

    /// Pause before rejoining the group after an error, in milliseconds
    #[arg(long, default_value_t = 5000)]
    backoff_ms: u64,
}

impl ExportArgs {
    fn consumer_config(&self, topic: &str) -> ConsumerConfig {
        ConsumerConfig {
            topic: topic.to_string(),
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    match &cli.command {
        Commands::Run {
            publish,
            export,
            partitions,
        } => run(&cli, publish, export, *partitions).await,
        Commands::Produce { kafka, publish } => produce(&cli, kafka, publish).await,
        Commands::Export {
            kafka,
            export,
            initial_offset,
        } => export_metrics(&cli, kafka, export, *initial_offset).await,
        Commands::Check => check(&cli),
    }
}

fn load_sensors(cli: &Cli) -> Result<SensorFile> {
    let sensors = SensorFile::load(&cli.config).with_context(|| {
        format!("Failed to load sensor document {}", cli.config.display())
    })?;
    info!(
        "Loaded {} sensors from: {}",
        sensors.sensors.len(),
        cli.config.display()
    );
    Ok(sensors)
}

async fn run(
    cli: &Cli,
    publish: &PublishArgs,
    export: &ExportArgs,
    partitions: usize,
) -> Result<()> {
    let sensors = load_sensors(cli)?;
    let broker = MemoryBroker::new(partitions);
    let registry = Arc::new(MetricRegistry::new().context("Failed to create metric registry")?);

    // The in-process log starts empty, so reading from the oldest offset loses nothing.
    let group = broker.consumer_group(&export.group, InitialOffset::Oldest);
    let mut pipeline = Pipeline::new();
    pipeline.start_consumer(Consumer::new(
        Box::new(group),
        registry.clone(),
        export.consumer_config(&cli.topic),
    ));
    pipeline.start_producer(
        &sensors,
        Arc::new(broker.clone()),
        &cli.topic,
        publish.publisher_config(),
    )?;

    let served = serve_until_shutdown(export.listen, registry).await;
    pipeline.shutdown().await;
    served
}

#[cfg(feature = "kafka")]
async fn produce(cli: &Cli, kafka: &KafkaArgs, publish: &PublishArgs) -> Result<()> {
    use sensorbus_core::broker::kafka::KafkaTransport;

    let sensors = load_sensors(cli)?;
    let transport =
        KafkaTransport::connect(&kafka.brokers).context("Failed to create Kafka producer")?;

    let mut pipeline = Pipeline::new();
    pipeline.start_producer(
        &sensors,
        Arc::new(transport),
        &cli.topic,
        publish.publisher_config(),
    )?;

    let waited = wait_for_shutdown().await;
    pipeline.shutdown().await;
    waited
}

#[cfg(not(feature = "kafka"))]
async fn produce(_cli: &Cli, _kafka: &KafkaArgs, _publish: &PublishArgs) -> Result<()> {
    anyhow::bail!("sensorbusd was built without Kafka support; rebuild with --features kafka")
}

#[cfg(feature = "kafka")]
async fn export_metrics(
    cli: &Cli,
    kafka: &KafkaArgs,
    export: &ExportArgs,
    initial_offset: CliInitialOffset,
) -> Result<()> {
    use sensorbus_core::broker::kafka::KafkaConsumerGroup;

    let registry = Arc::new(MetricRegistry::new().context("Failed to create metric registry")?);
    let group = KafkaConsumerGroup::new(&kafka.brokers, &export.group, initial_offset.into());

    let mut pipeline = Pipeline::new();
    pipeline.start_consumer(Consumer::new(
        Box::new(group),
        registry.clone(),
        export.consumer_config(&cli.topic),
    ));

    let served = serve_until_shutdown(export.listen, registry).await;
    pipeline.shutdown().await;
    served
}

#[cfg(not(feature = "kafka"))]
async fn export_metrics(
    _cli: &Cli,
    _kafka: &KafkaArgs,
    _export: &ExportArgs,
    _initial_offset: CliInitialOffset,
) -> Result<()> {
    anyhow::bail!("sensorbusd was built without Kafka support; rebuild with --features kafka")
}

fn check(cli: &Cli) -> Result<()> {
    let sensors = load_sensors(cli)?;
    let specs = sensors.specs().context("Invalid sensor configuration")?;

    for spec in &specs {
        for measurement in poll_once(spec) {
            println!("{}", serde_json::to_string(&measurement)?);
        }
    }
    Ok(())
}

/// Serves `/metrics` until SIGINT or SIGTERM.
async fn serve_until_shutdown(listen: SocketAddr, registry: Arc<MetricRegistry>) -> Result<()> {
    // Setup Unix signal handlers
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let app = web::create_router(registry);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Metrics endpoint listening on http://{}/metrics", listen);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
    }
    Ok(())
}
