use clap::{Parser, Subcommand};
use sentinel_bus::{
    Compression, Config, ConsumedMessage, Connector, PublishOptions, Result, SubscribeOptions,
};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "sentinel-bus")]
#[command(about = "Resilient Kafka messaging connector", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the cluster and print the health report
    Health,
    /// Create any missing known topics
    Provision,
    /// Publish a JSON document; an array is published as one batch
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,
        #[arg(long, default_value = "default")]
        producer: String,
        #[arg(long, default_value = "gzip")]
        compression: Compression,
    },
    /// Consume and print messages until interrupted
    Consume {
        #[arg(short, long)]
        group: String,
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,
        #[arg(long)]
        dlq_topic: Option<String>,
        #[arg(long)]
        continue_on_error: bool,
        #[arg(long)]
        from_beginning: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        kafka_brokers = ?config.kafka.brokers,
        client_id = %config.kafka.client_id,
        security_protocol = config.kafka.security_protocol(),
        known_topics = config.topics.known.len(),
        "Configuration summary"
    );

    let connector = Connector::new(config)?;
    if let Err(e) = connector.connect().await {
        // The health report carries the failure itself.
        if !matches!(args.command, Command::Health) {
            error!("Failed to connect: {}", e);
            return Err(e);
        }
    }

    let outcome = run(&connector, args.command).await;
    connector.disconnect().await;
    outcome
}

async fn run(connector: &Connector, command: Command) -> Result<()> {
    match command {
        Command::Health => {
            let report = connector.health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Provision => {
            info!("Known topics provisioned");
            Ok(())
        }
        Command::Publish {
            topic,
            file,
            producer,
            compression,
        } => {
            let document: Value = serde_json::from_slice(&tokio::fs::read(&file).await?)?;
            let options = PublishOptions::new()
                .producer(producer)
                .compression(compression);

            match document {
                Value::Array(messages) => {
                    let receipt = connector.publish_batch(&topic, &messages, &options).await?;
                    println!("{}", serde_json::to_string_pretty(&receipt)?);
                }
                message => {
                    let receipt = connector.publish(&topic, &message, &options).await?;
                    println!("{}", serde_json::to_string_pretty(&receipt)?);
                }
            }
            Ok(())
        }
        Command::Consume {
            group,
            topics,
            dlq_topic,
            continue_on_error,
            from_beginning,
        } => {
            let mut options = SubscribeOptions::new()
                .continue_on_error(continue_on_error)
                .from_beginning(from_beginning);
            if let Some(dlq_topic) = dlq_topic {
                options = options.dlq_topic(dlq_topic);
            }

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            connector
                .subscribe(&group, &topic_refs, print_message, options)
                .await?;
            info!(group = %group, "Consuming, press Ctrl-C to stop");

            tokio::select! {
                result = connector.wait_for_consumer(&group) => result,
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    info!("Interrupted, shutting down");
                    Ok(())
                }
            }
        }
    }
}

async fn print_message(message: ConsumedMessage) -> anyhow::Result<()> {
    let line = serde_json::json!({
        "topic": message.topic,
        "partition": message.partition,
        "offset": message.offset,
        "key": message.key,
        "headers": message.headers,
        "value": message.value,
    });
    println!("{}", line);
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("sentinel_bus=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sentinel_bus=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
