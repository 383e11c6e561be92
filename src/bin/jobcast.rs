//! jobcast CLI: operator interface to the job engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use jobcast::codec::{CodecLimits, PayloadSource, TomlCodec, required_fields};
use jobcast::config::Config;
use jobcast::config::secrets::redacted;
use jobcast::engine::{Engine, ProcessResult};
use jobcast::model::{JobId, ResultEnvelope};
use jobcast::telemetry::{TelemetryConfig, init_telemetry};
use jobcast::transport::{ChannelTransport, InboundMessage, MqttTransport};
use toml::Table;
use tracing::info;

#[derive(Parser)]
#[command(name = "jobcast", about = "Message-driven job tracker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a config file and print the resolved settings
    CheckConfig {
        /// Path to the TOML config
        path: PathBuf,
    },
    /// Run a payload file through the codec
    Decode {
        /// Path to the TOML payload
        path: PathBuf,
        /// Field that must be present (repeatable)
        #[arg(long = "require")]
        require: Vec<String>,
    },
    /// Connect to the configured broker and echo every job to the results topic
    Listen {
        /// Path to the TOML config
        #[arg(long)]
        config: PathBuf,
    },
    /// Feed payload files through the engine with an echo processor
    Replay {
        /// Path to the TOML config
        #[arg(long)]
        config: Option<PathBuf>,
        /// Payload files, delivered in order
        payloads: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig { path } => cmd_check_config(path),
        Command::Decode { path, require } => cmd_decode(path, require),
        Command::Listen { config } => cmd_listen(config).await,
        Command::Replay { config, payloads } => cmd_replay(config, payloads).await,
    }
}

fn cmd_check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&path)?;
    let conn = &config.connection;

    println!("URI:          {}", conn.uri());
    println!("Client ID:    {}", conn.client_id);
    println!("Username:     {}", conn.username.as_deref().unwrap_or("(unset)"));
    println!("Password:     {}", redacted(conn.password.as_ref()));
    println!("TLS:          {}", if config.tls.is_enabled() { "on" } else { "off" });
    println!("Topic:        {} (qos {})", config.topics.main, config.topics.qos);
    println!("Results:      {}", config.topics.results);
    println!("Errors:       {} (retain {})", config.topics.error, config.topics.retain);
    println!(
        "Session:      keep-alive {}s, clean {}, reconnect {} (retries {}, max {}s)",
        conn.keep_alive,
        conn.clean_session,
        conn.auto_reconnect,
        conn.reconnect_retries,
        conn.reconnect_max_interval
    );
    if let Some(will) = &config.will {
        println!("Will:         {} (qos {}, retain {})", will.topic, will.qos, will.retain);
    }
    for (name, options) in &config.custom_topics {
        println!("Custom:       {name} (qos {}, retain {})", options.qos, options.retain);
    }
    println!("Max jobs:     {}", config.jobs.max_in_memory);
    println!("Retention:    {}s", config.jobs.retention_secs);
    println!("Id field:     {}", config.jobs.id_field);
    println!("Generate ids: {}", config.jobs.allow_id_generation);
    println!("Duplicates:   {}", config.jobs.duplicate_action);
    Ok(())
}

fn cmd_decode(path: PathBuf, require: Vec<String>) -> anyhow::Result<()> {
    let fields: Vec<&str> = require.iter().map(String::as_str).collect();
    let codec = TomlCodec::new(CodecLimits::default()).with_validator(required_fields(&fields));

    let parsed = codec.parse(PayloadSource::File(path))?;
    println!("{}", serde_json::to_string_pretty(&parsed.data)?);

    if !parsed.is_valid() {
        for error in &parsed.validation_errors {
            eprintln!("invalid: {error}");
        }
        anyhow::bail!("{} validation error(s)", parsed.validation_errors.len());
    }
    Ok(())
}

/// Returns the input unchanged as the job result.
fn echo(payload: &Table, job_id: &JobId) -> ProcessResult {
    Ok(Some(ResultEnvelope::new(job_id.clone(), payload.clone())))
}

async fn cmd_listen(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&config_path)?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "jobcast"))?;
    let engine = Engine::new(config);

    let stopper = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current message");
            stopper.stop();
        }
    });

    let mut transport = MqttTransport::new();
    engine.run(&mut transport, &echo).await?;

    let jobs = engine.all_jobs().await;
    info!(
        total = jobs.len(),
        failed = engine.failed_jobs().await.len(),
        "listener finished"
    );
    Ok(())
}

async fn cmd_replay(config_path: Option<PathBuf>, payloads: Vec<PathBuf>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "jobcast"))?;

    let topic = config.topics.main.clone();
    let engine = Engine::new(config);

    let (mut transport, handle) = ChannelTransport::pair();
    let (inbound, mut outbound) = handle.split();
    for path in &payloads {
        let bytes = std::fs::read(path)?;
        inbound
            .send(InboundMessage {
                topic: topic.clone(),
                payload: bytes,
            })
            .map_err(|_| anyhow::anyhow!("transport dropped"))?;
    }
    // Closing the inbound side ends the run once every payload is handled.
    drop(inbound);

    engine.run(&mut transport, &echo).await?;

    while let Ok(message) = outbound.try_recv() {
        println!(
            "--- published to {} (qos {}, retain {})",
            message.topic, message.qos, message.retain
        );
        println!("{}", String::from_utf8_lossy(&message.payload));
    }

    let jobs = engine.all_jobs().await;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}
