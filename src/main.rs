//! Kafka broker operator
//!
//! Invoked by the runtime once per batch of events for one unit.
//!
//! ## Usage
//!
//! ```bash
//! # Handle the events in a bundle and print the invocation report
//! kafka-operator dispatch --bundle bundle.json
//!
//! # Show the files the current snapshot would render, without applying them
//! kafka-operator resolve --bundle bundle.json
//!
//! # Print a JSON schema
//! kafka-operator schema bundle
//!
//! # Run with custom log level
//! RUST_LOG=debug kafka-operator dispatch --bundle -
//! ```

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use kafka_operator::controllers::render::render;
use kafka_operator::controllers::resolver::ResolverInput;
use kafka_operator::dispatch::{Bundle, Dispatcher, STATE_KEY};
use kafka_operator::model::config::CharmConfig;
use kafka_operator::store::{self, FileStore, Scope};
use kafka_operator::{Engine, OperatorSettings, SnapWorkload, UnitState};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Kafka broker operator
#[derive(Parser, Debug)]
#[command(name = "kafka-operator")]
#[command(version, about = "Reconciles Kafka brokers against their relations, config and storage")]
struct Args {
    /// Operator settings file (TOML)
    #[arg(long, env = "KAFKA_OPERATOR_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handle the events of a bundle and print the invocation report
    Dispatch {
        /// Bundle file, or `-` for stdin
        #[arg(long, default_value = "-")]
        bundle: String,
    },
    /// Resolve the desired configuration and print the rendered files
    Resolve {
        /// Bundle file, or `-` for stdin
        #[arg(long, default_value = "-")]
        bundle: String,
    },
    /// Print the JSON schema of an input document
    Schema {
        #[arg(value_enum)]
        document: SchemaDocument,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SchemaDocument {
    Config,
    Settings,
    Bundle,
}

fn read_bundle(source: &str) -> anyhow::Result<Bundle> {
    let raw = if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading bundle from stdin")?;
        raw
    } else {
        std::fs::read_to_string(source).with_context(|| format!("reading bundle {}", source))?
    };
    serde_json::from_str(&raw).context("parsing bundle")
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the report, logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let settings = OperatorSettings::load(args.settings.as_deref())?;

    match args.command {
        Command::Dispatch { bundle } => {
            let bundle = read_bundle(&bundle)?;
            info!(
                unit = %bundle.snapshot.unit,
                events = bundle.events.len(),
                "Starting invocation"
            );

            let store = Arc::new(FileStore::open(&settings.state_path)?);
            let workload = SnapWorkload::new(&settings);
            let engine = Engine::new(settings)?;
            let mut dispatcher = Dispatcher::new(engine, workload, store);

            let report = tokio::select! {
                report = dispatcher.dispatch(bundle) => report?,
                _ = tokio::signal::ctrl_c() => {
                    error!("Interrupted, state of the current event was not persisted");
                    anyhow::bail!("interrupted");
                }
            };
            print_json(&report)?;
            if let Some(e) = &report.error {
                anyhow::bail!("invocation failed: {}", e);
            }
        }
        Command::Resolve { bundle } => {
            let bundle = read_bundle(&bundle)?;
            let store = FileStore::open(&settings.state_path)?;
            let scope = Scope::Unit(bundle.snapshot.unit.clone());
            let state: UnitState = store::load(&store, &scope, STATE_KEY)?
                .map(|(state, _)| state)
                .unwrap_or_default();

            let engine = Engine::new(settings.clone())?;
            let members = bundle.snapshot.members();
            let desired = engine.resolver().resolve(&ResolverInput {
                unit: &bundle.snapshot.unit,
                config: &bundle.snapshot.config,
                relations: &bundle.snapshot.relations,
                members: &members,
                storage: &state.storage,
            })?;
            print_json(&render(&desired, &settings))?;
        }
        Command::Schema { document } => {
            let schema = match document {
                SchemaDocument::Config => schemars::schema_for!(CharmConfig),
                SchemaDocument::Settings => schemars::schema_for!(OperatorSettings),
                SchemaDocument::Bundle => schemars::schema_for!(Bundle),
            };
            print_json(&schema)?;
        }
    }
    Ok(())
}
