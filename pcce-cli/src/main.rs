mod commands;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::Result;
use pcce_engine::{load_config, ComplianceEngine, ConfigError, ConfigFormat, EngineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!("Only one of the `dev`, `test`, or `prod` features may be enabled for pcce-cli.");

#[derive(Debug, Parser)]
#[command(
    name = "pcce",
    version,
    about = "Scores, audits and proves compliance over encrypted metrics"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML). The sample configuration
    /// is used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto, global = true)]
    config_format: ConfigFormat,
    /// Seed keys and protocol randomness. Reproducible runs only.
    #[arg(long, global = true)]
    seed: Option<u64>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Encrypt metrics and compute the weighted compliance score.
    Score(commands::ScoreArgs),
    /// Run a threshold audit over simulated local participants.
    Audit(commands::AuditArgs),
    /// Intersect two identifier lists (one identifier per line).
    Psi(commands::PsiArgs),
    /// Prove a claim about an encrypted value.
    Prove(commands::ProveArgs),
    /// Classify an encrypted value against a policy threshold table.
    Classify(commands::ClassifyArgs),
    /// Position an encrypted value among encrypted peers.
    Benchmark(commands::BenchmarkArgs),
    /// Print the sample configuration as TOML.
    SampleConfig,
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_engine(path: Option<&Path>, format: ConfigFormat, seed: Option<u64>) -> Result<ComplianceEngine> {
    let config = match path {
        Some(path) => load_config(path, format).map_err(|err| match err {
            ConfigError::Validation(reason) => color_eyre::eyre::eyre!(reason),
            other => other.into(),
        })?,
        None => {
            info!("no --config given, using the sample configuration");
            EngineConfig::sample()
        }
    };
    let engine = match seed {
        Some(seed) => ComplianceEngine::with_seed(config, seed)?,
        None => ComplianceEngine::from_config(config)?,
    };
    Ok(engine)
}

fn emit(engine: &ComplianceEngine, report: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&report)?);
    let snapshot = engine.telemetry().flush();
    info!(
        component = %snapshot.component,
        counters = ?snapshot.counters,
        "telemetry flushed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let Cli {
        config,
        config_format,
        seed,
        log_json,
        command,
    } = Cli::parse();
    init_tracing(log_json);
    let engine = || build_engine(config.as_deref(), config_format, seed);

    match command {
        Command::SampleConfig => print!("{}", EngineConfig::sample_toml()?),
        Command::Score(args) => {
            let engine = engine()?;
            emit(&engine, commands::score(&engine, args)?)?;
        }
        Command::Audit(args) => {
            let engine = engine()?;
            emit(&engine, commands::audit(&engine, args).await?)?;
        }
        Command::Psi(args) => {
            let engine = engine()?;
            emit(&engine, commands::psi(&engine, args)?)?;
        }
        Command::Prove(args) => {
            let engine = engine()?;
            emit(&engine, commands::prove(&engine, args)?)?;
        }
        Command::Classify(args) => {
            let engine = engine()?;
            emit(&engine, commands::classify(&engine, args)?)?;
        }
        Command::Benchmark(args) => {
            let engine = engine()?;
            emit(&engine, commands::benchmark(&engine, args)?)?;
        }
    }
    Ok(())
}
