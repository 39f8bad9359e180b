use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::Verbosity;

mod command;
mod config;
mod sys;

#[derive(Debug, clap::Parser)]
#[command(name = "htun", version)]
#[command(about = "Tunnel TCP connections through plain HTTP requests.", long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,

    /// Profile to use for tunnel settings
    #[arg(long, default_value = "default", global = true)]
    profile: String,

    /// Configuration file to read instead of the per-user one
    #[arg(long, global = true, env = "HTUN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: command::Command,
}

fn init_logger_env(verbosity: &Verbosity) {
    use tracing::level_filters::LevelFilter;

    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .with_env_var("HTUN_LOG")
        .from_env_lossy();

    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(match (verbosity.is_present(), verbosity.is_silent()) {
            (false, _) => env_filter,
            (true, true) => env_filter.add_directive(LevelFilter::OFF.into()),
            (true, false) => {
                let level_filter = match verbosity.log_level_filter() {
                    clap_verbosity_flag::LevelFilter::Off => LevelFilter::OFF,
                    clap_verbosity_flag::LevelFilter::Error => LevelFilter::ERROR,
                    clap_verbosity_flag::LevelFilter::Warn => LevelFilter::WARN,
                    clap_verbosity_flag::LevelFilter::Info => LevelFilter::INFO,
                    clap_verbosity_flag::LevelFilter::Debug => LevelFilter::DEBUG,
                    clap_verbosity_flag::LevelFilter::Trace => LevelFilter::TRACE,
                };
                env_filter.add_directive(level_filter.into())
            }
        })
        .init();
}

fn load_config(cli: &Cli) -> Result<config::Config> {
    config::Config::load(cli.config.as_deref()).context("Failed to read configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger_env(&cli.verbose);

    match &cli.command {
        command::Command::Serve(args) => {
            command::serve::execute(args, &load_config(&cli)?).await?;
        }
        command::Command::Connect(args) => {
            command::connect::execute(args, &load_config(&cli)?, &cli.profile).await?;
        }
        command::Command::Status(args) => {
            command::status::execute(args, &load_config(&cli)?, &cli.profile).await?;
        }
        command::Command::HashPassword(args) => {
            command::hash_password::execute(args)?;
        }
    }

    Ok(())
}
