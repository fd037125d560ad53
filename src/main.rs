use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gator::commands::{Command, CommandError, Commands, State};
use gator::config::Config;
use gator::db::Database;
use gator::fetcher::Fetcher;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging, kept off stdout so command output stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let commands = Commands::builtin();
    let Some(cmd) = Command::from_args(std::env::args().skip(1)) else {
        anyhow::bail!(
            "usage: gator <command> [args...], commands: {}",
            commands.names().join(", ")
        );
    };
    if !commands.contains(&cmd.name) {
        return Err(CommandError::NotFound(cmd.name).into());
    }

    // Load configuration
    let config_path = Config::default_path()?;
    let config = Config::load(&config_path).context("failed to load configuration")?;

    // Initialize database
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.db_url.clone());
    let db = Database::new(&database_url)
        .await
        .with_context(|| format!("failed to open database {}", database_url))?;
    db.initialize()
        .await
        .context("failed to initialize database schema")?;
    debug!(url = %database_url, "database initialized");

    let fetcher = Fetcher::new(Duration::from_secs(config.fetch_timeout_secs))?
        .strict_status(config.strict_http_status);

    let mut state = State {
        config,
        config_path,
        db,
        fetcher,
    };

    commands.run(&mut state, &cmd).await?;
    Ok(())
}
