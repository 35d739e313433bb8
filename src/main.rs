mod common;
mod config;
mod relay;
mod storage;

use std::path::PathBuf;

use clap::Parser;
use dotenvy::dotenv;

use common::codec;
use config::{AppConfig, BackendKind};
use relay::{MessageEngine, Session, SessionMode};

#[derive(Parser)]
#[command(
    name = "chat_log_relay",
    version,
    about = "Relays chat commands from stdin into a shared message log \
             and streams new records to stdout"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    /// Message log file (file backend)
    #[arg(long, value_name = "FILE")]
    log_path: Option<PathBuf>,
    /// Identity map file (file backend)
    #[arg(long, value_name = "FILE")]
    identity_path: Option<PathBuf>,
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
    /// SQLite database file (sqlite backend)
    #[arg(long, value_name = "FILE")]
    database_path: Option<PathBuf>,
    /// Longest accepted input line in bytes
    #[arg(long, value_name = "BYTES")]
    max_line_bytes: Option<u64>,
    /// How long to wait for input before checking the log for new records
    #[arg(long, value_name = "MILLIS")]
    poll_interval_ms: Option<u64>,
}

impl Cli {
    fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(path) = &self.log_path {
            config.log_path = path.clone();
        }
        if let Some(path) = &self.identity_path {
            config.identity_path = path.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(path) = &self.database_path {
            config.database_path = path.clone();
        }
        if let Some(bytes) = self.max_line_bytes {
            config.max_line_bytes = bytes;
        }
        if let Some(millis) = self.poll_interval_ms {
            config.poll_interval_ms = millis;
        }
        config
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    dotenv().ok();
    // Logs go to stderr; stdout carries records only
    env_logger::init();

    let cli = Cli::parse();
    let app_config = cli.apply(config::load_config(&cli.config)).clamped();

    let backend = match storage::open_backend(&app_config) {
        Ok(backend) => backend,
        Err(err) => {
            log::error!("Failed to open storage: {err}");
            std::process::exit(1);
        }
    };

    let mode = match codec::probe() {
        Ok(()) => SessionMode::Active,
        Err(err) => {
            log::error!("JSON codec cannot round-trip wide identifiers ({err}); running passive");
            SessionMode::Passive
        }
    };

    let session = Session::new(
        MessageEngine::new(backend),
        tokio::io::stdout(),
        app_config.poll_interval(),
        mode,
    );
    let err = session
        .run(tokio::io::stdin(), app_config.max_line_len())
        .await;
    log::error!("Session terminated: {err}");
    std::process::exit(1);
}
