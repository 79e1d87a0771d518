//! Kiln CLI entry point.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod commands;
mod output;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use commands::{Cli, CommandContext};
use kiln_credentials::CredentialStore;
use kiln_store::KilnDb;
use output::{print_error, print_success, CliError};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run() -> Result<(serde_json::Value, bool), (CliError, bool)> {
    let cli = Cli::parse();
    let json_mode = cli.json;

    let config = kiln_config::load_config(None)
        .map_err(|err| (CliError::validation(err.to_string()), json_mode))?;

    let db_path = config.database.path.as_deref().map(Path::new);
    let db = Arc::new(KilnDb::open(db_path).map_err(|err| (CliError::from(err), json_mode))?);

    let cred_path = config.database.credentials_path.as_deref().map(Path::new);
    let credentials = Arc::new(
        CredentialStore::open(None, cred_path)
            .map_err(|err| (CliError::from(err), json_mode))?,
    );

    let context = CommandContext {
        db,
        credentials,
        cli,
    };
    context
        .run()
        .await
        .map(|data| (data, json_mode))
        .map_err(|err| (err, json_mode))
}

#[tokio::main]
async fn main() {
    init_tracing();
    match run().await {
        Ok((data, json_mode)) => {
            print_success(json_mode, data);
        }
        Err((err, json_mode)) => {
            let code = print_error(json_mode, &err);
            std::process::exit(code);
        }
    }
}
