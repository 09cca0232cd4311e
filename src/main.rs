//! coordkit binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use coordkit::api::{self, AppState};
use coordkit::cli;
use coordkit::config::Config;
use coordkit::logging;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Try 'coordkit --help' for more information.");
            return ExitCode::from(2);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _ = logging::init_with_level(config.log_filter());

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("coordkit v{}", env!("CARGO_PKG_VERSION"));

    let server_config = config.to_server_config()?;
    let state = AppState::embedded(config.to_ensemble_config(), config.to_session_config()).await?;
    info!(
        "ensemble serving at {} (session {})",
        state.session.endpoint(),
        state.session.id()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = tokio::spawn(Arc::clone(&state.ensemble).run_reaper(shutdown_rx));

    let session = state.session.clone();
    let result = api::serve(server_config, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await;

    session.close().await?;
    let _ = shutdown_tx.send(true);
    let _ = reaper.await;

    result?;
    info!("coordkit stopped");
    Ok(())
}
