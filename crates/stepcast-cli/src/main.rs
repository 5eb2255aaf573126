//! Stepcast - BLE pedometer peripheral

use clap::Parser;
use tracing::{error, info};

use stepcast_cli::{app, cli::Cli, config::AppConfig, error::Result, simulate};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    // Nothing is opened until the configuration is known to be valid
    let config = match AppConfig::resolve(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if cli.simulate {
        match simulate::run_simulation(&config).await {
            Ok(report) => info!(
                "Simulation complete: {} notification(s), final state {}",
                report.notifications.len(),
                report.final_state
            ),
            Err(e) => {
                error!("Simulation failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    if let Err(e) = app::run_device(&config).await {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("Stepcast exited");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
