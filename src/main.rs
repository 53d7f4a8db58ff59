//! This file defines the padocc binary entry point.

use padocc::app;
use padocc::cli;
use padocc::error::ErrorBody;
use padocc::metrics;
use padocc::tracing;

use std::process::ExitCode;

/// Application entry point
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing(args.verbose);
    if let Err(err) = metrics::register_metrics() {
        ::tracing::warn!("Failed to register metrics: {}", err);
    }
    match app::run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            ::tracing::error!("{}", ErrorBody::new(&err).render());
            ExitCode::FAILURE
        }
    }
}
