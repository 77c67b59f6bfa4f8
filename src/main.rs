use std::process::ExitCode;

use clap::Parser;
use sceneforge::commands::{exit_code_for, run};
use sceneforge::config::setup_logging;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = sceneforge::cli::CliOptions::parse();

    if setup_logging(cli.debug).is_err() {
        return ExitCode::FAILURE;
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight jobs and skipping the rest");
                cancel.cancel();
            }
        }
    });

    match run(cli, cancel).await {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            exit_code_for(&err)
        }
    }
}
