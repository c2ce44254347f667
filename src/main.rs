//! Proxy core binary.
//!
//! ```text
//!   proxy-core [-c PATH]... [-C DIR]... [-D DIR] [--disable-color] <check|run|version>
//! ```

use std::process::ExitCode;

use clap::Parser;

use proxy_core::cli::{self, Cli};
use proxy_core::observability::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log = logging::init("info", cli.disable_color);

    match cli::execute(cli, &log).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
