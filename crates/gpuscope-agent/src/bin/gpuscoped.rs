//! Main binary for the gpuscope exporter daemon (gpuscoped)

use clap::Parser;
use gpuscope_agent::{init_logging, Agent, Cli};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_format, cli.debug) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let agent = Agent::new(cli);
    if let Err(e) = agent.run().await {
        error!(error = %e, "exporter failed");
        std::process::exit(1);
    }
}
