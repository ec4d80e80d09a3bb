use clap::Parser;
use tracing_subscriber::EnvFilter;

use domainlink::cli::{Cli, Command, load_config, run_config_command, run_loopback_command};

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("domainlink=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Config => run_config_command(&config),
        Command::Loopback(args) => run_loopback_command(args, &config).await,
    }
}
