use clap::Parser;
use fmsh_cli::Cli;
use fmsh_cli::run;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    run(Cli::parse()).await
}

fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
