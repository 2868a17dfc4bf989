use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = pipemaster::pm::cli::Args::parse();
    pipemaster::pm::events::init_tracing("info");
    let cfg = pipemaster::pm::config::load_master_config(&args.config)?;
    pipemaster::pm::daemon::run_daemon_async(cfg).await
}
