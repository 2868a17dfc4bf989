fn main() -> anyhow::Result<()> {
    pipemaster::pm::events::init_tracing("warn");
    pipemaster::pm::pipectl_cli::run()
}
