use anyhow::Result;
use clap::Parser;
use conductor_engine_stub::StubCli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = StubCli::parse();
    conductord::init_tracing(false, "info");
    conductor_engine_stub::run(cli).await
}
