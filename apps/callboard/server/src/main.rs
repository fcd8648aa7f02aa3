use anyhow::Result;
use callboard_server::{
    app,
    config::{Cli, Command, ServerConfig},
    telemetry::Telemetry,
    watch,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Watch {
        url,
        token,
        ping_secs,
        count,
    }) = cli.command
    {
        let _telemetry = Telemetry::init_tracing()?;
        return watch::run_watch(url, token, ping_secs, count).await;
    }

    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        fanout = ?config.fanout,
        poller = config.run_poller,
        "starting callboard server"
    );

    app::run(config, telemetry.metrics_handle()).await
}
