use plugin_echo::Echo;
use router_plugin::{Connector, init_plugin_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_plugin_tracing();
    Connector::listen_and_serve(Echo).await?;
    Ok(())
}
