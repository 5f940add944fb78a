use plugin_math::Mul;
use router_plugin::{Connector, init_plugin_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_plugin_tracing();
    Connector::listen_and_serve(Mul).await?;
    Ok(())
}
