use anyhow::Context;
use storefront_sync::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let _guard = storefront_sync::init_logging(&config);
    storefront_sync::run(config).await
}
