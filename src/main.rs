use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg: rust_lanshare::config::Config =
        rust_lanshare::config_io::load_or_create_config("config.toml")
            .await
            .context("unable to read or create the config.toml file")?;

    rust_lanshare::config::init_tracing(&cfg);
    tracing::info!("rust-lanshare booted");

    rust_lanshare::app::run(cfg).await?;
    Ok(())
}
