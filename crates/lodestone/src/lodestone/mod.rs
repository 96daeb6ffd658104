pub mod aggregate;
pub mod app;
pub mod config;
pub mod control;
pub mod identity;
pub mod logging;
pub mod net;
pub mod notify;
pub mod pending;
pub mod persist;
pub mod ppv2;
pub mod tcp;
pub mod udp;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
