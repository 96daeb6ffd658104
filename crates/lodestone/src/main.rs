mod lodestone;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lodestone",
    version,
    about = "Lodestone - TCP/UDP forwarder with PROXY protocol v2 and player-aware notifications"
)]
struct Cli {
    /// Path to the YAML config file. Defaults to config.yml in the working
    /// directory (written with defaults when missing).
    #[arg(long, env = "LODESTONE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lodestone::run(cli.config).await
}
