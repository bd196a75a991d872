mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kube_kms_core::config::PluginConfig;

#[derive(Parser)]
#[command(name = "kube-kms-plugin")]
#[command(about = "Kubernetes KMS plugin: envelope encryption keys served over a unix socket")]
#[command(version)]
struct Cli {
    /// Path to the plugin configuration file (TOML)
    #[arg(
        long,
        short,
        global = true,
        env = "KUBE_KMS_CONFIG",
        default_value = "/etc/kube-kms/config.toml"
    )]
    config: PathBuf,

    /// Socket endpoint, overriding `plugin.endpoint` (unix:///path/socket.sock)
    #[arg(long, global = true, env = "KUBE_KMS_ENDPOINT")]
    endpoint: Option<String>,

    /// Health listener address, overriding `plugin.health_addr`
    #[arg(long, global = true, env = "KUBE_KMS_HEALTH_ADDR")]
    health_addr: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the KMS API on the unix socket (default)
    Serve,

    /// Print the config hash, KeyId prefix and default endpoint
    KeyId,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kube_kms=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = PluginConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::KeyId => commands::key_id::run(&config),
        Commands::Serve => {
            let overrides = commands::serve::Overrides {
                endpoint: cli.endpoint,
                health_addr: cli.health_addr,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::serve::run(config, overrides))
        }
    }
}
