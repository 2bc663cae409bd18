//! Opens a CONNECT tunnel and relays stdin/stdout through it.
//!
//! Usable as an SSH `ProxyCommand`:
//!
//! ```text
//! ssh -o ProxyCommand='connect --proxy http://proxy.corp:3128 %h:%p' host
//! ```

use std::path::PathBuf;

use clap::Parser;
use connect_tunnel::{CredentialsConfig, HttpHost, ProxyClient, TunnelConfig};
use n0_error::{Result, StdResultExt};
use tokio::io::{AsyncWriteExt, stdin, stdout};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// Proxy URL, e.g. "http://proxy.corp:3128".
    #[clap(short, long)]
    proxy: HttpHost,
    /// TOML configuration file.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Proxy username. The password is read from CONNECT_TUNNEL_PASSWORD.
    #[clap(short, long)]
    user: Option<String>,
    /// Target as host:port. Port 80 if omitted.
    target: HttpHost,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TunnelConfig::load(path)?,
        None => TunnelConfig::default(),
    };
    if let Some(username) = cli.user {
        let password = std::env::var("CONNECT_TUNNEL_PASSWORD").unwrap_or_default();
        let credentials = config.credentials.get_or_insert_with(CredentialsConfig::default);
        credentials.username = username;
        credentials.password = password;
    } else if let Some(credentials) = config.credentials.as_mut()
        && credentials.password.is_empty()
        && let Ok(password) = std::env::var("CONNECT_TUNNEL_PASSWORD")
    {
        credentials.password = password;
    }

    let client = ProxyClient::from_config(config);
    let tunnel = client.tunnel(&cli.proxy, &cli.target).await?;
    info!(response = %tunnel.response(), "tunnel established");

    let (mut recv, mut send) = tokio::io::split(tunnel);
    let upload = async {
        let n = tokio::io::copy(&mut stdin(), &mut send).await?;
        send.shutdown().await?;
        Ok::<_, std::io::Error>(n)
    };
    let download = async {
        let n = tokio::io::copy(&mut recv, &mut stdout()).await?;
        stdout().flush().await?;
        Ok::<_, std::io::Error>(n)
    };
    let (sent, received) = tokio::try_join!(upload, download).std_context("relay failed")?;
    debug!(sent, received, "tunnel closed");
    Ok(())
}
