use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use htun::client::{CredentialSource, Credentials, PromptCredentials, StaticCredentials, TunnelClient, TunnelConfig};
use tracing::info;

use crate::config::{Config, ConfigError};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Base URL of the tunnel server, e.g. http://proxy.example:9999/proxy
    #[arg(long, env = "HTUN_PROXY_URL")]
    proxy_url: Option<String>,

    /// Destination host, as reachable from the tunnel server
    #[arg(long)]
    remote_host: Option<String>,

    /// Destination port
    #[arg(long)]
    remote_port: Option<u16>,

    /// Local port to accept connections on [default: the remote port]
    #[arg(long, short = 'l')]
    local_port: Option<u16>,

    /// Local address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind: IpAddr,

    /// User to authenticate as; prompted for when missing
    #[arg(long, env = "HTUN_USERNAME")]
    username: Option<String>,

    /// Password to authenticate with; prompted for when missing
    #[arg(long, env = "HTUN_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

fn tunnel_config(args: &Args, config: &Config, profile: &str) -> Result<TunnelConfig, ConfigError> {
    let defaults = config.profile(profile).cloned().unwrap_or_default();

    let proxy_url = args
        .proxy_url
        .clone()
        .or(defaults.proxy_url)
        .ok_or_else(|| ConfigError::missing(profile, "proxy_url", "proxy-url"))?;
    let remote_host = args
        .remote_host
        .clone()
        .or(defaults.remote_host)
        .ok_or_else(|| ConfigError::missing(profile, "remote_host", "remote-host"))?;
    let remote_port = args
        .remote_port
        .or(defaults.remote_port)
        .ok_or_else(|| ConfigError::missing(profile, "remote_port", "remote-port"))?;
    let local_port = args.local_port.or(defaults.local_port).unwrap_or(remote_port);

    Ok(TunnelConfig {
        name: profile.to_owned(),
        proxy_url,
        username: args.username.clone().or(defaults.username),
        remote_host,
        remote_port,
        local_addr: SocketAddr::new(args.bind, local_port),
        ping_interval: defaults.ping_interval,
    })
}

fn credential_source(tunnel: &TunnelConfig, password: Option<&str>) -> Arc<dyn CredentialSource> {
    match (&tunnel.username, password) {
        (Some(username), Some(password)) => {
            Arc::new(StaticCredentials::new(Credentials::new(username, password)))
        }
        _ => Arc::new(PromptCredentials::new()),
    }
}

pub async fn execute(args: &Args, config: &Config, profile: &str) -> Result<()> {
    let tunnel = tunnel_config(args, config, profile)?;
    let credentials = credential_source(&tunnel, args.password.as_deref());

    let client = TunnelClient::new(tunnel, credentials).context("Invalid tunnel configuration")?;
    let listener = client
        .bind()
        .await
        .with_context(|| format!("Failed to listen on {}", client.config().local_addr))?;

    let tunnel = client.config();
    println!(
        "Forwarding {} to {}:{} through {}",
        listener.local_addr()?,
        tunnel.remote_host,
        tunnel.remote_port,
        tunnel.proxy_url
    );
    println!("Press Ctrl+C to stop");

    let serve = client.serve(listener);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            result.context("Tunnel failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            client.shutdown();
            serve.await.context("Tunnel failed")?;
        }
    }

    println!("Tunnel stopped: {}", client.stats());
    Ok(())
}
