use anyhow::{Context, Result, bail};
use htun::client::api::{StatusReport, http_client};
use htun::client::{CredentialSource, Credentials, PromptCredentials, ProxyApi};

use crate::config::{Config, ConfigError};

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Base URL of the tunnel server
    #[arg(long, env = "HTUN_PROXY_URL")]
    proxy_url: Option<String>,

    /// User to authenticate as; prompted for when missing
    #[arg(long, env = "HTUN_USERNAME")]
    username: Option<String>,

    /// Password to authenticate with; prompted for when missing
    #[arg(long, env = "HTUN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Print the server's JSON report as is
    #[arg(long)]
    json: bool,
}

pub async fn execute(args: &Args, config: &Config, profile: &str) -> Result<()> {
    let defaults = config.profile(profile).cloned().unwrap_or_default();
    let proxy_url = args
        .proxy_url
        .clone()
        .or(defaults.proxy_url)
        .ok_or_else(|| ConfigError::missing(profile, "proxy_url", "proxy-url"))?;
    let username = args.username.clone().or(defaults.username);

    let api = ProxyApi::new(http_client()?, &proxy_url).context("Invalid proxy URL")?;
    let credentials = match (username, args.password.clone()) {
        (Some(username), Some(password)) => Credentials::new(username, password),
        (username, _) => {
            let target = api.target();
            tokio::task::spawn_blocking(move || {
                PromptCredentials::new().credentials(&target, username.as_deref(), false)
            })
            .await?
            .context("No credentials given")?
        }
    };

    let api = api.with_credentials(credentials);
    if !api.authenticate().await.context("Failed to reach tunnel server")? {
        bail!("Credentials rejected by {}", api.target());
    }

    if args.json {
        println!("{}", api.status_text(true).await?);
        return Ok(());
    }

    let report = api.status().await.context("Failed to fetch server status")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &StatusReport) {
    if report.connections.is_empty() {
        println!("No active sessions");
    } else {
        println!("Active sessions: {}", report.connections.len());
        for connection in &report.connections {
            println!("  {}", connection.id);
            println!("    Destination: {}", connection.destination);
            println!("    User:        {}", connection.user);
            println!("    Created:     {}", connection.created_at);
            println!("    Expires:     {}", connection.expires_at);
        }
    }

    println!();
    if report.events.is_empty() {
        println!("No recent events");
        return;
    }
    println!("Recent events:");
    for event in &report.events {
        println!(
            "  {} {:<16} {} {}",
            event.timestamp, event.status, event.connection_id, event.details
        );
    }
}
