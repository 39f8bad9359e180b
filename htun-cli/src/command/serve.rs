use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use htun::server::{TunnelServer, UserStore, normalize_base_path};
use tracing::{info, warn};

use crate::config::Config;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "HTUN_LISTEN")]
    listen: Option<SocketAddr>,

    /// Path prefix of the tunnel routes ("/" for none)
    #[arg(long)]
    base_path: Option<String>,
}

pub async fn execute(args: &Args, config: &Config) -> Result<()> {
    let mut server_config = config.server.to_server_config();
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(base_path) = &args.base_path {
        server_config.base_path = base_path.clone();
    }

    if config.server.users.is_empty() {
        warn!("No users configured under [server.users]; every request will be rejected");
    }
    let users = UserStore::new(config.server.users.clone());
    info!(users = users.len(), "Loaded user table");

    let server = TunnelServer::new(server_config, Arc::new(users));
    let listener = server.bind().await.context("Failed to start tunnel server")?;
    let addr = listener.local_addr()?;

    println!(
        "Tunnel server listening on http://{}{}",
        addr,
        normalize_base_path(&server.config().base_path)
    );
    println!("Press Ctrl+C to stop");

    let serve = server.serve(listener);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            return result.context("Tunnel server failed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            server.shutdown();
        }
    }

    serve.await.context("Tunnel server failed")?;
    println!("Tunnel server stopped");
    Ok(())
}
