pub mod connect;
pub mod hash_password;
pub mod serve;
pub mod status;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the tunnel server
    Serve(serve::Args),

    /// Forward a local port through a tunnel server
    Connect(connect::Args),

    /// Show live connections and recent events of a tunnel server
    Status(status::Args),

    /// Hash a password for the [server.users] table
    HashPassword(hash_password::Args),
}
