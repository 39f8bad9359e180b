use anyhow::{Result, anyhow, bail};
use dialoguer::Password;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// User the hash is for
    username: String,
}

pub fn execute(args: &Args) -> Result<()> {
    let password = Password::new()
        .with_prompt(format!("Password for {}", args.username))
        .with_confirmation("Repeat password", "Passwords do not match")
        .allow_empty_password(true)
        .interact()?;
    if password.is_empty() {
        bail!("Password must not be empty");
    }

    let hash = htun::server::auth::hash_password(&password)
        .map_err(|e| anyhow!("Failed to hash password: {}", e))?;

    println!("[server.users]");
    println!("{:?} = {:?}", args.username, hash);
    Ok(())
}
