use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cloudlift::credentials::{
    cached_provider, credential_cache_enabled, CredentialsProvider, StaticCredentialsProvider,
};

#[derive(Parser)]
#[command(name = "cloudlift")]
#[command(about = "Cluster lifecycle manager for managed Kubernetes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Credential helpers
    #[command(subcommand)]
    Auth(AuthCommand),
}

#[derive(Subcommand)]
enum AuthCommand {
    /// Resolve credentials for a profile and print the non-secret parts
    PrintCredentials {
        /// Credential profile to resolve
        #[arg(long, default_value = "default")]
        profile: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Auth(AuthCommand::PrintCredentials { profile }) => print_credentials(&profile),
    }
}

fn print_credentials(profile: &str) -> Result<()> {
    let provider = Box::new(static_provider_from_env()?);

    let (value, expires_at) = if credential_cache_enabled() {
        let cached = cached_provider(profile, provider)?;
        (cached.retrieve()?, cached.expires_at())
    } else {
        (provider.retrieve()?, provider.expires_at())
    };

    println!("profile:       {profile}");
    println!("access key id: {}", value.access_key_id);
    println!("provider:      {}", value.provider_name);
    match expires_at {
        Some(expires_at) => println!("expires at:    {expires_at}"),
        None => println!("expires at:    never"),
    }
    Ok(())
}

fn static_provider_from_env() -> Result<StaticCredentialsProvider> {
    let access_key_id =
        std::env::var("CLOUDLIFT_ACCESS_KEY_ID").context("CLOUDLIFT_ACCESS_KEY_ID is not set")?;
    let secret_access_key = std::env::var("CLOUDLIFT_SECRET_ACCESS_KEY")
        .context("CLOUDLIFT_SECRET_ACCESS_KEY is not set")?;
    let session_token = std::env::var("CLOUDLIFT_SESSION_TOKEN").unwrap_or_default();
    Ok(StaticCredentialsProvider::new(
        access_key_id,
        secret_access_key,
        session_token,
    ))
}
