use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use session_relay::utils::logging;
use session_relay::{AuthClient, ClientConfig};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "session-relay", version, about = "Cookie-authenticated API client")]
struct AppCli {
    /// Config file path; environment variables are used when it is absent
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in, then fetch each path concurrently through the refresh pipeline
    Fetch {
        #[arg(long)]
        email: String,
        /// Falls back to SESSION_RELAY_PASSWORD
        #[arg(long, env = "SESSION_RELAY_PASSWORD", hide_env_values = true)]
        password: String,
        paths: Vec<String>,
    },
    /// Print the persisted session, if any
    Whoami,
    /// Sign out and clear the persisted session
    Logout,
}

fn load_config(path: Option<&str>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::from_file(path),
        None => ClientConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let args = AppCli::parse();
    let config = load_config(args.config.as_deref()).context("loading configuration")?;
    let client = AuthClient::from_config(&config)?;

    match args.command {
        Commands::Fetch {
            email,
            password,
            paths,
        } => {
            let session = client.login(&email, &password).await?;
            info!(user_id = %session.user_id(), "signed in as {}", session.identity.email);

            let results = join_all(paths.iter().map(|path| client.get(path))).await;
            for (path, result) in paths.iter().zip(results) {
                match result {
                    Ok(response) => println!("{path} {} {}", response.status(), response.text()),
                    Err(err) => warn!(path = %path, error = %err, "request failed"),
                }
            }
        }
        Commands::Whoami => match client.session().get().await {
            Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
            None => println!("not signed in"),
        },
        Commands::Logout => {
            if let Err(err) = client.logout().await {
                warn!(error = %err, "server logout failed");
            }
            println!("signed out");
        }
    }

    Ok(())
}
