use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::config::{DashboardConfig, ServerRegistry};
use crate::livekit::{LiveKitClient, TokenRequest};
use crate::server::{self, BindOptions};

#[derive(Debug, Parser)]
#[command(
    name = "livekit-dashboard",
    version,
    about = "Web admin dashboard for LiveKit servers"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the dashboard web server.
    Serve(ServeArgs),
    /// Print the configured LiveKit servers.
    Servers,
    /// Issue a participant join token without starting the server.
    Token(TokenArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// Port to listen on; 0 picks a free port.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,
    /// Optional file path to write the resolved listener port.
    #[arg(long, hide = true)]
    pub port_file: Option<PathBuf>,
    /// Server id to mark as the registry default.
    #[arg(long)]
    pub default_server: Option<String>,
}

#[derive(Debug, Args)]
struct TokenArgs {
    /// Server id; defaults to the registry default.
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    room: String,
    #[arg(long)]
    identity: String,
    /// Display name.
    #[arg(long)]
    name: Option<String>,
    /// Lifetime in seconds.
    #[arg(long, default_value_t = 3600)]
    ttl: u64,
    #[arg(long)]
    metadata: Option<String>,
    #[arg(long, default_value_t = false)]
    no_publish: bool,
    #[arg(long, default_value_t = false)]
    no_subscribe: bool,
    #[arg(long, default_value_t = false)]
    no_publish_data: bool,
}

pub async fn run(cli: Cli, config: DashboardConfig) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => {
            if let Some(id) = &args.default_server
                && !config.registry.set_default(id)
            {
                bail!(
                    "unknown default server '{id}'; configured: {}",
                    config.registry.ids().join(", ")
                );
            }
            server::serve(
                BindOptions {
                    host: args.host,
                    port: args.port,
                    port_file: args.port_file,
                },
                config,
            )
            .await
        }
        Commands::Servers => {
            print!("{}", describe_servers(&config.registry));
            Ok(())
        }
        Commands::Token(args) => {
            let token = issue_token(&config.registry, args)?;
            println!("{token}");
            Ok(())
        }
    }
}

/// One tab-separated line per server; secrets are never printed.
fn describe_servers(registry: &ServerRegistry) -> String {
    let default_id = registry.default_profile().map(|profile| profile.id());
    let mut out = String::new();
    for profile in registry.list() {
        let marker = if default_id == Some(profile.id()) { "*" } else { " " };
        let sip = if profile.sip_enabled() { "sip" } else { "-" };
        out.push_str(&format!(
            "{marker} {}\t{}\t{}\t{}\t{sip}\n",
            profile.id(),
            profile.name(),
            profile.url(),
            profile.api_key(),
        ));
    }
    out
}

fn issue_token(registry: &ServerRegistry, args: TokenArgs) -> Result<String> {
    let profile = match &args.server {
        Some(id) => registry
            .get(id)
            .with_context(|| format!("unknown server '{id}'"))?,
        None => registry
            .default_profile()
            .context("no default server configured")?,
    };
    let client = LiveKitClient::new(reqwest::Client::new(), profile)?;
    let token = client.generate_token(&TokenRequest {
        room: args.room,
        identity: args.identity,
        name: args.name,
        ttl: Duration::from_secs(args.ttl),
        metadata: args.metadata,
        can_publish: !args.no_publish,
        can_subscribe: !args.no_subscribe,
        can_publish_data: !args.no_publish_data,
    })?;
    Ok(token)
}
