use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use smsgw::config::Config;
use smsgw::transport::NodeClient;
use smsgw::types::Submission;
use smsgw::Codec;

#[derive(Parser, Debug)]
#[command(name = "smsgw-cli")]
#[command(about = "SMS gateway CLI - operator client for a WIS node", long_about = None)]
struct Args {
    /// Config file holding the shared codec key
    #[arg(short, long, default_value = "smsgw.toml")]
    config: String,

    /// WIS base URL (defaults to [wis] public_url from the config)
    #[arg(short, long)]
    url: Option<String>,

    /// Output compact JSON (single line)
    #[arg(long)]
    compact: bool,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 20)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "lowercase")]
enum Commands {
    /// Submit a message
    Send {
        /// Target number
        #[arg(long)]
        mobile: String,
        #[arg(long)]
        content: String,
        /// 0 (normal) to 2 (urgent)
        #[arg(long, default_value_t = 0)]
        priority: u8,
        #[arg(long)]
        appid: Option<String>,
    },

    /// Dump the routing table
    Routes,

    /// Messages submitted on a UTC day
    History {
        /// YYYY-MM-DD, today when omitted
        #[arg(long)]
        date: Option<String>,
    },

    /// Router and watchdog liveness
    Status,

    /// Trigger a watchdog sweep
    Wake,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run_command(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_command(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&args.config)?;
    let url = args.url.clone().unwrap_or_else(|| config.wis.public_url.clone());
    if url.is_empty() {
        return Err("no WIS URL given and [wis] public_url is empty".into());
    }

    let timeout = Duration::from_secs(args.timeout);
    let client = NodeClient::new(Codec::new(&config.codec.key), timeout, timeout)?;

    match args.command {
        Commands::Send {
            mobile,
            content,
            priority,
            appid,
        } => {
            let submission = Submission {
                id: None,
                target_number: mobile,
                content,
                priority,
                app_id: appid,
                forwarded_for: None,
            };
            let receipt = client.submit(&url, &submission).await?;
            print(&receipt, args.compact)?;
        }
        Commands::Routes => {
            let routes = client.request_routes(&url).await?;
            print(&routes, args.compact)?;
        }
        Commands::History { date } => {
            let messages = client.history(&url, date).await?;
            print(&messages, args.compact)?;
        }
        Commands::Status => {
            let status = client.router_status(&url).await?;
            print(&status, args.compact)?;
        }
        Commands::Wake => {
            client.wake_watchdog(&url).await?;
            println!("watchdog triggered");
        }
    }
    Ok(())
}

fn print<T: Serialize>(value: &T, compact: bool) -> Result<(), serde_json::Error> {
    if compact {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}
