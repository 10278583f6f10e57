use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use smsgw::config::{Config, Role};
use smsgw::delivery::open_message_store;
use smsgw::logging::{setup_logging, short_hostname};
use smsgw::pid::{ModemBank, ModemNodeClient};
use smsgw::pis::Dispatcher;
use smsgw::shutdown::ShutdownManager;
use smsgw::wis::WisNode;
use smsgw::{AppError, Codec};

#[derive(Parser, Debug)]
#[command(name = "smsgwd")]
#[command(about = "SMS gateway node daemon", long_about = None)]
struct Args {
    /// Role this process runs as
    #[arg(value_enum)]
    role: Role,

    #[arg(short, long, default_value = "smsgw.toml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Print hostname at startup BEFORE any logging
    eprintln!("\n╔═══════════════════════════════════════════╗");
    eprintln!("║  🖥️  NODE: {:<30} ║", short_hostname());
    eprintln!("╚═══════════════════════════════════════════╝\n");

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate_for(args.role) {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }

    setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");

    println!("\n🚀 SMS Gateway {:?} node v{} ({})", args.role, version, git_hash);
    println!("  └─ Build: {}", build_date);
    println!("═══════════════════════════════════════════════════════");

    let shutdown_manager = ShutdownManager::new();
    let codec = Codec::new(&config.codec.key);

    let result = match args.role {
        Role::Wis => run_wis(&config, codec, shutdown_manager).await,
        Role::Pis => run_pis(&config, codec, shutdown_manager).await,
        Role::Pid => run_pid(&config, codec, shutdown_manager).await,
    };

    if let Err(e) = result {
        tracing::error!("❌ {:?} node failed: {}", args.role, e);
        std::process::exit(1);
    }
}

async fn run_wis(
    config: &Config,
    codec: Codec,
    mut shutdown_manager: ShutdownManager,
) -> Result<(), AppError> {
    let messages = open_message_store(&config.storage)?;
    let stored = messages.len().await?;
    let node = WisNode::new(
        &config.wis,
        config.storage.retention_secs,
        messages,
        codec,
        shutdown_manager.token(),
    )?;

    let listener = TcpListener::bind(&config.wis.listen_address).await?;
    println!("  ✅ WIS {} on {}", config.wis.node_id, config.wis.listen_address);
    println!("  ├─ Peers: {:?}", config.wis.peers);
    println!("  └─ Stored messages: {}", stored);

    node.start();
    let handle = tokio::spawn(async move {
        if let Err(e) = node.serve(listener).await {
            tracing::error!("❌ WIS server error: {}", e);
        }
    });
    shutdown_manager.register_task(handle);

    shutdown_manager.wait_for_shutdown().await;
    Ok(())
}

async fn run_pis(
    config: &Config,
    codec: Codec,
    mut shutdown_manager: ShutdownManager,
) -> Result<(), AppError> {
    let dispatcher = Dispatcher::new(&config.pis, codec, shutdown_manager.token())?;

    let listener = TcpListener::bind(&config.pis.listen_address).await?;
    println!("  ✅ PIS {} on {}", config.pis.node_id, config.pis.listen_address);
    println!("  └─ WIS: {:?}", config.pis.wis_urls);

    let handle = tokio::spawn(async move {
        if let Err(e) = dispatcher.serve(listener).await {
            tracing::error!("❌ PIS server error: {}", e);
        }
    });
    shutdown_manager.register_task(handle);

    shutdown_manager.wait_for_shutdown().await;
    Ok(())
}

async fn run_pid(
    config: &Config,
    codec: Codec,
    shutdown_manager: ShutdownManager,
) -> Result<(), AppError> {
    let bank = Arc::new(ModemBank::connect(&config.pid).await);
    println!(
        "  ✅ PID {} with {}/{} modems{}",
        config.pid.node_id,
        bank.len(),
        config.pid.modems.len(),
        if config.pid.test_mode { " (test mode)" } else { "" }
    );
    println!("  └─ PIS: {:?}", config.pid.pis_urls);

    let client = ModemNodeClient::new(&config.pid, codec, bank)?;
    let token = shutdown_manager.token();
    shutdown_manager
        .run_until(async move { client.run(token).await })
        .await;
    Ok(())
}
