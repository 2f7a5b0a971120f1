use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lumi_appium::config::{self, Config};
use lumi_appium::server::status::{self, HttpStatusClient, StatusClient};
use lumi_appium::server::{ServerLifecycleManager, ServerState};
use lumi_appium::session::{DriverSessionManager, Platform};

#[derive(Parser)]
#[command(name = "lumi-appium")]
#[command(author = "NL Team")]
#[command(version)]
#[command(about = "Appium server and session management for mobile UI suites", long_about = None)]
struct Cli {
    /// Override a configuration key (repeatable)
    #[arg(short = 'D', value_name = "KEY=VALUE", global = true)]
    define: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration
    Config,

    /// Probe an Appium server once
    Status {
        /// Server URL (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,
    },

    /// Start a managed Appium server and keep it running until Ctrl+C
    Serve,

    /// Open one session and close it again
    Check {
        /// Target platform (android, ios); defaults to the configured one
        #[arg(short, long)]
        platform: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = if cli.define.is_empty() {
        Config::global()
    } else {
        Config::init_global(config::parse_overrides(&cli.define))
    };

    match cli.command {
        Commands::Config => {
            print!("{}", config.summary());
        }

        Commands::Status { url } => {
            let base = url.unwrap_or_else(|| config.server_url());
            let target = status::status_url(&base);
            let client = HttpStatusClient::new()?;

            match client.get(&target) {
                Ok(reply) if reply.is_reachable() => {
                    let version = status::extract_major_version(&reply.body)
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!(
                        "{} {} (HTTP {}, major version {})",
                        "✓".green(),
                        target,
                        reply.code,
                        version.cyan()
                    );
                }
                Ok(reply) => {
                    println!("{} {} answered HTTP {}", "✗".red(), target, reply.code);
                    std::process::exit(1);
                }
                Err(e) => {
                    println!("{} {} unreachable: {:#}", "✗".red(), target, e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Serve => {
            let server = ServerLifecycleManager::new(config.clone())?;
            server.ensure_started()?;

            match server.state() {
                ServerState::Running { .. } => {}
                _ => {
                    println!(
                        "{} No managed server (appium.local={}, url={}); nothing to serve",
                        "!".yellow(),
                        config.start_local_server(),
                        config.server_url()
                    );
                    return Ok(());
                }
            }

            let endpoint = server.endpoint().unwrap_or_else(|| config.server_url());
            println!("{} Appium available at {}", "▶".green().bold(), endpoint.cyan());
            println!("   Press Ctrl+C to stop.");

            let stop_flag = Arc::new(AtomicBool::new(false));
            let stop_flag_handler = stop_flag.clone();
            ctrlc::set_handler(move || {
                stop_flag_handler.store(true, Ordering::SeqCst);
            })?;

            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }

            println!("\n{} Stopping Appium...", "⏹".yellow());
            server.shutdown();
        }

        Commands::Check { platform } => {
            let platform: Platform = platform
                .unwrap_or_else(|| config.platform())
                .parse()?;

            let server = ServerLifecycleManager::new(config.clone())?;
            let result = check_session(&config, &server, platform);
            server.shutdown();
            result?;
        }
    }

    Ok(())
}

fn check_session(
    config: &Arc<Config>,
    server: &ServerLifecycleManager,
    platform: Platform,
) -> anyhow::Result<()> {
    server.ensure_started()?;
    let endpoint = server.endpoint().unwrap_or_else(|| config.server_url());

    let sessions = DriverSessionManager::builder(config.clone())
        .endpoint(endpoint.as_str())
        .build()?;
    let mut ctx = sessions.context();

    println!("{} Opening {} session at {}", "▶".green().bold(), platform, endpoint.cyan());
    ctx.init_platform(platform)
        .with_context(|| format!("{} session check failed", platform))?;

    if let Some(session) = ctx.current() {
        println!("  Session: {}", session.id().cyan());
        println!("  Capabilities: {}", session.capabilities().len());
    }
    ctx.quit();
    println!("{} Session closed", "✓".green());
    Ok(())
}
