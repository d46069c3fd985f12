use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

mod config;

use config::FileConfig;

#[derive(Parser)]
#[command(name = "revbot")]
#[command(about = "Reverse-mirror bot for MetaTrader 5 — opens an inverse position for every trade and closes it when the original closes")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror trades against a live MetaTrader bridge
    Run {
        /// Bridge host
        #[arg(long, env = "REVBOT_BRIDGE_HOST")]
        host: Option<String>,

        /// Bridge port
        #[arg(long, env = "REVBOT_BRIDGE_PORT")]
        port: Option<u16>,
    },

    /// Connect to the bridge, dump positions and tracked pairs, exit
    Check {
        /// Bridge host
        #[arg(long, env = "REVBOT_BRIDGE_HOST")]
        host: Option<String>,

        /// Bridge port
        #[arg(long, env = "REVBOT_BRIDGE_PORT")]
        port: Option<u16>,
    },

    /// Run a scripted scenario against the simulated terminal
    Simulate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    match cli.command {
        Commands::Run { host, port } => run_live(file_config, host, port).await?,
        Commands::Check { host, port } => run_check(file_config, host, port).await?,
        Commands::Simulate => run_simulation(file_config).await?,
    }

    Ok(())
}

fn terminal_config(
    file_config: &FileConfig,
    host: Option<String>,
    port: Option<u16>,
) -> revbot_terminal_metatrader::MetaTraderConfig {
    let mut config = file_config.terminal_config();
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    config
}

async fn run_live(file_config: FileConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    use revbot_core::Terminal;
    use revbot_engine::MirrorEngine;
    use revbot_terminal_metatrader::MetaTraderTerminal;

    let terminal_config = terminal_config(&file_config, host, port);
    let mirror_config = file_config.mirror_config();

    tracing::info!(
        host = %terminal_config.host,
        port = terminal_config.port,
        magic = mirror_config.magic,
        poll_ms = mirror_config.poll_interval.as_millis() as u64,
        "Starting reverse-mirror bot"
    );

    let mut terminal = MetaTraderTerminal::new(terminal_config);
    terminal.connect().await?;

    let mut engine = MirrorEngine::new(terminal, mirror_config);

    tokio::select! {
        _ = engine.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, shutting down");
        }
    }

    engine.terminal_mut().disconnect().await?;
    Ok(())
}

async fn run_check(file_config: FileConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    use revbot_core::Terminal;
    use revbot_terminal_metatrader::MetaTraderTerminal;

    let terminal_config = terminal_config(&file_config, host, port);
    let mirror_config = file_config.mirror_config();

    let mut terminal = MetaTraderTerminal::new(terminal_config);
    terminal.connect().await?;
    terminal.heartbeat().await?;

    let positions = terminal.positions().await?;
    let (reverses, originals): (Vec<_>, Vec<_>) = positions
        .into_iter()
        .partition(|p| mirror_config.is_reverse(p));

    let sep = "=".repeat(60);
    println!("\n{sep}");
    println!("  TERMINAL CHECK");
    println!("{sep}");
    println!("  Originals: {}", originals.len());
    for p in &originals {
        println!(
            "    #{:<12} {:<10} {:>5} {:>8} lots  sl={:?} tp={:?}",
            p.ticket, p.symbol, p.side, p.volume, p.sl, p.tp
        );
    }
    println!("  Reverses:  {}", reverses.len());
    for p in &reverses {
        let origin = mirror_config
            .parse_origin_ticket(&p.comment)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "    #{:<12} {:<10} {:>5} {:>8} lots  mirrors #{}",
            p.ticket, p.symbol, p.side, p.volume, origin
        );
    }
    println!("{sep}\n");

    terminal.disconnect().await?;
    Ok(())
}

/// Exercise the engine against the simulated terminal: open an original,
/// move its levels, close it, and show every cycle's events.
async fn run_simulation(file_config: FileConfig) -> Result<()> {
    use revbot_core::{Side, SymbolInfo};
    use revbot_engine::{mirror::log_events, MirrorConfig, MirrorEngine};
    use revbot_terminal_common::simulated::SimulatedTerminal;
    use rust_decimal::Decimal;
    use std::time::Duration;

    let mirror_config = MirrorConfig {
        link_delay: Duration::ZERO,
        ..file_config.mirror_config()
    };

    let mut terminal = SimulatedTerminal::new();
    terminal.add_symbol(SymbolInfo {
        symbol: "EURUSD".to_string(),
        digits: 5,
        point: Decimal::new(1, 5),
        volume_min: Decimal::new(1, 2),
        volume_max: Decimal::new(100, 0),
        volume_step: Decimal::new(1, 2),
        visible: true,
    });
    terminal.set_quote("EURUSD", Decimal::new(110000, 5), Decimal::new(110012, 5));
    let original = terminal.open_original(
        "EURUSD",
        Side::Buy,
        Decimal::new(10, 2),
        Some(Decimal::new(109500, 5)),
        Some(Decimal::new(110500, 5)),
    );

    let mut engine = MirrorEngine::new(terminal, mirror_config);

    println!("[1] original #{original} opened (buy 0.10 EURUSD)");
    let events = engine.run_cycle().await?;
    log_events(&events);

    println!("[2] trader moves the original's SL/TP");
    engine.terminal_mut().set_position_sltp(
        original,
        Some(Decimal::new(109800, 5)),
        Some(Decimal::new(111000, 5)),
    );
    let events = engine.run_cycle().await?;
    log_events(&events);

    println!("[3] original closes");
    engine.terminal_mut().remove_position(original);
    let events = engine.run_cycle().await?;
    log_events(&events);

    println!(
        "done: {} positions remain, {} pairs tracked",
        engine.terminal_mut().open_position_count(),
        engine.pairs().len()
    );
    Ok(())
}
