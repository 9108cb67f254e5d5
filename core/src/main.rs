//! Meshbridge CLI
//!
//! Run the bridge against a radio, or export the stored topology.
//!
//! Usage:
//!   meshbridge --serial /dev/ttyUSB0                  # Radio on a serial port
//!   meshbridge --tcp 192.168.1.20:4403                # Network attached radio
//!   meshbridge --export-topology --window-hours 6     # Print topology JSON and exit

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use meshbridge_core::link::DEFAULT_BAUD_RATE;
use meshbridge_core::{Bridge, BridgeConfig, TransportConfig};

const HOUR_SECS: u64 = 60 * 60;
const DAY_SECS: u64 = 24 * HOUR_SECS;

fn print_usage() {
    println!("Meshbridge v0.1.0");
    println!();
    println!("Usage:");
    println!("  meshbridge --serial <PATH>                   Bridge a serial radio");
    println!("  meshbridge --tcp <HOST:PORT>                 Bridge a network radio");
    println!("  meshbridge --export-topology                 Print topology JSON and exit");
    println!();
    println!("Options:");
    println!("  --serial <PATH>               Serial port of the radio");
    println!("  --baud <RATE>                 Serial line speed (default: 115200)");
    println!("  --tcp <HOST:PORT>             TCP endpoint of the radio");
    println!("  --db-path <PATH>              Database path (default: meshbridge.db)");
    println!("  --silence-secs <N>            Reconnect after N silent seconds (default: 120)");
    println!("  --packet-retention-hours <N>  Keep packets N hours (default: 48)");
    println!("  --edge-retention-days <N>     Keep neighbor edges N days (default: 30)");
    println!("  --stat-retention-days <N>     Keep node statistics N days (default: 30)");
    println!("  --local-node <ID>             Our own radio's node id (!xxxxxxxx or decimal)");
    println!("  --max-distance-km <KM>        Drop topology edges longer than KM");
    println!("  --export-topology             Print the topology as JSON and exit");
    println!("  --window-hours <N>            Export window (default: 24)");
    println!("  --testing                     Use short timers for testing");
    println!("  --help, -h                    Show this help");
    println!();
    println!("Environment:");
    println!("  RUST_LOG                      Set log level (e.g., info, debug)");
}

/// Value following `name`, parsed; Err names the flag
fn flag_value<T: FromStr>(args: &[String], name: &str) -> Result<Option<T>, String> {
    match args.windows(2).find(|w| w[0] == name) {
        Some(w) => w[1]
            .parse()
            .map(Some)
            .map_err(|_| format!("invalid value for {}: {}", name, w[1])),
        None if args.last().map(|a| a == name).unwrap_or(false) => {
            Err(format!("missing value for {}", name))
        }
        None => Ok(None),
    }
}

struct Options {
    config: BridgeConfig,
    export_topology: bool,
    window: Duration,
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let testing_mode = args.iter().any(|a| a == "--testing");
    let export_topology = args.iter().any(|a| a == "--export-topology");

    let mut config = if testing_mode {
        BridgeConfig::for_testing()
    } else {
        BridgeConfig::default()
    };

    let db_path: PathBuf = flag_value(args, "--db-path")?
        .unwrap_or_else(|| PathBuf::from("meshbridge.db"));
    config = config.with_db_path(db_path);

    let serial: Option<String> = flag_value(args, "--serial")?;
    let tcp: Option<String> = flag_value(args, "--tcp")?;
    let baud: Option<u32> = flag_value(args, "--baud")?;
    match (serial, tcp) {
        (Some(_), Some(_)) => return Err("--serial and --tcp are mutually exclusive".to_string()),
        (Some(path), None) => {
            config = config.with_transport(TransportConfig::Serial {
                path,
                baud_rate: baud.unwrap_or(DEFAULT_BAUD_RATE),
            });
        }
        (None, Some(addr)) => config = config.with_transport(TransportConfig::tcp(addr)),
        (None, None) => {}
    }

    if let Some(secs) = flag_value::<u64>(args, "--silence-secs")? {
        config = config.with_silence_threshold(secs);
    }
    if let Some(hours) = flag_value::<u64>(args, "--packet-retention-hours")? {
        config = config.with_packet_retention(hours.saturating_mul(HOUR_SECS));
    }
    if let Some(days) = flag_value::<u64>(args, "--edge-retention-days")? {
        config = config.with_edge_retention(days.saturating_mul(DAY_SECS));
    }
    if let Some(days) = flag_value::<u64>(args, "--stat-retention-days")? {
        config = config.with_stat_retention(days.saturating_mul(DAY_SECS));
    }
    if let Some(node) = flag_value::<String>(args, "--local-node")? {
        config = config.with_local_node(node);
    }
    if let Some(km) = flag_value::<f64>(args, "--max-distance-km")? {
        config = config.with_max_distance_km(km);
    }

    let window_hours: u64 = flag_value(args, "--window-hours")?.unwrap_or(24);
    if window_hours == 0 {
        return Err("--window-hours must be greater than zero".to_string());
    }

    if export_topology {
        // Export reads the store only
        config.transport = None;
    } else if config.transport.is_none() {
        return Err("one of --serial or --tcp is required".to_string());
    }

    config.validate().map_err(|e| e.to_string())?;

    Ok(Options {
        config,
        export_topology,
        window: Duration::from_secs(window_hours * HOUR_SECS),
    })
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") || args.len() < 2 {
        print_usage();
        return;
    }

    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let bridge = match Bridge::start(options.config).await {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("Failed to start bridge: {}", e);
            std::process::exit(1);
        }
    };

    if options.export_topology {
        let query = bridge.query();
        let result = query.export_topology(options.window, None).await;
        bridge.stop().await;
        match result {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Failed to export topology: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    info!(config = ?bridge.config(), "Meshbridge running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    let stats = bridge.query().stats();
    info!(
        link_state = %stats.link.state,
        reconnects = stats.link.reconnects,
        stored = stats.ingest.stored,
        dropped_full = stats.ingest.dropped_full,
        decode_errors = stats.ingest.decode_errors,
        storage_degraded = stats.storage.degraded,
        "Final statistics"
    );

    bridge.stop().await;
}
