use clap::Parser;
use tracing::{warn, Level};

use srtla_rec::config::ReceiverConfig;
use srtla_rec::receiver::Receiver;
use srtla_rec::resolver;

#[derive(Parser)]
#[command(name = "srtla_rec", version, about = "SRT transport relay with uplink bonding")]
struct Cli {
    /// Port to bind the SRTLA socket to
    #[arg(long = "srtla_port", default_value_t = 5000)]
    srtla_port: u16,

    /// Hostname of the downstream SRT server
    #[arg(long = "srt_hostname", default_value = "127.0.0.1")]
    srt_hostname: String,

    /// Port of the downstream SRT server
    #[arg(long = "srt_port", default_value_t = 4001)]
    srt_port: u16,

    /// Set logging level (trace, debug, info, warn, error, critical)
    #[arg(long = "log_level", default_value = "info")]
    log_level: String,
}

fn log_level_filter(name: &str) -> Option<Level> {
    match name {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        // tracing has no separate critical level; both map to ERROR
        "error" | "critical" => Some(Level::ERROR),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(1);
    });

    let (level, level_known) = match log_level_filter(&cli.log_level) {
        Some(level) => (level, true),
        None => (Level::INFO, false),
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    if !level_known {
        warn!("invalid log level '{}' specified, using 'info' as default", cli.log_level);
    }

    let srt_addr = match resolver::resolve_srt_address(&cli.srt_hostname, cli.srt_port).await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };

    let config = ReceiverConfig::new(cli.srtla_port, srt_addr);
    let receiver = match Receiver::bind(config) {
        Ok(receiver) => receiver,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = receiver.run().await {
        eprintln!("{:#}", e);
        std::process::exit(2);
    }
}
