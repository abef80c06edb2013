use clap::Parser;
use log::{debug, error, info};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

mod checksum;
mod models;
mod output;
mod probe;
mod raw_socket;
mod scanner;
mod targets;
mod tcp;
mod utils;

use models::{parse_versions, PortRange};
use probe::{Prober, DEFAULT_PROBE_TIMEOUT, DEFAULT_SOURCE_PORT};
use raw_socket::RawSocketChannel;
use scanner::{MptcpScanner, ScanConfig, DEFAULT_CONNECT_TIMEOUT};

const MAX_CONCURRENCY: usize = 1024;

/// Probe hosts for Multipath TCP support with hand-built SYN segments
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Interface whose IPv4 address is used as the probe source (default: first usable one)
    #[clap(short, long)]
    interface: Option<String>,

    /// Host list: one hostname per line, or ranked CSV lines like `1,example.com`
    #[clap(short, long, required_unless_present = "summarize")]
    file: Option<PathBuf>,

    /// Maximum number of hosts read from the host list
    #[clap(short, long, default_value_t = 100)]
    count: usize,

    /// Where to write the JSON result document
    #[clap(short, long, required_unless_present = "summarize")]
    output: Option<PathBuf>,

    /// Ports to probe (comma-separated, ranges like 8000-8010)
    #[clap(short, long, default_value = "80,443")]
    ports: String,

    /// MPTCP versions to request (comma-separated, 0-15)
    #[clap(long, default_value = "0,1")]
    versions: String,

    /// Seconds to wait for a reply to each probe
    #[clap(short, long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_secs_f64())]
    timeout: f64,

    /// Seconds to wait for the plain TCP connect that precedes probing
    #[clap(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs_f64())]
    timeout_connect: f64,

    /// Source port for probes (further ports are used only when scanning concurrently)
    #[clap(long, default_value_t = DEFAULT_SOURCE_PORT)]
    source_port: u16,

    /// Number of hosts scanned at the same time
    #[clap(long, default_value_t = 1)]
    concurrency: usize,

    /// Print statistics for an existing result document and exit
    #[clap(long, value_name = "PATH")]
    summarize: Option<PathBuf>,

    /// Enable debug logging
    #[clap(short, long)]
    verbose: bool,
}

/// Initialise env_logger. `RUST_LOG` overrides the level picked by `verbose`.
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));

    builder.format(move |buf, record| {
        if verbose {
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        } else {
            writeln!(
                buf,
                "[{} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        }
    });
    builder.init();
}

/// Report a configuration problem and exit with status 1
fn config_error(message: impl std::fmt::Display) -> ! {
    error!("{}", message);
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn seconds(value: f64, flag: &str) -> Duration {
    if !value.is_finite() || value <= 0.0 {
        config_error(format!("{} must be a positive number of seconds, got {}", flag, value));
    }
    Duration::from_secs_f64(value)
}

fn select_source(interface: Option<&str>) -> Ipv4Addr {
    let selected = match interface {
        Some(name) => utils::interface_ipv4(name).map(|ip| (name.to_string(), ip)),
        None => utils::get_default_interface_ipv4(),
    };

    match selected {
        Ok((name, ip)) => {
            info!("Using interface {} with source address {}", name, ip);
            ip
        }
        Err(e) => config_error(e),
    }
}

fn summarize(path: &Path) -> Result<(), anyhow::Error> {
    let results = output::load_json_results(path)?;
    output::print_summary(&output::Summary::from_results(&results));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    setup_logging(args.verbose);

    if let Some(path) = &args.summarize {
        return summarize(path);
    }

    let (Some(host_file), Some(output_path)) = (args.file.as_ref(), args.output.as_ref()) else {
        config_error("--file and --output are required when scanning");
    };

    let ports = match PortRange::parse(&args.ports) {
        Ok(ranges) => PortRange::expand(&ranges),
        Err(e) => config_error(format!("Invalid --ports value: {}", e)),
    };
    let versions = match parse_versions(&args.versions) {
        Ok(versions) => versions,
        Err(e) => config_error(format!("Invalid --versions value: {}", e)),
    };
    let probe_timeout = seconds(args.timeout, "--timeout");
    let connect_timeout = seconds(args.timeout_connect, "--timeout-connect");
    if args.concurrency == 0 || args.concurrency > MAX_CONCURRENCY {
        config_error(format!("--concurrency must be between 1 and {}", MAX_CONCURRENCY));
    }

    if !utils::has_raw_socket_privileges() {
        config_error("Raw sockets require root privileges, run with sudo");
    }

    let local = select_source(args.interface.as_deref());
    let hosts = targets::load_hosts(host_file, args.count)?;
    debug!("Loaded {} hosts from {:?}", hosts.len(), host_file);

    let config = ScanConfig {
        ports,
        versions,
        connect_timeout,
        source_port: args.source_port,
        concurrency: args.concurrency,
        ..ScanConfig::new(local)
    };
    let scanner = MptcpScanner::new(config, Prober::new(RawSocketChannel, probe_timeout));

    let results = match scanner.scan_hosts(hosts).await {
        Ok(results) => results,
        Err(e) => {
            error!("Scan aborted: {}", e);
            return Err(e.into());
        }
    };

    output::save_json_results(&results, output_path)?;
    info!("Results written to {}", output_path.display());

    output::print_results(&results);
    output::print_summary(&output::Summary::from_results(&results));

    Ok(())
}
