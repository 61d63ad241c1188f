//! canary-tool - find the canary offset of a crashing target and brute-force the canary
//!
//! The target is reached through exactly one transport (local process, Unix socket,
//! TCP, UDP, TLS or serial line) and is only ever asked one question: did it survive?

use anyhow::{Context, Result};
use canary_core::config::{CanaryConfig, Endpoint, SerialSpec, TransportConfig};
use canary_core::transport::{self, Transport};
use canary_core::{BruteForceParams, ConfigError, DiscoverParams, SearchSettings};
use clap::{Args, Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

/// Brute-force stack canaries over Unix/TCP/UDP/TLS/serial/local exec
#[derive(Parser, Debug)]
#[command(name = "canary-tool")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// TOML configuration file (default: ./canary.toml if it exists)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Probe for the offset automatically
    #[arg(long)]
    auto_offset: bool,

    /// With --auto-offset, probe every length in order instead of bisecting
    #[arg(long, requires = "auto_offset")]
    linear: bool,

    /// Known offset (skips discovery)
    #[arg(long, conflicts_with = "auto_offset")]
    offset: Option<usize>,

    /// Longest padding tried during offset discovery (default 4096)
    #[arg(long)]
    max_probe: Option<usize>,

    /// Bytes in canary (default 8)
    #[arg(long)]
    canary_len: Option<usize>,

    /// Extra identical probes a candidate byte must survive (default 3)
    #[arg(long)]
    confirm: Option<usize>,

    /// Padding byte before the canary (single char or \xHH)
    #[arg(long)]
    pad: Option<String>,

    /// Static prefix before the padding (\x escapes OK)
    #[arg(long)]
    prefix: Option<String>,

    /// Seconds to wait for each probe (default 0.2)
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<f64>,

    /// Serial only: require the target to echo bytes back to count as alive
    #[arg(long)]
    require_echo: bool,

    /// TLS only: accept any server certificate
    #[arg(long)]
    tls_insecure: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args, Debug)]
#[group(required = false, multiple = false)]
struct TargetArgs {
    /// Unix-domain socket path
    #[arg(long, value_name = "PATH")]
    unix: Option<PathBuf>,

    /// HOST:PORT of a TCP service
    #[arg(long, value_name = "HOST:PORT")]
    tcp: Option<Endpoint>,

    /// HOST:PORT of a UDP service
    #[arg(long, value_name = "HOST:PORT")]
    udp: Option<Endpoint>,

    /// HOST:PORT of a TLS service
    #[arg(long, value_name = "HOST:PORT")]
    tls: Option<Endpoint>,

    /// Serial device, e.g. /dev/ttyUSB0[:baud]
    #[arg(long, value_name = "DEV[:BAUD]")]
    serial: Option<SerialSpec>,

    /// Local binary and its arguments; must come last, e.g. --exec ./vuln -fA 1
    #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "BIN")]
    exec: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable lines
    Text,
    /// One JSON object
    Json,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
struct Report {
    offset: usize,
    /// Set when the offset was discovered rather than given.
    first_crash: Option<usize>,
    canary_len: usize,
    /// Canary as a little-endian integer literal.
    canary: String,
    /// Canary bytes in payload order.
    canary_bytes: String,
}

impl TargetArgs {
    fn to_config(&self, require_echo: bool, tls_insecure: bool) -> Option<TransportConfig> {
        if let Some(path) = &self.unix {
            return Some(TransportConfig::Unix { path: path.clone() });
        }
        if let Some(addr) = &self.tcp {
            return Some(TransportConfig::Tcp { addr: addr.clone() });
        }
        if let Some(addr) = &self.udp {
            return Some(TransportConfig::Udp { addr: addr.clone() });
        }
        if let Some(addr) = &self.tls {
            return Some(TransportConfig::Tls {
                addr: addr.clone(),
                insecure: tls_insecure,
            });
        }
        if let Some(spec) = &self.serial {
            return Some(TransportConfig::Serial {
                device: spec.device.clone(),
                baud: spec.baud,
                require_echo,
            });
        }
        self.exec
            .as_ref()
            .map(|argv| TransportConfig::Exec { argv: argv.clone() })
    }
}

fn load_config(cli: &Cli) -> Result<CanaryConfig> {
    match &cli.config {
        Some(config_path) => {
            info!("Loading configuration from {config_path:?}");
            CanaryConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("canary.toml");
            if default_config_path.exists() {
                info!("No config file specified, loading default: {default_config_path:?}");
                CanaryConfig::load_from_file(&default_config_path)
            } else {
                Ok(CanaryConfig::default())
            }
        }
    }
}

/// Command-line flags win over the configuration file.
fn apply_overrides(cli: &Cli, config: &mut CanaryConfig) -> Result<()> {
    if let Some(transport) = cli.target.to_config(cli.require_echo, cli.tls_insecure) {
        config.transport = Some(transport);
    } else {
        match config.transport.as_mut() {
            Some(TransportConfig::Serial { require_echo, .. }) if cli.require_echo => {
                *require_echo = true;
            }
            Some(TransportConfig::Tls { insecure, .. }) if cli.tls_insecure => *insecure = true,
            _ => {}
        }
    }

    let search = &mut config.search;
    if cli.auto_offset {
        search.auto_offset = true;
    }
    if cli.linear {
        search.linear = true;
    }
    if let Some(offset) = cli.offset {
        search.offset = Some(offset);
        search.auto_offset = false;
    }
    if let Some(max_probe) = cli.max_probe {
        search.max_probe = max_probe;
    }
    if let Some(canary_len) = cli.canary_len {
        search.canary_len = canary_len;
    }
    if let Some(confirm) = cli.confirm {
        search.confirm = confirm;
    }
    if let Some(pad) = &cli.pad {
        search.pad = pad.clone();
    }
    if let Some(prefix) = &cli.prefix {
        search.prefix = prefix.clone();
    }
    if let Some(seconds) = cli.timeout {
        if !seconds.is_finite() || seconds <= 0.0 {
            anyhow::bail!("--timeout must be a positive number of seconds, got {seconds}");
        }
        search.timeout_ms = ((seconds * 1000.0).round() as u64).max(1);
    }
    Ok(())
}

/// Discovers (or takes) the offset, then recovers the canary.
fn run(transport: &mut dyn Transport, search: &SearchSettings) -> Result<Report> {
    let pad = search.pad_byte()?;
    let prefix = search.prefix_bytes()?;
    let timeout = search.timeout();

    let (offset, first_crash) = if search.auto_offset {
        let params = DiscoverParams::new(search.max_probe, pad, timeout).with_prefix(prefix.clone());
        let bracket = if search.linear {
            canary_core::discover_linear(transport, &params)
        } else {
            canary_core::discover(transport, &params)
        }
        .context("Offset discovery failed")?;
        (bracket.offset(), Some(bracket.first_crash))
    } else {
        let offset = search.offset.ok_or(ConfigError::MissingOffset)?;
        info!("Using configured offset {offset}");
        (offset, None)
    };

    let params = BruteForceParams {
        offset,
        length: search.canary_len,
        confirm: search.confirm,
        timeout,
        prefix,
        pad,
    };
    let canary = canary_core::recover(transport, &params).context("Canary brute force failed")?;

    Ok(Report {
        offset,
        first_crash,
        canary_len: canary.len(),
        canary: canary.to_le_hex(),
        canary_bytes: canary.to_string(),
    })
}

fn print_report(report: &Report, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            match report.first_crash {
                Some(first_crash) => println!(
                    "Offset: {} bytes (first crash at {})",
                    report.offset, first_crash
                ),
                None => println!("Offset: {} bytes (user defined)", report.offset),
            }
            println!("Canary -> {}", report.canary);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = load_config(&cli)?;
    apply_overrides(&cli, &mut config)?;
    config.validate().context("Invalid configuration")?;
    let transport_config = config
        .transport
        .as_ref()
        .ok_or(ConfigError::MissingTransport)?;

    let mut transport = transport::open(transport_config)
        .with_context(|| format!("Cannot open transport {transport_config}"))?;
    let outcome = run(transport.as_mut(), &config.search);
    transport.close();

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            warn!("Run failed, transport closed");
            return Err(e);
        }
    };
    print_report(&report, cli.format)
}
