//! adsb-live: inspect frames and replay observations through the live
//! aircraft table.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use adsb_live_core::config::{load_config, DeliveryMode};
use adsb_live_core::crc::{self, Crc16Ccitt};
use adsb_live_core::feed::DetailLookup;
use adsb_live_core::frame::{self, IcaoCache};
use adsb_live_core::types::*;
use adsb_live_core::{
    AircraftRecord, AircraftTable, Clock, Config, DetailFetcher, FeedProcessor, FeedStats, Heartbeat,
    ManualClock, Observation, Tick,
};

mod registry;

use registry::RegistrySource;

#[derive(Parser)]
#[command(name = "adsb-live", version, about = "Mode S integrity checks and live-table replay")]
struct Cli {
    /// JSON config file; missing keys take their defaults
    #[arg(long, global = true, env = "ADSB_LIVE_CONFIG")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run hex frames through the CRC gate and summarise the verdicts
    Check {
        /// File with one hex frame per line, optionally "hex;timestamp" ("-" for stdin)
        file: PathBuf,

        /// Print every frame as it is checked
        #[arg(short, long)]
        raw: bool,
    },

    /// Replay JSON-lines observations and print the resulting aircraft table
    Replay {
        /// File with one JSON observation per line ("-" for stdin)
        file: PathBuf,

        /// JSON registry of aircraft details keyed by ICAO address
        #[arg(long)]
        registry: Option<PathBuf>,

        /// Print the aircraft snapshots as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print every checksum of a hex string
    Checksum {
        /// Bytes as hex
        hex: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Check { file, raw } => cmd_check(cli.config.as_deref(), &file, raw),
        Commands::Replay {
            file,
            registry,
            json,
        } => cmd_replay(cli.config.as_deref(), &file, registry.as_deref(), json),
        Commands::Checksum { hex } => cmd_checksum(&hex),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

fn open_input(file: &Path) -> Result<Box<dyn BufRead>> {
    if file.to_str() == Some("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let f = std::fs::File::open(file)?;
    Ok(Box::new(io::BufReader::new(f)))
}

fn dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".into(), |v| v.to_string())
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
struct CheckSummary {
    frames: u64,
    malformed: u64,
    by_verdict: BTreeMap<String, u64>,
    by_df: BTreeMap<u8, u64>,
    /// Distinct addresses in trusted frames
    aircraft: usize,
}

fn check_frames(reader: impl BufRead, raw: bool, config: &Config) -> Result<CheckSummary> {
    let clock = Arc::new(ManualClock::new(0.0));
    let cache = IcaoCache::from_config(clock.clone(), Heartbeat::new(), &config.expiry)?;
    let mut summary = CheckSummary::default();
    let mut trusted: HashSet<Icao> = HashSet::new();
    let mut timestamp = 0.0f64;

    for line in reader.lines() {
        let line = line?;
        let hex = line.trim();
        if hex.is_empty() || hex.starts_with('#') {
            continue;
        }

        // Handle lines with format "hex;timestamp" or just "hex"
        let (hex_part, ts) = match hex.split_once(';') {
            Some((h, t)) => (h.trim(), t.trim().parse::<f64>().unwrap_or(timestamp)),
            None => (hex, timestamp),
        };
        timestamp = ts + 0.1; // Auto-increment for files without timestamps
        clock.set(ts);

        let frame = match frame::parse_hex(hex_part, ts, &cache) {
            Ok(f) => f,
            Err(e) => {
                summary.malformed += 1;
                if raw {
                    println!("{hex_part}: {e}");
                }
                continue;
            }
        };

        summary.frames += 1;
        *summary.by_df.entry(frame.df).or_default() += 1;
        *summary
            .by_verdict
            .entry(format!("{:?}", frame.verdict))
            .or_default() += 1;
        if frame.verdict.is_trusted() {
            trusted.insert(frame.icao);
        }
        if raw {
            println!(
                "{hex_part}: DF{} {} {} {:?}",
                frame.df,
                frame.df_name(),
                icao_to_string(&frame.icao),
                frame.verdict
            );
        }
    }

    summary.aircraft = trusted.len();
    Ok(summary)
}

fn cmd_check(config_path: Option<&Path>, file: &Path, raw: bool) -> Result<()> {
    let config = load_or_default(config_path)?;
    let summary = check_frames(open_input(file)?, raw, &config)?;

    println!();
    println!(
        "Frames: {} parsed, {} malformed, {} aircraft",
        summary.frames, summary.malformed, summary.aircraft
    );
    println!();

    let mut table = Table::new();
    table.set_header(vec!["DF", "Name", "Frames"]);
    for (df, count) in &summary.by_df {
        table.add_row(vec![
            Cell::new(df),
            Cell::new(df_info(*df).map_or("Unknown", |i| i.name)),
            Cell::new(count),
        ]);
    }
    println!("{table}");

    let mut table = Table::new();
    table.set_header(vec!["Verdict", "Frames"]);
    for (verdict, count) in &summary.by_verdict {
        table.add_row(vec![Cell::new(verdict), Cell::new(count)]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

struct ReplayOutcome {
    records: Vec<AircraftRecord>,
    stats: FeedStats,
    bad_lines: u64,
}

/// Feed observations through the pipeline on replay time: the heartbeat is
/// fired as the timestamps cross each fast and slow interval.
fn replay(
    reader: impl BufRead,
    mut config: Config,
    registry: Option<RegistrySource>,
) -> Result<ReplayOutcome> {
    // Replay time only advances between observations.
    config.queue.delivery = DeliveryMode::Direct;

    let clock = Arc::new(ManualClock::new(0.0));
    let heartbeat = Heartbeat::new();
    let table = Arc::new(AircraftTable::new(
        clock.clone(),
        config.table.clone(),
        &config.trail,
    ));
    let details: Option<Arc<dyn DetailLookup>> = match registry {
        Some(source) => {
            let fetcher = DetailFetcher::new(
                source,
                clock.clone(),
                Arc::clone(&heartbeat),
                config.fetcher.clone(),
            )?;
            Some(fetcher as Arc<dyn DetailLookup>)
        }
        None => None,
    };
    let feed =
        FeedProcessor::start(&config, clock.clone(), Arc::clone(&heartbeat), table, details)?;

    let mut next_fast: Option<f64> = None;
    let mut next_slow = 0.0;
    let mut bad_lines = 0u64;

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let obs: Observation = match serde_json::from_str(text) {
            Ok(obs) => obs,
            Err(e) => {
                warn!(line = number + 1, error = %e, "skipping bad observation");
                bad_lines += 1;
                continue;
            }
        };

        let now = obs.timestamp.max(clock.now());
        clock.set(now);
        match next_fast {
            None => {
                next_fast = Some(now + 1.0);
                next_slow = now + 10.0;
            }
            Some(fast) if now >= fast => {
                heartbeat.fire(Tick::Fast);
                next_fast = Some(now.floor() + 1.0);
                if now >= next_slow {
                    heartbeat.fire(Tick::Slow);
                    feed.prune(now);
                    next_slow = now.floor() + 10.0;
                }
            }
            Some(_) => {}
        }

        feed.submit(obs);
    }

    feed.shutdown();
    Ok(ReplayOutcome {
        records: feed.table().snapshot_all(),
        stats: feed.stats(),
        bad_lines,
    })
}

fn cmd_replay(
    config_path: Option<&Path>,
    file: &Path,
    registry: Option<&Path>,
    json: bool,
) -> Result<()> {
    let config = load_or_default(config_path)?;
    let registry = registry.map(RegistrySource::load).transpose()?;
    let outcome = replay(open_input(file)?, config, registry)?;

    if json {
        let text = serde_json::to_string_pretty(&outcome.records)
            .map_err(|e| AdsbError::Io(io::Error::other(e)))?;
        println!("{text}");
        return Ok(());
    }

    let s = outcome.stats;
    println!();
    println!(
        "Observations: {} received, {} applied, {} bad lines, {} aircraft",
        s.received,
        s.applied,
        outcome.bad_lines,
        outcome.records.len()
    );
    println!(
        "Held back: {} altitudes, {} positions. Rejected: {} altitudes, {} positions",
        s.altitudes_held, s.positions_held, s.altitudes_rejected, s.positions_rejected
    );
    println!();

    if outcome.records.is_empty() {
        return Ok(());
    }
    println!("{}", aircraft_table(&outcome.records));
    Ok(())
}

fn aircraft_table(records: &[AircraftRecord]) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "ICAO", "Callsign", "Reg", "Type", "Squawk", "Alt (ft)", "Speed (kts)", "Trk", "VRate",
        "Lat", "Lon", "Trail", "Ver",
    ]);

    for r in records {
        table.add_row(vec![
            Cell::new(r.icao_code.value()),
            Cell::new(dash(r.callsign.value().as_deref())),
            Cell::new(dash(r.registration.value().as_deref())),
            Cell::new(dash(r.aircraft_type.value().as_deref())),
            Cell::new(dash(r.squawk.value().as_deref())),
            Cell::new(dash(*r.altitude.value())),
            Cell::new(dash(r.ground_speed.value().map(|s| format!("{s:.0}")))),
            Cell::new(dash(r.track.value().map(|t| format!("{t:.1}")))),
            Cell::new(dash(r.vertical_rate.value().map(|v| format!("{v:+}")))),
            Cell::new(dash(r.latitude.value().map(|l| format!("{l:.4}")))),
            Cell::new(dash(r.longitude.value().map(|l| format!("{l:.4}")))),
            Cell::new(format!("{}/{}", r.trail.short().len(), r.trail.full().len())),
            Cell::new(r.data_version()),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// checksum
// ---------------------------------------------------------------------------

fn checksums(bytes: &[u8]) -> Result<Vec<(&'static str, String)>> {
    let mut rows = vec![
        (
            "CRC-16 CCITT (seed 0000)",
            format!("{:04X}", Crc16Ccitt::new(Crc16Ccitt::SEED_ZERO).checksum(bytes)),
        ),
        (
            "CRC-16 CCITT (seed FFFF)",
            format!("{:04X}", Crc16Ccitt::new(Crc16Ccitt::SEED_ONES).checksum(bytes)),
        ),
        ("Mode S parity", format!("{:06X}", crc::mode_s_parity(bytes))),
    ];
    if bytes.len() > 3 {
        rows.push((
            "Mode S residual",
            format!("{:06X}", crc::mode_s_residual(bytes)),
        ));
    }
    rows.push(("CRC-64", crc::crc64_hex(bytes, 0, bytes.len())?));
    Ok(rows)
}

fn cmd_checksum(hex: &str) -> Result<()> {
    let bytes = hex_decode(hex).ok_or_else(|| AdsbError::InvalidHex(hex.to_string()))?;
    let mut table = Table::new();
    table.set_header(vec!["Algorithm", "Value"]);
    for (name, value) in checksums(&bytes)? {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    println!("{table}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
