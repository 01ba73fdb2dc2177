//! squawk1090: a 1090 MHz Mode S / ADS-B receiver and decoder
//!
//! I/Q samples in (RTL-SDR or capture file), decoded messages and a live
//! aircraft roster out (console, raw/SBS TCP, HTTP JSON).

mod aircraft;
mod config;
mod cpr;
mod crc;
mod demod;
mod icao;
mod magnitude;
mod message;
mod network;
mod phase;
mod pipeline;
mod source;
mod stats;

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, bounded};
use parking_lot::RwLock;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use crate::aircraft::{Roster, ShowState};
use crate::config::Config;
use crate::message::ModesMessage;
use crate::network::Broadcasts;
use crate::pipeline::{Pipeline, SampleRing, spawn_sampler, unix_now_ms};
use crate::source::{FileSource, RtlSdrSource, SampleSource, SourceError};
use crate::stats::Stats;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_args();

    // Logging would fight the interactive screen refresh.
    if !config.interactive {
        let d = &config.debug;
        let verbose =
            d.demod || d.demod_err || d.bad_crc || d.good_crc || d.no_preamble || d.net;
        let subscriber = FmtSubscriber::builder()
            .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        info!("squawk1090 starting...");
    }

    let stats = Arc::new(Stats::default());
    let roster = Arc::new(RwLock::new(Roster::new(
        config.interactive_ttl,
        config.min_messages,
    )));
    let (msg_tx, msg_rx) = bounded::<ModesMessage>(1024);
    let ring = Arc::new(SampleRing::new());
    let broadcasts = Broadcasts::new();

    let rt = tokio::runtime::Runtime::new()?;

    let net_handle = if config.net {
        let cfg = config.clone();
        let roster = Arc::clone(&roster);
        let stats = Arc::clone(&stats);
        let broadcasts = broadcasts.clone();
        Some(rt.spawn(async move {
            if let Err(e) = network::run_servers(cfg, roster, stats, broadcasts).await {
                error!("network error: {e}");
            }
        }))
    } else {
        None
    };

    // Decoded-message fan-out: roster, sinks, console.
    let processor = {
        let cfg = config.clone();
        let roster = Arc::clone(&roster);
        let broadcasts = broadcasts.clone();
        rt.spawn_blocking(move || process_messages(msg_rx, roster, broadcasts, cfg))
    };

    // Roster tick at ~4 Hz; doubles as the interactive display refresh.
    let tick_handle = {
        let cfg = config.clone();
        let roster = Arc::clone(&roster);
        rt.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                roster.write().tick(unix_now_ms());
                if cfg.interactive {
                    render_roster(&roster, &cfg);
                }
            }
        })
    };

    // Ctrl-C is the one cancellation signal; everything hangs off the ring's
    // exit flag.
    let interrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let ring = Arc::clone(&ring);
        let interrupted = Arc::clone(&interrupted);
        rt.spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            interrupted.store(true, Relaxed);
            ring.shutdown();
        });
    }

    if !config.net_only {
        match build_source(&config) {
            Ok(source) => {
                let sampler = spawn_sampler(source, Arc::clone(&ring));
                let mut pipeline = Pipeline::new(
                    config.fix_errors,
                    config.aggressive,
                    config.check_crc,
                    icao::DEFAULT_TTL_SECS,
                    config.max_messages,
                    Arc::clone(&stats),
                );
                // The decoder loop owns this (main) thread until the source
                // runs dry, ctrl-C arrives or the message budget is spent.
                pipeline.run(&ring, &msg_tx);
                ring.shutdown();
                sampler.join().ok();
            }
            Err(e) => {
                error!("failed to initialise sample source: {e}");
                if matches!(e, SourceError::Spawn { .. }) {
                    eprintln!("\nMake sure rtl-sdr is installed and on PATH,");
                    eprintln!("or use --ifile to read from a file, or --net-only for network mode");
                }
                if !config.net {
                    std::process::exit(1);
                }
            }
        }
    }

    if config.net_only {
        info!("net-only mode, waiting for data from network clients");
        rt.block_on(tokio::signal::ctrl_c()).ok();
    } else if config.interactive && !interrupted.load(Relaxed) {
        println!("\nInput exhausted. Press Ctrl+C to exit...");
        rt.block_on(tokio::signal::ctrl_c()).ok();
    }

    // Let the processor drain whatever is still queued.
    drop(msg_tx);
    rt.block_on(processor).ok();

    tick_handle.abort();
    if let Some(h) = net_handle {
        h.abort();
    }

    if config.stats {
        stats
            .unique_aircraft
            .store(roster.read().unique_seen(), Relaxed);
        print!("{stats}");
    }

    Ok(())
}

fn build_source(config: &Config) -> Result<Box<dyn SampleSource>, SourceError> {
    if let Some(filename) = &config.filename {
        if !config.interactive {
            info!("reading samples from {filename}");
        }
        Ok(Box::new(FileSource::new(
            filename.clone(),
            config.loop_passes,
        )?))
    } else {
        Ok(Box::new(RtlSdrSource::new(
            config.freq,
            config.gain,
            config.dev_index,
            config.enable_agc,
        )?))
    }
}

/// Consume decoded messages: feed the roster, the network sinks and the
/// console. Messages with bad CRC only get here when CRC checking is off;
/// they print but never touch the roster.
fn process_messages(
    rx: Receiver<ModesMessage>,
    roster: Arc<RwLock<Roster>>,
    broadcasts: Broadcasts,
    config: Config,
) {
    while let Ok(mm) = rx.recv() {
        let position = if mm.crc_ok {
            let mut roster = roster.write();
            roster.update(&mm, unix_now_ms());
            roster.position_of(mm.icao)
        } else {
            None
        };

        let _ = broadcasts.raw.send(Bytes::from(mm.to_raw_line()));
        if let Some(sbs) = mm.to_sbs_line(position) {
            let _ = broadcasts.sbs.send(Bytes::from(sbs));
        }

        if !config.interactive {
            if config.raw {
                println!("{}", mm.to_raw_line());
            } else if config.onlyaddr {
                println!("{:06X}", mm.icao);
            } else {
                println!("{mm}");
            }
        }
    }
}

const RED: &str = "\x1B[91m";
const YELLOW: &str = "\x1B[93m";
const GREEN: &str = "\x1B[92m";
const BOLD: &str = "\x1B[1m";
const RESET: &str = "\x1B[0m";

/// Clear the screen and print the roster table, most recent first.
fn render_roster(roster: &Arc<RwLock<Roster>>, config: &Config) {
    print!("\x1B[2J\x1B[H");

    let has_site = config.receiver_lat.is_some() && config.receiver_lon.is_some();
    if has_site {
        println!(
            "{BOLD}{:<6} {:<8} {:>7} {:>5} {:>7} {:>5} {:>5} {:>6} {:>4}{RESET}",
            "Hex", "Flight", "Alt", "Spd", "Dist", "Brg", "Sqwk", "Msgs", "Age"
        );
    } else {
        println!(
            "{BOLD}{:<6} {:<8} {:>7} {:>5} {:>9} {:>10} {:>5} {:>5} {:>6} {:>4}{RESET}",
            "Hex", "Flight", "Alt", "Spd", "Lat", "Lon", "Track", "Sqwk", "Msgs", "Age"
        );
    }
    println!("{}", "-".repeat(if has_site { 62 } else { 77 }));

    let now_ms = unix_now_ms();
    let roster = roster.read();
    let mut aircraft: Vec<_> = roster.visible().collect();
    aircraft.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
    let count = aircraft.len();

    for ac in aircraft.into_iter().take(config.interactive_rows) {
        let age_s = now_ms.saturating_sub(ac.last_seen_ms) / 1000;
        let is_emergency = matches!(ac.squawk, 7500 | 7600 | 7700);

        let color = if is_emergency {
            RED
        } else {
            match ac.show_state {
                ShowState::FirstTime => GREEN,
                ShowState::LastTime => YELLOW,
                _ => "",
            }
        };
        let hex = format!("{color}{:06X}{}", ac.icao, if color.is_empty() { "" } else { RESET });

        let (altitude, speed) = if config.metric {
            ((ac.altitude as f64 / 3.2808) as i32, (ac.speed as f64 * 1.852) as u16)
        } else {
            (ac.altitude, ac.speed)
        };

        let alt_str = if altitude != 0 { altitude.to_string() } else { String::new() };
        let speed_str = if speed != 0 { speed.to_string() } else { String::new() };
        let squawk_str = if ac.squawk != 0 { format!("{:04}", ac.squawk) } else { String::new() };

        if has_site {
            let (dist_str, brg_str) = match ac.position {
                Some((lat, lon)) => {
                    let (dist_km, brg) = distance_bearing(
                        config.receiver_lat.unwrap(),
                        config.receiver_lon.unwrap(),
                        lat,
                        lon,
                    );
                    let (dist, unit) = if config.metric {
                        (dist_km, "km")
                    } else {
                        (dist_km * 0.539957, "nm")
                    };
                    (format!("{dist:.1}{unit}"), format!("{brg:.0}"))
                }
                None => (String::new(), String::new()),
            };
            println!(
                "{:<6} {:<8} {:>7} {:>5} {:>7} {:>5} {:>5} {:>6} {:>3}s",
                hex, ac.callsign, alt_str, speed_str, dist_str, brg_str, squawk_str,
                ac.messages, age_s
            );
        } else {
            let (lat_str, lon_str) = match ac.position {
                Some((lat, lon)) => (format!("{lat:.4}"), format!("{lon:.4}")),
                None => (String::new(), String::new()),
            };
            let track_str = if ac.heading_valid { ac.heading.to_string() } else { String::new() };
            println!(
                "{:<6} {:<8} {:>7} {:>5} {:>9} {:>10} {:>5} {:>5} {:>6} {:>3}s",
                hex, ac.callsign, alt_str, speed_str, lat_str, lon_str, track_str,
                squawk_str, ac.messages, age_s
            );
        }

        if is_emergency {
            let warning = match ac.squawk {
                7500 => format!("{RED}  HIJACK (7500){RESET}"),
                7600 => format!("{YELLOW}  RADIO FAILURE (7600){RESET}"),
                _ => format!("{RED}  EMERGENCY (7700){RESET}"),
            };
            println!("{warning}");
        }
    }

    println!("{}", "-".repeat(if has_site { 62 } else { 77 }));
    println!(
        "Aircraft: {} | {} | Ctrl+C to exit",
        count,
        if config.metric { "Metric" } else { "Imperial" }
    );
    io::stdout().flush().ok();
}

/// Haversine distance (km) and initial bearing (degrees) between two points.
fn distance_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64) {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let distance = EARTH_RADIUS_KM * 2.0 * a.sqrt().asin();

    let y = delta_lon.sin() * lat2_rad.cos();
    let x = lat1_rad.cos() * lat2_rad.sin() - lat1_rad.sin() * lat2_rad.cos() * delta_lon.cos();
    let bearing = (y.atan2(x).to_degrees() + 360.0) % 360.0;

    (distance, bearing)
}
