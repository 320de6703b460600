//! main.rs — boardlink hardware simulator entry point
//!
//! Serves the boardlink wire protocol over TCP so the controller can be
//! developed without a physical board. Two concurrent jobs per connection:
//!   1. Protocol loop: answer controller commands (discovery, snapshots,
//!      changes, trademark, battery, sleep)
//!   2. Scenario loop: replay a scripted lift/place/key sequence, ringing
//!      the piece-event doorbell like the real MCU

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;
use tracing::{info, warn};

use boardlink_simulator::mcu::{FakeMcu, Flip, McuConfig};
use boardlink_simulator::scenarios::{self, Scenario, Step};

// ── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "boardlink-sim", about = "Tabula board MCU simulator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Listen port override
    #[arg(long)]
    port: Option<u16>,
    /// Scenario preset to replay: opening, rook_first_castle, misplace
    #[arg(long)]
    scenario: Option<String>,
    /// Replay the scenario in a loop
    #[arg(long)]
    repeat: bool,
}

// ── Config ────────────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct FullConfig {
    board: BoardConfig,
    simulation: SimulationConfig,
}

#[derive(Debug, serde::Deserialize)]
struct BoardConfig {
    addr1: u8,
    addr2: u8,
    battery_level: u8,
    charging: bool,
    serial_no: String,
    software_version: String,
    hardware_version: String,
    build: String,
}

#[derive(Debug, serde::Deserialize)]
struct SimulationConfig {
    listen_port: u16,
    step_interval_ms: u64,
    occupied_level: u16,
    empty_level: u16,
    sensor_jitter: u16,
}

fn mcu_config(cfg: &FullConfig) -> McuConfig {
    McuConfig {
        addr1: cfg.board.addr1,
        addr2: cfg.board.addr2,
        battery_level: cfg.board.battery_level,
        charging: cfg.board.charging,
        serial_no: cfg.board.serial_no.clone(),
        software_version: cfg.board.software_version.clone(),
        hardware_version: cfg.board.hardware_version.clone(),
        build: cfg.board.build.clone(),
        occupied_level: cfg.simulation.occupied_level,
        empty_level: cfg.simulation.empty_level,
        sensor_jitter: cfg.simulation.sensor_jitter,
    }
}

// ── Main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boardlink_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str)?;

    let scenario = args
        .scenario
        .as_deref()
        .and_then(scenarios::preset)
        .unwrap_or_default();
    if !scenario.steps.is_empty() {
        info!(
            "Scenario '{}' loaded ({} steps)",
            scenario.name,
            scenario.steps.len()
        );
    }

    let port = args.port.unwrap_or(cfg.simulation.listen_port);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("Board simulator listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("Controller connected from {peer}");
        stream.set_nodelay(true).ok();
        if let Err(e) = serve(
            stream,
            mcu_config(&cfg),
            scenario.clone(),
            cfg.simulation.step_interval_ms,
            args.repeat,
        )
        .await
        {
            warn!("Session ended: {e}");
        } else {
            info!("Controller disconnected");
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    config: McuConfig,
    scenario: Scenario,
    step_interval_ms: u64,
    repeat: bool,
) -> Result<()> {
    let mut board = FakeMcu::new(config);
    let mut buf = [0u8; 512];
    let mut ticker = interval(Duration::from_millis(step_interval_ms.max(100)));
    let mut step_index = 0usize;
    let mut elapsed = 0.0f64;
    let mut extra_wait: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read? {
                    0 => return Ok(()),
                    n => n,
                };
                let reply = board.receive(&buf[..n]);
                if !reply.is_empty() {
                    stream.write_all(&reply).await?;
                    stream.flush().await?;
                }
            }
            _ = ticker.tick() => {
                if scenario.steps.is_empty() || !board.notifications_enabled {
                    continue;
                }
                if let Some(until) = extra_wait {
                    if tokio::time::Instant::now() < until {
                        continue;
                    }
                    extra_wait = None;
                }
                if step_index >= scenario.steps.len() {
                    if repeat {
                        step_index = 0;
                        elapsed = 0.0;
                    } else {
                        continue;
                    }
                }
                let step = &scenario.steps[step_index];
                step_index += 1;
                elapsed += step_interval_ms as f64 / 1000.0;

                let bytes = match step {
                    Step::Lift { square } => {
                        info!("Scenario: lift {square}");
                        step.square_index()
                            .map(|sq| board.flip(Flip::Lift, sq, elapsed))
                            .unwrap_or_default()
                    }
                    Step::Place { square } => {
                        info!("Scenario: place {square}");
                        step.square_index()
                            .map(|sq| board.flip(Flip::Place, sq, elapsed))
                            .unwrap_or_default()
                    }
                    Step::Key { key } => {
                        info!("Scenario: key {key}");
                        step.key()
                            .map(|k| board.key_frames(k, true))
                            .unwrap_or_default()
                    }
                    Step::Wait { ms } => {
                        extra_wait = Some(
                            tokio::time::Instant::now() + Duration::from_millis(*ms),
                        );
                        Vec::new()
                    }
                };
                if !bytes.is_empty() {
                    stream.write_all(&bytes).await?;
                    stream.flush().await?;
                }
            }
        }
    }
}
