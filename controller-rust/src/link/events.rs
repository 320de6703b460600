//! Event demultiplexer.
//!
//! Consumes raw link traffic and produces typed input events for the game
//! task: key releases, synthesized long presses, piece lift/place, battery
//! updates, and the inactivity countdown.
//!
//! Long-press synthesis: a key held ≥ 1.0 s emits `LongPress` once; the
//! release still arrives as `KeyUp` (the shutdown countdown cancels on the
//! `Play` release). Short presses deliver only the `KeyUp`.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use boardlink_types::{scan_key_event, Key, PieceEvent};

use super::board::BoardController;
use super::bus::LinkEvent;
use crate::settings::Settings;
use crate::system::SystemState;

const LONG_PRESS: Duration = Duration::from_secs(1);
const TICK: Duration = Duration::from_millis(250);
const BATTERY_POLL: Duration = Duration::from_secs(30);

/// Typed events out of the demultiplexer.
#[derive(Debug, Clone)]
pub enum InputEvent {
    /// Key released after a short press, or released after a long press.
    KeyUp(Key),
    /// Key held for at least one second (synthesized host-side).
    LongPress(Key),
    Piece(PieceEvent),
    BatteryChanged { level: u8, charging: bool },
    /// Inactivity shutdown approaching; emitted once per remaining second.
    InactivityCountdown { remaining_secs: u64 },
}

struct HeldKey {
    key: Key,
    since: Instant,
    long_fired: bool,
}

struct Demux {
    board: BoardController,
    settings: Settings,
    system: SystemState,
    out: mpsc::Sender<InputEvent>,
    held: Option<HeldKey>,
    last_activity: Instant,
    last_countdown_emit: Option<u64>,
}

/// Spawn the demultiplexer task.
pub fn start_demux(
    mut link_events: mpsc::Receiver<LinkEvent>,
    board: BoardController,
    settings: Settings,
    system: SystemState,
    out: mpsc::Sender<InputEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut demux = Demux {
            board,
            settings,
            system,
            out,
            held: None,
            last_activity: Instant::now(),
            last_countdown_emit: None,
        };
        let mut ticker = interval(TICK);
        let mut battery_ticker = interval(BATTERY_POLL);

        loop {
            tokio::select! {
                event = link_events.recv() => {
                    match event {
                        Some(event) => demux.handle_link_event(event).await,
                        None => {
                            info!("Demux: link event stream ended");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    demux.handle_tick().await;
                }
                _ = battery_ticker.tick() => {
                    demux.poll_battery().await;
                }
                _ = shutdown.changed() => {
                    info!("Demux: shutdown");
                    return;
                }
            }
        }
    })
}

impl Demux {
    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Pieces(events) => {
                self.touch_activity();
                for event in events {
                    self.emit(InputEvent::Piece(event)).await;
                }
            }
            LinkEvent::KeyReport(payload) => {
                if let Some(key_event) = scan_key_event(&payload) {
                    self.touch_activity();
                    if key_event.down {
                        self.held = Some(HeldKey {
                            key: key_event.key,
                            since: Instant::now(),
                            long_fired: false,
                        });
                    } else {
                        self.held = None;
                        self.emit(InputEvent::KeyUp(key_event.key)).await;
                    }
                } else {
                    debug!("Demux: key report without key event ({} bytes)", payload.len());
                }
            }
            LinkEvent::Battery(payload) => {
                if let Some(status) = payload.first() {
                    let level = status & 0x1f;
                    let charging = ((status >> 5) & 0x07) == 1;
                    self.apply_battery(level, charging).await;
                }
            }
        }
    }

    async fn handle_tick(&mut self) {
        // Long-press synthesis.
        let fire = match self.held.as_mut() {
            Some(held) if !held.long_fired && held.since.elapsed() >= LONG_PRESS => {
                held.long_fired = true;
                Some(held.key)
            }
            _ => None,
        };
        if let Some(key) = fire {
            info!("Demux: long press {key:?}");
            self.emit(InputEvent::LongPress(key)).await;
        }

        // Inactivity watchdog. Charger suspends the timer.
        if self.system.charger_connected() {
            self.touch_activity();
            return;
        }
        let inactivity = self.settings.inactivity();
        if inactivity.timeout_secs == 0 {
            return;
        }
        let idle = self.last_activity.elapsed().as_secs();
        let remaining = inactivity.timeout_secs.saturating_sub(idle);
        if remaining == 0 {
            info!("Demux: inactivity timeout - requesting shutdown");
            self.touch_activity();
            self.emit(InputEvent::LongPress(Key::Play)).await;
        } else if remaining <= inactivity.countdown_secs
            && self.last_countdown_emit != Some(remaining)
        {
            self.last_countdown_emit = Some(remaining);
            self.emit(InputEvent::InactivityCountdown {
                remaining_secs: remaining,
            })
            .await;
        }
    }

    async fn poll_battery(&mut self) {
        match self.board.get_battery().await {
            Ok((level, charging)) => self.apply_battery(level, charging).await,
            Err(e) => debug!("Demux: battery poll failed: {e}"),
        }
    }

    async fn apply_battery(&mut self, level: u8, charging: bool) {
        let was_charging = self.system.charger_connected();
        self.system.set_battery(level, charging);
        if charging && !was_charging {
            // Charger attach counts as activity.
            self.touch_activity();
        }
        self.emit(InputEvent::BatteryChanged { level, charging }).await;
    }

    fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
        self.last_countdown_emit = None;
    }

    async fn emit(&self, event: InputEvent) {
        if self.out.send(event).await.is_err() {
            warn!("Demux: input event receiver dropped");
        }
    }
}
