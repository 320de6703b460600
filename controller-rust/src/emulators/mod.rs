//! Board-protocol emulators.
//!
//! Each emulator impersonates a commercially available electronic chess
//! board on its wire protocol so third-party apps can play against the
//! physical board unmodified. Emulators are pure parsers/responders: they
//! consume bytes and internal game events, and emit [`EmulatorAction`]s the
//! protocol server executes (socket writes, LED and sound commands).
//!
//! Auto-detection: while no protocol has been recognized, every incoming
//! byte is offered to each parser in priority order; the first parser to
//! process a complete command claims the connection.

pub mod chessnut;
pub mod millennium;
pub mod pegasus;

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::game::{GameCommand, GameHandle, ManagerEvent};
use crate::link::{BoardController, SoundKind};
use crate::settings::SoundEventType;
use crate::system::SystemState;

/// Snapshot of internal state an emulator may need while responding.
#[derive(Debug, Clone)]
pub struct EmulatorContext {
    /// Full FEN of the authoritative game.
    pub fen: String,
    /// Logical piece presence, chess order.
    pub occupancy: [u8; 64],
    /// Battery level on the 0..20 scale.
    pub battery_level: u8,
    pub charging: bool,
    /// Board metadata (serial no, versions) from the trademark cache.
    pub meta: HashMap<String, String>,
}

impl Default for EmulatorContext {
    fn default() -> Self {
        Self {
            fen: Default::default(),
            occupancy: [0u8; 64],
            battery_level: Default::default(),
            charging: Default::default(),
            meta: Default::default(),
        }
    }
}

impl EmulatorContext {
    fn default_occupancy() -> [u8; 64] {
        let mut occ = [0u8; 64];
        for (i, slot) in occ.iter_mut().enumerate() {
            let rank = i / 8;
            if rank <= 1 || rank >= 6 {
                *slot = 1;
            }
        }
        occ
    }
}

/// Side effects an emulator asks the server to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatorAction {
    /// Write bytes to the connected app.
    Send(Vec<u8>),
    LedsOff,
    LedSingle { square: u8, intensity: u8, speed: u8 },
    LedArray { squares: Vec<u8>, intensity: u8, speed: u8 },
    Beep,
}

/// One protocol personality.
pub trait Emulator: Send {
    fn name(&self) -> &'static str;

    /// Feed one byte. Returns true when a complete, recognized command for
    /// this protocol was processed (used to commit auto-detection).
    fn parse_byte(&mut self, byte: u8, ctx: &EmulatorContext, out: &mut Vec<EmulatorAction>)
        -> bool;

    /// Forward an internal game event onto the wire.
    fn handle_event(&mut self, event: &ManagerEvent, ctx: &EmulatorContext, out: &mut Vec<EmulatorAction>);

    /// Clear parser and session state.
    fn reset(&mut self);
}

// ── Protocol manager ──────────────────────────────────────────────────────

pub struct ProtocolManager {
    emulators: Vec<Box<dyn Emulator>>,
    /// Index into `emulators` once a protocol has been detected.
    active: Option<usize>,
}

impl Default for ProtocolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolManager {
    pub fn new() -> ProtocolManager {
        ProtocolManager {
            emulators: vec![
                Box::new(millennium::Millennium::new()),
                Box::new(pegasus::Pegasus::new()),
                Box::new(chessnut::Chessnut::new()),
            ],
            active: None,
        }
    }

    /// Put a specific protocol first in detection order (transport hint).
    pub fn with_hint(hint: &str) -> ProtocolManager {
        let mut manager = ProtocolManager::new();
        if let Some(pos) = manager.emulators.iter().position(|e| e.name() == hint) {
            let preferred = manager.emulators.remove(pos);
            manager.emulators.insert(0, preferred);
        }
        manager
    }

    pub fn active_name(&self) -> Option<&'static str> {
        self.active.map(|i| self.emulators[i].name())
    }

    /// Route one byte. Returns true when some parser recognized a command.
    pub fn receive_byte(
        &mut self,
        byte: u8,
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) -> bool {
        if let Some(active) = self.active {
            return self.emulators[active].parse_byte(byte, ctx, out);
        }
        for i in 0..self.emulators.len() {
            if self.emulators[i].parse_byte(byte, ctx, out) {
                info!(
                    "Protocol: {} detected via auto-detection",
                    self.emulators[i].name()
                );
                self.active = Some(i);
                // The other parsers saw bytes that are not theirs.
                for (j, emulator) in self.emulators.iter_mut().enumerate() {
                    if j != i {
                        emulator.reset();
                    }
                }
                return true;
            }
        }
        false
    }

    pub fn handle_event(
        &mut self,
        event: &ManagerEvent,
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) {
        if let Some(active) = self.active {
            self.emulators[active].handle_event(event, ctx, out);
        }
    }

    pub fn reset(&mut self) {
        for emulator in &mut self.emulators {
            emulator.reset();
        }
        self.active = None;
    }
}

// ── Protocol server ───────────────────────────────────────────────────────

/// TCP stand-in for the BLE/RFCOMM bridge. One app at a time; while an app
/// is connected, local move requests are paused.
pub struct ProtocolServer {
    pub port: u16,
    pub game: GameHandle,
    pub board: BoardController,
    pub system: SystemState,
}

impl ProtocolServer {
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let addr = format!("0.0.0.0:{}", self.port);
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("Protocol server: listening on {addr}");
                    listener
                }
                Err(e) => {
                    warn!("Protocol server: could not bind {addr}: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                info!("Protocol server: app connected from {peer}");
                                self.serve_client(stream).await;
                                info!("Protocol server: app disconnected");
                            }
                            Err(e) => warn!("Protocol server: accept failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }

    async fn serve_client(&self, mut stream: tokio::net::TcpStream) {
        let mut manager = ProtocolManager::new();
        let mut events = self.game.subscribe();
        self.game.send(GameCommand::AppConnected).await;

        let mut buf = [0u8; 512];
        let mut actions = Vec::new();
        loop {
            tokio::select! {
                read = stream.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            debug!("Protocol server: read error: {e}");
                            break;
                        }
                    };
                    let ctx = self.context().await;
                    for &byte in &buf[..n] {
                        let claimed = manager.receive_byte(byte, &ctx, &mut actions);
                        if claimed && self.system.snapshot().client_type.is_none() {
                            self.system
                                .set_client_type(manager.active_name().map(String::from));
                        }
                    }
                    if self.run_actions(&mut stream, &mut actions).await.is_err() {
                        break;
                    }
                }
                event = events.recv() => {
                    let Ok(event) = event else { continue };
                    let ctx = self.context().await;
                    manager.handle_event(&event, &ctx, &mut actions);
                    if self.run_actions(&mut stream, &mut actions).await.is_err() {
                        break;
                    }
                }
            }
        }

        manager.reset();
        self.system.set_client_type(None);
        self.game.send(GameCommand::AppDisconnected).await;
    }

    async fn context(&self) -> EmulatorContext {
        let fen = self.game.fen();
        let occupancy = occupancy_from_fen(&fen);
        let status = self.system.snapshot();
        let mut meta = HashMap::new();
        for key in ["serial no", "software version", "hardware version", "build", "tm"] {
            if let Some(value) = self.board.get_meta(key).await {
                meta.insert(key.to_string(), value);
            }
        }
        EmulatorContext {
            fen,
            occupancy,
            battery_level: status.battery_level.unwrap_or(10),
            charging: status.charger_connected,
            meta,
        }
    }

    async fn run_actions(
        &self,
        stream: &mut tokio::net::TcpStream,
        actions: &mut Vec<EmulatorAction>,
    ) -> std::io::Result<()> {
        for action in actions.drain(..) {
            match action {
                EmulatorAction::Send(bytes) => {
                    stream.write_all(&bytes).await?;
                    stream.flush().await?;
                }
                EmulatorAction::LedsOff => {
                    let _ = self.board.leds_off().await;
                }
                EmulatorAction::LedSingle {
                    square,
                    intensity,
                    speed,
                } => {
                    let _ = self.board.led(square, intensity, speed, 0).await;
                }
                EmulatorAction::LedArray {
                    squares,
                    intensity,
                    speed,
                } => {
                    let _ = self.board.led_array(&squares, intensity, speed, 0).await;
                }
                EmulatorAction::Beep => {
                    self.board
                        .beep(SoundKind::General, Some(SoundEventType::KeyPress))
                        .await;
                }
            }
        }
        Ok(())
    }
}

/// Piece presence (chess order) from a FEN's placement field.
pub fn occupancy_from_fen(fen: &str) -> [u8; 64] {
    let placement = fen.split_whitespace().next().unwrap_or("");
    let mut occ = [0u8; 64];
    let mut rank = 7i32;
    let mut file = 0i32;
    for c in placement.chars() {
        match c {
            '/' => {
                rank -= 1;
                file = 0;
            }
            '1'..='8' => file += c as i32 - '0' as i32,
            _ => {
                if (0..8).contains(&rank) && (0..8).contains(&file) {
                    occ[(rank * 8 + file) as usize] = 1;
                }
                file += 1;
            }
        }
    }
    if placement.is_empty() {
        return EmulatorContext::default_occupancy();
    }
    occ
}
