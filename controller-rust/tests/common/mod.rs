//! Test rig: a full controller stack wired to the fake MCU over an
//! in-memory duplex stream.
//!
//! Piece and key events are injected into the fake MCU, which rings the
//! doorbell exactly like the hardware; they travel through the bus, the
//! demultiplexer, and the game task before any assertion sees them.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use boardlink_simulator::mcu::{FakeMcu, Flip, McuConfig};
use boardlink_types::square::parse_square;
use boardlink_types::Key;

use tabula_controller::analysis::AnalysisState;
use tabula_controller::display::{start_display, LogSink};
use tabula_controller::emulators::occupancy_from_fen;
use tabula_controller::game::clock::ChessClock;
use tabula_controller::game::players::{Player, PlayerManager};
use tabula_controller::game::{GameCommand, GameDeps, GameHandle, GameManager, ManagerEvent};
use tabula_controller::link::{start_demux, BoardController, Bus};
use tabula_controller::persistence::{FenLog, GameStore};
use tabula_controller::settings::{Settings, SettingsData};
use tabula_controller::system::SystemState;

pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

pub fn test_mcu_config() -> McuConfig {
    McuConfig {
        addr1: 0x06,
        addr2: 0x50,
        battery_level: 16,
        charging: false,
        serial_no: "S10000001X".to_string(),
        software_version: "1.00".to_string(),
        hardware_version: "1.00".to_string(),
        build: "210722".to_string(),
        occupied_level: 12000,
        empty_level: 80,
        sensor_jitter: 0,
    }
}

pub struct Rig {
    pub mcu: Arc<Mutex<FakeMcu>>,
    writer: Arc<Mutex<WriteHalf<DuplexStream>>>,
    pub game: GameHandle,
    pub events: broadcast::Receiver<ManagerEvent>,
    pub store: GameStore,
    pub clock: ChessClock,
    pub board: BoardController,
    pub system: SystemState,
    _shutdown: watch::Sender<bool>,
}

impl Rig {
    pub async fn start() -> Rig {
        Rig::start_with(SettingsData::default()).await
    }

    pub async fn start_with(settings_data: SettingsData) -> Rig {
        let (controller_side, mcu_side) = tokio::io::duplex(16 * 1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Fake MCU service task.
        let mcu = Arc::new(Mutex::new(FakeMcu::new(test_mcu_config())));
        let (mcu_read, mcu_write) = tokio::io::split(mcu_side);
        let writer = Arc::new(Mutex::new(mcu_write));
        {
            let mcu = mcu.clone();
            let writer = writer.clone();
            let mut mcu_read = mcu_read;
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = match mcu_read.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    let reply = {
                        let mut mcu = mcu.lock().await;
                        mcu.receive(&buf[..n])
                    };
                    if !reply.is_empty() {
                        let mut writer = writer.lock().await;
                        if writer.write_all(&reply).await.is_err() {
                            return;
                        }
                        let _ = writer.flush().await;
                    }
                }
            });
        }

        // Controller stack.
        let settings = Settings::from_data(settings_data);
        let (bus, link_events, _reader) = Bus::start(Box::new(controller_side), shutdown_rx.clone());
        let board = BoardController::new(bus.clone(), settings.clone());

        bus.begin_discovery().await.expect("discovery");
        assert!(bus.wait_ready(Duration::from_secs(2)).await, "discovery");

        let system = SystemState::new();
        let (input_tx, input_rx) = mpsc::channel(256);
        let _demux = start_demux(
            link_events,
            board.clone(),
            settings.clone(),
            system.clone(),
            input_tx,
            shutdown_rx.clone(),
        );

        let (display, _display_task) = start_display(Box::new(LogSink), shutdown_rx.clone());
        let clock = ChessClock::new();
        let store = GameStore::open(":memory:").await.expect("store");
        let (players, player_moves) = PlayerManager::new(Player::human("White"), Player::human("Black"));

        let deps = GameDeps {
            board: board.clone(),
            settings,
            store: Some(store.clone()),
            fen_log: FenLog::new("/dev/null"),
            clock: clock.clone(),
            players,
            player_moves,
            assistant: None,
            analysis: AnalysisState::new(),
            display,
        };
        let (manager, player_moves, game, cmd_rx) = GameManager::new(deps);
        let events = game.subscribe();
        let _game_task = manager.start(input_rx, player_moves, cmd_rx, shutdown_rx);

        Rig {
            mcu,
            writer,
            game,
            events,
            store,
            clock,
            board,
            system,
            _shutdown: shutdown_tx,
        }
    }

    async fn push_to_controller(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.expect("mcu write");
        writer.flush().await.expect("mcu flush");
    }

    pub async fn lift(&self, square: &str) {
        self.flip(Flip::Lift, square).await;
    }

    pub async fn place(&self, square: &str) {
        self.flip(Flip::Place, square).await;
    }

    async fn flip(&self, flip: Flip, square: &str) {
        let sq = parse_square(square).expect("square");
        let doorbell = {
            let mut mcu = self.mcu.lock().await;
            mcu.flip(flip, sq, 1.0)
        };
        self.push_to_controller(doorbell).await;
        // Keep injected events comfortably apart, the way a human moves
        // pieces; back-to-back doorbells can land inside a raw occupancy
        // read, exactly as on the wire.
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    /// Press and release a front-panel key.
    pub async fn press_key(&self, key: Key) {
        let frames = {
            let mcu = self.mcu.lock().await;
            mcu.key_frames(key, true)
        };
        self.push_to_controller(frames).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    /// Key-down only; release with [`Rig::key_up`].
    pub async fn key_down(&self, key: Key) {
        let frame = {
            let mcu = self.mcu.lock().await;
            mcu.key_frame(key, true)
        };
        self.push_to_controller(frame).await;
    }

    pub async fn key_up(&self, key: Key) {
        let frame = {
            let mcu = self.mcu.lock().await;
            mcu.key_frame(key, false)
        };
        self.push_to_controller(frame).await;
    }

    /// Load a position into both the game and the fake sensor matrix.
    pub async fn set_position(&self, fen: &str) {
        {
            let mut mcu = self.mcu.lock().await;
            mcu.occupancy = occupancy_from_fen(fen);
        }
        self.game
            .send(GameCommand::SetPosition {
                fen: fen.to_string(),
            })
            .await;
        self.settle().await;
    }

    /// Let in-flight traffic drain.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    pub async fn next_event(&mut self) -> Option<ManagerEvent> {
        match tokio::time::timeout(Duration::from_secs(2), self.events.recv()).await {
            Ok(Ok(event)) => Some(event),
            _ => None,
        }
    }

    /// Wait for the next committed move.
    pub async fn expect_move(&mut self) -> (String, String) {
        loop {
            match self.next_event().await {
                Some(ManagerEvent::MoveMade { uci, fen }) => return (uci, fen),
                Some(_) => continue,
                None => panic!("timed out waiting for a move"),
            }
        }
    }

    pub async fn expect_takeback(&mut self) {
        loop {
            match self.next_event().await {
                Some(ManagerEvent::Takeback) => return,
                Some(_) => continue,
                None => panic!("timed out waiting for a takeback"),
            }
        }
    }

    pub fn drain_events(&mut self) {
        while self.events.try_recv().is_ok() {}
    }

    /// All sound payloads the MCU has received so far.
    pub async fn sound_payloads(&self) -> Vec<Vec<u8>> {
        let mcu = self.mcu.lock().await;
        mcu.history
            .iter()
            .filter_map(|c| match c {
                boardlink_simulator::mcu::McuCommand::Sound(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// All LED payloads the MCU has received so far.
    pub async fn led_payloads(&self) -> Vec<Vec<u8>> {
        let mcu = self.mcu.lock().await;
        mcu.history
            .iter()
            .filter_map(|c| match c {
                boardlink_simulator::mcu::McuCommand::Led(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn move_rows(&self) -> Vec<String> {
        let Some(id) = self.store.latest_game_id().await.expect("game id") else {
            return Vec::new();
        };
        self.store
            .moves_for_game(id)
            .await
            .expect("rows")
            .into_iter()
            .map(|m| m.move_uci)
            .collect()
    }
}
