//! Game core: the manager that turns demultiplexed piece events into moves
//! on the authoritative board, plus its satellites.
//!
//! All board mutation happens on the game task. Other components observe
//! through the [`ManagerEvent`] broadcast channel or the shared FEN mirror.

pub mod castling;
pub mod clock;
pub mod correction;
pub mod moves;
pub mod players;
pub mod state;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use shakmaty::{Color, Role};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use boardlink_types::{square_name, Key, PieceEventKind};

use crate::analysis::AnalysisState;
use crate::display::{DisplayEvent, DisplayHandle};
use crate::link::{BoardController, InputEvent, SoundKind};
use crate::persistence::{FenLog, GameStore};
use crate::settings::{Settings, SoundEventType};

use clock::{ChessClock, ClockEvent};
use correction::{diff_states, provide_guidance, CorrectionState, PLACE_SETTLE};
use moves::{KingLift, MoveState, KING_LIFT_RESIGN};
use players::{AssistantManager, PlayerManager, PlayerMove};
use state::{ChessGameState, STARTING_STATE};

/// How long the promotion menu waits before defaulting to a queen.
const PROMOTION_MENU_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the background occupancy check against the logical board.
const VALIDATION_INTERVAL: Duration = Duration::from_secs(5);

/// Events published by the game manager.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    NewGame,
    WhiteTurn,
    BlackTurn,
    PieceLift { square: u8, elapsed: f64 },
    PiecePlace { square: u8, elapsed: f64 },
    MoveMade { uci: String, fen: String },
    Takeback,
    GameOver { result: String, termination: String },
    PromotionNeeded,
    ResignMenu { color: Color },
    ResignMenuCancelled,
    Key(Key),
    LongKey(Key),
}

/// Commands into the game task from other components.
#[derive(Debug)]
pub enum GameCommand {
    /// Engine/online/app move the player must reproduce on the board.
    ComputerMove { uci: String },
    Resign(Color),
    AgreeDraw,
    NewGame,
    /// Load a position (web setup, emulator handover).
    SetPosition { fen: String },
    SetClock { white_secs: u64, black_secs: u64 },
    /// An external app took over through an emulator.
    AppConnected,
    AppDisconnected,
    /// Stop players and the clock ahead of system shutdown.
    Shutdown,
}

/// Cheap handle for components that talk to the game task.
#[derive(Clone)]
pub struct GameHandle {
    cmd_tx: mpsc::Sender<GameCommand>,
    events: broadcast::Sender<ManagerEvent>,
    fen_mirror: Arc<RwLock<String>>,
}

impl GameHandle {
    pub async fn send(&self, cmd: GameCommand) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("Game: command channel closed");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Latest FEN, kept current by the game task.
    pub fn fen(&self) -> String {
        self.fen_mirror.read().unwrap().clone()
    }
}

struct PendingPromotion {
    target: u8,
    deadline: Instant,
}

pub struct GameManager {
    state: ChessGameState,
    move_state: MoveState,
    correction: CorrectionState,
    board: BoardController,
    settings: Settings,
    store: Option<GameStore>,
    fen_log: FenLog,
    clock: ChessClock,
    players: PlayerManager,
    assistant: Option<AssistantManager>,
    analysis: AnalysisState,
    display: DisplayHandle,
    events: broadcast::Sender<ManagerEvent>,
    fen_mirror: Arc<RwLock<String>>,
    /// Expected occupancy after each committed move; `[0]` is the start.
    board_states: Vec<[u8; 64]>,
    game_db_id: Option<i64>,
    pending_promotion: Option<PendingPromotion>,
    resign_menu: Option<Color>,
    app_connected: bool,
    /// An inactivity countdown overlay is on screen.
    countdown_shown: bool,
    /// Consecutive background validation reads that disagreed with the game.
    divergence_strikes: u8,
}

pub struct GameDeps {
    pub board: BoardController,
    pub settings: Settings,
    pub store: Option<GameStore>,
    pub fen_log: FenLog,
    pub clock: ChessClock,
    pub players: PlayerManager,
    pub player_moves: mpsc::Receiver<PlayerMove>,
    pub assistant: Option<AssistantManager>,
    pub analysis: AnalysisState,
    pub display: DisplayHandle,
}

impl GameManager {
    pub fn new(deps: GameDeps) -> (GameManager, mpsc::Receiver<PlayerMove>, GameHandle, mpsc::Receiver<GameCommand>) {
        let (events, _) = broadcast::channel(128);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let state = ChessGameState::new();
        let fen_mirror = Arc::new(RwLock::new(state.fen()));
        let handle = GameHandle {
            cmd_tx,
            events: events.clone(),
            fen_mirror: fen_mirror.clone(),
        };
        let manager = GameManager {
            state,
            move_state: MoveState::new(),
            correction: CorrectionState::default(),
            board: deps.board,
            settings: deps.settings,
            store: deps.store,
            fen_log: deps.fen_log,
            clock: deps.clock,
            players: deps.players,
            assistant: deps.assistant,
            analysis: deps.analysis,
            display: deps.display,
            events,
            fen_mirror,
            board_states: vec![STARTING_STATE],
            game_db_id: None,
            pending_promotion: None,
            resign_menu: None,
            app_connected: false,
            countdown_shown: false,
            divergence_strikes: 0,
        };
        (manager, deps.player_moves, handle, cmd_rx)
    }

    /// Spawn the game task.
    pub fn start(
        mut self,
        mut input_rx: mpsc::Receiver<InputEvent>,
        mut player_moves: mpsc::Receiver<PlayerMove>,
        mut cmd_rx: mpsc::Receiver<GameCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut clock_rx = self.clock.subscribe();
        tokio::spawn(async move {
            let mut validation = tokio::time::interval(VALIDATION_INTERVAL);
            loop {
                let timer = self.next_timer();
                tokio::select! {
                    event = input_rx.recv() => {
                        match event {
                            Some(event) => self.handle_input(event).await,
                            None => return,
                        }
                    }
                    chosen = player_moves.recv() => {
                        if let Some(chosen) = chosen {
                            self.handle_player_move(chosen).await;
                        }
                    }
                    cmd = cmd_rx.recv() => {
                        if let Some(cmd) = cmd {
                            self.handle_command(cmd).await;
                        }
                    }
                    clock_event = clock_rx.recv() => {
                        if let Ok(ClockEvent::Flag(color)) = clock_event {
                            self.handle_flag(color).await;
                        }
                    }
                    _ = sleep_until_opt(timer) => {
                        self.handle_timer().await;
                    }
                    _ = validation.tick() => {
                        self.validate_board().await;
                    }
                    _ = shutdown.changed() => {
                        info!("Game: shutdown");
                        return;
                    }
                }
            }
        })
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn update_fen_mirror(&self) {
        *self.fen_mirror.write().unwrap() = self.state.fen();
    }

    // ── Timers ────────────────────────────────────────────────────────────

    fn next_timer(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        if let Some(p) = &self.pending_promotion {
            next = Some(p.deadline);
        }
        if let Some(kl) = &self.move_state.king_lift {
            if !kl.menu_raised {
                let deadline = kl.since + KING_LIFT_RESIGN;
                next = Some(match next {
                    Some(n) if n < deadline => n,
                    _ => deadline,
                });
            }
        }
        next
    }

    async fn handle_timer(&mut self) {
        let now = Instant::now();
        if self
            .pending_promotion
            .as_ref()
            .is_some_and(|p| p.deadline <= now)
        {
            info!("Promotion menu timed out; defaulting to queen");
            self.complete_promotion('q').await;
            return;
        }
        let raise = match &mut self.move_state.king_lift {
            Some(kl) if !kl.menu_raised && now >= kl.since + KING_LIFT_RESIGN => {
                kl.menu_raised = true;
                Some(kl.color)
            }
            _ => None,
        };
        if let Some(color) = raise {
            info!("King held off the board for 3s; resign menu for {color:?}");
            self.resign_menu = Some(color);
            self.emit(ManagerEvent::ResignMenu { color });
            self.display.send(DisplayEvent::ResignMenu {
                color: color_name(color).to_string(),
            });
        }
    }

    // ── Input dispatch ────────────────────────────────────────────────────

    async fn handle_input(&mut self, event: InputEvent) {
        // Any user input withdraws the inactivity overlay; the watchdog has
        // already reset its timer on the same event.
        if self.countdown_shown
            && matches!(event, InputEvent::Piece(_) | InputEvent::KeyUp(_))
        {
            self.countdown_shown = false;
            self.display.send(DisplayEvent::Countdown(None));
        }
        match event {
            InputEvent::Piece(piece) => {
                match piece.kind {
                    PieceEventKind::Lift => self.emit(ManagerEvent::PieceLift {
                        square: piece.square,
                        elapsed: piece.elapsed,
                    }),
                    PieceEventKind::Place => self.emit(ManagerEvent::PiecePlace {
                        square: piece.square,
                        elapsed: piece.elapsed,
                    }),
                }
                if self.pending_promotion.is_some() {
                    debug!("Piece event ignored while the promotion menu is up");
                    return;
                }
                if self.correction.active {
                    self.correction_event(piece.kind).await;
                    return;
                }
                match piece.kind {
                    PieceEventKind::Lift => self.handle_lift(piece.square).await,
                    PieceEventKind::Place => self.handle_place(piece.square).await,
                }
            }
            InputEvent::KeyUp(key) => self.handle_key(key).await,
            InputEvent::LongPress(key) => {
                self.emit(ManagerEvent::LongKey(key));
            }
            InputEvent::BatteryChanged { level, charging } => {
                self.display.send(DisplayEvent::StatusLine(format!(
                    "battery {}%{}",
                    level.min(20) * 5,
                    if charging { " +" } else { "" }
                )));
            }
            InputEvent::InactivityCountdown { remaining_secs } => {
                self.countdown_shown = true;
                self.display
                    .send(DisplayEvent::Countdown(Some(remaining_secs)));
            }
        }
    }

    async fn handle_key(&mut self, key: Key) {
        if self.pending_promotion.is_some() {
            let letter = match key {
                Key::Up => 'q',
                Key::Down => 'r',
                Key::Tick => 'b',
                Key::Back => 'n',
                _ => 'q',
            };
            self.complete_promotion(letter).await;
            return;
        }
        if let Some(color) = self.resign_menu {
            match key {
                Key::Tick => {
                    self.resign_menu = None;
                    self.resign(color).await;
                }
                Key::Back => {
                    self.resign_menu = None;
                    self.emit(ManagerEvent::ResignMenuCancelled);
                }
                _ => {}
            }
            return;
        }
        self.emit(ManagerEvent::Key(key));
    }

    async fn handle_command(&mut self, cmd: GameCommand) {
        match cmd {
            GameCommand::ComputerMove { uci } => self.computer_move(uci).await,
            GameCommand::Resign(color) => self.resign(color).await,
            GameCommand::AgreeDraw => {
                self.finish_externally("1/2-1/2", "draw agreement").await;
            }
            GameCommand::NewGame => self.reset_game().await,
            GameCommand::SetPosition { fen } => {
                match self.state.set_position(&fen) {
                    Ok(()) => {
                        self.update_fen_mirror();
                        self.move_state = MoveState::new();
                        self.pending_promotion = None;
                        self.correction.active = false;
                        self.board_states = vec![self.state.to_piece_presence_state()];
                        self.fen_log.write(&self.state.fen()).await;
                        self.display.send(DisplayEvent::Position {
                            fen: self.state.fen(),
                        });
                    }
                    Err(e) => warn!("Game: set position rejected: {e}"),
                }
            }
            GameCommand::SetClock {
                white_secs,
                black_secs,
            } => {
                self.clock.set_times(white_secs, black_secs);
                self.clock.start(self.state.turn());
            }
            GameCommand::AppConnected => {
                info!("Game: external app connected; local players paused");
                self.app_connected = true;
                self.players.cancel_all();
            }
            GameCommand::AppDisconnected => {
                info!("Game: external app disconnected; local players resume");
                self.app_connected = false;
                self.request_move_if_computer().await;
            }
            GameCommand::Shutdown => {
                info!("Game: stopping players for shutdown");
                self.players.stop();
                if let Some(assistant) = &self.assistant {
                    assistant.cancel();
                }
                self.clock.pause();
            }
        }
    }

    async fn handle_player_move(&mut self, chosen: PlayerMove) {
        if self.state.is_game_over() {
            return;
        }
        if chosen.color != self.state.turn() {
            warn!(
                "Game: discarding {} move out of turn",
                color_name(chosen.color)
            );
            return;
        }
        self.computer_move(chosen.uci).await;
    }

    /// Announce a forced move: restrict the recognizer and light the path.
    async fn computer_move(&mut self, uci: String) {
        if uci.len() < moves::MIN_UCI_LEN || self.state.is_game_over() {
            return;
        }
        if !self.state.is_legal_uci(&uci) {
            warn!("Game: announced move {uci} is not legal here");
            return;
        }
        info!("Game: forced move {uci}");
        self.move_state.forced_move = Some(uci.clone());
        let from = self.move_state.forced_source();
        let to = self.move_state.forced_target();
        if let (Some(from), Some(to)) = (from, to) {
            let _ = self.board.led_from_to(from, to, 5, 3, 0).await;
        }
    }

    async fn handle_flag(&mut self, color: Color) {
        if self.state.is_game_over() {
            return;
        }
        let result = match color {
            Color::White => "0-1",
            Color::Black => "1-0",
        };
        info!("Game: {} flagged", color_name(color));
        self.finish_externally(result, "time forfeit").await;
    }

    async fn resign(&mut self, color: Color) {
        if self.state.is_game_over() {
            return;
        }
        let result = match color {
            Color::White => "0-1",
            Color::Black => "1-0",
        };
        info!("Game: {} resigns", color_name(color));
        self.finish_externally(result, "resignation").await;
    }

    async fn finish_externally(&mut self, result: &str, termination: &str) {
        self.state.set_result(result, termination);
        self.conclude_game(result.to_string(), termination.to_string())
            .await;
    }

    // ── Piece lift ────────────────────────────────────────────────────────

    async fn handle_lift(&mut self, sq: u8) {
        let piece_color = self.state.piece_color_at(sq);
        let is_current = piece_color.is_some() && piece_color == Some(self.state.turn());

        // A king lifted after the rook already sits on its castling
        // destination continues the castling sequence.
        if self.move_state.castling_rook_placed {
            if let Some(rook) = self.move_state.castling_rook_source {
                if let Some((king_sq, king_color)) = MoveState::king_square_for_rook(rook) {
                    if sq == king_sq
                        && self.state.piece_role_at(sq) == Some(Role::King)
                        && piece_color == Some(king_color)
                    {
                        info!("Late castling: king lifted from {}", square_name(sq));
                        self.move_state.source_square = Some(sq);
                        self.move_state.source_color = piece_color;
                        self.move_state.late_castling_in_progress = true;
                        let mut dests = vec![sq];
                        if let Some(dest) = MoveState::king_dest_for_rook(rook) {
                            dests.push(dest);
                        }
                        self.move_state.legal_destinations = dests;
                        return;
                    }
                }
                if is_current && self.move_state.source_square.is_none() {
                    info!("Late castling abandoned: different piece lifted");
                    self.move_state.clear_castling_tracking();
                }
            }
        }

        // Rook leaving its castling square while castling is legal.
        if is_current
            && self.move_state.source_square.is_none()
            && self.state.piece_role_at(sq) == Some(Role::Rook)
            && MoveState::is_rook_castling_square(sq)
        {
            if let Some(castling_uci) = MoveState::castling_uci_for_rook(sq) {
                if self.state.is_legal_uci(castling_uci) {
                    info!("Potential castling rook lifted from {}", square_name(sq));
                    self.move_state.castling_rook_source = Some(sq);
                    self.move_state.source_color = piece_color;
                }
            }
        }

        if !is_current {
            self.move_state.opponent_source_square = Some(sq);
        }

        // Resign gesture: either king, human sides only.
        if self.state.piece_role_at(sq) == Some(Role::King) {
            if let Some(color) = piece_color {
                if self.players.player(color).can_resign() {
                    self.move_state.king_lift = Some(KingLift {
                        square: sq,
                        color,
                        since: Instant::now(),
                        menu_raised: false,
                    });
                }
            }
        }

        // Move construction.
        if self.move_state.castling_rook_source.is_none() {
            if self.move_state.is_forced() {
                if self.move_state.source_square.is_none() && is_current {
                    self.move_state.legal_destinations =
                        if Some(sq) == self.move_state.forced_source() {
                            let mut dests = vec![sq];
                            if let Some(target) = self.move_state.forced_target() {
                                dests.push(target);
                            }
                            dests
                        } else {
                            // Wrong piece for the forced move: back only.
                            vec![sq]
                        };
                    self.move_state.source_square = Some(sq);
                    self.move_state.source_color = piece_color;
                }
            } else if is_current
                && self.move_state.source_square.is_none()
                && !self.move_state.legal_destinations.contains(&sq)
            {
                self.move_state.legal_destinations = self.state.legal_destinations(sq);
                self.move_state.source_square = Some(sq);
                self.move_state.source_color = piece_color;
            }
        }

        self.correction.clear_exit_flag();
    }

    // ── Piece place ───────────────────────────────────────────────────────

    async fn handle_place(&mut self, sq: u8) {
        // Any placement cancels the king-lift gesture.
        if self.move_state.king_lift.take().is_some() && self.resign_menu.take().is_some() {
            info!("King placed; resign menu cancelled");
            self.emit(ManagerEvent::ResignMenuCancelled);
        }

        // Late castling completion has priority.
        if self.move_state.late_castling_in_progress {
            let rook = self.move_state.castling_rook_source;
            let expected_dest = rook.and_then(MoveState::king_dest_for_rook);
            if expected_dest == Some(sq) {
                if let Some(rook) = rook {
                    self.execute_castling(rook).await;
                }
            } else if Some(sq) == self.move_state.source_square {
                info!("Late castling cancelled: king returned");
                self.move_state.reset();
                let _ = self.board.leds_off().await;
            } else {
                warn!(
                    "Late castling failed: king placed on {}",
                    square_name(sq)
                );
                self.move_state.reset();
                self.enter_correction().await;
            }
            return;
        }

        let is_current = self.state.piece_color_at(sq) == Some(self.state.turn());

        // Opponent piece put back where it was lifted from.
        if !is_current && self.move_state.opponent_source_square == Some(sq) {
            let _ = self.board.leds_off().await;
            self.move_state.opponent_source_square = None;
            return;
        }

        // Rook placement while castling tracking is active.
        if let Some(rook) = self.move_state.castling_rook_source {
            if self.move_state.source_square.is_none() && !self.move_state.castling_rook_placed {
                if sq == rook {
                    info!("Rook returned to {}; castling tracking cancelled", square_name(sq));
                    self.move_state.clear_castling_tracking();
                    return;
                }
                if MoveState::is_valid_rook_castling_destination(rook, sq) {
                    // Hold the move open; the king completes the castle.
                    info!("Rook parked on its castling destination; awaiting the king");
                    self.move_state.castling_rook_placed = true;
                    return;
                }
                // Anywhere else is a regular rook move.
                self.move_state.source_square = Some(rook);
                self.move_state.legal_destinations = self.state.legal_destinations(rook);
                self.move_state.castling_rook_source = None;
                self.move_state.castling_rook_placed = false;
            }
        }

        // Stale PLACE with no lift on record.
        if self.move_state.source_square.is_none()
            && self.move_state.opponent_source_square.is_none()
        {
            if let Ok(current) = self.board.get_state().await {
                let expected = self.state.to_piece_presence_state();
                let (_missing, extra) = diff_states(&current, &expected);
                if !extra.is_empty() {
                    warn!(
                        "PLACE without LIFT left {} extra piece(s); entering correction",
                        extra.len()
                    );
                    self.board
                        .beep(SoundKind::WrongMove, Some(SoundEventType::Error))
                        .await;
                    self.correction.enter();
                    provide_guidance(&self.board, &current, &expected).await;
                    return;
                }
            }
            if self.correction.just_exited {
                let exempt = self.move_state.is_forced()
                    && self.move_state.forced_source() == Some(sq);
                if !exempt {
                    info!("Ignoring stale PLACE after correction exit ({})", square_name(sq));
                    self.correction.clear_exit_flag();
                    return;
                }
            }
            if self.move_state.is_forced() {
                if self.move_state.forced_source() == Some(sq) {
                    info!("Ignoring stale PLACE on the forced move's source square");
                    self.correction.clear_exit_flag();
                    return;
                }
            } else {
                info!("Ignoring stale PLACE for {}", square_name(sq));
                self.correction.clear_exit_flag();
                return;
            }
        }

        // Illegal placement.
        if !self.move_state.legal_destinations.contains(&sq) {
            // A placement that leaves the physical board in agreement with
            // the game needs no complaint. This absorbs the rook transit
            // after a committed king-first castle.
            if let Ok(current) = self.board.get_state().await {
                if ChessGameState::states_match(&current, &self.state.to_piece_presence_state()) {
                    debug!("Placement restored agreement with the game; clearing move state");
                    let _ = self.board.leds_off().await;
                    self.move_state.source_square = None;
                    self.move_state.source_color = None;
                    self.move_state.legal_destinations.clear();
                    self.move_state.opponent_source_square = None;
                    return;
                }
            }
            self.board
                .beep(SoundKind::WrongMove, Some(SoundEventType::Error))
                .await;
            warn!("Piece placed on illegal square {}", square_name(sq));
            if self.check_takeback().await {
                return;
            }
            if self.try_late_castling_from_king_move(sq).await {
                return;
            }
            self.enter_correction().await;
            return;
        }

        // Legal placement.
        if Some(sq) == self.move_state.source_square {
            // Move withdrawn.
            let _ = self.board.leds_off().await;
            self.move_state.source_square = None;
            self.move_state.source_color = None;
            self.move_state.legal_destinations.clear();
            self.move_state.clear_castling_tracking();
            return;
        }
        self.commit_move(sq).await;
    }

    // ── Commit ────────────────────────────────────────────────────────────

    async fn commit_move(&mut self, target: u8) {
        if self.state.is_game_over() {
            warn!("Move attempted after game end");
            self.board
                .beep(SoundKind::WrongMove, Some(SoundEventType::Error))
                .await;
            let _ = self.board.leds_off().await;
            self.move_state.reset();
            return;
        }
        let Some(source) = self.move_state.source_square else {
            return;
        };
        let mover = self.state.turn();
        let role = self.state.piece_role_at(source);

        let uci = if let Some(forced) = self.move_state.forced_move.clone() {
            let mut uci = forced;
            if needs_promotion(role, target, mover) && uci.len() < 5 {
                warn!("Forced move '{uci}' missing its promotion piece; defaulting to queen");
                uci.push('q');
            }
            uci
        } else {
            if needs_promotion(role, target, mover) {
                self.board
                    .beep(SoundKind::General, Some(SoundEventType::GameEvent))
                    .await;
                self.pending_promotion = Some(PendingPromotion {
                    target,
                    deadline: Instant::now() + PROMOTION_MENU_TIMEOUT,
                });
                self.emit(ManagerEvent::PromotionNeeded);
                self.display.send(DisplayEvent::PromotionMenu);
                return;
            }
            format!("{}{}", square_name(source), square_name(target))
        };
        self.finish_commit(uci, target).await;
    }

    async fn complete_promotion(&mut self, letter: char) {
        let Some(pending) = self.pending_promotion.take() else {
            return;
        };
        let Some(source) = self.move_state.source_square else {
            return;
        };
        let uci = format!(
            "{}{}{}",
            square_name(source),
            square_name(pending.target),
            letter
        );
        self.finish_commit(uci, pending.target).await;
    }

    pub(crate) async fn finish_commit(&mut self, uci: String, target: u8) {
        let preserve_rook = self.move_state.castling_rook_source;
        let preserve_placed = self.move_state.castling_rook_placed;
        let fen_before = self.state.fen();

        if let Err(e) = self.state.push_uci(&uci) {
            error!("Game: push {uci} failed: {e}");
            self.board
                .beep(SoundKind::WrongMove, Some(SoundEventType::Error))
                .await;
            let _ = self.board.leds_off().await;
            self.move_state.reset();
            self.enter_correction().await;
            return;
        }
        let fen_after = self.state.fen();
        self.update_fen_mirror();

        let _ = self.board.leds_off().await;
        self.board
            .beep(SoundKind::General, Some(SoundEventType::GameEvent))
            .await;
        let _ = self.board.led(target, 5, 3, 1).await;

        self.persist_move(&uci, &fen_after, &fen_before).await;
        self.fen_log.write(&fen_after).await;
        self.board_states.push(self.state.to_piece_presence_state());

        self.move_state.reset();
        self.move_state.forced_move = None;
        if preserve_placed {
            self.move_state.castling_rook_source = preserve_rook;
            self.move_state.castling_rook_placed = true;
        }

        self.emit(ManagerEvent::MoveMade {
            uci: uci.clone(),
            fen: fen_after.clone(),
        });
        self.display.send(DisplayEvent::Position { fen: fen_after });

        if self.state.is_game_over() {
            self.board
                .beep(SoundKind::General, Some(SoundEventType::GameEvent))
                .await;
            let result = self.state.result().unwrap_or_default();
            let termination = self.state.termination().unwrap_or_default();
            self.conclude_game(result, termination).await;
        } else {
            self.signal_alerts().await;
            self.switch_turn().await;
        }
    }

    /// Check / queen-threat warnings after a committed move. Check wins; at
    /// most one alert shows at a time.
    async fn signal_alerts(&mut self) {
        if let Some((_, attacker, king)) = self.state.check_info() {
            let _ = self.board.led_from_to(attacker, king, 5, 4, 2).await;
            self.display.send(DisplayEvent::Message("Check".to_string()));
            return;
        }
        if let Some((_, attacker, queen)) = self.state.queen_threat_info() {
            let _ = self.board.led_from_to(attacker, queen, 2, 2, 1).await;
        }
    }

    async fn switch_turn(&mut self) {
        let to_move = self.state.turn();
        self.clock.switch_turn(to_move);
        self.emit(match to_move {
            Color::White => ManagerEvent::WhiteTurn,
            Color::Black => ManagerEvent::BlackTurn,
        });
        self.request_move_if_computer().await;
        if let Some(assistant) = &self.assistant {
            if self.players.player(to_move).is_human() && !self.app_connected {
                assistant.suggest(self.state.fen(), to_move);
            }
        }
    }

    async fn request_move_if_computer(&mut self) {
        if self.app_connected || self.state.is_game_over() {
            return;
        }
        let to_move = self.state.turn();
        self.players.request_move(to_move, self.state.fen());
    }

    async fn conclude_game(&mut self, result: String, termination: String) {
        info!("Game over: {result} ({termination})");
        self.players.cancel_all();
        self.clock.pause();
        if let (Some(store), Some(id)) = (&self.store, self.game_db_id) {
            if let Err(e) = store.set_result(id, &result).await {
                error!("Game: result update failed: {e}");
            }
        }
        self.display
            .send(DisplayEvent::Message(format!("{result} {termination}")));
        self.emit(ManagerEvent::GameOver {
            result,
            termination,
        });
    }

    async fn persist_move(&mut self, uci: &str, fen_after: &str, fen_before: &str) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if self.game_db_id.is_none() {
            let info = self.settings.game_info();
            match store.create_game(&info, "board", fen_before).await {
                Ok(id) => self.game_db_id = Some(id),
                Err(e) => {
                    error!("Game: create game failed: {e}");
                    return;
                }
            }
        }
        let Some(id) = self.game_db_id else { return };
        let (white_clock, black_clock) = if self.clock.timed_mode() {
            let (w, b) = self.clock.times();
            (Some(w as i64), Some(b as i64))
        } else {
            (None, None)
        };
        let eval = self.analysis.eval_cp().map(i64::from);
        if let Err(e) = store
            .record_move(id, uci, fen_after, white_clock, black_clock, eval)
            .await
        {
            error!("Game: move persist failed: {e}");
        }
    }

    // ── Takeback ──────────────────────────────────────────────────────────

    async fn check_takeback(&mut self) -> bool {
        if self.board_states.len() <= 1 {
            return false;
        }
        let Ok(current) = self.board.get_state().await else {
            return false;
        };
        let previous = self.board_states[self.board_states.len() - 2];
        if current != previous {
            return false;
        }
        info!("Takeback detected");
        let _ = self.board.leds_off().await;
        self.board_states.pop();
        if let (Some(store), Some(id)) = (&self.store, self.game_db_id) {
            if let Err(e) = store.remove_last_move(id).await {
                error!("Game: takeback row removal failed: {e}");
            }
        }
        self.state.pop_move();
        self.update_fen_mirror();
        self.fen_log.write(&self.state.fen()).await;
        self.board
            .beep(SoundKind::General, Some(SoundEventType::GameEvent))
            .await;
        self.move_state.reset();
        self.move_state.forced_move = None;
        self.clock.switch_turn(self.state.turn());
        self.emit(ManagerEvent::Takeback);
        self.display.send(DisplayEvent::Position {
            fen: self.state.fen(),
        });
        self.request_move_if_computer().await;
        true
    }

    // ── Background validation ─────────────────────────────────────────────

    /// Confirm the wood still matches the game while no move is in flight.
    /// Uses the low-priority read so real traffic always wins; a single bad
    /// read (a piece being slid, a skipped poll) is not acted on.
    async fn validate_board(&mut self) {
        if !self.board_idle() || self.state.is_game_over() {
            self.divergence_strikes = 0;
            return;
        }
        let Ok(current) = self.board.get_state_low_priority().await else {
            return;
        };
        if ChessGameState::states_match(&current, &self.state.to_piece_presence_state()) {
            self.divergence_strikes = 0;
            return;
        }
        self.divergence_strikes += 1;
        if self.divergence_strikes < 2 {
            return;
        }
        self.divergence_strikes = 0;
        warn!("Physical board diverged with no move in progress; entering correction");
        self.board
            .beep(SoundKind::Wrong, Some(SoundEventType::Error))
            .await;
        self.enter_correction().await;
    }

    fn board_idle(&self) -> bool {
        self.move_state.source_square.is_none()
            && self.move_state.opponent_source_square.is_none()
            && self.move_state.castling_rook_source.is_none()
            && self.move_state.king_lift.is_none()
            && self.pending_promotion.is_none()
            && !self.correction.active
    }

    // ── Correction ────────────────────────────────────────────────────────

    async fn enter_correction(&mut self) {
        let expected = self.state.to_piece_presence_state();
        match self.board.get_state().await {
            Ok(current) => {
                self.correction.enter();
                provide_guidance(&self.board, &current, &expected).await;
            }
            Err(e) => {
                warn!("Correction: occupancy read failed: {e}");
                self.correction.enter();
            }
        }
    }

    async fn correction_event(&mut self, kind: PieceEventKind) {
        if kind == PieceEventKind::Place {
            tokio::time::sleep(PLACE_SETTLE).await;
        }
        let Ok(current) = self.board.get_state().await else {
            return;
        };

        // Starting position while correcting is the reset gesture.
        if ChessGameState::is_starting_position(&current) {
            warn!("Starting position detected during correction; starting a new game");
            let _ = self.board.leds_off().await;
            self.board
                .beep(SoundKind::General, Some(SoundEventType::GameEvent))
                .await;
            self.correction.exit();
            self.correction.clear_exit_flag();
            self.reset_game().await;
            return;
        }

        let expected = self.state.to_piece_presence_state();
        if ChessGameState::states_match(&current, &expected) {
            info!("Physical board matches again; leaving correction");
            self.board
                .beep(SoundKind::General, Some(SoundEventType::GameEvent))
                .await;
            let _ = self.board.leds_off().await;
            self.correction.exit();
            self.restore_after_correction().await;
            return;
        }
        provide_guidance(&self.board, &current, &expected).await;
    }

    async fn restore_after_correction(&mut self) {
        self.move_state.source_square = None;
        self.move_state.source_color = None;
        self.move_state.legal_destinations.clear();
        self.move_state.opponent_source_square = None;
        if self.move_state.is_forced() {
            if let (Some(from), Some(to)) = (
                self.move_state.forced_source(),
                self.move_state.forced_target(),
            ) {
                let _ = self.board.led_from_to(from, to, 5, 3, 0).await;
            }
        }
    }

    // ── Game lifecycle ────────────────────────────────────────────────────

    pub(crate) async fn reset_game(&mut self) {
        info!("New game");
        self.players.cancel_all();
        self.state.reset();
        self.update_fen_mirror();
        self.move_state = MoveState::new();
        self.pending_promotion = None;
        self.resign_menu = None;
        self.correction.active = false;
        self.analysis.clear();
        self.clock.reset();
        self.board_states = vec![STARTING_STATE];
        self.fen_log.write(&self.state.fen()).await;
        let _ = self.board.leds_off().await;
        self.board
            .beep(SoundKind::General, Some(SoundEventType::GameEvent))
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.board
            .beep(SoundKind::General, Some(SoundEventType::GameEvent))
            .await;

        self.game_db_id = None;
        if let Some(store) = self.store.clone() {
            let info = self.settings.game_info();
            match store
                .create_game(&info, "board", state::STARTING_FEN)
                .await
            {
                Ok(id) => self.game_db_id = Some(id),
                Err(e) => error!("Game: create game failed: {e}"),
            }
        }

        self.emit(ManagerEvent::NewGame);
        self.emit(ManagerEvent::WhiteTurn);
        self.display.send(DisplayEvent::Position {
            fen: self.state.fen(),
        });
        self.request_move_if_computer().await;
    }

}

fn needs_promotion(role: Option<Role>, target: u8, mover: Color) -> bool {
    role == Some(Role::Pawn)
        && match mover {
            Color::White => target / 8 == 7,
            Color::Black => target / 8 == 0,
        }
}

fn color_name(color: Color) -> &'static str {
    match color {
        Color::White => "White",
        Color::Black => "Black",
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
