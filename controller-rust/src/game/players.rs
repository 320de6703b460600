//! Players and assistants.
//!
//! A player is human (moves come from the board), engine (background UCI
//! search), or online (moves stream in from a remote session). The manager
//! routes `request_move` to whichever player owns the side to move and
//! funnels chosen moves back to the game task through one channel.

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use shakmaty::{Color, Position};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::analysis::AnalysisState;

/// A move chosen off-board, delivered to the game task.
#[derive(Debug, Clone)]
pub struct PlayerMove {
    pub color: Color,
    pub uci: String,
}

// ── Engine player ─────────────────────────────────────────────────────────

pub struct EnginePlayer {
    pub name: String,
    engine_path: String,
    move_time_ms: u64,
    analysis: AnalysisState,
    search: StdMutex<Option<JoinHandle<()>>>,
}

impl EnginePlayer {
    pub fn new(
        name: &str,
        engine_path: &str,
        move_time_ms: u64,
        analysis: AnalysisState,
    ) -> EnginePlayer {
        EnginePlayer {
            name: name.to_string(),
            engine_path: engine_path.to_string(),
            move_time_ms,
            analysis,
            search: StdMutex::new(None),
        }
    }

    fn request_move(&self, fen: String, color: Color, tx: mpsc::Sender<PlayerMove>) {
        self.cancel_move();
        let path = self.engine_path.clone();
        let move_time = self.move_time_ms;
        let analysis = self.analysis.clone();
        let handle = tokio::spawn(async move {
            match run_uci_search(&path, &fen, move_time, color, &analysis).await {
                Ok(Some(uci)) => {
                    info!("Engine: bestmove {uci}");
                    let _ = tx.send(PlayerMove { color, uci }).await;
                }
                Ok(None) => warn!("Engine: search ended without a bestmove"),
                Err(e) => error!("Engine: search failed: {e}"),
            }
        });
        *self.search.lock().unwrap() = Some(handle);
    }

    fn cancel_move(&self) {
        if let Some(handle) = self.search.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Drive one `go movetime` search and return the bestmove.
async fn run_uci_search(
    engine_path: &str,
    fen: &str,
    move_time_ms: u64,
    side_to_move: Color,
    analysis: &AnalysisState,
) -> anyhow::Result<Option<String>> {
    let mut child = Command::new(engine_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("engine stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("engine stdout unavailable"))?;
    let mut lines = BufReader::new(stdout).lines();

    stdin
        .write_all(format!("uci\nisready\nposition fen {fen}\ngo movetime {move_time_ms}\n").as_bytes())
        .await?;
    stdin.flush().await?;

    // The search budget plus slack for engine startup.
    let deadline = Duration::from_millis(move_time_ms + 10_000);
    let result = tokio::time::timeout(deadline, async {
        while let Some(line) = lines.next_line().await? {
            if line.starts_with("info") {
                analysis.record_info(&line, side_to_move);
            } else if let Some(rest) = line.strip_prefix("bestmove ") {
                let uci = rest.split_whitespace().next().unwrap_or_default().to_string();
                if !uci.is_empty() && uci != "(none)" {
                    return Ok::<_, anyhow::Error>(Some(uci));
                }
                return Ok(None);
            }
        }
        Ok(None)
    })
    .await;

    let _ = child.kill().await;
    match result {
        Ok(found) => found,
        Err(_) => {
            warn!("Engine: search timed out");
            Ok(None)
        }
    }
}

// ── Online player ─────────────────────────────────────────────────────────

/// Moves stream in from a remote game session through an injector channel;
/// the session transport lives outside this module.
pub struct OnlinePlayer {
    pub name: String,
    feed: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    injector: mpsc::Sender<String>,
    pending: StdMutex<Option<JoinHandle<()>>>,
}

impl OnlinePlayer {
    pub fn new(name: &str) -> OnlinePlayer {
        let (injector, feed) = mpsc::channel(16);
        OnlinePlayer {
            name: name.to_string(),
            feed: Arc::new(tokio::sync::Mutex::new(feed)),
            injector,
            pending: StdMutex::new(None),
        }
    }

    /// Channel the remote transport pushes opponent moves into.
    pub fn remote_handle(&self) -> mpsc::Sender<String> {
        self.injector.clone()
    }

    fn request_move(&self, color: Color, tx: mpsc::Sender<PlayerMove>) {
        self.cancel_move();
        let feed = self.feed.clone();
        let handle = tokio::spawn(async move {
            let mut feed = feed.lock().await;
            if let Some(uci) = feed.recv().await {
                debug!("Online: received {uci}");
                let _ = tx.send(PlayerMove { color, uci }).await;
            }
        });
        *self.pending.lock().unwrap() = Some(handle);
    }

    fn cancel_move(&self) {
        if let Some(handle) = self.pending.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// ── Player ────────────────────────────────────────────────────────────────

pub enum Player {
    Human { name: String },
    Engine(EnginePlayer),
    Online(OnlinePlayer),
}

impl Player {
    pub fn human(name: &str) -> Player {
        Player::Human {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Player::Human { name } => name,
            Player::Engine(p) => &p.name,
            Player::Online(p) => &p.name,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Player::Human { .. })
    }

    /// Only a human's king lift can mean resignation.
    pub fn can_resign(&self) -> bool {
        self.is_human()
    }

    /// Ask this player for a move. No-op for humans: their moves arrive
    /// from the physical board.
    pub fn request_move(&self, fen: String, color: Color, tx: mpsc::Sender<PlayerMove>) {
        match self {
            Player::Human { .. } => {}
            Player::Engine(p) => p.request_move(fen, color, tx),
            Player::Online(p) => p.request_move(color, tx),
        }
    }

    /// Abort any in-flight search or wait; no move will be delivered.
    pub fn cancel_move(&self) {
        match self {
            Player::Human { .. } => {}
            Player::Engine(p) => p.cancel_move(),
            Player::Online(p) => p.cancel_move(),
        }
    }
}

// ── Player manager ────────────────────────────────────────────────────────

pub struct PlayerManager {
    white: Arc<Player>,
    black: Arc<Player>,
    move_tx: mpsc::Sender<PlayerMove>,
}

impl PlayerManager {
    /// Returns the manager plus the receiving end of the chosen-move
    /// channel; the game task consumes it.
    pub fn new(white: Player, black: Player) -> (PlayerManager, mpsc::Receiver<PlayerMove>) {
        let (move_tx, move_rx) = mpsc::channel(8);
        (
            PlayerManager {
                white: Arc::new(white),
                black: Arc::new(black),
                move_tx,
            },
            move_rx,
        )
    }

    pub fn player(&self, color: Color) -> &Arc<Player> {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    pub fn is_two_player(&self) -> bool {
        self.white.is_human() && self.black.is_human()
    }

    /// Ask the side to move for its move when that side is non-human.
    pub fn request_move(&self, color: Color, fen: String) {
        let player = self.player(color);
        if player.is_human() {
            return;
        }
        info!("Players: requesting move from {} ({color:?})", player.name());
        player.request_move(fen, color, self.move_tx.clone());
    }

    pub fn cancel_all(&self) {
        self.white.cancel_move();
        self.black.cancel_move();
    }

    pub fn stop(&self) {
        self.cancel_all();
    }
}

// ── Assistants ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantKind {
    /// Suggest the best move outright.
    Hint,
    /// Hand-and-brain: name only the piece type to move.
    HandAndBrain,
}

#[derive(Debug, Clone)]
pub enum Suggestion {
    BestMove(String),
    PieceCue(String),
}

/// Produces hints on a separate suggestion channel. Never touches the
/// authoritative board, and stays silent for non-human sides.
pub struct AssistantManager {
    kind: AssistantKind,
    engine_path: String,
    move_time_ms: u64,
    suggestion_tx: mpsc::Sender<Suggestion>,
    search: StdMutex<Option<JoinHandle<()>>>,
}

impl AssistantManager {
    pub fn new(
        kind: AssistantKind,
        engine_path: &str,
        move_time_ms: u64,
    ) -> (AssistantManager, mpsc::Receiver<Suggestion>) {
        let (suggestion_tx, suggestion_rx) = mpsc::channel(8);
        (
            AssistantManager {
                kind,
                engine_path: engine_path.to_string(),
                move_time_ms,
                suggestion_tx,
                search: StdMutex::new(None),
            },
            suggestion_rx,
        )
    }

    /// Kick off a suggestion search for the given position.
    pub fn suggest(&self, fen: String, side_to_move: Color) {
        self.cancel();
        let path = self.engine_path.clone();
        let move_time = self.move_time_ms;
        let kind = self.kind;
        let tx = self.suggestion_tx.clone();
        let handle = tokio::spawn(async move {
            let analysis = AnalysisState::new();
            match run_uci_search(&path, &fen, move_time, side_to_move, &analysis).await {
                Ok(Some(uci)) => {
                    let suggestion = match kind {
                        AssistantKind::Hint => Suggestion::BestMove(uci),
                        AssistantKind::HandAndBrain => match piece_cue(&fen, &uci) {
                            Some(cue) => Suggestion::PieceCue(cue),
                            None => Suggestion::BestMove(uci),
                        },
                    };
                    let _ = tx.send(suggestion).await;
                }
                Ok(None) => {}
                Err(e) => warn!("Assistant: search failed: {e}"),
            }
        });
        *self.search.lock().unwrap() = Some(handle);
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.search.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Name the piece type standing on the move's source square.
fn piece_cue(fen: &str, uci: &str) -> Option<String> {
    use shakmaty::fen::Fen;
    use shakmaty::{CastlingMode, Chess, Square};

    if uci.len() < 4 {
        return None;
    }
    let pos: Chess = fen
        .parse::<Fen>()
        .ok()?
        .into_position(CastlingMode::Standard)
        .ok()?;
    let from: Square = uci[0..2].parse().ok()?;
    let role = pos.board().piece_at(from)?.role;
    Some(
        match role {
            shakmaty::Role::Pawn => "pawn",
            shakmaty::Role::Knight => "knight",
            shakmaty::Role::Bishop => "bishop",
            shakmaty::Role::Rook => "rook",
            shakmaty::Role::Queen => "queen",
            shakmaty::Role::King => "king",
        }
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_players_never_request() {
        let (manager, mut rx) = PlayerManager::new(Player::human("White"), Player::human("Black"));
        assert!(manager.is_two_player());
        manager.request_move(Color::White, STARTING.to_string());
        assert!(rx.try_recv().is_err());
    }

    const STARTING: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    #[tokio::test]
    async fn online_player_forwards_injected_moves() {
        let online = OnlinePlayer::new("Remote");
        let remote = online.remote_handle();
        let (manager, mut rx) =
            PlayerManager::new(Player::human("White"), Player::Online(online));
        manager.request_move(Color::Black, STARTING.to_string());
        remote.send("e7e5".to_string()).await.unwrap();
        let chosen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chosen.uci, "e7e5");
        assert_eq!(chosen.color, Color::Black);
    }

    #[tokio::test]
    async fn cancel_aborts_a_pending_online_wait() {
        let online = OnlinePlayer::new("Remote");
        let remote = online.remote_handle();
        let (manager, mut rx) =
            PlayerManager::new(Player::human("White"), Player::Online(online));
        manager.request_move(Color::Black, STARTING.to_string());
        manager.cancel_all();
        remote.send("e7e5".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn piece_cue_names_the_role() {
        assert_eq!(piece_cue(STARTING, "g1f3").as_deref(), Some("knight"));
        assert_eq!(piece_cue(STARTING, "e2e4").as_deref(), Some("pawn"));
        assert_eq!(piece_cue(STARTING, "xxyy"), None);
    }
}
