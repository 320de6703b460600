//! tabula-controller — replacement controller daemon for a reed-sensor
//! chess board.
//!
//! Startup order: settings → persistence → link discovery (retried) → game
//! task → emulator server. Shutdown order: players, emulators, MCU sleep
//! (retried, loud on failure), display, halt.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use boardlink_types::Key;

use tabula_controller::analysis::AnalysisState;
use tabula_controller::display::{self, start_display, DisplayEvent, LogSink};
use tabula_controller::emulators::ProtocolServer;
use tabula_controller::game::clock::ChessClock;
use tabula_controller::game::players::{
    AssistantKind, AssistantManager, EnginePlayer, Player, PlayerManager, Suggestion,
};
use tabula_controller::game::{GameCommand, GameDeps, GameHandle, GameManager, ManagerEvent};
use tabula_controller::link::{self, start_demux, BoardController, Bus, SoundKind};
use tabula_controller::persistence::{FenLog, GameStore};
use tabula_controller::settings::Settings;
use tabula_controller::system::SystemState;

/// Seconds the shutdown countdown overlay runs before the MCU sleeps.
const SHUTDOWN_COUNTDOWN_SECS: u64 = 3;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "tabula-controller", about = "Tabula chess board controller")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Link override, e.g. serial:/dev/serial0 or tcp:127.0.0.1:3334
    #[arg(long)]
    link: Option<String>,
    /// Skip the database (moves are not persisted)
    #[arg(long)]
    no_db: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabula_controller=info".into()),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!(
        "Tabula controller v{} starting",
        env!("CARGO_PKG_VERSION")
    );
    let settings = Settings::load(&args.config);
    let link_settings = settings.link();
    let link_spec = args.link.unwrap_or(link_settings.spec);

    // Two shutdown phases: services stop first, the link stays up long
    // enough to put the MCU to sleep.
    let (services_tx, services_rx) = watch::channel(false);
    let (link_tx, link_rx) = watch::channel(false);

    // Persistence.
    let store = if args.no_db {
        None
    } else {
        match GameStore::open(&settings.database_path()).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!("Persistence unavailable: {e:#}");
                None
            }
        }
    };
    let fen_log = FenLog::new(&settings.fen_log_path());

    // Serial link + discovery.
    let stream = link::transport::open(&link_spec, link_settings.baud)
        .await
        .context("opening board link")?;
    let (bus, link_events, _reader_handle) = Bus::start(stream, link_rx.clone());
    let board = BoardController::new(bus.clone(), settings.clone());

    let mut discovered = false;
    for attempt in 1..=link_settings.discovery_attempts {
        bus.begin_discovery().await.context("discovery send")?;
        if bus.wait_ready(DISCOVERY_TIMEOUT).await {
            discovered = true;
            break;
        }
        warn!(
            "Discovery attempt {attempt}/{} timed out",
            link_settings.discovery_attempts
        );
    }
    if !discovered {
        bail!("board discovery failed after {} attempts", link_settings.discovery_attempts);
    }
    let (addr1, addr2) = bus.address();
    info!("Board ready at address {addr1:02x}:{addr2:02x}");
    board.beep(SoundKind::PowerOn, None).await;
    let _ = board.leds_off().await;

    // Display.
    let (display, _display_handle) = start_display(Box::new(LogSink), link_rx.clone());

    // System state + demultiplexer.
    let system = SystemState::new();
    let (input_tx, input_rx) = mpsc::channel(256);
    let _demux_handle = start_demux(
        link_events,
        board.clone(),
        settings.clone(),
        system.clone(),
        input_tx,
        services_rx.clone(),
    );

    // Clock.
    let clock = ChessClock::new();
    let _clock_handle = clock.start_ticker(services_rx.clone());
    let _clock_display = spawn_clock_display(clock.clone(), display.clone(), services_rx.clone());

    // Players and assistants.
    let analysis = AnalysisState::new();
    let engine_settings = settings.engine();
    let make_player = |plays: bool, name: &str| -> Player {
        match (&engine_settings.path, plays) {
            (Some(path), true) => Player::Engine(EnginePlayer::new(
                name,
                path,
                engine_settings.move_time_ms,
                analysis.clone(),
            )),
            _ => Player::human(name),
        }
    };
    let white = make_player(engine_settings.play_white, "White");
    let black = make_player(engine_settings.play_black, "Black");
    let (players, player_moves) = PlayerManager::new(white, black);

    let assistant_kind = match engine_settings.assistant.as_deref() {
        Some("hint") => Some(AssistantKind::Hint),
        Some("hand_and_brain") => Some(AssistantKind::HandAndBrain),
        Some(other) => {
            warn!("Unknown assistant '{other}', assistants disabled");
            None
        }
        None => None,
    };
    let assistant = match (&engine_settings.path, assistant_kind) {
        (Some(path), Some(kind)) => {
            let (manager, suggestions) =
                AssistantManager::new(kind, path, engine_settings.move_time_ms);
            let _suggestion_display =
                spawn_suggestion_display(suggestions, display.clone(), services_rx.clone());
            Some(manager)
        }
        _ => None,
    };

    // Game task.
    let deps = GameDeps {
        board: board.clone(),
        settings: settings.clone(),
        store,
        fen_log,
        clock: clock.clone(),
        players,
        player_moves,
        assistant,
        analysis,
        display: display.clone(),
    };
    let (manager, player_moves, game_handle, cmd_rx) = GameManager::new(deps);
    let _game_handle_task = manager.start(input_rx, player_moves, cmd_rx, services_rx.clone());

    // Emulator bridge.
    let emulator_settings = settings.emulator();
    if emulator_settings.enabled {
        let server = ProtocolServer {
            port: emulator_settings.port,
            game: game_handle.clone(),
            board: board.clone(),
            system: system.clone(),
        };
        let _server_handle = server.start(services_rx.clone());
    }

    display.send(DisplayEvent::Position {
        fen: game_handle.fen(),
    });
    info!("Tabula controller running");

    // Lifecycle: wait for a long PLAY press, the inactivity watchdog, or
    // Ctrl-C.
    let wants_halt = lifecycle_loop(&game_handle, &display).await;

    // Ordered shutdown.
    info!("Shutting down");
    game_handle.send(GameCommand::Shutdown).await;
    board.beep(SoundKind::PowerOff, None).await;
    let _ = board.leds_off().await;
    services_tx.send_replace(true);
    tokio::time::sleep(Duration::from_millis(200)).await;

    if wants_halt {
        display.send(DisplayEvent::Message("Shutting down".to_string()));
        if board.sleep(3, Duration::from_millis(500)).await.is_err() {
            display.send(DisplayEvent::Message(
                "Board did not power off".to_string(),
            ));
        }
    }
    display.send(DisplayEvent::Clear);
    tokio::time::sleep(Duration::from_millis(100)).await;
    link_tx.send_replace(true);

    if wants_halt {
        if let Some(halt) = settings.halt_command() {
            info!("Halting host: {halt}");
            let _ = std::process::Command::new("sh").arg("-c").arg(halt).status();
        }
    }
    info!("Controller stopped");
    Ok(())
}

/// Mirror the clock counters onto the display whenever they change.
fn spawn_clock_display(
    clock: ChessClock,
    display: display::DisplayHandle,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut events = clock.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(_) => {
                            if clock.timed_mode() {
                                let (w, b) = clock.times();
                                display.send(DisplayEvent::ClockText(display::format_clock(w, b)));
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(_) => return,
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Surface assistant output as display messages.
fn spawn_suggestion_display(
    mut suggestions: mpsc::Receiver<Suggestion>,
    display: display::DisplayHandle,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                suggestion = suggestions.recv() => {
                    match suggestion {
                        Some(Suggestion::BestMove(uci)) => {
                            display.send(DisplayEvent::Message(format!("Hint: {uci}")));
                        }
                        Some(Suggestion::PieceCue(cue)) => {
                            display.send(DisplayEvent::Message(format!("Move a {cue}")));
                        }
                        None => return,
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Returns true when the MCU should be put to sleep (user shutdown), false
/// for a plain process exit (Ctrl-C).
async fn lifecycle_loop(game: &GameHandle, display: &display::DisplayHandle) -> bool {
    let mut events = game.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(ManagerEvent::LongKey(Key::Play)) => {
                        if shutdown_countdown(&mut events, display).await {
                            return true;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!("Game task ended unexpectedly");
                        return false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                return false;
            }
        }
    }
}

/// Run the 3-second countdown; a PLAY release cancels it.
async fn shutdown_countdown(
    events: &mut tokio::sync::broadcast::Receiver<ManagerEvent>,
    display: &display::DisplayHandle,
) -> bool {
    for remaining in (1..=SHUTDOWN_COUNTDOWN_SECS).rev() {
        display.send(DisplayEvent::Countdown(Some(remaining)));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(ManagerEvent::Key(Key::Play))) => {
                    info!("Shutdown cancelled");
                    display.send(DisplayEvent::Countdown(None));
                    return false;
                }
                Ok(Ok(_)) | Ok(Err(_)) => continue,
                Err(_) => break,
            }
        }
    }
    display.send(DisplayEvent::Countdown(None));
    true
}
