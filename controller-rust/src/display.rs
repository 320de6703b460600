//! Display queue.
//!
//! The e-paper pipeline is an external collaborator; this module only owns
//! the queue in front of it and a sink interface it renders through. The
//! default sink logs, which is also what headless development uses.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    /// Latest position for the board widget.
    Position { fen: String },
    /// Clock line, already formatted ("MM:SS       MM:SS").
    ClockText(String),
    Message(String),
    /// Shutdown / inactivity countdown overlay; `None` clears it.
    Countdown(Option<u64>),
    PromotionMenu,
    ResignMenu { color: String },
    StatusLine(String),
    Clear,
}

/// Where display events end up. The e-paper implementation lives outside
/// this crate; tests and headless runs use [`LogSink`].
pub trait DisplaySink: Send {
    fn render(&mut self, event: &DisplayEvent);
}

pub struct LogSink;

impl DisplaySink for LogSink {
    fn render(&mut self, event: &DisplayEvent) {
        match event {
            DisplayEvent::Position { fen } => debug!("Display: position {fen}"),
            DisplayEvent::Countdown(Some(secs)) => info!("Display: shutdown in {secs}s"),
            DisplayEvent::Countdown(None) => debug!("Display: countdown cleared"),
            other => debug!("Display: {other:?}"),
        }
    }
}

#[derive(Clone)]
pub struct DisplayHandle {
    tx: mpsc::Sender<DisplayEvent>,
}

impl DisplayHandle {
    /// Best-effort enqueue; a saturated display queue never blocks game
    /// logic.
    pub fn send(&self, event: DisplayEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Spawn the display task draining the queue into the sink.
pub fn start_display(
    mut sink: Box<dyn DisplaySink>,
    mut shutdown: watch::Receiver<bool>,
) -> (DisplayHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<DisplayEvent>(64);
    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => sink.render(&event),
                        None => return,
                    }
                }
                _ = shutdown.changed() => {
                    sink.render(&DisplayEvent::Clear);
                    return;
                }
            }
        }
    });
    (DisplayHandle { tx }, handle)
}

/// Clock line in the layout the panel uses.
pub fn format_clock(white_secs: u64, black_secs: u64) -> String {
    format!(
        "{:02}:{:02}       {:02}:{:02}",
        white_secs / 60,
        white_secs % 60,
        black_secs / 60,
        black_secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_formatting() {
        assert_eq!(format_clock(300, 59), "05:00       00:59");
        assert_eq!(format_clock(3601, 0), "60:01       00:00");
    }
}
