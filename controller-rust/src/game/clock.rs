//! Chess clock.
//!
//! Per-side integer second counters plus the active side. A 1 Hz tick task
//! decrements the active side while running; hitting zero emits a flag
//! event once. With a zero time control the clock is a pure turn indicator
//! and never decrements.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use shakmaty::Color;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockEvent {
    Tick,
    StateChange,
    Flag(Color),
}

#[derive(Debug, Clone, Default)]
struct ClockData {
    white_time: u64,
    black_time: u64,
    active: Option<Color>,
    running: bool,
    paused: bool,
    timed_mode: bool,
    flagged: Option<Color>,
}

/// Shared clock handle. Mutations are atomic under one lock.
#[derive(Clone)]
pub struct ChessClock {
    data: Arc<Mutex<ClockData>>,
    events: broadcast::Sender<ClockEvent>,
}

impl Default for ChessClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ChessClock {
    pub fn new() -> ChessClock {
        let (events, _) = broadcast::channel(32);
        ChessClock {
            data: Arc::new(Mutex::new(ClockData::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClockEvent> {
        self.events.subscribe()
    }

    pub fn times(&self) -> (u64, u64) {
        let data = self.data.lock().unwrap();
        (data.white_time, data.black_time)
    }

    pub fn active(&self) -> Option<Color> {
        self.data.lock().unwrap().active
    }

    pub fn is_running(&self) -> bool {
        let data = self.data.lock().unwrap();
        data.running && !data.paused
    }

    pub fn timed_mode(&self) -> bool {
        self.data.lock().unwrap().timed_mode
    }

    /// Set both counters. A zero/zero control selects untimed mode.
    pub fn set_times(&self, white_secs: u64, black_secs: u64) {
        {
            let mut data = self.data.lock().unwrap();
            data.white_time = white_secs;
            data.black_time = black_secs;
            data.timed_mode = white_secs > 0 || black_secs > 0;
            data.flagged = None;
        }
        self.emit(ClockEvent::StateChange);
    }

    pub fn start(&self, active: Color) {
        {
            let mut data = self.data.lock().unwrap();
            data.active = Some(active);
            data.running = true;
            data.paused = false;
        }
        self.emit(ClockEvent::StateChange);
    }

    pub fn pause(&self) {
        {
            let mut data = self.data.lock().unwrap();
            data.paused = true;
        }
        self.emit(ClockEvent::StateChange);
    }

    pub fn resume(&self) {
        {
            let mut data = self.data.lock().unwrap();
            data.paused = false;
        }
        self.emit(ClockEvent::StateChange);
    }

    /// Swap the active side without decrementing either counter.
    pub fn switch_turn(&self, to_move: Color) {
        {
            let mut data = self.data.lock().unwrap();
            data.active = Some(to_move);
        }
        self.emit(ClockEvent::StateChange);
    }

    pub fn reset(&self) {
        {
            let mut data = self.data.lock().unwrap();
            *data = ClockData::default();
        }
        self.emit(ClockEvent::StateChange);
    }

    /// One second elapsed. Returns the side that flagged, if any.
    fn tick(&self) -> Option<Color> {
        let flagged = {
            let mut guard = self.data.lock().unwrap();
            let data = &mut *guard;
            if !data.running || data.paused || !data.timed_mode {
                return None;
            }
            let active = data.active?;
            let counter = match active {
                Color::White => &mut data.white_time,
                Color::Black => &mut data.black_time,
            };
            if *counter == 0 {
                return None;
            }
            *counter -= 1;
            if *counter == 0 && data.flagged.is_none() {
                data.flagged = Some(active);
                Some(active)
            } else {
                None
            }
        };
        self.emit(ClockEvent::Tick);
        flagged
    }

    fn emit(&self, event: ClockEvent) {
        let _ = self.events.send(event);
    }

    /// Spawn the 1 Hz countdown task.
    pub fn start_ticker(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let clock = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(color) = clock.tick() {
                            info!("Clock: {color:?} flagged");
                            clock.emit(ClockEvent::Flag(color));
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_times_is_idempotent_with_pause_resume() {
        let clock = ChessClock::new();
        clock.set_times(300, 300);
        clock.pause();
        clock.resume();
        clock.set_times(300, 300);
        assert_eq!(clock.times(), (300, 300));
        assert!(clock.timed_mode());
    }

    #[test]
    fn tick_decrements_only_the_active_side() {
        let clock = ChessClock::new();
        clock.set_times(10, 10);
        clock.start(Color::White);
        clock.tick();
        clock.tick();
        assert_eq!(clock.times(), (8, 10));
        clock.switch_turn(Color::Black);
        clock.tick();
        assert_eq!(clock.times(), (8, 9));
    }

    #[test]
    fn switch_does_not_decrement() {
        let clock = ChessClock::new();
        clock.set_times(5, 5);
        clock.start(Color::White);
        clock.switch_turn(Color::Black);
        clock.switch_turn(Color::White);
        assert_eq!(clock.times(), (5, 5));
    }

    #[test]
    fn flag_fires_exactly_once() {
        let clock = ChessClock::new();
        clock.set_times(2, 10);
        clock.start(Color::White);
        assert_eq!(clock.tick(), None);
        assert_eq!(clock.tick(), Some(Color::White));
        assert_eq!(clock.tick(), None);
        assert_eq!(clock.times().0, 0);
    }

    #[test]
    fn untimed_mode_never_decrements() {
        let clock = ChessClock::new();
        clock.set_times(0, 0);
        clock.start(Color::White);
        for _ in 0..5 {
            assert_eq!(clock.tick(), None);
        }
        assert_eq!(clock.times(), (0, 0));
    }

    #[test]
    fn pause_halts_the_countdown() {
        let clock = ChessClock::new();
        clock.set_times(10, 10);
        clock.start(Color::White);
        clock.pause();
        clock.tick();
        assert_eq!(clock.times(), (10, 10));
        clock.resume();
        clock.tick();
        assert_eq!(clock.times(), (9, 10));
    }

    #[test]
    fn reset_twice_is_a_no_op_after_the_first() {
        let clock = ChessClock::new();
        clock.set_times(60, 60);
        clock.start(Color::White);
        clock.reset();
        let after_first = clock.times();
        clock.reset();
        assert_eq!(clock.times(), after_first);
        assert_eq!(clock.active(), None);
        assert!(!clock.is_running());
    }
}
