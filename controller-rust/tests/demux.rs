//! Demultiplexer behavior: long-press synthesis and the inactivity
//! watchdog, observed through the full stack.

mod common;

use std::time::Duration;

use boardlink_types::Key;
use common::Rig;
use tabula_controller::game::ManagerEvent;
use tabula_controller::settings::SettingsData;

#[tokio::test]
async fn held_play_synthesizes_a_long_press_then_delivers_the_release() {
    let mut rig = Rig::start().await;

    rig.key_down(Key::Play).await;
    tokio::time::sleep(Duration::from_millis(1400)).await;
    rig.key_up(Key::Play).await;

    let mut saw_long = false;
    let mut saw_release_after_long = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, rig.events.recv()).await {
            Ok(Ok(ManagerEvent::LongKey(Key::Play))) => saw_long = true,
            Ok(Ok(ManagerEvent::Key(Key::Play))) => {
                if saw_long {
                    saw_release_after_long = true;
                    break;
                }
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_long, "no long press synthesized");
    assert!(saw_release_after_long, "release not delivered after the long press");
}

#[tokio::test]
async fn short_press_delivers_only_the_release() {
    let mut rig = Rig::start().await;
    rig.press_key(Key::Help).await;

    let mut saw_key = false;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rig.events.recv()).await {
        match event {
            ManagerEvent::Key(Key::Help) => saw_key = true,
            ManagerEvent::LongKey(Key::Help) => panic!("short press produced a long press"),
            _ => {}
        }
    }
    assert!(saw_key);
}

#[tokio::test]
async fn inactivity_counts_down_and_requests_shutdown() {
    let mut data = SettingsData::default();
    data.inactivity.timeout_secs = 3;
    data.inactivity.countdown_secs = 2;
    let mut rig = Rig::start_with(data).await;

    // Stay idle: the countdown must reach zero and synthesize a long PLAY.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    let mut saw_shutdown_request = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, rig.events.recv()).await {
            Ok(Ok(ManagerEvent::LongKey(Key::Play))) => {
                saw_shutdown_request = true;
                break;
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_shutdown_request, "inactivity never requested shutdown");
}

#[tokio::test]
async fn activity_resets_the_inactivity_timer() {
    let mut data = SettingsData::default();
    data.inactivity.timeout_secs = 3;
    data.inactivity.countdown_secs = 2;
    let mut rig = Rig::start_with(data).await;

    // Keep touching the board; no shutdown may fire while we are active.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        rig.lift("e2").await;
        rig.place("e2").await;
    }
    let mut saw_shutdown_request = false;
    rig.drain_events();
    // One quiet second is still well inside the fresh timeout.
    tokio::time::sleep(Duration::from_secs(1)).await;
    while let Ok(event) = rig.events.try_recv() {
        if matches!(event, ManagerEvent::LongKey(Key::Play)) {
            saw_shutdown_request = true;
        }
    }
    assert!(!saw_shutdown_request, "shutdown fired despite activity");
}
