//! Workflow integration tests against the mock engine.

mod common;

use std::time::Duration;

use common::{wait_for_snapshot, MockEngine, Responder};
use tokio_util::sync::CancellationToken;

use guidelink::{AppState, Guider, GuiderError};

fn app_state_event(state: &str) -> serde_json::Value {
    serde_json::json!({
        "Event": "AppState", "TimeStamp": 1.0, "Host": "m", "Inst": 1, "State": state
    })
}

async fn connected_guider(mock: &MockEngine) -> Guider {
    let guider = Guider::new(mock.config());
    guider.connect().await.expect("connect should succeed");
    guider
}

/// Drives the session into a known state through the event stream.
async fn seed_state(mock: &MockEngine, guider: &Guider, state: AppState) {
    mock.send_event(app_state_event(state.as_str()));
    assert!(
        wait_for_snapshot(guider, Duration::from_secs(2), |s| {
            s.app_state == Some(state)
        })
        .await,
        "failed to seed state {}",
        state
    );
}

#[tokio::test]
async fn start_guiding_skips_command_when_already_guiding() {
    let mock = MockEngine::start().await;
    let guider = connected_guider(&mock).await;
    seed_state(&mock, &guider, AppState::Guiding).await;

    let token = CancellationToken::new();
    guider
        .start_guiding(false, &token)
        .await
        .expect("should succeed immediately");

    assert_eq!(
        mock.command_count("guide"),
        0,
        "no guide command may be sent while already guiding"
    );
    guider.disconnect().await;
}

#[tokio::test]
async fn stop_guiding_skips_command_when_already_stopped() {
    let mock = MockEngine::start().await;
    let guider = connected_guider(&mock).await;
    seed_state(&mock, &guider, AppState::Stopped).await;

    let token = CancellationToken::new();
    guider
        .stop_guiding(&token)
        .await
        .expect("should succeed immediately");

    assert_eq!(
        mock.command_count("stop_capture"),
        0,
        "no stop command may be sent while already stopped"
    );
    guider.disconnect().await;
}

#[tokio::test]
async fn start_guiding_waits_for_guiding_state() {
    let mock = MockEngine::start().await;
    mock.emit_on("guide", app_state_event("Calibrating"));
    mock.emit_on("guide", app_state_event("Guiding"));

    let guider = connected_guider(&mock).await;
    let token = CancellationToken::new();
    guider
        .start_guiding(false, &token)
        .await
        .expect("guiding should start");

    assert_eq!(mock.command_count("guide"), 1);
    assert_eq!(guider.app_state().await, Some(AppState::Guiding));
    guider.disconnect().await;
}

#[tokio::test]
async fn start_guiding_fails_on_engine_error() {
    let mock = MockEngine::start().await;
    mock.respond(
        "guide",
        Responder::Error {
            code: 1,
            message: "no star selected".to_string(),
        },
    );

    let guider = connected_guider(&mock).await;
    let token = CancellationToken::new();
    let result = guider.start_guiding(false, &token).await;

    assert!(
        matches!(result, Err(GuiderError::Rpc { method: "guide", .. })),
        "expected a guide rejection, got {:?}",
        result
    );
    guider.disconnect().await;
}

#[tokio::test]
async fn auto_retry_stops_once_between_attempts_until_cancelled() {
    let mock = MockEngine::start().await;
    // Guiding never starts: each guide attempt only reaches calibration,
    // each stop returns the engine to stopped.
    mock.emit_on("guide", app_state_event("Calibrating"));
    mock.emit_on("stop_capture", app_state_event("Stopped"));
    mock.respond("get_app_state", Responder::Ok(serde_json::json!("Stopped")));

    let config = guidelink::GuiderConfig {
        auto_retry: true,
        retry_timeout_secs: 1,
        ..mock.config()
    };
    let guider = std::sync::Arc::new(Guider::new(config));
    guider.connect().await.expect("connect should succeed");

    let token = CancellationToken::new();
    let task_guider = std::sync::Arc::clone(&guider);
    let task_token = token.clone();
    let handle =
        tokio::spawn(async move { task_guider.start_guiding(false, &task_token).await });

    // Let a few retry cycles run, then cancel.
    tokio::time::sleep(Duration::from_millis(4500)).await;
    token.cancel();
    let result = handle.await.expect("task should not panic");
    assert!(
        matches!(result, Err(GuiderError::Cancelled)),
        "expected Cancelled, got {:?}",
        result
    );

    let sequence: Vec<String> = mock
        .commands()
        .into_iter()
        .filter(|m| m == "guide" || m == "stop_capture")
        .collect();
    let guides = sequence.iter().filter(|m| *m == "guide").count();
    assert!(guides >= 2, "expected repeated attempts, got {:?}", sequence);
    assert_eq!(sequence.first().map(String::as_str), Some("guide"));
    // Exactly one stop between consecutive attempts: the commands strictly
    // alternate guide, stop, guide, stop, ...
    for pair in sequence.windows(2) {
        assert_ne!(pair[0], pair[1], "non-alternating sequence {:?}", sequence);
    }

    guider.disconnect().await;
}

#[tokio::test]
async fn dither_completes_when_settle_done_arrives() {
    let mock = MockEngine::start().await;
    mock.emit_on(
        "dither",
        serde_json::json!({
            "Event": "GuidingDithered", "TimeStamp": 1.0, "Host": "m", "Inst": 1,
            "dx": 2.0, "dy": -1.5
        }),
    );
    mock.emit_on(
        "dither",
        serde_json::json!({
            "Event": "Settling", "TimeStamp": 2.0, "Host": "m", "Inst": 1,
            "Distance": 0.9, "Time": 0.0, "SettleTime": 8.0
        }),
    );
    mock.emit_on(
        "dither",
        serde_json::json!({
            "Event": "SettleDone", "TimeStamp": 3.0, "Host": "m", "Inst": 1,
            "Status": 0, "TotalFrames": 10, "DroppedFrames": 0
        }),
    );

    let guider = connected_guider(&mock).await;
    let token = CancellationToken::new();
    let started = std::time::Instant::now();
    guider
        .dither(5.0, false, &token)
        .await
        .expect("dither should settle");

    assert!(
        started.elapsed() < Duration::from_secs(30),
        "settled dither must not run into the failsafe"
    );
    let snapshot = guider.snapshot().await;
    assert!(!snapshot.is_dithering);
    assert!(snapshot.settle_done.is_some());
    guider.disconnect().await;
}

#[tokio::test]
async fn dither_failsafe_returns_success_without_settle_done() {
    let mock = MockEngine::start().await;
    let config = guidelink::GuiderConfig {
        dither_settle_failsafe_secs: 1,
        ..mock.config()
    };
    let guider = Guider::new(config);
    guider.connect().await.expect("connect should succeed");

    let token = CancellationToken::new();
    let started = std::time::Instant::now();
    guider
        .dither(5.0, false, &token)
        .await
        .expect("failsafe resolves to success");

    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "must wait out the failsafe window"
    );
    assert!(!guider.snapshot().await.is_dithering);
    guider.disconnect().await;
}

#[tokio::test]
async fn dither_fails_on_engine_error_and_clears_flag() {
    let mock = MockEngine::start().await;
    mock.respond(
        "dither",
        Responder::Error {
            code: 2,
            message: "dither while not guiding".to_string(),
        },
    );

    let guider = connected_guider(&mock).await;
    let token = CancellationToken::new();
    let result = guider.dither(5.0, false, &token).await;

    assert!(
        matches!(result, Err(GuiderError::Rpc { method: "dither", .. })),
        "expected a dither rejection, got {:?}",
        result
    );
    assert!(!guider.snapshot().await.is_dithering);
    guider.disconnect().await;
}

#[tokio::test]
async fn cancelled_dither_leaves_flag_as_last_event_set_it() {
    let mock = MockEngine::start().await;
    let guider = std::sync::Arc::new(connected_guider(&mock).await);

    let token = CancellationToken::new();
    let task_guider = std::sync::Arc::clone(&guider);
    let task_token = token.clone();
    let handle = tokio::spawn(async move { task_guider.dither(5.0, false, &task_token).await });

    assert!(mock.wait_for_command("dither", Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    token.cancel();
    let result = handle.await.expect("task should not panic");

    assert!(matches!(result, Err(GuiderError::Cancelled)));
    // No settle-done was applied, so the flag stays where the workflow
    // left it; cancellation must not rewrite shared state.
    assert!(guider.snapshot().await.is_dithering);
    guider.disconnect().await;
}

#[tokio::test]
async fn pause_waits_for_paused_state() {
    let mock = MockEngine::start().await;
    mock.emit_on(
        "set_paused",
        serde_json::json!({
            "Event": "Paused", "TimeStamp": 1.0, "Host": "m", "Inst": 1
        }),
    );

    let guider = connected_guider(&mock).await;
    let token = CancellationToken::new();
    guider.pause(true, &token).await.expect("pause should succeed");

    assert_eq!(guider.app_state().await, Some(AppState::Paused));
    guider.disconnect().await;
}

#[tokio::test]
async fn resume_waits_for_state_leaving_paused() {
    let mock = MockEngine::start().await;
    let guider = connected_guider(&mock).await;
    seed_state(&mock, &guider, AppState::Paused).await;

    mock.emit_on(
        "set_paused",
        serde_json::json!({
            "Event": "LoopingExposures", "TimeStamp": 1.0, "Host": "m", "Inst": 1, "Frame": 3
        }),
    );

    let token = CancellationToken::new();
    guider
        .pause(false, &token)
        .await
        .expect("resume should succeed");

    assert_eq!(guider.app_state().await, Some(AppState::Looping));
    guider.disconnect().await;
}

#[tokio::test]
async fn auto_select_skips_loop_when_already_looping() {
    let mock = MockEngine::start().await;
    let guider = connected_guider(&mock).await;
    seed_state(&mock, &guider, AppState::Looping).await;

    let loops_before = mock.command_count("loop");
    let token = CancellationToken::new();
    let found = guider
        .auto_select_guide_star(&token)
        .await
        .expect("star selection should round-trip");

    assert!(found);
    assert_eq!(mock.command_count("find_star"), 1);
    assert_eq!(
        mock.command_count("loop"),
        loops_before,
        "no extra loop command while already looping"
    );
    guider.disconnect().await;
}

#[tokio::test]
async fn clear_calibration_reports_engine_refusal() {
    let mock = MockEngine::start().await;
    let guider = connected_guider(&mock).await;
    let token = CancellationToken::new();

    let cleared = guider
        .clear_calibration(&token)
        .await
        .expect("exchange should succeed");
    assert!(cleared);

    mock.respond(
        "clear_calibration",
        Responder::Error {
            code: 3,
            message: "cannot clear while calibrating".to_string(),
        },
    );
    let cleared = guider
        .clear_calibration(&token)
        .await
        .expect("exchange should succeed");
    assert!(!cleared, "engine refusal maps to Ok(false)");

    guider.disconnect().await;
}

#[tokio::test]
async fn operations_require_a_connection() {
    let mock = MockEngine::start().await;
    let guider = Guider::new(mock.config());
    let token = CancellationToken::new();

    let result = guider.stop_guiding(&token).await;
    assert!(
        matches!(result, Err(GuiderError::NotConnected)),
        "expected NotConnected, got {:?}",
        result
    );
}
