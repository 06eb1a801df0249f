//! Control-loop behavior of a single execution unit.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::{Recorder, Scripted, Step};
use patchbay::applet::{Role, RunState};
use patchbay::capability::{Handler, InvokeOutcome, InvokeRequest, ValueMap};
use patchbay::credential::{AuthEndpoints, Authenticator, Credential, CredentialStore};
use patchbay::engine::{ExecutionUnit, RunLog};
use patchbay::provider::{Gateway, Provider};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Rate limit 3/30s computes a 10s interval; the emitter skips twice, then
/// triggers with `{"x":"1"}`, and both receivers see that exact map once.
#[tokio::test(start_paused = true)]
async fn scenario_two_skips_then_trigger() {
    let emitter = Scripted::new(vec![
        Step::Skip,
        Step::Skip,
        Step::Trigger(common::upstream("x", "1")),
    ]);
    let first = Recorder::new();
    let second = Recorder::new();

    let catalog = common::catalog(vec![common::fake_provider(
        3.0,
        emitter.clone(),
        vec![("r1", first.clone()), ("r2", second.clone())],
    )]);
    let (applets, credentials) = common::stores();
    let applet = common::seeded_applet(&applets, &["r1", "r2"]);

    let unit = ExecutionUnit::build(&applet, catalog, applets.clone(), credentials).unwrap();
    let handles = unit.handles();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    // Cycles fire at t=0, 10, 20
    tokio::time::sleep(Duration::from_secs(25)).await;
    settle().await;

    assert_eq!(first.call_count(), 1);
    assert_eq!(second.call_count(), 1);
    assert_eq!(first.calls.lock().unwrap()[0], common::upstream("x", "1"));
    assert_eq!(second.calls.lock().unwrap()[0], common::upstream("x", "1"));

    // A trigger is not fatal: the unit keeps running
    assert!(!task.is_finished());
    assert_eq!(
        applets.get_applet(applet.id).unwrap().unwrap().run_state,
        RunState::Running
    );

    assert!(handles.send_cancel().await);
    task.await.unwrap();
    assert_eq!(
        applets.get_applet(applet.id).unwrap().unwrap().run_state,
        RunState::Stopped
    );
}

#[tokio::test(start_paused = true)]
async fn skipped_outcomes_keep_the_unit_running() {
    let emitter = Scripted::new(vec![]);
    let recorder = Recorder::new();

    let catalog = common::catalog(vec![common::fake_provider(
        3.0,
        emitter.clone(),
        vec![("r1", recorder.clone())],
    )]);
    let (applets, credentials) = common::stores();
    let applet = common::seeded_applet(&applets, &["r1"]);

    let unit = ExecutionUnit::build(&applet, catalog, applets.clone(), credentials).unwrap();
    let handles = unit.handles();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    assert!(!task.is_finished());
    assert!(emitter.calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(recorder.call_count(), 0);

    handles.send_cancel().await;
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn emitter_error_is_fatal() {
    let emitter = Scripted::new(vec![Step::Fail]);
    let recorder = Recorder::new();

    let catalog = common::catalog(vec![common::fake_provider(
        3.0,
        emitter,
        vec![("r1", recorder.clone())],
    )]);
    let (applets, credentials) = common::stores();
    let applet = common::seeded_applet(&applets, &["r1"]);

    let unit = ExecutionUnit::build(&applet, catalog, applets.clone(), credentials).unwrap();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    // First cycle fires immediately and kills the unit
    tokio::time::timeout(Duration::from_secs(30), task)
        .await
        .expect("unit should stop after a fatal handler error")
        .unwrap();

    assert_eq!(recorder.call_count(), 0);
    assert_eq!(
        applets.get_applet(applet.id).unwrap().unwrap().run_state,
        RunState::Stopped
    );
}

/// R1 fails: the cycle aborts before R2, and the unit stops.
#[tokio::test(start_paused = true)]
async fn receiver_error_aborts_cycle_in_order() {
    let emitter = Scripted::new(vec![Step::Trigger(common::upstream("x", "1"))]);
    let failing = Recorder::failing();
    let never_reached = Recorder::new();

    let catalog = common::catalog(vec![common::fake_provider(
        3.0,
        emitter,
        vec![("r1", failing), ("r2", never_reached.clone())],
    )]);
    let (applets, credentials) = common::stores();
    let applet = common::seeded_applet(&applets, &["r1", "r2"]);

    let unit = ExecutionUnit::build(&applet, catalog, applets.clone(), credentials).unwrap();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    tokio::time::timeout(Duration::from_secs(30), task)
        .await
        .expect("unit should stop after a fatal reaction error")
        .unwrap();

    assert_eq!(never_reached.call_count(), 0);
    assert_eq!(
        applets.get_applet(applet.id).unwrap().unwrap().run_state,
        RunState::Stopped
    );
}

/// An inactive unit skips cycles entirely: no refresh, no handler call.
#[tokio::test(start_paused = true)]
async fn paused_unit_skips_cycles() {
    let emitter = Scripted::new(vec![]);

    let catalog = common::catalog(vec![common::fake_provider(3.0, emitter.clone(), vec![])]);
    let (applets, credentials) = common::stores();
    let applet = common::seeded_applet(&applets, &[]);

    let unit = ExecutionUnit::build(&applet, catalog, applets, credentials).unwrap();
    let handles = unit.handles();

    // Queue the pause before the loop starts; the control channels are
    // drained ahead of the timer
    assert!(handles.send_pause(false).await);
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    tokio::time::sleep(Duration::from_secs(45)).await;
    settle().await;
    assert_eq!(emitter.calls.load(Ordering::SeqCst), 0);

    handles.send_pause(true).await;
    tokio::time::sleep(Duration::from_secs(45)).await;
    settle().await;
    assert!(emitter.calls.load(Ordering::SeqCst) > 0);

    handles.send_cancel().await;
    task.await.unwrap();
}

/// Echoes the area's `req:val` config entry into its trigger output.
struct EchoConfig;

#[async_trait]
impl Handler for EchoConfig {
    async fn call(&self, req: InvokeRequest<'_>) -> Result<InvokeOutcome> {
        let mut data = ValueMap::new();
        data.insert(
            "v".to_string(),
            req.store.get("req:val").cloned().unwrap_or(json!(null)),
        );
        Ok(InvokeOutcome::Triggered(data))
    }
}

/// The reconfigure signal rebuilds the action binding in place from the
/// updated area, without restarting the unit.
#[tokio::test(start_paused = true)]
async fn reconfigure_rebuilds_binding_in_place() {
    let recorder = Recorder::new();

    let catalog = common::catalog(vec![common::fake_provider(
        3.0,
        Arc::new(EchoConfig),
        vec![("r1", recorder.clone())],
    )]);
    let (applets, credentials) = common::stores();

    let applet = common::applet_row(RunState::Running);
    applets.create_applet(&applet).unwrap();
    applets
        .create_area(&common::area_row(
            applet.id,
            Role::Action,
            "fake",
            "emit",
            r#"{"req:val":"a"}"#,
            None,
        ))
        .unwrap();
    applets
        .create_area(&common::area_row(
            applet.id, Role::Reaction, "fake", "r1", "{}", None,
        ))
        .unwrap();

    let unit =
        ExecutionUnit::build(&applet, catalog, applets.clone(), credentials).unwrap();
    let handles = unit.handles();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    // First cycle at t=0 sees the original config
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(recorder.calls.lock().unwrap()[0].get("v"), Some(&json!("a")));

    // Authoring side updates the area, then signals the running unit
    let area = applets.action_area(applet.id).unwrap().unwrap();
    applets
        .update_area_config(area.id, r#"{"req:val":"b"}"#)
        .unwrap();
    assert!(handles.send_reconfigure(Role::Action).await);

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;

    let calls = recorder.calls.lock().unwrap();
    assert_eq!(calls.last().unwrap().get("v"), Some(&json!("b")));
    assert!(!task.is_finished());
    drop(calls);

    handles.send_cancel().await;
    task.await.unwrap();
}

struct FakeGateway {
    started: AtomicBool,
    stopped: AtomicBool,
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Gateway-backed emitters start the connection once and tear it down on
/// shutdown; the loop stays responsive to cancellation in between.
#[tokio::test(start_paused = true)]
async fn gateway_lifecycle() {
    let gateway = Arc::new(FakeGateway {
        started: AtomicBool::new(false),
        stopped: AtomicBool::new(false),
    });
    let emitter = Scripted::new(vec![]);

    let provider = Provider {
        name: "fake".to_string(),
        description: String::new(),
        rate_limit: 3.0,
        authenticator: None,
        validators: HashMap::new(),
        gateway: Some(gateway.clone()),
        actions: vec![common::capability("emit", true, emitter.clone())],
        reactions: Vec::new(),
    };
    let catalog = common::catalog(vec![provider]);
    let (applets, credentials) = common::stores();
    let applet = common::seeded_applet(&applets, &[]);

    let unit = ExecutionUnit::build(&applet, catalog, applets.clone(), credentials).unwrap();
    let handles = unit.handles();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;
    assert!(gateway.started.load(Ordering::SeqCst));
    assert!(!gateway.stopped.load(Ordering::SeqCst));
    // The short fixed tick still drives the handler
    assert!(emitter.calls.load(Ordering::SeqCst) >= 2);

    handles.send_cancel().await;
    task.await.unwrap();
    assert!(gateway.stopped.load(Ordering::SeqCst));
    assert_eq!(
        applets.get_applet(applet.id).unwrap().unwrap().run_state,
        RunState::Stopped
    );
}

/// Records the access token each invocation sees.
struct TokenCapture {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Handler for TokenCapture {
    async fn call(&self, req: InvokeRequest<'_>) -> Result<InvokeOutcome> {
        self.seen.lock().unwrap().push(
            req.credential
                .map(|c| c.access_token.clone())
                .unwrap_or_default(),
        );
        Ok(InvokeOutcome::Skipped)
    }
}

fn authed_provider(refresh_url: Option<String>, emit: Arc<dyn Handler>) -> Provider {
    Provider {
        name: "authy".to_string(),
        description: String::new(),
        rate_limit: 30.0,
        authenticator: Some(Authenticator {
            name: "authy".to_string(),
            enabled: false,
            authorize_endpoint: String::new(),
            scopes: Vec::new(),
            endpoints: AuthEndpoints {
                token: "http://localhost:1/token".to_string(),
                refresh: refresh_url,
                ..Default::default()
            },
            extra_context: None,
        }),
        validators: HashMap::new(),
        gateway: None,
        actions: vec![common::capability("emit", false, emit)],
        reactions: Vec::new(),
    }
}

fn seed_credential(credentials: &CredentialStore, expires_at: chrono::DateTime<Utc>) -> Credential {
    let credential = Credential {
        id: Uuid::new_v4(),
        account_id: Uuid::new_v4(),
        provider: "authy".to_string(),
        access_token: "stale_token".to_string(),
        refresh_token: Some("refresh_me".to_string()),
        expires_at,
        context: "{}".to_string(),
        permanent: false,
    };
    credentials.insert(&credential).unwrap();
    credential
}

fn seed_authed_applet(
    applets: &patchbay::applet::AppletStore,
    credential_id: Uuid,
) -> patchbay::applet::Applet {
    let applet = common::applet_row(RunState::Running);
    applets.create_applet(&applet).unwrap();
    applets
        .create_area(&common::area_row(
            applet.id,
            Role::Action,
            "authy",
            "emit",
            "{}",
            Some(credential_id),
        ))
        .unwrap();
    applet
}

/// Expired credential, failing refresh endpoint: the unit stops before the
/// handler ever runs.
#[tokio::test]
async fn failing_refresh_stops_unit_before_handler() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/refresh")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let capture = Arc::new(TokenCapture {
        seen: Mutex::new(Vec::new()),
    });
    let catalog = common::catalog(vec![authed_provider(
        Some(format!("{}/refresh", server.url())),
        capture.clone(),
    )]);
    let (applets, credentials) = common::stores();
    let credential = seed_credential(&credentials, Utc::now() - ChronoDuration::seconds(1));
    let applet = seed_authed_applet(&applets, credential.id);

    let unit = ExecutionUnit::build(&applet, catalog, applets.clone(), credentials).unwrap();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("unit should stop after the refresh failure")
        .unwrap();

    assert!(capture.seen.lock().unwrap().is_empty());
    assert_eq!(
        applets.get_applet(applet.id).unwrap().unwrap().run_state,
        RunState::Stopped
    );
}

/// Expired credential, working refresh endpoint: the handler is invoked with
/// the refreshed token, and the rotation is persisted.
#[tokio::test]
async fn refresh_happens_before_handler_invocation() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/refresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"fresh_token","expires_in":3600}"#)
        .create_async()
        .await;

    let capture = Arc::new(TokenCapture {
        seen: Mutex::new(Vec::new()),
    });
    let catalog = common::catalog(vec![authed_provider(
        Some(format!("{}/refresh", server.url())),
        capture.clone(),
    )]);
    let (applets, credentials) = common::stores();
    let credential = seed_credential(&credentials, Utc::now() - ChronoDuration::seconds(1));
    let applet = seed_authed_applet(&applets, credential.id);

    let unit =
        ExecutionUnit::build(&applet, catalog, applets.clone(), credentials.clone()).unwrap();
    let handles = unit.handles();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    handles.send_cancel().await;
    task.await.unwrap();

    let seen = capture.seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|token| token == "fresh_token"));

    let stored = credentials.get(credential.id).unwrap().unwrap();
    assert_eq!(stored.access_token, "fresh_token");
}

/// A credential with a future expiry is used as-is; the refresh endpoint is
/// never contacted.
#[tokio::test]
async fn fresh_credential_is_not_refreshed() {
    let mut server = mockito::Server::new_async().await;
    let refresh_mock = server
        .mock("POST", "/refresh")
        .expect(0)
        .create_async()
        .await;

    let capture = Arc::new(TokenCapture {
        seen: Mutex::new(Vec::new()),
    });
    let catalog = common::catalog(vec![authed_provider(
        Some(format!("{}/refresh", server.url())),
        capture.clone(),
    )]);
    let (applets, credentials) = common::stores();
    let credential = seed_credential(&credentials, Utc::now() + ChronoDuration::hours(1));
    let applet = seed_authed_applet(&applets, credential.id);

    let unit = ExecutionUnit::build(&applet, catalog, applets, credentials).unwrap();
    let handles = unit.handles();
    let task = tokio::spawn(unit.run(RunLog::sink(applet.id)));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    handles.send_cancel().await;
    task.await.unwrap();

    let seen = capture.seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|token| token == "stale_token"));
    refresh_mock.assert_async().await;
}
