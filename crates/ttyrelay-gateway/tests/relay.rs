// End-to-end: registry, real shells and WebSocket clients on loopback ports.
#![cfg(unix)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use ttyrelay_core::config::RelayConfig;
use ttyrelay_gateway::{EventStream, GatewayError, SessionEvent, SessionRegistry};
use ttyrelay_protocol::{ClientMessage, HostMessage};
use ttyrelay_terminal::{IntrospectionError, Introspector, ShellConfig};

const WAIT: Duration = Duration::from_secs(10);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

// Every test gets its own port block so they can run in parallel.
fn config(base_port: u16, slots: u16) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.bridge.base_port = base_port;
    config.bridge.secondary_slots = slots;
    config.tracker.interval_ms = 100;
    config
}

fn echo_shell(dir: &tempfile::TempDir) -> ShellConfig {
    ShellConfig::new("/bin/sh", dir.path()).with_args(["-c", "exec cat"])
}

async fn connect(port: u16, path: &str, origin: Option<&str>) -> Result<Ws, WsError> {
    let mut req = format!("ws://127.0.0.1:{port}{path}")
        .into_client_request()
        .unwrap();
    if let Some(origin) = origin {
        req.headers_mut()
            .insert("origin", HeaderValue::from_str(origin).unwrap());
    }
    tokio_tungstenite::connect_async(req).await.map(|(ws, _)| ws)
}

fn http_status(err: WsError) -> u16 {
    match err {
        WsError::Http(resp) => resp.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

/// Read binary frames until `needle` appears in the accumulated output.
async fn read_until(ws: &mut Ws, needle: &str) -> String {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(WAIT, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                seen.extend_from_slice(&data);
                if String::from_utf8_lossy(&seen).contains(needle) {
                    break;
                }
            }
        }
    })
    .await;
    String::from_utf8_lossy(&seen).into_owned()
}

/// Next control message matching `pred`, skipping the rest.
async fn next_host_message(ws: &mut Ws, pred: impl Fn(&HostMessage) -> bool) -> HostMessage {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let msg = HostMessage::decode(text.as_str()).unwrap();
                    if pred(&msg) {
                        return msg;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("control socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for control message")
}

async fn wait_event(
    events: &mut EventStream,
    port: u16,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let ev = events.recv().await.expect("event stream ended");
            if ev.port == port && pred(&ev.event) {
                return ev.event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Everything delivered for `port` within `window`.
async fn collect_events(events: &mut EventStream, port: u16, window: Duration) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    let _ = tokio::time::timeout(window, async {
        while let Some(ev) = events.recv().await {
            if ev.port == port {
                out.push(ev.event);
            }
        }
    })
    .await;
    out
}

#[derive(Debug)]
struct BrokenIntrospector;

#[async_trait]
impl Introspector for BrokenIntrospector {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn cwd(&self, _pid: u32) -> Result<PathBuf, IntrospectionError> {
        Err(IntrospectionError::Parse("no cwd for you".into()))
    }

    async fn foreground_process(&self, _pid: u32) -> Result<String, IntrospectionError> {
        Err(IntrospectionError::Parse("no process either".into()))
    }
}

#[tokio::test]
async fn secondary_ports_fill_in_order_then_exhaust() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _events) = SessionRegistry::new(&config(38100, 2)).unwrap();
    assert_eq!(registry.secondary_ports(), vec![38102, 38103]);

    let primary = registry.spawn_primary(echo_shell(&dir)).await.unwrap();
    assert_eq!(primary.port(), 38100);
    assert_eq!(registry.spawn_secondary(echo_shell(&dir)).await.unwrap(), 38102);
    assert_eq!(registry.spawn_secondary(echo_shell(&dir)).await.unwrap(), 38103);

    let err = registry.spawn_secondary(echo_shell(&dir)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Exhausted { slots: 2 }));
    assert_eq!(registry.sessions().await.len(), 3);

    // A freed slot is handed out again.
    assert!(registry.close(38102).await);
    assert_eq!(registry.spawn_secondary(echo_shell(&dir)).await.unwrap(), 38102);

    registry.close_all().await;
    assert!(registry.sessions().await.is_empty());
}

#[tokio::test]
async fn primary_is_spawned_once() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _events) = SessionRegistry::new(&config(38110, 1)).unwrap();
    registry.spawn_primary(echo_shell(&dir)).await.unwrap();
    let err = registry.spawn_primary(echo_shell(&dir)).await.unwrap_err();
    assert!(matches!(err, GatewayError::PrimaryAlreadySpawned(38110)));
    registry.close_all().await;
}

#[tokio::test]
async fn second_client_is_refused_while_first_keeps_relaying() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _events) = SessionRegistry::new(&config(38120, 1)).unwrap();
    let port = registry.spawn_secondary(echo_shell(&dir)).await.unwrap();

    let mut first = connect(port, "/", Some("file://")).await.unwrap();
    let err = connect(port, "/", Some("file://")).await.unwrap_err();
    assert_eq!(http_status(err), 409);

    first.send(Message::binary(b"still-here\n".to_vec())).await.unwrap();
    let out = read_until(&mut first, "still-here").await;
    assert!(out.contains("still-here"), "output was {out:?}");

    registry.close_all().await;
}

#[tokio::test]
async fn untrusted_origin_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _events) = SessionRegistry::new(&config(38130, 1)).unwrap();
    let port = registry.spawn_secondary(echo_shell(&dir)).await.unwrap();

    let err = connect(port, "/", Some("https://evil.example")).await.unwrap_err();
    assert_eq!(http_status(err), 403);
    let err = connect(port, "/control", Some("https://evil.example"))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 403);

    // The refusal did not take the client slot.
    let ws = connect(port, "/", None).await.unwrap();
    drop(ws);

    registry.close_all().await;
}

#[tokio::test]
async fn resize_is_applied_and_echoed() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, mut events) = SessionRegistry::new(&config(38140, 1)).unwrap();
    let port = registry.spawn_secondary(echo_shell(&dir)).await.unwrap();
    let mut control = connect(port, "/control", Some("null")).await.unwrap();

    for _ in 0..2 {
        control
            .send(Message::text(r#"{"type":"resize","cols":"040","rows":"024"}"#))
            .await
            .unwrap();
        let echoed = next_host_message(&mut control, |m| {
            matches!(m, HostMessage::Resized { .. })
        })
        .await;
        assert_eq!(echoed, HostMessage::Resized { cols: 40, rows: 24 });
        assert_eq!(echoed.encode(), r#"{"type":"resized","cols":"040","rows":"024"}"#);
        let ev = wait_event(&mut events, port, |e| matches!(e, SessionEvent::Resized { .. })).await;
        assert_eq!(ev, SessionEvent::Resized { cols: 40, rows: 24 });
    }

    let session = registry.session(port).await.unwrap();
    let size = session.size();
    assert_eq!((size.cols, size.rows), (40, 24));

    registry.close_all().await;
}

#[tokio::test]
async fn reconnect_reuses_the_same_shell() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, mut events) = SessionRegistry::new(&config(38150, 1)).unwrap();
    let port = registry.spawn_secondary(echo_shell(&dir)).await.unwrap();

    let mut first = connect(port, "/", Some("file://")).await.unwrap();
    let opened = wait_event(&mut events, port, |e| matches!(e, SessionEvent::Opened { .. })).await;
    first.send(Message::binary(b"one\n".to_vec())).await.unwrap();
    read_until(&mut first, "one").await;
    first
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
    let gone = wait_event(&mut events, port, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    assert_eq!(
        gone,
        SessionEvent::Disconnected {
            code: Some(1000),
            reason: "bye".into()
        }
    );

    let mut second = connect(port, "/", Some("file://")).await.unwrap();
    let reopened = wait_event(&mut events, port, |e| matches!(e, SessionEvent::Opened { .. })).await;
    assert_eq!(opened, reopened, "same shell pid after reconnect");
    second.send(Message::binary(b"two\n".to_vec())).await.unwrap();
    let out = read_until(&mut second, "two").await;
    assert!(out.contains("two"), "output was {out:?}");

    registry.close_all().await;
}

#[tokio::test]
async fn shell_exit_reports_closed_once_and_frees_port() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, mut events) = SessionRegistry::new(&config(38160, 1)).unwrap();
    let shell = ShellConfig::new("/bin/sh", dir.path()).with_args(["-c", "sleep 0.3; exit 0"]);
    let port = registry.spawn_secondary(shell).await.unwrap();

    let closed = wait_event(&mut events, port, |e| matches!(e, SessionEvent::Closed { .. })).await;
    assert_eq!(
        closed,
        SessionEvent::Closed {
            exit_code: 0,
            signal: None
        }
    );
    assert!(registry.is_free(port).await);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    let later = collect_events(&mut events, port, Duration::from_millis(500)).await;
    assert!(later.is_empty(), "unexpected events after close: {later:?}");
}

#[tokio::test]
async fn explicit_close_is_quiet_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, mut events) = SessionRegistry::new(&config(38170, 1)).unwrap();
    let port = registry.spawn_secondary(echo_shell(&dir)).await.unwrap();
    let mut client = connect(port, "/", Some("file://")).await.unwrap();
    wait_event(&mut events, port, |e| matches!(e, SessionEvent::Opened { .. })).await;

    assert!(registry.close(port).await);
    assert!(!registry.close(port).await);
    assert!(registry.is_free(port).await);

    // The attached client is told the session is gone.
    let ended = tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    let after = collect_events(&mut events, port, Duration::from_millis(500)).await;
    assert!(after.is_empty(), "events after explicit close: {after:?}");

    // The listener is gone, so the same port can be taken again.
    assert_eq!(registry.spawn_secondary(echo_shell(&dir)).await.unwrap(), port);
    registry.close_all().await;
}

#[tokio::test]
async fn failed_cwd_tracking_falls_back_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _events) =
        SessionRegistry::with_introspector(&config(38180, 1), Arc::new(BrokenIntrospector))
            .unwrap();
    let port = registry.spawn_secondary(echo_shell(&dir)).await.unwrap();
    let control = registry.control(port).await.unwrap();
    let mut host_rx = control.subscribe();

    // Keep the shell busy across several tracker ticks.
    let mut client = connect(port, "/", Some("file://")).await.unwrap();
    for i in 0..10 {
        client
            .send(Message::binary(format!("line {i}\n").into_bytes()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut seen = Vec::new();
    while let Ok(msg) = host_rx.try_recv() {
        seen.push(msg);
    }
    let expected = HostMessage::FallbackCwd {
        path: dir.path().to_string_lossy().into_owned(),
    };
    assert_eq!(seen.iter().filter(|m| **m == expected).count(), 1, "{seen:?}");
    assert!(!seen.iter().any(|m| matches!(m, HostMessage::NewCwd { .. })));

    // A fresh display client asking for state gets the fallback replayed.
    assert!(control.send(ClientMessage::Startup));
    let replay = tokio::time::timeout(WAIT, host_rx.recv()).await.unwrap().unwrap();
    assert_eq!(replay, expected);

    registry.close_all().await;
}

#[tokio::test]
async fn spawn_failure_leaves_slot_free() {
    let (registry, _events) = SessionRegistry::new(&config(38190, 1)).unwrap();
    let shell = ShellConfig::new("/bin/sh", "/no/such/dir/for/ttyrelay");
    let err = registry.spawn_secondary(shell).await.unwrap_err();
    assert!(err.is_spawn_error());
    assert!(registry.is_free(38192).await);
    assert!(registry.sessions().await.is_empty());
}

#[tokio::test]
async fn busy_port_fails_before_any_shell_starts() {
    let dir = tempfile::tempdir().unwrap();
    let _squatter = std::net::TcpListener::bind(("127.0.0.1", 38202)).unwrap();
    let (registry, _events) = SessionRegistry::new(&config(38200, 1)).unwrap();
    let err = registry.spawn_secondary(echo_shell(&dir)).await.unwrap_err();
    assert!(matches!(err, GatewayError::Bind { port: 38202, .. }));
    assert!(registry.is_free(38202).await);
}

#[tokio::test]
async fn concurrent_spawns_never_overbook_secondaries() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _events) = SessionRegistry::new(&config(38210, 2)).unwrap();

    let results = futures_util::future::join_all(
        (0..3).map(|_| registry.spawn_secondary(echo_shell(&dir))),
    )
    .await;

    let mut ports: Vec<u16> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![38212, 38213]);
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(GatewayError::Exhausted { slots: 2 })))
        .count();
    assert_eq!(exhausted, 1);

    // The refused spawn bound nothing past the range.
    assert!(TcpStream::connect(("127.0.0.1", 38214)).await.is_err());
    assert_eq!(registry.sessions().await.len(), 2);

    registry.close_all().await;
}

#[tokio::test]
async fn close_and_spawn_racing_never_share_a_port() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _events) = SessionRegistry::new(&config(38220, 2)).unwrap();
    registry.spawn_secondary(echo_shell(&dir)).await.unwrap();
    registry.spawn_secondary(echo_shell(&dir)).await.unwrap();

    for _ in 0..3 {
        let old_pid = registry.session(38222).await.and_then(|s| s.pid());
        let (closed, spawned) = tokio::join!(
            registry.close(38222),
            registry.spawn_secondary(echo_shell(&dir))
        );
        assert!(closed);

        match spawned {
            // Spawn ran after the close and took the freed slot.
            Ok(port) => {
                assert_eq!(port, 38222);
                let session = registry.session(38222).await.unwrap();
                assert_ne!(session.pid(), old_pid);
            }
            // Spawn ran first, found no slot, then the close freed one.
            Err(GatewayError::Exhausted { .. }) => {
                assert!(registry.is_free(38222).await);
                registry.spawn_secondary(echo_shell(&dir)).await.unwrap();
            }
            Err(other) => panic!("unexpected spawn failure: {other}"),
        }

        let mut ports: Vec<u16> = registry.sessions().await.iter().map(|s| s.port).collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![38222, 38223]);
    }

    registry.close_all().await;
}
