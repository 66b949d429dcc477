//! Router against a real in-process server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_auth::{async_trait, AuthError, Authenticator, LoginResponse};
use burrow_client::{
    AppConfig, ClientConfig, ClientError, ClientStatus, Fault, HttpAuthenticator, Router,
    RouterState, RunMode, StatusEvent,
};
use burrow_lib::{ServerAddrs, ServerConfig, ServerHandle, TunnelServer};
use burrow_proto::{
    read_control_request, write_heartbeat_ack, write_new_app_response, AppAssignment,
    ControlRequest, NewAppResponse,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

struct Server {
    addrs: ServerAddrs,
    handle: ServerHandle,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

async fn start_server(config: ServerConfig) -> Server {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
    let server = TunnelServer::bind(config.with_jwt_secret("router-test"))
        .await
        .unwrap();
    let addrs = server.addrs();
    let handle = server.handle();
    tokio::spawn(server.run());
    Server { addrs, handle }
}

/// Echo service standing in for the internal target.
async fn echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

fn client_config(server: &ServerAddrs, target: SocketAddr, cache: &tempfile::TempDir) -> ClientConfig {
    ClientConfig::builder()
        .server("127.0.0.1")
        .ports(
            server.config.port(),
            server.provider.port(),
            server.web.map(|w| w.port()).unwrap_or(0),
        )
        .app(AppConfig::new(target.ip().to_string(), target.port()))
        .cache_path(cache.path().join("client.cache"))
        .reconnect_interval(Duration::from_millis(100))
        .connect_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

async fn next_status(rx: &mut UnboundedReceiver<StatusEvent>, status: ClientStatus) -> StatusEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("status channel closed");
            if event.status == status {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {:?} event", status))
}

fn public_port(event: &StatusEvent) -> u16 {
    // "1: 127.0.0.1:PORT => host:port"
    let line = &event.tunnels[0];
    let public = line.split(" => ").next().unwrap();
    public.rsplit(':').next().unwrap().parse().unwrap()
}

async fn round_trip(port: u16, msg: &[u8]) {
    let mut consumer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    consumer.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    timeout(Duration::from_secs(5), consumer.read_exact(&mut buf))
        .await
        .expect("echo through tunnel")
        .unwrap();
    assert_eq!(buf, msg);
}

/// Delegates to the HTTP login but counts calls.
struct CountingAuth {
    inner: HttpAuthenticator,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Authenticator for CountingAuth {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.login(username, password).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consumers_reach_target_through_router() {
    let server = start_server(ServerConfig::ephemeral().with_anonymous_login(true)).await;
    let target = echo_target().await;
    let cache = tempfile::tempdir().unwrap();

    let mut router = Router::new(client_config(&server.addrs, target, &cache)).unwrap();
    let mut status = router.subscribe();
    let handle = router.handle();
    assert_eq!(handle.state(), RouterState::LoggingIn);
    let task = tokio::spawn(router.run());

    let started = next_status(&mut status, ClientStatus::Started).await;
    assert_eq!(started.tunnels.len(), 1);
    assert!(started.tunnels[0].starts_with("1: 127.0.0.1:"));
    assert!(started.tunnels[0].ends_with(&format!("=> {}", target)));
    let port = public_port(&started);

    // Sequential consumers rely on replenishment
    for i in 0..3 {
        round_trip(port, format!("sequential-{}", i).as_bytes()).await;
    }

    let mut consumers = Vec::new();
    for i in 0..6 {
        consumers.push(tokio::spawn(async move {
            round_trip(port, format!("concurrent-{}", i).as_bytes()).await;
        }));
    }
    for c in consumers {
        c.await.unwrap();
    }

    let client_id = handle.client_id().unwrap();
    assert!(server.handle.registry().contains(client_id));
    assert_eq!(handle.state(), RouterState::Connected);
    handle.close().await;
    timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    next_status(&mut status, ClientStatus::Stopped).await;
    assert_eq!(handle.state(), RouterState::Closing);

    let registry = server.handle.registry().clone();
    timeout(Duration::from_secs(5), async {
        while registry.contains(client_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("close request should remove the session");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login_error_before_connecting_is_final() {
    let server = start_server(ServerConfig::ephemeral()).await;
    let target = echo_target().await;
    let cache = tempfile::tempdir().unwrap();

    let mut router = Router::new(client_config(&server.addrs, target, &cache)).unwrap();
    let mut status = router.subscribe();
    let result = timeout(Duration::from_secs(10), router.run()).await.unwrap();

    assert!(matches!(result, Err(ClientError::Login(_))));
    next_status(&mut status, ClientStatus::LoginError).await;
    next_status(&mut status, ClientStatus::Stopped).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_login_credentials() {
    let server = start_server(ServerConfig::ephemeral().with_user("carol", "pw")).await;
    let target = echo_target().await;
    let cache = tempfile::tempdir().unwrap();

    let mut config = client_config(&server.addrs, target, &cache);
    config.login = Some(burrow_client::LoginInfo {
        username: "carol".to_string(),
        password: "pw".to_string(),
    });
    let mut router = Router::new(config).unwrap();
    let mut status = router.subscribe();
    let handle = router.handle();
    tokio::spawn(router.run());

    let started = next_status(&mut status, ClientStatus::Started).await;
    round_trip(public_port(&started), b"carol").await;
    handle.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cached_token_skips_login() {
    let server = start_server(ServerConfig::ephemeral().with_anonymous_login(true)).await;
    let target = echo_target().await;
    let cache = tempfile::tempdir().unwrap();
    let config = client_config(&server.addrs, target, &cache);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut first_id = None;
    for _ in 0..2 {
        let auth = CountingAuth {
            inner: HttpAuthenticator::new(config.login_url(), Duration::from_secs(2)).unwrap(),
            calls: calls.clone(),
        };
        let mut router = Router::new(config.clone())
            .unwrap()
            .with_authenticator(Arc::new(auth));
        let mut status = router.subscribe();
        let handle = router.handle();
        let task = tokio::spawn(router.run());

        next_status(&mut status, ClientStatus::Started).await;
        let id = handle.client_id().unwrap();
        assert_eq!(*first_id.get_or_insert(id), id, "same identity on both runs");
        handle.close().await;
        task.await.unwrap().unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "second run used the cache");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_side_teardown_triggers_restart() {
    let server = start_server(ServerConfig::ephemeral().with_anonymous_login(true)).await;
    let target = echo_target().await;
    let cache = tempfile::tempdir().unwrap();

    let mut router = Router::new(client_config(&server.addrs, target, &cache)).unwrap();
    let mut status = router.subscribe();
    let handle = router.handle();
    tokio::spawn(router.run());

    next_status(&mut status, ClientStatus::Started).await;
    let client_id = handle.client_id().unwrap();

    // Dropping the session closes the pooled reverse connection under the client
    assert!(server.handle.registry().close_client(client_id));
    next_status(&mut status, ClientStatus::Stopped).await;

    let restarted = next_status(&mut status, ClientStatus::Started).await;
    round_trip(public_port(&restarted), b"after restart").await;
    handle.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_target_dial_failure_ends_single_shot_run() {
    let server = start_server(ServerConfig::ephemeral().with_anonymous_login(true)).await;
    // Reserve a port, then free it so nothing listens there
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let cache = tempfile::tempdir().unwrap();

    let mut router = Router::new(client_config(&server.addrs, dead, &cache))
        .unwrap()
        .with_run_mode(RunMode {
            always_reconnect: false,
            single_shot: true,
        });
    let mut status = router.subscribe();
    let task = tokio::spawn(router.run());

    let started = next_status(&mut status, ClientStatus::Started).await;
    let _consumer = TcpStream::connect(("127.0.0.1", public_port(&started)))
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    match result {
        Err(ClientError::Fault(Fault::TargetDial { app_id, .. })) => assert_eq!(app_id, 1),
        other => panic!("expected target dial fault, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_server_never_connects() {
    let closed = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let cache = tempfile::tempdir().unwrap();
    let addrs = ServerAddrs {
        config: closed,
        provider: closed,
        web: Some(closed),
    };
    let router = Router::new(client_config(&addrs, closed, &cache)).unwrap();
    let result = timeout(Duration::from_secs(10), router.run()).await.unwrap();
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_always_reconnect_retries_until_closed() {
    let closed = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let cache = tempfile::tempdir().unwrap();
    let addrs = ServerAddrs {
        config: closed,
        provider: closed,
        web: Some(closed),
    };
    let mut router = Router::new(client_config(&addrs, closed, &cache))
        .unwrap()
        .with_run_mode(RunMode {
            always_reconnect: true,
            single_shot: false,
        });
    let mut status = router.subscribe();
    let handle = router.handle();
    let task = tokio::spawn(router.run());

    // Several failed attempts, each reporting Stopped
    for _ in 0..3 {
        next_status(&mut status, ClientStatus::Stopped).await;
    }
    assert!(!task.is_finished());

    handle.close().await;
    timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

/// Hands out a fixed token without any HTTP endpoint.
struct FixedToken;

#[async_trait]
impl Authenticator for FixedToken {
    async fn login(&self, _username: &str, _password: &str) -> Result<LoginResponse, AuthError> {
        Ok(LoginResponse {
            token: "fixed".to_string(),
            user_id: 5,
        })
    }
}

/// Control endpoint that records the opcode of every registration. Only the
/// first `accept` registrations are answered; later ones are refused by closing.
async fn scripted_control(accept: usize) -> (SocketAddr, Arc<Mutex<Vec<bool>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let record = record.clone();
            tokio::spawn(async move {
                match read_control_request(&mut stream).await {
                    Ok(ControlRequest::NewApp { reconnect, .. }) => {
                        let answered = {
                            let mut seen = record.lock().unwrap();
                            seen.push(reconnect);
                            seen.len() <= accept
                        };
                        if answered {
                            let response = NewAppResponse {
                                client_id: 5,
                                assignments: vec![AppAssignment { app_id: 1, port: 40001 }],
                            };
                            let _ = write_new_app_response(&mut stream, &response).await;
                        }
                    }
                    Ok(ControlRequest::Heartbeat { .. }) => {
                        let _ = write_heartbeat_ack(&mut stream).await;
                    }
                    _ => {}
                }
            });
        }
    });
    (addr, seen)
}

/// Provider endpoint that takes the hello and hangs up, ending the session.
async fn hanging_up_provider() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut hello = [0u8; 3];
            let _ = stream.read_exact(&mut hello).await;
        }
    });
    addr
}

async fn wait_for_registrations(seen: &Arc<Mutex<Vec<bool>>>, count: usize) -> Vec<bool> {
    timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = seen.lock().unwrap().clone();
            if snapshot.len() >= count {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registrations")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_starts_keep_the_new_app_opcode() {
    let (control, seen) = scripted_control(0).await;
    let target = echo_target().await;
    let cache = tempfile::tempdir().unwrap();
    let addrs = ServerAddrs {
        config: control,
        provider: control,
        web: None,
    };

    let router = Router::new(client_config(&addrs, target, &cache))
        .unwrap()
        .with_authenticator(Arc::new(FixedToken))
        .with_run_mode(RunMode {
            always_reconnect: true,
            single_shot: false,
        });
    let handle = router.handle();
    let task = tokio::spawn(router.run());

    let opcodes = wait_for_registrations(&seen, 3).await;
    assert!(opcodes.iter().all(|reconnect| !reconnect), "{:?}", opcodes);
    assert_ne!(handle.state(), RouterState::Connected);

    handle.close().await;
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_opcode_follows_a_started_session() {
    let (control, seen) = scripted_control(1).await;
    let provider = hanging_up_provider().await;
    let target = echo_target().await;
    let cache = tempfile::tempdir().unwrap();
    let addrs = ServerAddrs {
        config: control,
        provider,
        web: None,
    };

    let mut router = Router::new(client_config(&addrs, target, &cache))
        .unwrap()
        .with_authenticator(Arc::new(FixedToken));
    let mut status = router.subscribe();
    let handle = router.handle();
    let task = tokio::spawn(router.run());

    next_status(&mut status, ClientStatus::Started).await;
    let opcodes = wait_for_registrations(&seen, 3).await;
    assert_eq!(&opcodes[..3], &[false, true, true]);

    handle.close().await;
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}
