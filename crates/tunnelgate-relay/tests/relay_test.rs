//! End-to-end relay tests over loopback TCP
//!
//! Every relay binds port 0 on 127.0.0.1; tests learn the actual ports from
//! the lifecycle events instead of guessing them.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tunnelgate_relay::{LinkError, LinkKind, RelayConfig, RelayError, RelayEvent, RelayServer};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

struct TestRelay {
    control_addr: SocketAddr,
    events: broadcast::Receiver<RelayEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), RelayError>>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Self {
        init_tracing();

        let server = RelayServer::bind(config).await.expect("relay should bind");
        let control_addr = server.control_addr();
        let events = server.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        Self {
            control_addr,
            events,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn start_default() -> Self {
        Self::start(local_config()).await
    }

    /// Wait for the first event matching `pred`, skipping others.
    async fn expect_event<F>(&mut self, mut pred: F) -> RelayEvent
    where
        F: FnMut(&RelayEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async move {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for relay event")
    }

    /// Connect an agent and return it with the data port opened for it.
    async fn connect_agent(&mut self) -> (TcpStream, SocketAddr) {
        let agent = TcpStream::connect(self.control_addr)
            .await
            .expect("agent should connect");
        let data_addr = match self
            .expect_event(|e| matches!(e, RelayEvent::WaitingForUser { .. }))
            .await
        {
            RelayEvent::WaitingForUser { data_addr } => data_addr,
            _ => unreachable!(),
        };
        (agent, data_addr)
    }

    async fn connect_user(&mut self, data_addr: SocketAddr) -> TcpStream {
        let user = TcpStream::connect(data_addr)
            .await
            .expect("user should connect");
        self.expect_event(|e| matches!(e, RelayEvent::UserConnected { .. }))
            .await;
        user
    }

    async fn stop(mut self) -> Result<(), RelayError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("relay did not stop")
            .expect("relay task panicked")
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tunnelgate_relay=debug,tunnelgate_link=debug")
        .with_test_writer()
        .try_init();
}

fn local_config() -> RelayConfig {
    RelayConfig::new(0, 0).with_bind_ip("127.0.0.1".parse().unwrap())
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading")
        .expect("read failed");
    buf
}

async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(QUIET, stream.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(n)) => panic!("expected silence, got {} bytes: {:?}", n, &buf[..n]),
        Ok(Err(e)) => panic!("expected silence, got error: {}", e),
    }
}

async fn assert_closed_by_relay(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("relay did not close the connection");
    match read {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected close, got {} bytes: {:?}", n, &buf[..n]),
    }
}

#[tokio::test]
async fn test_hello_heartbeat_world_scenario() {
    let mut relay = TestRelay::start_default().await;
    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;

    user.write_all(b"hello").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 5).await, b"hello");

    agent.write_all(b"pi").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 2).await, b"pi");
    assert_silent(&mut user).await;

    agent.write_all(b"world").await.unwrap();
    assert_eq!(read_exactly(&mut user, 5).await, b"world");

    drop(user);
    assert_closed_by_relay(&mut agent).await;

    let closed = relay
        .expect_event(|e| matches!(e, RelayEvent::SessionClosed { .. }))
        .await;
    match closed {
        RelayEvent::SessionClosed {
            failed,
            bytes_to_agent,
            bytes_to_user,
            ..
        } => {
            assert_eq!(failed, LinkKind::Data);
            assert_eq!(bytes_to_agent, 5);
            assert_eq!(bytes_to_user, 5);
        }
        _ => unreachable!(),
    }

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_answered_before_pairing() {
    let mut relay = TestRelay::start_default().await;
    let (mut agent, _data_addr) = relay.connect_agent().await;

    for _ in 0..3 {
        agent.write_all(b"pi").await.unwrap();
        assert_eq!(read_exactly(&mut agent, 2).await, b"pi");
    }

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_single_byte_is_payload() {
    let mut relay = TestRelay::start_default().await;
    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;

    agent.write_all(b"p").await.unwrap();
    assert_eq!(read_exactly(&mut user, 1).await, b"p");
    assert_silent(&mut agent).await;

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_order_preserved_in_both_directions() {
    let mut relay = TestRelay::start_default().await;
    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;

    let mut sent = Vec::new();
    for i in 0..20u8 {
        let chunk = format!("user-chunk-{:02};", i).into_bytes();
        user.write_all(&chunk).await.unwrap();
        sent.extend_from_slice(&chunk);
    }
    assert_eq!(read_exactly(&mut agent, sent.len()).await, sent);

    let mut sent = Vec::new();
    for i in 0..20u8 {
        // Leading 'x' keeps chunks from looking like probes
        let chunk = format!("x-agent-chunk-{:02};", i).into_bytes();
        agent.write_all(&chunk).await.unwrap();
        sent.extend_from_slice(&chunk);
    }
    assert_eq!(read_exactly(&mut user, sent.len()).await, sent);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_large_transfer_is_forwarded_intact() {
    let mut relay = TestRelay::start_default().await;
    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;

    // Several read buffers' worth, starting with a byte that is not 'p'
    let payload: Vec<u8> = (0..64 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
    let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
            user.write_all(&payload).await.unwrap();
            user
        })
    };

    assert_eq!(read_exactly(&mut agent, payload.len()).await, payload);
    let _user = writer.await.unwrap();

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_agent_drop_closes_user_and_restarts() {
    let mut relay = TestRelay::start_default().await;
    let (agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;

    drop(agent);
    assert_closed_by_relay(&mut user).await;

    let disconnected = relay
        .expect_event(|e| matches!(e, RelayEvent::AgentDisconnected { .. }))
        .await;
    assert!(matches!(
        disconnected,
        RelayEvent::AgentDisconnected {
            reason: LinkError::PeerClosed,
            ..
        } | RelayEvent::AgentDisconnected {
            reason: LinkError::Closed,
            ..
        }
    ));
    relay
        .expect_event(|e| matches!(e, RelayEvent::WaitingForAgent { .. }))
        .await;

    // A fresh agent gets a fully working pairing
    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;

    agent.write_all(b"pi").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 2).await, b"pi");

    user.write_all(b"again").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 5).await, b"again");
    agent.write_all(b"back").await.unwrap();
    assert_eq!(read_exactly(&mut user, 4).await, b"back");

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_unpaired_agent_drop_restarts() {
    let mut relay = TestRelay::start_default().await;
    let (agent, _data_addr) = relay.connect_agent().await;

    drop(agent);
    relay
        .expect_event(|e| matches!(e, RelayEvent::AgentDisconnected { .. }))
        .await;

    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;
    user.write_all(b"ok").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 2).await, b"ok");

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_second_user_is_not_served() {
    let mut relay = TestRelay::start_default().await;
    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut first = relay.connect_user(data_addr).await;

    match TcpStream::connect(data_addr).await {
        // Listener released after the first accept
        Err(_) => {}
        Ok(mut second) => {
            agent.write_all(b"only-first").await.unwrap();
            assert_eq!(read_exactly(&mut first, 10).await, b"only-first");
            let mut buf = [0u8; 16];
            match tokio::time::timeout(QUIET, second.read(&mut buf)).await {
                Err(_) | Ok(Ok(0)) | Ok(Err(_)) => {}
                Ok(Ok(n)) => panic!("second user received {} bytes", n),
            }
        }
    }

    first.write_all(b"still-paired").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 12).await, b"still-paired");

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_agent_times_out() {
    let config = local_config().with_control_read_timeout(Duration::from_millis(300));
    let mut relay = TestRelay::start(config).await;
    let (mut agent, _data_addr) = relay.connect_agent().await;

    let disconnected = relay
        .expect_event(|e| matches!(e, RelayEvent::AgentDisconnected { .. }))
        .await;
    assert_eq!(
        disconnected,
        RelayEvent::AgentDisconnected {
            peer: agent.local_addr().unwrap(),
            reason: LinkError::Timeout(Duration::from_millis(300)),
        }
    );
    assert_closed_by_relay(&mut agent).await;

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_heartbeats_keep_agent_alive() {
    let config = local_config().with_control_read_timeout(Duration::from_millis(400));
    let mut relay = TestRelay::start(config).await;
    let (mut agent, data_addr) = relay.connect_agent().await;

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.write_all(b"pi").await.unwrap();
        assert_eq!(read_exactly(&mut agent, 2).await, b"pi");
    }

    // Still supervised: the data port is still served
    let mut user = relay.connect_user(data_addr).await;
    user.write_all(b"alive").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 5).await, b"alive");

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_idle_user_times_out() {
    let config = local_config().with_data_read_timeout(Duration::from_millis(300));
    let mut relay = TestRelay::start(config).await;
    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;

    let closed = relay
        .expect_event(|e| matches!(e, RelayEvent::SessionClosed { .. }))
        .await;
    match closed {
        RelayEvent::SessionClosed { failed, reason, .. } => {
            assert_eq!(failed, LinkKind::Data);
            assert_eq!(reason, LinkError::Timeout(Duration::from_millis(300)));
        }
        _ => unreachable!(),
    }

    assert_closed_by_relay(&mut user).await;
    assert_closed_by_relay(&mut agent).await;

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_links() {
    let mut relay = TestRelay::start_default().await;
    let (mut agent, data_addr) = relay.connect_agent().await;
    let mut user = relay.connect_user(data_addr).await;

    relay.stop().await.unwrap();

    assert_closed_by_relay(&mut agent).await;
    assert_closed_by_relay(&mut user).await;
}

#[tokio::test]
async fn test_shutdown_while_waiting_for_agent() {
    let mut relay = TestRelay::start_default().await;
    relay
        .expect_event(|e| matches!(e, RelayEvent::WaitingForAgent { .. }))
        .await;
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_data_port_bind_failure_is_fatal() {
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let config = RelayConfig::new(0, taken).with_bind_ip("127.0.0.1".parse().unwrap());
    let relay = TestRelay::start(config).await;
    let _agent = TcpStream::connect(relay.control_addr).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), relay.task)
        .await
        .expect("relay should stop on bind failure")
        .expect("relay task panicked");
    match result {
        Err(RelayError::BindError { port, .. }) => assert_eq!(port, taken),
        other => panic!("expected bind error, got {:?}", other),
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_fixed_data_port_is_rebound_after_agent_failures() {
    let data_port = free_port().await;
    let config = RelayConfig::new(0, data_port).with_bind_ip("127.0.0.1".parse().unwrap());
    let mut relay = TestRelay::start(config).await;

    // Agent leaves before any user shows up
    let (agent, data_addr) = relay.connect_agent().await;
    assert_eq!(data_addr.port(), data_port);
    drop(agent);
    relay
        .expect_event(|e| matches!(e, RelayEvent::AgentDisconnected { .. }))
        .await;

    // Same port again; this agent leaves while paired
    let (mut agent, data_addr) = relay.connect_agent().await;
    assert_eq!(data_addr.port(), data_port);
    let mut user = relay.connect_user(data_addr).await;
    user.write_all(b"x1").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 2).await, b"x1");
    drop(agent);
    assert_closed_by_relay(&mut user).await;
    relay
        .expect_event(|e| matches!(e, RelayEvent::AgentDisconnected { .. }))
        .await;

    // And once more, fully working
    let (mut agent, data_addr) = relay.connect_agent().await;
    assert_eq!(data_addr.port(), data_port);
    let mut user = relay.connect_user(data_addr).await;
    user.write_all(b"x2").await.unwrap();
    assert_eq!(read_exactly(&mut agent, 2).await, b"x2");
    agent.write_all(b"y2").await.unwrap();
    assert_eq!(read_exactly(&mut user, 2).await, b"y2");

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_interrupts_data_port_bind_retry() {
    let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let config = RelayConfig::new(0, taken).with_bind_ip("127.0.0.1".parse().unwrap());
    let mut relay = TestRelay::start(config).await;
    let _agent = TcpStream::connect(relay.control_addr).await.unwrap();
    relay
        .expect_event(|e| matches!(e, RelayEvent::AgentConnected { .. }))
        .await;

    // The bind keeps retrying for ~2s; shutdown must not wait for it
    if let Some(shutdown) = relay.shutdown.take() {
        let _ = shutdown.send(());
    }
    let result = tokio::time::timeout(Duration::from_millis(500), relay.task)
        .await
        .expect("shutdown waited for the bind retry")
        .expect("relay task panicked");
    assert!(result.is_ok(), "expected clean shutdown, got {:?}", result);
}
