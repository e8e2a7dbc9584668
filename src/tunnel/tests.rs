//! Unit tests for the session manager, dial wait, forwards and connectors.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use super::*;
use crate::error::ProviderError;
use crate::supervisor::TaskSupervisor;
use crate::test_support::{
    FakeForwardTransport, FakeSession, FakeSessionFactory, provider_config,
};

fn temp_dir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");
    (dir, path)
}

fn forward_request(root: &Utf8PathBuf, hostname: &str) -> ForwardRequest {
    ForwardRequest {
        hostname: hostname.to_owned(),
        ssh_port: 2222,
        remote_socket: String::from("/var/run/docker.sock"),
        local_socket: root.join(hostname).join("daemon-forward.sock"),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_session() {
    let factory = FakeSessionFactory::new(FakeSession::new("fly-provider-a"))
        .with_delay(Duration::from_millis(100));
    let connects = factory.connect_count();
    let manager = Arc::new(TunnelManager::new(factory));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let shared = Arc::clone(&manager);
            tokio::spawn(async move { shared.session().await.map(|s| s.hostname().to_owned()) })
        })
        .collect();
    for handle in handles {
        let hostname = handle.await.expect("join").expect("session");
        assert_eq!(hostname, "fly-provider-a");
    }

    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert!(manager.is_connected());
}

#[tokio::test]
async fn failed_session_construction_can_be_retried() {
    let factory = FakeSessionFactory::new(FakeSession::new("fly-provider-a")).failing_connects(1);
    let connects = factory.connect_count();
    let manager = TunnelManager::new(factory);

    let err = manager.session().await.err().expect("first connect fails");
    assert!(matches!(err, TunnelError::Login { .. }));
    assert!(!manager.is_connected());

    manager.session().await.expect("second connect succeeds");
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn wait_for_dial_retries_until_success() {
    let factory = FakeSessionFactory::new(FakeSession::new("fly-provider-a").failing_dials(1));
    let session = factory.session();
    let manager = TunnelManager::new(factory);
    let started = Instant::now();

    manager
        .wait_for_dial("t1", 2222, Duration::from_secs(10))
        .await
        .expect("second attempt succeeds");

    assert_eq!(session.dials().len(), 2);
    let elapsed = started.elapsed();
    assert!(elapsed >= DIAL_RETRY_INTERVAL, "retried too soon: {elapsed:?}");
    assert!(elapsed < DIAL_RETRY_INTERVAL * 2, "retried too late: {elapsed:?}");
}

#[rstest]
#[case::short(Duration::from_millis(2_500))]
#[case::exact_multiple(Duration::from_secs(3))]
#[tokio::test(start_paused = true)]
async fn wait_for_dial_times_out_at_the_limit(#[case] limit: Duration) {
    let factory =
        FakeSessionFactory::new(FakeSession::new("fly-provider-a").failing_dials(usize::MAX));
    let manager = TunnelManager::new(factory);
    let started = Instant::now();

    let err = manager
        .wait_for_dial("t1", 2222, limit)
        .await
        .expect_err("dial never succeeds");

    let elapsed = started.elapsed();
    assert!(matches!(err, ProviderError::Timeout { .. }), "unexpected: {err}");
    assert!(elapsed >= limit, "returned early: {elapsed:?}");
    assert!(elapsed < limit + DIAL_RETRY_INTERVAL, "returned late: {elapsed:?}");
}

#[tokio::test]
async fn concurrent_ensure_forward_starts_one_transport() {
    let (_guard, root) = temp_dir();
    let transport = FakeForwardTransport::new();
    let forwarder = Arc::new(SocketForwarder::new(
        Arc::new(transport.clone()),
        Arc::new(TaskSupervisor::new()),
    ));
    let session: Arc<dyn TunnelSession> = Arc::new(FakeSession::new("fly-provider-a"));

    let first = {
        let (fwd, sess) = (Arc::clone(&forwarder), Arc::clone(&session));
        let req = forward_request(&root, "t1");
        tokio::spawn(async move { fwd.ensure_forward(sess, req).await })
    };
    let second = {
        let (fwd, sess) = (Arc::clone(&forwarder), Arc::clone(&session));
        let req = forward_request(&root, "t1");
        tokio::spawn(async move { fwd.ensure_forward(sess, req).await })
    };

    first.await.expect("join").expect("first caller sees ready");
    second.await.expect("join").expect("second caller sees ready");
    assert_eq!(transport.runs(), 1);
}

#[tokio::test]
async fn failed_forward_cleans_up_and_restarts() {
    let (_guard, root) = temp_dir();
    let transport = FakeForwardTransport::new();
    let supervisor = Arc::new(TaskSupervisor::new());
    let forwarder = SocketForwarder::new(Arc::new(transport.clone()), Arc::clone(&supervisor));
    let session: Arc<dyn TunnelSession> = Arc::new(FakeSession::new("fly-provider-a"));
    let request = forward_request(&root, "t1");

    forwarder
        .ensure_forward(Arc::clone(&session), request.clone())
        .await
        .expect("forward starts");
    transport.break_forward();
    let failure = supervisor.next_failure().await.expect("failure recorded");
    assert_eq!(failure.task, "forward:t1");
    assert!(!root.join("t1").exists(), "forward directory should be removed");

    forwarder
        .ensure_forward(session, request)
        .await
        .expect("forward restarts");
    assert_eq!(transport.runs(), 2);
}

#[tokio::test]
async fn forward_start_failure_is_returned() {
    let (_guard, root) = temp_dir();
    let transport = FakeForwardTransport::new().failing_starts(1);
    let forwarder = SocketForwarder::new(
        Arc::new(transport.clone()),
        Arc::new(TaskSupervisor::new()),
    );
    let session: Arc<dyn TunnelSession> = Arc::new(FakeSession::new("fly-provider-a"));

    let err = forwarder
        .ensure_forward(session, forward_request(&root, "t1"))
        .await
        .expect_err("transport refuses");

    assert!(matches!(err, TunnelError::Forward { .. }));
    assert!(!root.join("t1").exists());
}

#[tokio::test]
async fn forwarded_connector_reaches_local_socket() {
    let (_guard, root) = temp_dir();
    let sessions = FakeSessionFactory::new(FakeSession::new("fly-provider-a"));
    let tunnel = Arc::new(TunnelManager::new(sessions));
    let supervisor = Arc::new(TaskSupervisor::new());
    let transport = FakeForwardTransport::new();
    let connector = ForwardedSocketConnector::new(
        tunnel,
        SocketForwarder::new(Arc::new(transport.clone()), supervisor),
        &root,
        "/var/run/docker.sock",
        2222,
    );

    let path = connector.ensure_socket("t1").await.expect("socket");
    assert_eq!(path, root.join("t1").join("daemon-forward.sock"));

    let mut stream = connector.connect("t1").await.expect("connect");
    stream.write_all(b"ping").await.expect("write");
    let mut reply = [0_u8; 4];
    stream.read_exact(&mut reply).await.expect("read");
    assert_eq!(&reply, b"ping");
    assert_eq!(transport.runs(), 1);
}

#[tokio::test]
async fn direct_connector_dials_daemon_port() {
    let sessions = FakeSessionFactory::new(FakeSession::new("fly-provider-a"));
    let session = sessions.session();
    let connector = DirectDialConnector::new(Arc::new(TunnelManager::new(sessions)), 2375);

    connector.connect("t1").await.expect("dial");

    assert_eq!(session.dials(), [(String::from("t1"), 2375)]);
}

#[rstest]
fn ssh_args_forward_remote_socket_through_proxy() {
    let transport = SshForwardTransport::new("ssh", "daytona");
    let request = ForwardRequest {
        hostname: String::from("t1"),
        ssh_port: 2222,
        remote_socket: String::from("/var/run/docker.sock"),
        local_socket: Utf8PathBuf::from("/tmp/socks/t1/daemon-forward.sock"),
    };

    let args: Vec<String> = transport
        .ssh_args("tailscale nc %h %p", &request)
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    assert_eq!(args.get(..4), Some(&["-N", "-T", "-p", "2222"].map(String::from)[..]));
    assert!(args.contains(&String::from("ProxyCommand=tailscale nc %h %p")));
    assert!(args.contains(&String::from("ExitOnForwardFailure=yes")));
    assert_eq!(
        args.iter().rev().take(2).cloned().collect::<Vec<_>>(),
        [
            String::from("daytona@t1"),
            String::from("/tmp/socks/t1/daemon-forward.sock:/var/run/docker.sock"),
        ]
    );
}

#[tokio::test]
async fn tailscale_factory_reports_missing_daemon_binary() {
    let (_guard, root) = temp_dir();
    let mut config = provider_config(root.as_str());
    config.tailscaled_bin = root.join("no-such-tailscaled").into_string();
    let factory = TailscaleSessionFactory::from_config(&config);

    let err = factory.connect().await.err().expect("spawn should fail");

    assert!(matches!(err, TunnelError::Spawn { .. }), "unexpected: {err}");
    assert_no_session_state(&root);
}

#[tokio::test]
async fn tailscale_factory_gives_up_when_daemon_keeps_exiting() {
    let (_guard, root) = temp_dir();
    let mut config = provider_config(root.as_str());
    config.tailscaled_bin = String::from("false");
    let factory = TailscaleSessionFactory::from_config(&config);

    let err = factory.connect().await.err().expect("daemon exits at once");

    let TunnelError::Login { message } = &err else {
        panic!("expected login failure, got {err}");
    };
    assert!(message.contains("exited"), "message: {message}");
    assert_no_session_state(&root);
}

fn assert_no_session_state(root: &Utf8Path) {
    let sessions = root.join("tsnet");
    let leftovers = std::fs::read_dir(&sessions)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "state left under {sessions}");
}
