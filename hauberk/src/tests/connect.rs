//! End-to-end connect scenarios against the loopback test server.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::server::{ServerBehavior, TestServer};
use super::test_init;
use crate::auth::Credential;
use crate::client::{
    connect, BoxError, Config, ConnectionInfo, Destination, HostAuthentication,
};
use crate::known_hosts::{HostKeyDecision, KnownHostStatus};
use crate::{ConnectError, Error};

fn config_for(server: &TestServer) -> Config {
    let mut config = Config::new(Destination::new(
        "testuser",
        "127.0.0.1",
        server.addr.port(),
    ));
    config.credentials = vec![Credential::Password("testpassword".to_string())];
    config.known_hosts_path = None;
    config
}

fn seeded_known_hosts(server: &TestServer) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "{}", server.known_hosts_line()).unwrap();
    (dir, path)
}

/// Records what it was shown and returns a fixed decision.
struct Decide {
    decision: HostKeyDecision,
    cancel_inside: bool,
    invoked: AtomicBool,
    seen: Mutex<Option<(KnownHostStatus, ConnectionInfo)>>,
}

impl Decide {
    fn new(decision: HostKeyDecision) -> Arc<Self> {
        Arc::new(Decide {
            decision,
            cancel_inside: false,
            invoked: AtomicBool::new(false),
            seen: Mutex::new(None),
        })
    }
}

#[async_trait]
impl HostAuthentication for Decide {
    async fn authenticate(
        &self,
        status: KnownHostStatus,
        info: &ConnectionInfo,
        cancel: &CancellationToken,
    ) -> Result<HostKeyDecision, BoxError> {
        self.invoked.store(true, Ordering::SeqCst);
        *self.seen.lock().unwrap() = Some((status, info.clone()));
        if self.cancel_inside {
            cancel.cancel();
        }
        Ok(self.decision)
    }
}

fn assert_verification_failed(err: ConnectError) {
    match err {
        ConnectError::Failed(Error::HostKeyVerification { .. }) => {}
        other => panic!("expected HostKeyVerification, got {other:?}"),
    }
}

// S1: a good known-hosts file and a matching password credential; a
// second client with the same settings also connects.
#[tokio::test]
async fn connect_succeeds_with_known_host_and_password() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;
    let (_dir, path) = seeded_known_hosts(&server);

    for _ in 0..2 {
        let mut config = config_for(&server);
        config.known_hosts_path = Some(path.clone());
        let handle = connect(Arc::new(config), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.connection_info().host, "127.0.0.1");
        assert_eq!(handle.connection_info().port, server.addr.port());
        assert!(!handle.connection_info().session_id.is_empty());
        handle.disconnect().await;
    }
}

// S2: an unusable known-hosts path and no callback override.
#[tokio::test]
async fn unknown_host_is_rejected_by_default() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;
    let mut config = config_for(&server);
    config.known_hosts_path = Some(PathBuf::from("/"));

    let err = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap_err();
    assert_verification_failed(err);
}

// S3: the callback sees the classification and the connection details,
// and its Trusted decision lets the connect proceed.
#[tokio::test]
async fn callback_sees_details_and_can_trust() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;
    let callback = Decide::new(HostKeyDecision::Trusted);
    let mut config = config_for(&server);
    config.host_auth = callback.clone();

    let handle = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap();

    let seen = callback.seen.lock().unwrap().take().unwrap();
    assert_eq!(seen.0, KnownHostStatus::Unknown);
    assert_eq!(seen.1.host, "127.0.0.1");
    assert_eq!(seen.1.port, server.addr.port());
    assert_eq!(
        seen.1.server_key.sha256_fingerprint,
        server.sha256_fingerprint()
    );
    assert!(seen.1.server_key.md5_fingerprint.contains(':'));
    handle.disconnect().await;
}

// S4: any rejecting decision fails the connect.
#[tokio::test]
async fn callback_rejections_fail_the_connect() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;
    for decision in [
        HostKeyDecision::Revoked,
        HostKeyDecision::Changed,
        HostKeyDecision::Unknown,
    ] {
        let mut config = config_for(&server);
        config.host_auth = Decide::new(decision);
        let err = connect(Arc::new(config), CancellationToken::new())
            .await
            .unwrap_err();
        assert_verification_failed(err);
    }
}

// S5: AddKnownHost creates the file; the second connect finds the host
// trusted and never consults the callback.
#[tokio::test]
async fn add_known_host_persists() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fresh").join("known_hosts");

    let mut config = config_for(&server);
    config.known_hosts_path = Some(path.clone());
    config.host_auth = Decide::new(HostKeyDecision::AddKnownHost);
    let handle = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap();
    handle.disconnect().await;
    assert!(path.exists());

    let second_callback = Decide::new(HostKeyDecision::Unknown);
    let mut config = config_for(&server);
    config.known_hosts_path = Some(path.clone());
    config.host_auth = second_callback.clone();
    let handle = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap();
    handle.disconnect().await;
    assert!(!second_callback.invoked.load(Ordering::SeqCst));
}

// S6: a wrong password exhausts the credential list.
#[tokio::test]
async fn wrong_password_is_authentication_failed() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;
    let mut config = config_for(&server);
    config.host_auth = Decide::new(HostKeyDecision::Trusted);
    config.credentials = vec![Credential::Password("invalid".to_string())];

    let err = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ConnectError::Failed(Error::AuthenticationFailed { methods }) => {
            assert!(methods.contains(crate::auth::MethodSet::PASSWORD));
        }
        other => panic!("expected AuthenticationFailed, got {other:?}"),
    }
}

// A failed credential is recoverable: the next one in order still wins.
#[tokio::test]
async fn later_credential_can_succeed() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;
    let mut config = config_for(&server);
    config.host_auth = Decide::new(HostKeyDecision::Trusted);
    config.credentials = vec![
        Credential::Password("invalid".to_string()),
        Credential::Password("testpassword".to_string()),
    ];

    let handle = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap();
    handle.disconnect().await;
}

// The publickey probe-then-sign flow against a server that accepts it.
#[tokio::test]
async fn publickey_credential_authenticates() {
    test_init();
    let server = TestServer::spawn(ServerBehavior {
        password: None,
        accept_publickey: true,
        silent: false,
    })
    .await;
    let key = ssh_key::PrivateKey::random(&mut rand::rngs::OsRng, ssh_key::Algorithm::Ed25519)
        .unwrap();
    let mut config = config_for(&server);
    config.host_auth = Decide::new(HostKeyDecision::Trusted);
    config.credentials = vec![Credential::Key(Arc::new(key))];

    let handle = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap();
    handle.disconnect().await;
}

// S7: the server accepts TCP but never speaks SSH.
#[tokio::test]
async fn connect_timeout_surfaces_as_timeout() {
    test_init();
    let server = TestServer::spawn(ServerBehavior {
        silent: true,
        ..ServerBehavior::default()
    })
    .await;
    let mut config = config_for(&server);
    config.connect_timeout = Some(Duration::from_millis(1));

    let err = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ConnectError::Failed(Error::Timeout) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
}

// S8: cancellation before the banner, and cancellation from inside the
// verification callback, both surface unwrapped.
#[tokio::test]
async fn cancellation_is_never_wrapped() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let config = config_for(&server);
    match connect(Arc::new(config), cancel).await {
        Err(ConnectError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }

    let callback = Arc::new(Decide {
        decision: HostKeyDecision::Trusted,
        cancel_inside: true,
        invoked: AtomicBool::new(false),
        seen: Mutex::new(None),
    });
    let mut config = config_for(&server);
    config.host_auth = callback;
    match connect(Arc::new(config), CancellationToken::new()).await {
        Err(ConnectError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

// S9: an empty credential list fails before any IO.
#[tokio::test]
async fn empty_credentials_fail_immediately() {
    test_init();
    let config = Config::new(Destination::new("nobody", "127.0.0.1", 1));
    let err = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ConnectError::Failed(Error::NoCredentials) => {}
        other => panic!("expected NoCredentials, got {other:?}"),
    }
}

// S10: an error from the callback comes back as the inner cause, intact.
#[derive(Debug)]
struct FlakyDirectory;

impl std::fmt::Display for FlakyDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "the key directory is on fire")
    }
}

impl std::error::Error for FlakyDirectory {}

struct Throwing;

#[async_trait]
impl HostAuthentication for Throwing {
    async fn authenticate(
        &self,
        _status: KnownHostStatus,
        _info: &ConnectionInfo,
        _cancel: &CancellationToken,
    ) -> Result<HostKeyDecision, BoxError> {
        Err(Box::new(FlakyDirectory))
    }
}

#[tokio::test]
async fn callback_errors_are_attached_verbatim() {
    test_init();
    let server = TestServer::spawn(ServerBehavior::default()).await;
    let mut config = config_for(&server);
    config.host_auth = Arc::new(Throwing);

    let err = connect(Arc::new(config), CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ConnectError::Failed(Error::HostKeyVerification {
            source: Some(source),
        }) => {
            assert!(source.downcast_ref::<FlakyDirectory>().is_some());
        }
        other => panic!("expected the callback error, got {other:?}"),
    }
}

#[test]
fn destination_parsing() {
    let d: Destination = "alice@example.com:2222".parse().unwrap();
    assert_eq!(d, Destination::new("alice", "example.com", 2222));

    let d: Destination = "example.com".parse().unwrap();
    assert_eq!(d.host, "example.com");
    assert_eq!(d.port, 22);
    assert!(!d.user.is_empty());

    let d: Destination = "bob@[::1]:2200".parse().unwrap();
    assert_eq!(d, Destination::new("bob", "::1", 2200));

    let d: Destination = "bob@fe80::1".parse().unwrap();
    assert_eq!(d, Destination::new("bob", "fe80::1", 22));

    assert!("@example.com".parse::<Destination>().is_err());
    assert!("alice@host:notaport".parse::<Destination>().is_err());
}
