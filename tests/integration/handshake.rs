//! CONNECT and LOGIN exchange against the mock node

use gridwire::config::Config;
use gridwire::SqlConnection;

use crate::mock::{self, AuthScript, MockNode, ResultShape, CONNECT, DISCONNECT, LOGIN};
use crate::{connect, mock_options};

#[test]
fn test_connect_then_login_without_challenge() {
    let node = MockNode::spawn(AuthScript::None, |_| mock::ok(&[ResultShape::Update(0)]));
    let connection = connect(&node);

    let frames = node.frames();
    assert_eq!(frames[0].statement_type, CONNECT);
    assert_eq!(frames[1].statement_type, LOGIN);
    assert_eq!(&frames[0].body[..4], &(-9i32).to_le_bytes());

    let login = mock::parse_login(&frames[1]);
    assert_eq!(login.user, "alice");
    assert_eq!(login.cluster, "mockCluster");
    assert_eq!(login.mode, 0);
    assert!(!login.challenged);

    assert_eq!(connection.epoch(), 1);
    assert_eq!(connection.login_outcome().map(|o| o.database_id), Some(0));
}

#[test]
fn test_challenge_login_takes_two_rounds() {
    let node = MockNode::spawn(AuthScript::Challenge, |_| mock::ok(&[ResultShape::Update(0)]));
    let _connection = connect(&node);

    let logins = node.frames_of(LOGIN);
    assert_eq!(logins.len(), 2);

    let first = mock::parse_login(&logins[0]);
    assert_eq!(first.mode, 2);
    assert!(!first.challenged);

    let second = mock::parse_login(&logins[1]);
    assert_eq!(second.mode, 2);
    assert!(second.challenged);
    assert_eq!(second.opaque.as_deref(), Some("opaque"));
    assert!(second.secret.starts_with("#1#"), "secret: {}", second.secret);
}

#[test]
fn test_connect_from_config() {
    let node = MockNode::spawn(AuthScript::None, |_| mock::ok(&[ResultShape::Update(0)]));
    let mut config = Config::default();
    config.cluster.name = "configured".to_string();
    config.cluster.addresses = vec![node.address().to_string()];
    config.auth.user = "bob".to_string();
    config.auth.password = "pw".to_string();
    config.failover.login_timeout_ms = 5000;

    let connection = SqlConnection::connect(&config).unwrap();
    let login = mock::parse_login(&node.frames_of(LOGIN)[0]);
    assert_eq!(login.user, "bob");
    assert_eq!(login.cluster, "configured");
    assert!(login.owner_mode);
    drop(connection);
}

#[test]
fn test_close_sends_disconnect() {
    let node = MockNode::spawn(AuthScript::None, |_| mock::ok(&[ResultShape::Update(0)]));
    let connection = SqlConnection::open(mock_options(&node)).unwrap();

    connection.close().unwrap();
    assert!(connection.is_closed());
    assert!(node.wait_for(|frames| frames.iter().any(|f| f.statement_type == DISCONNECT)));

    let err = connection.create_session().unwrap_err();
    assert_eq!(err.code(), gridwire::error::code::ALREADY_CLOSED);
}
