//! Reconnect and retry behavior when the mock node drops connections

use std::time::{Duration, Instant};

use gridwire::query::StatementOperation;
use gridwire::SqlConnection;

use crate::mock::{self, AuthScript, MockNode, Reply, ResultShape, CONNECT, LOGIN};
use crate::{connect, mock_options, I64Rows};

const CREATE: u8 = 1;
const GET: u8 = 2;

#[test]
fn test_new_statement_retried_on_new_connection() {
    let node = MockNode::spawn(AuthScript::None, |request| match request.connection {
        0 => Reply::Hangup,
        _ => mock::ok(&[ResultShape::Update(4)]),
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    assert_eq!(session.update("UPDATE t SET a = 1").unwrap(), 4);
    assert_eq!(connection.epoch(), 2);

    let requests = node.sql_requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].retry);
    assert_eq!(requests[1].connection, 1);
    assert_eq!(requests[1].mode, CREATE);
    assert!(requests[1].retry);
    // The first id died with the old connection; nothing is closed for it
    assert_eq!((requests[1].query_id, requests[1].old_query_id), (2, 0));

    let reconnect: Vec<i32> = node
        .frames()
        .iter()
        .filter(|f| f.connection == 1)
        .map(|f| f.statement_type)
        .take(2)
        .collect();
    assert_eq!(reconnect, vec![CONNECT, LOGIN]);
}

#[test]
fn test_prepared_statement_prepared_again_after_reconnect() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation == StatementOperation::Prepare.ordinal() {
            return mock::ok(&[ResultShape::Prepared(1)]);
        }
        match request.connection {
            0 => Reply::Hangup,
            _ => mock::ok(&[ResultShape::Update(5)]),
        }
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    session.prepare("UPDATE t SET a = ?").unwrap();
    let result = session.execute_prepared(StatementOperation::Update).unwrap();
    assert_eq!(result.update_count, 5);

    let retried: Vec<_> = node
        .sql_requests()
        .into_iter()
        .filter(|r| r.connection == 1)
        .collect();
    assert_eq!(retried.len(), 2);

    let prepare = &retried[0];
    assert_eq!(prepare.operation, StatementOperation::Prepare.ordinal());
    assert_eq!(prepare.mode, CREATE);
    assert_eq!(prepare.old_query_id, 0);
    assert_eq!(prepare.sql, vec!["UPDATE t SET a = ?".to_string()]);
    assert!(prepare.retry);

    let update = &retried[1];
    assert_eq!(update.operation, StatementOperation::Update.ordinal());
    assert_eq!(update.mode, GET);
    assert_eq!(update.query_id, prepare.query_id);
    assert!(update.sql.is_empty());
    assert_eq!(session.query_id(), prepare.query_id);
}

#[test]
fn test_fetch_not_resumed_after_connection_loss() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation == StatementOperation::Fetch.ordinal() {
            return Reply::Hangup;
        }
        mock::ok(&[ResultShape::Table {
            following: true,
            rows: vec![1],
        }])
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();
    session.query("SELECT * FROM t").unwrap();

    let mut cursor = session.cursor(I64Rows).unwrap();
    assert_eq!(cursor.next_row().unwrap(), Some(1));
    let err = cursor.next_row().unwrap_err();
    assert!(err.is_connection());
    assert!(
        err.message()
            .starts_with("Connection problem cannot be recovered on this operation type"),
        "message: {}",
        err.message()
    );
    assert!(err.message().contains("operation=FETCH"));
    assert_eq!(cursor.next_row().unwrap(), None);
}

#[test]
fn test_query_timeout_bounds_failover() {
    let node = MockNode::spawn(AuthScript::None, |_| Reply::Hangup);
    let mut options = mock_options(&node);
    options.timeouts.failover_interval = Duration::from_millis(100);
    options.session.query_timeout = Some(Duration::from_secs(1));
    let connection = SqlConnection::open(options).unwrap();
    let mut session = connection.create_session().unwrap();

    let started = Instant::now();
    let err = session.update("UPDATE t SET a = 1").unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_connection());
    assert!(err.message().starts_with("Connection problem occurred"));
    assert!(err.message().contains("queryTimeoutMillis=1000"));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(4), "elapsed: {:?}", elapsed);
    assert!(node.sql_requests().len() > 1);
}

#[test]
fn test_silent_node_resumed_on_new_connection() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation == StatementOperation::Prepare.ordinal() {
            return mock::ok(&[ResultShape::Prepared(0)]);
        }
        if request.operation == StatementOperation::Close.ordinal() {
            return mock::ok(&[]);
        }
        match request.connection {
            0 => Reply::Stall,
            _ => mock::ok(&[ResultShape::Table {
                following: false,
                rows: vec![10, 20, 30],
            }]),
        }
    });
    let mut options = mock_options(&node);
    options.timeouts.heartbeat = Duration::from_millis(200);
    let connection = SqlConnection::open(options).unwrap();
    let mut session = connection.create_session().unwrap();

    session.prepare("SELECT * FROM t WHERE a > ?").unwrap();
    let page = session
        .execute_prepared(StatementOperation::Query)
        .unwrap()
        .page
        .clone()
        .unwrap();
    assert_eq!(page.row_count, 3);
    let rows: Vec<i64> = session.cursor(I64Rows).unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(rows, vec![10, 20, 30]);

    // One reconnect: the stalled socket is abandoned for exactly one new one
    assert_eq!(connection.epoch(), 2);
    let frames = node.frames();
    assert!(frames.iter().all(|f| f.connection <= 1));
    assert_eq!(
        frames
            .iter()
            .filter(|f| f.connection == 1 && f.statement_type == LOGIN)
            .count(),
        1
    );
    // Unanswered heartbeat probes went out on the stalled socket first
    assert!(frames
        .iter()
        .any(|f| f.connection == 0 && f.statement_type == CONNECT && f.statement_id > 1));

    let resumed: Vec<_> = node
        .sql_requests()
        .into_iter()
        .filter(|r| r.connection == 1)
        .collect();
    assert_eq!(resumed.len(), 2);
    assert_eq!(resumed[0].operation, StatementOperation::Prepare.ordinal());
    assert_eq!(resumed[0].mode, CREATE);
    assert!(resumed[0].retry);
    assert_eq!(resumed[1].operation, StatementOperation::Query.ordinal());
    assert_eq!(resumed[1].mode, GET);
    assert_eq!(resumed[1].query_id, resumed[0].query_id);
    assert!(resumed[1].retry);
    assert_eq!(session.query_id(), resumed[0].query_id);
}
