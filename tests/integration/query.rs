//! Statement round trips against the mock node

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use gridwire::error::code;
use gridwire::metrics::metrics;
use gridwire::query::{InputRows, StatementOperation};
use gridwire::SqlConnection;

use crate::mock::{self, AuthScript, MockNode, Reply, ResultShape, CONNECT, DISCONNECT, SQL_CANCEL};
use crate::{connect, mock_options, I64Rows};

const CREATE: u8 = 1;
const GET: u8 = 2;

fn table(following: bool, rows: &[i64]) -> ResultShape {
    ResultShape::Table {
        following,
        rows: rows.to_vec(),
    }
}

#[test]
fn test_each_statement_allocates_a_new_query_id() {
    let node = MockNode::spawn(AuthScript::None, |_| mock::ok(&[ResultShape::Update(1)]));
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    assert_eq!(session.update("INSERT INTO t VALUES (1)").unwrap(), 1);
    assert_eq!(session.update("INSERT INTO t VALUES (2)").unwrap(), 1);

    let requests = node.sql_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].mode, CREATE);
    assert_eq!(requests[0].operation, StatementOperation::Update.ordinal());
    assert_eq!((requests[0].query_id, requests[0].old_query_id), (1, 0));
    assert_eq!(requests[0].sql, vec!["INSERT INTO t VALUES (1)".to_string()]);
    assert_eq!((requests[1].query_id, requests[1].old_query_id), (2, 1));
    assert_eq!(session.query_id(), 2);
}

#[test]
fn test_released_query_closed_by_next_session() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation == StatementOperation::Query.ordinal() {
            mock::ok(&[table(false, &[7])])
        } else {
            mock::ok(&[ResultShape::Update(0)])
        }
    });
    let connection = connect(&node);

    let mut first = connection.create_session().unwrap();
    assert!(first.query("SELECT * FROM t").unwrap().table_found());
    drop(first);

    let mut second = connection.create_session().unwrap();
    second.update("DELETE FROM t").unwrap();

    let requests = node.sql_requests();
    assert_eq!(requests[1].mode, CREATE);
    assert_eq!((requests[1].query_id, requests[1].old_query_id), (2, 1));
}

#[test]
fn test_cursor_fetches_following_pages() {
    let mut fetches = 0;
    let node = MockNode::spawn(AuthScript::None, move |request| {
        if request.operation == StatementOperation::Fetch.ordinal() {
            fetches += 1;
            return match fetches {
                1 => mock::ok(&[table(true, &[4, 5, 6])]),
                _ => mock::ok(&[table(false, &[7])]),
            };
        }
        mock::ok(&[table(true, &[1, 2, 3])])
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    let query_id = session.query("SELECT * FROM t").unwrap().query_id;
    let rows: Vec<i64> = {
        let cursor = session.cursor(I64Rows).unwrap();
        cursor.collect::<Result<_, _>>().unwrap()
    };
    assert_eq!(rows, vec![1, 2, 3, 4, 5, 6, 7]);

    let fetches: Vec<_> = node
        .sql_requests()
        .into_iter()
        .filter(|r| r.operation == StatementOperation::Fetch.ordinal())
        .collect();
    assert_eq!(fetches.len(), 2);
    for fetch in &fetches {
        assert_eq!(fetch.mode, GET);
        assert_eq!(fetch.query_id, query_id);
        assert_eq!(fetch.old_query_id, 0);
        assert!(fetch.sql.is_empty());
    }

    // The statement's own first page is still the selected result
    let page = session.last_result().unwrap().page.clone().unwrap();
    assert_eq!(page.row_count, 3);
}

#[test]
fn test_fetch_of_replaced_query_rejected() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation == StatementOperation::Query.ordinal() {
            mock::ok(&[table(true, &[1])])
        } else {
            mock::ok(&[ResultShape::Update(0)])
        }
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    let old_id = session.query("SELECT * FROM t").unwrap().query_id;
    session.update("UPDATE t SET a = 1").unwrap();

    let err = session.fetch_following(old_id).unwrap_err();
    assert_eq!(err.code(), code::ALREADY_CLOSED);
    assert_eq!(node.sql_requests().len(), 2);
}

#[test]
fn test_close_query_keeps_session_usable() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation == StatementOperation::Query.ordinal() {
            mock::ok(&[table(true, &[1])])
        } else if request.operation == StatementOperation::Close.ordinal() {
            mock::ok(&[])
        } else {
            mock::ok(&[ResultShape::Update(1)])
        }
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    let closed_id = session.query("SELECT * FROM t").unwrap().query_id;
    session.close_query(closed_id).unwrap();
    assert_eq!(session.query_id(), 0);
    assert!(!session.is_closed());

    let err = session.fetch_following(closed_id).unwrap_err();
    assert_eq!(err.code(), code::ALREADY_CLOSED);

    assert_eq!(session.update("UPDATE t SET a = 1").unwrap(), 1);
    assert!(session.query_id() > closed_id);

    let requests = node.sql_requests();
    assert_eq!(requests.len(), 3);
    let close = &requests[1];
    assert_eq!(close.operation, StatementOperation::Close.ordinal());
    assert_eq!(close.mode, GET);
    assert_eq!(close.query_id, closed_id);

    // Nothing is left to close by the next statement
    let update = &requests[2];
    assert_eq!(update.mode, CREATE);
    assert!(update.query_id > closed_id);
    assert_eq!(update.old_query_id, 0);
}

#[test]
fn test_update_returning_table_rejected() {
    let node = MockNode::spawn(AuthScript::None, |_| {
        Reply::Success(mock::sql_response(true, false, &[table(false, &[1])]))
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    let err = session.update("SELECT * FROM t").unwrap_err();
    assert_eq!(err.code(), code::STATEMENT_CATEGORY_UNMATCHED);
    assert!(err.message().contains("Read only query specified for writable request"));
    assert!(!connection.is_transaction_started());

    let err = session.last_result().unwrap_err();
    assert_eq!(err.code(), code::ILLEGAL_STATE);
}

#[test]
fn test_transaction_state_follows_responses() {
    let node = MockNode::spawn(AuthScript::None, |_| {
        Reply::Success(mock::sql_response(true, false, &[ResultShape::Update(1)]))
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    session.update("BEGIN").unwrap();
    assert!(connection.is_transaction_started());
    assert!(!connection.auto_commit());

    session.update("INSERT INTO t VALUES (1)").unwrap();
    let requests = node.sql_requests();
    assert!(!requests[0].transaction_started);
    assert!(requests[1].transaction_started);
}

#[test]
fn test_multi_statement_results() {
    let node = MockNode::spawn(AuthScript::None, |_| {
        mock::ok(&[ResultShape::Update(2), table(false, &[9])])
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    let statements = vec!["DELETE FROM t".to_string(), "SELECT * FROM t".to_string()];
    assert_eq!(session.execute_all(statements).unwrap().len(), 2);
    assert_eq!(session.last_result().unwrap().update_count, 2);
    assert!(session.more_results());
    assert!(session.last_result().unwrap().table_found());
    assert!(!session.more_results());

    assert_eq!(node.sql_requests()[0].sql.len(), 2);
}

#[test]
fn test_prepared_statement_runs_by_query_id() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation == StatementOperation::Prepare.ordinal() {
            mock::ok(&[ResultShape::Prepared(2)])
        } else {
            mock::ok(&[ResultShape::Update(1)])
        }
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    assert_eq!(session.prepare("INSERT INTO t VALUES (?, ?)").unwrap(), 2);
    assert_eq!(session.parameter_count(), Some(2));

    session.set_input_rows(Some(InputRows {
        row_count: 1,
        schema: Bytes::from_static(b"sch"),
        rows: Bytes::from_static(&[1, 0, 0, 0, 2, 0, 0, 0]),
    }));
    let result = session.execute_prepared(StatementOperation::Update).unwrap();
    assert_eq!(result.update_count, 1);

    let requests = node.sql_requests();
    assert_eq!(requests[0].mode, CREATE);
    assert_eq!(requests[0].operation, StatementOperation::Prepare.ordinal());
    assert_eq!(requests[0].input_rows, 0);
    assert_eq!(requests[1].mode, GET);
    assert_eq!(requests[1].operation, StatementOperation::Update.ordinal());
    assert_eq!(requests[1].query_id, requests[0].query_id);
    assert_eq!(requests[1].input_rows, 1);
    assert!(requests[1].sql.is_empty());
}

#[test]
fn test_execute_prepared_requires_prepare() {
    let node = MockNode::spawn(AuthScript::None, |_| mock::ok(&[ResultShape::Update(0)]));
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    let err = session.execute_prepared(StatementOperation::Update).unwrap_err();
    assert_eq!(err.code(), code::ILLEGAL_STATE);
    assert!(node.sql_requests().is_empty());
}

#[test]
fn test_connection_close_closes_released_queries() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation == StatementOperation::Query.ordinal() {
            mock::ok(&[table(true, &[1])])
        } else {
            mock::ok(&[])
        }
    });
    let connection = connect(&node);

    let mut session = connection.create_session().unwrap();
    let query_id = session.query("SELECT * FROM t").unwrap().query_id;
    session.close();

    connection.close().unwrap();
    let requests = node.sql_requests();
    let close = requests.last().unwrap();
    assert_eq!(close.operation, StatementOperation::Close.ordinal());
    assert_eq!(close.mode, GET);
    assert_eq!(close.query_id, query_id);

    assert!(node.wait_for(|frames| frames.last().is_some_and(|f| f.statement_type == DISCONNECT)));
}

#[test]
fn test_remote_env_learned_from_response() {
    let node = MockNode::spawn(AuthScript::None, |_| {
        let body = mock::sql_response(false, true, &[ResultShape::Update(0)]);
        Reply::Success(mock::with_env(body, &[("search_path", "public")]))
    });
    let connection = connect(&node);
    let mut session = connection.create_session().unwrap();

    session.update("SET search_path = public").unwrap();
    let env = connection.remote_env();
    assert_eq!(env.get("search_path").map(String::as_str), Some("public"));
}

#[test]
fn test_heartbeat_keeps_slow_statement_alive() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation != StatementOperation::Update.ordinal() {
            return mock::ok(&[]);
        }
        Reply::AfterHeartbeat(mock::sql_response(false, true, &[ResultShape::Update(3)]))
    });
    let mut options = mock_options(&node);
    options.timeouts.heartbeat = Duration::from_millis(200);
    let connection = SqlConnection::open(options).unwrap();
    let mut session = connection.create_session().unwrap();

    let sent_before = metrics().heartbeats_sent.get();
    assert_eq!(session.update("UPDATE t SET a = 1").unwrap(), 3);
    assert!(metrics().heartbeats_sent.get() > sent_before);

    // The probe travelled on the same connection; no reconnect happened
    assert_eq!(node.frames_of(CONNECT).len(), 2);
    assert!(node.frames_of(CONNECT).iter().all(|f| f.connection == 0));
    assert_eq!(connection.epoch(), 1);
}

#[test]
fn test_response_ahead_of_heartbeat_answer() {
    let mut updates = 0;
    let node = MockNode::spawn(AuthScript::None, move |request| {
        if request.operation != StatementOperation::Update.ordinal() {
            return mock::ok(&[]);
        }
        updates += 1;
        if updates == 1 {
            return Reply::BeforeHeartbeatAnswer(mock::sql_response(false, true, &[ResultShape::Update(3)]));
        }
        mock::ok(&[ResultShape::Update(4)])
    });
    let mut options = mock_options(&node);
    options.timeouts.heartbeat = Duration::from_millis(200);
    let connection = SqlConnection::open(options).unwrap();
    let mut session = connection.create_session().unwrap();

    assert_eq!(session.update("UPDATE t SET a = 1").unwrap(), 3);
    // The late probe answer was drained; the next response is read in order
    assert_eq!(session.update("UPDATE t SET a = 2").unwrap(), 4);

    assert_eq!(node.frames_of(CONNECT).len(), 2);
    assert_eq!(connection.epoch(), 1);
}

#[test]
fn test_cancel_reaches_node_during_statement() {
    let node = MockNode::spawn(AuthScript::None, |request| {
        if request.operation != StatementOperation::Update.ordinal() {
            return mock::ok(&[]);
        }
        Reply::AfterCancel(mock::sql_response(false, true, &[ResultShape::Update(0)]))
    });
    let connection = connect(&node);
    let cancel = connection.cancel_handle();
    let mut session = connection.create_session().unwrap();

    let canceller = {
        let frames = node.frames_handle();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if frames.lock().iter().any(|f| f.statement_type == SQL_CANCEL) {
                    return true;
                }
                cancel.cancel();
                thread::sleep(Duration::from_millis(20));
            }
            false
        })
    };

    session.update("UPDATE t SET a = 1").unwrap();
    assert!(canceller.join().unwrap());

    let request = &node.sql_requests()[0];
    let cancels = node.frames_of(SQL_CANCEL);
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].statement_id, request.statement_id);

    // Body is the connection UUID followed by the query id
    assert_eq!(&cancels[0].body[..16], connection.uuid().as_bytes());
    assert_eq!(&cancels[0].body[16..24], &request.query_id.to_le_bytes());
}
