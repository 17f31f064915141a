//! Dispatcher Tests
//!
//! Drives the server dispatcher directly, covering:
//! - Admission through the allow-list
//! - Prepare/execute with an initial batch
//! - Transactional handle registration
//! - Cascading teardown of statements and cursors
//! - Session ownership of handles and cleanup on disconnect

use std::sync::Arc;

use sqlipc::driver::protocol::{
    crypto, Ack, BindParameter, Channel, Close, CloseCursor, CursorInfo, CursorRequest,
    DriverError, Execute, Frame, HandleKind, Message, Open, PrepareStatement, Request,
    RequestRows, UnprepareStatement,
};
use sqlipc::{DriverHandler, PermittedDatabase, SqlServer};
use sqlipc_client::{column_flags, cursor_flags, DataType, Value};
use tempfile::TempDir;

const ROWS: i64 = 12;

struct Fixture {
    server: Arc<SqlServer>,
    handler: DriverHandler,
    dbname: String,
    _dir: TempDir,
}

fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE t (v INTEGER, label VARCHAR(20));
         CREATE TABLE u (x INTEGER UNIQUE);
         INSERT INTO u VALUES (1);",
    )
    .unwrap();
    for i in 0..ROWS {
        conn.execute(
            "INSERT INTO t VALUES (?1, ?2)",
            rusqlite::params![i, format!("row {}", i)],
        )
        .unwrap();
    }
    drop(conn);

    let server = Arc::new(SqlServer::new(0x5100));
    server.add_database(PermittedDatabase::new("sqlite", "*", "*").unwrap());
    let handler = DriverHandler::new(server.clone());

    Fixture {
        server,
        handler,
        dbname: path.to_string_lossy().into_owned(),
        _dir: dir,
    }
}

fn open_request(driver: &str, dbname: &str) -> Request {
    Request::Open(Open {
        driver: driver.to_string(),
        dbname: dbname.to_string(),
        user: "tester".to_string(),
        password: None,
        host: None,
        port: 0,
    })
}

fn open(fx: &mut Fixture) -> u32 {
    let dbname = fx.dbname.clone();
    match fx.handler.execute_request(open_request("sqlite", &dbname)) {
        Ok(Ack::Open(ack)) => ack.connh,
        other => panic!("Expected Open ack, got {:?}", other),
    }
}

fn prepare(fx: &mut Fixture, connh: u32, text: &str, request: u32, flags: u32) -> (u32, Option<CursorInfo>) {
    let req = Request::PrepareStatement(PrepareStatement {
        connh,
        text: text.to_string(),
        request,
        flags,
    });
    match fx.handler.execute_request(req) {
        Ok(Ack::PrepareStatement(ack)) => (ack.stmth, ack.cursor),
        other => panic!("Expected PrepareStatement ack, got {:?}", other),
    }
}

fn execute(fx: &mut Fixture, stmth: u32, request: u32) -> CursorInfo {
    let req = Request::Execute(Execute {
        stmth,
        request,
        flags: cursor_flags::DEFAULT,
    });
    match fx.handler.execute_request(req) {
        Ok(Ack::Execute(ack)) => ack.cursor.expect("cursor"),
        other => panic!("Expected Execute ack, got {:?}", other),
    }
}

fn rows(fx: &mut Fixture, cursh: u32, start: i64, request: u32) -> Result<(Vec<i64>, i64), DriverError> {
    let req = Request::RequestRows(RequestRows {
        cursh,
        start,
        request,
    });
    match fx.handler.execute_request(req)? {
        Ack::RequestRows(ack) => {
            let ids = ack
                .data
                .chunks(2)
                .map(|row| row[0].value.as_i64().unwrap())
                .collect();
            Ok((ids, ack.rows_to_go))
        }
        other => panic!("Expected RequestRows ack, got {:?}", other),
    }
}

// ============================================================================
// Admission
// ============================================================================

#[test]
fn test_open_permitted_database() {
    let mut fx = setup();
    let connh = open(&mut fx);
    assert_ne!(connh, 0);
    assert_eq!(fx.server.handle_count(), 1);
}

#[test]
fn test_open_refused_allocates_nothing() {
    let mut fx = setup();
    let dbname = fx.dbname.clone();
    match fx.handler.execute_request(open_request("mysql", &dbname)) {
        Err(DriverError::NotPermitted(msg)) => assert!(msg.contains("mysql")),
        other => panic!("Expected NotPermitted, got {:?}", other),
    }
    assert_eq!(fx.server.handle_count(), 0);
}

#[test]
fn test_open_unknown_driver() {
    let mut fx = setup();
    fx.server
        .add_database(PermittedDatabase::new("*", "*", "*").unwrap());
    let result = fx.handler.execute_request(open_request("oracle", "orcl"));
    assert!(matches!(result, Err(DriverError::DatabaseError(_))));
    assert_eq!(fx.server.handle_count(), 0);
}

#[test]
fn test_removed_database_is_refused() {
    let mut fx = setup();
    assert!(fx.server.remove_database("sqlite", "*", "*", None, 0));
    let dbname = fx.dbname.clone();
    assert!(matches!(
        fx.handler.execute_request(open_request("sqlite", &dbname)),
        Err(DriverError::NotPermitted(_))
    ));
}

#[test]
fn test_open_with_sealed_password() {
    let mut fx = setup();
    let key = match fx.handler.execute_request(Request::RequestKey) {
        Ok(Ack::RequestKey(ack)) => ack.public_key,
        other => panic!("Expected RequestKey ack, got {:?}", other),
    };

    let mut req = Open {
        driver: "sqlite".to_string(),
        dbname: fx.dbname.clone(),
        user: "tester".to_string(),
        password: Some(crypto::seal_password(&key, "s3cret").unwrap()),
        host: None,
        port: 0,
    };
    assert!(matches!(
        fx.handler.execute_request(Request::Open(req.clone())),
        Ok(Ack::Open(_))
    ));

    // sealed for some other server
    let stranger = SqlServer::new(0x5100);
    req.password = Some(crypto::seal_password(&stranger.public_key(), "s3cret").unwrap());
    assert!(matches!(
        fx.handler.execute_request(Request::Open(req)),
        Err(DriverError::AuthError(_))
    ));
    assert_eq!(fx.server.handle_count(), 1);
}

// ============================================================================
// Statements and Cursors
// ============================================================================

#[test]
fn test_prepare_returns_first_batch() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (stmth, cursor) = prepare(&mut fx, connh, "SELECT * FROM t", 5, cursor_flags::DEFAULT);
    let cursor = cursor.expect("cursor info");

    assert_ne!(stmth, 0);
    assert_ne!(cursor.cursh, 0);
    assert_eq!(cursor.columns, 2);
    assert_eq!(cursor.rows, ROWS);
    assert_eq!(cursor.data.len(), 5 * 2);
    assert_eq!(cursor.data[8].value, Value::Integer(4));
    assert_eq!(cursor.data[9].value, Value::VarChar("row 4".into()));
    assert_eq!(cursor.rows_to_go, ROWS - 5);
    assert_eq!(fx.server.handle_count(), 3);
}

#[test]
fn test_prepare_only() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let req = Request::PrepareStatement(PrepareStatement {
        connh,
        text: "SELECT * FROM t WHERE v > :low AND v < ?".to_string(),
        request: 0,
        flags: cursor_flags::DEFAULT,
    });
    match fx.handler.execute_request(req) {
        Ok(Ack::PrepareStatement(ack)) => {
            assert_eq!(ack.par_names, vec![":low".to_string(), "?2".to_string()]);
            assert!(ack.cursor.is_none());
        }
        other => panic!("Expected PrepareStatement ack, got {:?}", other),
    }
    assert_eq!(fx.server.handle_count(), 2);
}

#[test]
fn test_failed_prepare_registers_nothing() {
    let mut fx = setup();
    let connh = open(&mut fx);

    let bad = Request::PrepareStatement(PrepareStatement {
        connh,
        text: "SELEC * FROM t".to_string(),
        request: 0,
        flags: 0,
    });
    assert!(matches!(
        fx.handler.execute_request(bad),
        Err(DriverError::DatabaseError(_))
    ));

    // prepares fine, fails when executed immediately
    let violating = Request::PrepareStatement(PrepareStatement {
        connh,
        text: "INSERT INTO u VALUES (1)".to_string(),
        request: 1,
        flags: 0,
    });
    assert!(matches!(
        fx.handler.execute_request(violating),
        Err(DriverError::DatabaseError(_))
    ));
    assert_eq!(fx.server.handle_count(), 1);
}

#[test]
fn test_immediate_statement_has_no_cursor() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (stmth, cursor) = prepare(&mut fx, connh, "DELETE FROM t WHERE v >= 10", 20, 0);
    assert_ne!(stmth, 0);
    assert!(cursor.is_none());

    let (_, cursor) = prepare(&mut fx, connh, "SELECT v, label FROM t", 100, cursor_flags::DEFAULT);
    assert_eq!(cursor.unwrap().rows, 10);
}

#[test]
fn test_bind_then_execute() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (stmth, _) = prepare(&mut fx, connh, "SELECT v, label FROM t WHERE v >= ?", 0, 0);

    let bind = Request::BindParameter(BindParameter {
        stmth,
        index: 0,
        value: Value::Integer(10),
    });
    assert_eq!(fx.handler.execute_request(bind), Ok(Ack::BindParameter));

    let cursor = execute(&mut fx, stmth, 10);
    assert_eq!(cursor.rows, 2);
    assert_eq!(cursor.data.len(), 4);
    assert_eq!(cursor.rows_to_go, 0);

    let out_of_range = Request::BindParameter(BindParameter {
        stmth,
        index: 5,
        value: Value::Null,
    });
    assert!(matches!(
        fx.handler.execute_request(out_of_range),
        Err(DriverError::DatabaseError(_))
    ));
}

#[test]
fn test_request_rows_positions_cursor() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (_, cursor) = prepare(&mut fx, connh, "SELECT v, label FROM t ORDER BY v", 2, cursor_flags::DEFAULT);
    let cursh = cursor.unwrap().cursh;

    assert_eq!(rows(&mut fx, cursh, 3, 4).unwrap(), (vec![3, 4, 5, 6], 5));
    // same range again after moving on
    assert_eq!(rows(&mut fx, cursh, 10, 5).unwrap(), (vec![10, 11], 0));
    assert_eq!(rows(&mut fx, cursh, 3, 4).unwrap(), (vec![3, 4, 5, 6], 5));
    assert_eq!(rows(&mut fx, cursh, 40, 4).unwrap(), (vec![], 0));
}

#[test]
fn test_prefetched_rows_match_single_rows() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (_, cursor) = prepare(&mut fx, connh, "SELECT v, label FROM t ORDER BY v", 0, cursor_flags::DEFAULT);
    let cursh = cursor.unwrap().cursh;

    let (batch, _) = rows(&mut fx, cursh, 0, ROWS as u32).unwrap();
    let single: Vec<i64> = (0..ROWS)
        .flat_map(|n| rows(&mut fx, cursh, n, 1).unwrap().0)
        .collect();
    assert_eq!(batch, single);
}

#[test]
fn test_column_metadata() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (_, cursor) = prepare(&mut fx, connh, "SELECT v, label FROM t", 1, cursor_flags::DEFAULT);
    let cursh = cursor.unwrap().cursh;

    match fx
        .handler
        .execute_request(Request::RequestColTypes(CursorRequest { cursh }))
    {
        Ok(Ack::RequestColTypes(ack)) => {
            assert_eq!(ack.types[0].data_type, DataType::Integer);
            assert_eq!(ack.types[1].data_type, DataType::VarChar);
            assert_eq!(ack.types[1].size, 20);
        }
        other => panic!("Expected RequestColTypes ack, got {:?}", other),
    }

    match fx
        .handler
        .execute_request(Request::RequestColHeaders(CursorRequest { cursh }))
    {
        Ok(Ack::RequestColHeaders(ack)) => {
            assert_eq!(ack.headers.len(), 2);
            assert_eq!(ack.headers[1].flags, column_flags::IS_HEADER);
            assert_eq!(ack.headers[1].value, Value::VarChar("label".into()));
        }
        other => panic!("Expected RequestColHeaders ack, got {:?}", other),
    }
}

#[test]
fn test_copy_cursor_is_independent() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (_, cursor) = prepare(&mut fx, connh, "SELECT v, label FROM t ORDER BY v", 3, cursor_flags::DEFAULT);
    let cursh = cursor.unwrap().cursh;

    let copy = match fx
        .handler
        .execute_request(Request::CopyCursor(CursorRequest { cursh }))
    {
        Ok(Ack::CopyCursor(ack)) => ack.cursh,
        other => panic!("Expected CopyCursor ack, got {:?}", other),
    };
    assert_ne!(copy, cursh);
    assert_eq!(fx.server.handle_count(), 4);

    fx.handler
        .execute_request(Request::CloseCursor(CloseCursor { cursh }))
        .unwrap();
    assert_eq!(rows(&mut fx, copy, 6, 2).unwrap(), (vec![6, 7], 4));
    assert_eq!(
        rows(&mut fx, cursh, 0, 1),
        Err(DriverError::HandleNotFound {
            kind: HandleKind::Cursor,
            handle: cursh
        })
    );
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_unprepare_removes_cursors() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (stmth, _) = prepare(&mut fx, connh, "SELECT v, label FROM t", 0, 0);
    let first = execute(&mut fx, stmth, 1).cursh;
    let second = execute(&mut fx, stmth, 1).cursh;
    assert_ne!(first, second);
    assert_eq!(fx.server.handle_count(), 4);

    let ack = fx
        .handler
        .execute_request(Request::UnprepareStatement(UnprepareStatement { stmth }));
    assert_eq!(ack, Ok(Ack::UnprepareStatement));
    assert_eq!(fx.server.handle_count(), 1);
    assert!(rows(&mut fx, first, 0, 1).is_err());
    assert!(rows(&mut fx, second, 0, 1).is_err());
}

#[test]
fn test_close_leaves_no_handles() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let (stmth, _) = prepare(&mut fx, connh, "SELECT v, label FROM t", 2, cursor_flags::DEFAULT);
    execute(&mut fx, stmth, 2);
    prepare(&mut fx, connh, "SELECT 1", 0, 0);
    assert_eq!(fx.server.handle_count(), 5);

    let ack = fx.handler.execute_request(Request::Close(Close { connh }));
    assert_eq!(ack, Ok(Ack::Close));
    assert_eq!(fx.server.handle_count(), 0);

    assert_eq!(
        fx.handler.execute_request(Request::Close(Close { connh })),
        Err(DriverError::HandleNotFound {
            kind: HandleKind::Connection,
            handle: connh
        })
    );
}

#[test]
fn test_wrong_kind_of_handle() {
    let mut fx = setup();
    let connh = open(&mut fx);
    let result = fx
        .handler
        .execute_request(Request::UnprepareStatement(UnprepareStatement { stmth: connh }));
    assert_eq!(
        result,
        Err(DriverError::HandleNotFound {
            kind: HandleKind::Statement,
            handle: connh
        })
    );
    assert_eq!(fx.server.handle_count(), 1);
}

#[test]
fn test_handles_belong_to_their_session() {
    let mut fx = setup();
    let connh = open(&mut fx);

    let mut other = DriverHandler::new(fx.server.clone());
    assert_ne!(other.session(), fx.handler.session());
    assert!(matches!(
        other.execute_request(Request::Close(Close { connh })),
        Err(DriverError::HandleNotFound { .. })
    ));
    assert_eq!(fx.server.handle_count(), 1);
}

// ============================================================================
// Channel Sessions
// ============================================================================

#[tokio::test]
async fn test_disconnect_closes_connections() {
    let fx = setup();
    let (client, server_end) = Channel::pair();
    let mut handler = DriverHandler::new(fx.server.clone());
    let task = tokio::spawn(async move {
        handler.handle_channel(server_end, "test").await;
    });

    let mut client = client;
    client
        .send(Frame::request(1, open_request("sqlite", &fx.dbname)))
        .unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.msg_id, 1);
    assert!(matches!(reply.message, Message::Ack(Ack::Open(_))));
    assert_eq!(fx.server.handle_count(), 1);

    drop(client);
    task.await.unwrap();
    assert_eq!(fx.server.handle_count(), 0);
}

#[tokio::test]
async fn test_fire_and_forget_gets_no_reply() {
    let fx = setup();
    let (mut client, server_end) = Channel::pair();
    let mut handler = DriverHandler::new(fx.server.clone());
    tokio::spawn(async move {
        handler.handle_channel(server_end, "test").await;
    });

    // fails on the server, but nobody asked for an ack
    client
        .send(Frame::request(0, Request::Close(Close { connh: 0x77 })))
        .unwrap();
    client.send(Frame::request(9, Request::RequestKey)).unwrap();

    let reply = client.recv().await.unwrap();
    assert_eq!(reply.msg_id, 9);
    assert!(matches!(reply.message, Message::Ack(Ack::RequestKey(_))));
}

#[tokio::test]
async fn test_failed_request_gets_failed_ack() {
    let fx = setup();
    let (mut client, server_end) = Channel::pair();
    let mut handler = DriverHandler::new(fx.server.clone());
    tokio::spawn(async move {
        handler.handle_channel(server_end, "test").await;
    });

    client
        .send(Frame::request(4, open_request("mysql", "x")))
        .unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.msg_id, 4);
    match reply.message {
        Message::Ack(Ack::Failed(DriverError::NotPermitted(_))) => {}
        other => panic!("Expected failed ack, got {:?}", other),
    }
}
