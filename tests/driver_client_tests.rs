//! Driver Client Tests
//!
//! Runs the client driver against the real dispatcher and SQLite, covering:
//! - Opening and closing through the allow-list
//! - Binding and reading back every kind of value
//! - Prefetching reads over a real table
//! - Deferred errors and handle release
//! - Frames near the size limit over a byte stream
//! - A full session over TCP

use std::sync::Arc;
use std::time::Duration;

use sqlipc::{serve, DriverHandler, PermittedDatabase, SqlServer};
use sqlipc_client::{
    column_flags, cursor_flags, AckMode, Channel, Connection, ConnectionBuilder, DataType,
    DriverError, MessageCodec, Value,
};
use sqlipc_client::protocol::MAX_MESSAGE_SIZE;
use tempfile::TempDir;
use tokio::net::TcpListener;

const TABLE_ROWS: i64 = 1000;

struct Fixture {
    server: Arc<SqlServer>,
    conn: Connection,
    _dir: TempDir,
}

fn server() -> Arc<SqlServer> {
    let server = Arc::new(SqlServer::new(0x5100));
    server.add_database(PermittedDatabase::new("sqlite", "*", "*").unwrap());
    server
}

/// Connect a client to a fresh dispatcher over an in-process channel
fn attach(server: &Arc<SqlServer>, builder: ConnectionBuilder) -> Connection {
    let (client, server_end) = Channel::pair();
    let mut handler = DriverHandler::new(server.clone());
    tokio::spawn(async move {
        handler.handle_channel(server_end, "client-test").await;
    });
    builder.build(client).unwrap()
}

/// Connect a client to a fresh dispatcher over an encoded byte stream
fn attach_stream(server: &Arc<SqlServer>, builder: ConnectionBuilder) -> Connection {
    let (client, server_end) = tokio::io::duplex(64 * 1024);
    let codec = MessageCodec::new(server.chunk());
    let mut handler = DriverHandler::new(server.clone());
    let server_end = Channel::from_stream(server_end, codec);
    tokio::spawn(async move {
        handler.handle_channel(server_end, "stream-test").await;
    });
    builder.build(Channel::from_stream(client, codec)).unwrap()
}

async fn setup(batch: u32, ask_for_more: u32) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let spec = format!("sqlite:{}", dir.path().join("client.db").display());
    let server = server();
    let conn = attach(
        &server,
        ConnectionBuilder::new(&spec)
            .user("tester")
            .prefetching(batch, ask_for_more),
    );
    conn.open(None, AckMode::Wait).await.unwrap();

    Fixture {
        server,
        conn,
        _dir: dir,
    }
}

async fn fill_numbers(conn: &Connection) {
    conn.immediate("CREATE TABLE n (v INTEGER, label VARCHAR(16))", AckMode::Wait)
        .await
        .unwrap();
    conn.immediate(
        &format!(
            "INSERT INTO n WITH RECURSIVE c(x) AS \
             (SELECT 0 UNION ALL SELECT x + 1 FROM c WHERE x < {}) \
             SELECT x, 'n' || x FROM c",
            TABLE_ROWS - 1
        ),
        AckMode::Wait,
    )
    .await
    .unwrap();
}

async fn wait_for_handles(server: &SqlServer, expected: usize) {
    for _ in 0..200 {
        if server.handle_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "Expected {} handles, server still holds {}",
        expected,
        server.handle_count()
    );
}

// ============================================================================
// Connections
// ============================================================================

#[tokio::test]
async fn test_open_and_close() {
    let fx = setup(16, 4).await;
    assert!(fx.conn.is_open());
    assert_ne!(fx.conn.handle(), 0);
    assert_eq!(fx.server.handle_count(), 1);

    fx.conn.close().await.unwrap();
    assert_eq!(fx.server.handle_count(), 0);
}

#[tokio::test]
async fn test_open_refused() {
    let server = server();
    let conn = attach(&server, ConnectionBuilder::new("mysql:orders").user("tester"));
    match conn.open(None, AckMode::Wait).await {
        Err(DriverError::NotPermitted(_)) => {}
        other => panic!("Expected NotPermitted, got {:?}", other),
    }
    assert!(!conn.is_open());
    assert_eq!(server.handle_count(), 0);
}

#[tokio::test]
async fn test_open_with_password() {
    let dir = tempfile::tempdir().unwrap();
    let spec = format!("sqlite:{}", dir.path().join("pw.db").display());
    let server = server();
    let conn = attach(&server, ConnectionBuilder::new(&spec).user("tester"));
    conn.open(Some("s3cret"), AckMode::Wait).await.unwrap();
    assert!(conn.is_open());
}

#[tokio::test]
async fn test_dropped_connection_frees_server_handles() {
    let fx = setup(16, 4).await;
    fill_numbers(&fx.conn).await;
    let stmt = fx.conn.prepare("SELECT v FROM n", AckMode::Wait).await.unwrap();
    let mut cursor = stmt.execute(cursor_flags::DEFAULT, AckMode::Wait).await.unwrap();
    assert_eq!(cursor.data(0).await.unwrap().value, Value::Integer(0));
    assert!(fx.server.handle_count() >= 3);

    drop(cursor);
    drop(stmt);
    drop(fx.conn);
    wait_for_handles(&fx.server, 0).await;
}

// ============================================================================
// Values
// ============================================================================

#[tokio::test]
async fn test_bound_values_read_back() {
    let fx = setup(16, 4).await;
    let conn = &fx.conn;
    conn.immediate(
        "CREATE TABLE v (n INTEGER, t VARCHAR(40), b BLOB, z INTEGER)",
        AckMode::Wait,
    )
    .await
    .unwrap();

    let blob: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let insert = conn
        .prepare("INSERT INTO v VALUES (?, ?, ?, ?)", AckMode::Wait)
        .await
        .unwrap();
    assert_eq!(insert.parameters().await.unwrap(), 4);
    insert.bind(0, 42i32, AckMode::Deferred).await.unwrap();
    insert.bind(1, "grüße ✓ 日本", AckMode::Deferred).await.unwrap();
    insert.bind(2, blob.clone(), AckMode::Deferred).await.unwrap();
    insert.bind(3, Value::Null, AckMode::Deferred).await.unwrap();
    insert.immediate(AckMode::Deferred).await.unwrap();
    conn.synchronise().await.unwrap();

    let mut cursor = conn
        .execute("SELECT n, t, b, z FROM v", cursor_flags::DEFAULT, AckMode::Wait)
        .await
        .unwrap();
    assert_eq!(cursor.rows().await.unwrap(), 1);
    assert_eq!(cursor.data(0).await.unwrap().value, Value::Integer(42));
    assert_eq!(
        cursor.data(1).await.unwrap().value,
        Value::VarChar("grüße ✓ 日本".to_string())
    );
    assert_eq!(cursor.data(2).await.unwrap().value, Value::Blob(blob));
    assert_eq!(cursor.data(3).await.unwrap().value, Value::Null);
}

#[tokio::test]
async fn test_named_parameters() {
    let fx = setup(16, 4).await;
    fill_numbers(&fx.conn).await;
    let stmt = fx
        .conn
        .prepare("SELECT v FROM n WHERE v BETWEEN :low AND :high", AckMode::Wait)
        .await
        .unwrap();
    assert_eq!(stmt.parameter_idx(":high").await.unwrap(), Some(1));

    stmt.bind(0, 10i32, AckMode::Forget).await.unwrap();
    stmt.bind(1, 12i32, AckMode::Forget).await.unwrap();
    let mut cursor = stmt.execute(cursor_flags::DEFAULT, AckMode::Wait).await.unwrap();

    let mut seen = Vec::new();
    while !cursor.at_end().await.unwrap() {
        seen.push(cursor.data(0).await.unwrap().value);
        cursor.forwards().await.unwrap();
    }
    assert_eq!(
        seen,
        vec![Value::Integer(10), Value::Integer(11), Value::Integer(12)]
    );
}

#[tokio::test]
async fn test_column_metadata() {
    let fx = setup(16, 4).await;
    fill_numbers(&fx.conn).await;
    let mut cursor = fx
        .conn
        .execute("SELECT v, label FROM n", cursor_flags::DEFAULT, AckMode::Deferred)
        .await
        .unwrap();

    assert_eq!(cursor.columns().await.unwrap(), 2);
    let label = cursor.column_type(1).await.unwrap();
    assert_eq!(label.data_type, DataType::VarChar);
    assert_eq!(label.size, 16);

    let header = cursor.header(0).await.unwrap();
    assert_eq!(header.row, -1);
    assert_eq!(header.flags, column_flags::IS_HEADER);
    assert_eq!(header.value, Value::VarChar("v".to_string()));
}

// ============================================================================
// Prefetching
// ============================================================================

#[tokio::test]
async fn test_sequential_read_over_table() {
    for (batch, ask_for_more) in [(1, 0), (7, 3), (64, 16), (1000, 0), (5000, 100)] {
        let fx = setup(batch, ask_for_more).await;
        fill_numbers(&fx.conn).await;

        let mut cursor = fx
            .conn
            .execute("SELECT v, label FROM n ORDER BY v", cursor_flags::DEFAULT, AckMode::Deferred)
            .await
            .unwrap();
        assert_eq!(cursor.rows().await.unwrap(), TABLE_ROWS);

        let mut expected = 0i64;
        while !cursor.at_end().await.unwrap() {
            let column = cursor.data(0).await.unwrap();
            assert_eq!(column.row, expected);
            assert_eq!(column.value.as_i64(), Some(expected), "batch {}", batch);
            expected += 1;
            cursor.forwards().await.unwrap();
        }
        assert_eq!(expected, TABLE_ROWS, "batch {}", batch);
    }
}

#[tokio::test]
async fn test_random_access() {
    let fx = setup(32, 8).await;
    fill_numbers(&fx.conn).await;
    let mut cursor = fx
        .conn
        .execute("SELECT v FROM n ORDER BY v", cursor_flags::DEFAULT, AckMode::Wait)
        .await
        .unwrap();

    cursor.seek(500).await.unwrap();
    assert_eq!(cursor.data(0).await.unwrap().value, Value::Integer(500));
    cursor.backwards().await.unwrap();
    assert_eq!(cursor.data(0).await.unwrap().value, Value::Integer(499));

    cursor.seek(TABLE_ROWS - 1).await.unwrap();
    assert!(!cursor.at_end().await.unwrap());
    cursor.forwards().await.unwrap();
    assert!(cursor.at_end().await.unwrap());

    cursor.seek(3).await.unwrap();
    assert_eq!(cursor.data(0).await.unwrap().value, Value::Integer(3));
}

#[tokio::test]
async fn test_copied_cursor() {
    let fx = setup(10, 2).await;
    fill_numbers(&fx.conn).await;
    let mut cursor = fx
        .conn
        .execute("SELECT v FROM n ORDER BY v", cursor_flags::DEFAULT, AckMode::Wait)
        .await
        .unwrap();
    cursor.seek(42).await.unwrap();

    let mut copy = cursor.copy(AckMode::Wait).await.unwrap();
    assert_ne!(copy.handle().await.unwrap(), cursor.handle().await.unwrap());
    assert_eq!(copy.position(), 42);

    copy.seek(900).await.unwrap();
    assert_eq!(copy.data(0).await.unwrap().value, Value::Integer(900));
    assert_eq!(cursor.data(0).await.unwrap().value, Value::Integer(42));
}

// ============================================================================
// Ack Queue
// ============================================================================

#[tokio::test]
async fn test_deferred_error_surfaces_later() {
    let fx = setup(16, 4).await;
    let stmt = fx.conn.prepare("SELEC 1", AckMode::Deferred).await.unwrap();
    assert_eq!(fx.conn.pending_acks(), 1);

    match fx.conn.synchronise().await {
        Err(DriverError::DatabaseError(_)) => {}
        other => panic!("Expected DatabaseError, got {:?}", other),
    }
    assert!(stmt.handle().await.is_err());
    assert_eq!(fx.server.handle_count(), 1);
}

#[tokio::test]
async fn test_poll_acks_consumes_queue() {
    let fx = setup(16, 4).await;
    fx.conn
        .immediate("CREATE TABLE p (x INTEGER)", AckMode::Deferred)
        .await
        .unwrap();
    fx.conn
        .immediate("INSERT INTO p VALUES (1)", AckMode::Deferred)
        .await
        .unwrap();
    assert_eq!(fx.conn.pending_acks(), 2);

    assert_eq!(fx.conn.poll_acks(Duration::from_secs(5)).await.unwrap(), 2);
    assert_eq!(fx.conn.pending_acks(), 0);
    assert_eq!(
        fx.conn.poll_acks(Duration::from_millis(10)).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_dropped_statement_is_unprepared() {
    let fx = setup(16, 4).await;
    fill_numbers(&fx.conn).await;
    {
        let stmt = fx.conn.prepare("SELECT v FROM n", AckMode::Deferred).await.unwrap();
        let _first = stmt.execute(cursor_flags::DEFAULT, AckMode::Deferred).await.unwrap();
        let _second = stmt.execute(cursor_flags::DEFAULT, AckMode::Deferred).await.unwrap();
        fx.conn.synchronise().await.unwrap();
        assert_eq!(fx.server.handle_count(), 4);
    }

    // requests are served in order, so one round trip flushes the releases
    let _sync = fx.conn.prepare("SELECT 1", AckMode::Wait).await.unwrap();
    assert_eq!(fx.server.handle_count(), 2);
}

#[tokio::test]
async fn test_immediate_statements_leave_no_cursor() {
    let fx = setup(16, 4).await;
    fill_numbers(&fx.conn).await;
    fx.conn
        .immediate("DELETE FROM n WHERE v >= 10", AckMode::Deferred)
        .await
        .unwrap();

    let cursor = fx
        .conn
        .execute("SELECT v FROM n", cursor_flags::DEFAULT, AckMode::Wait)
        .await
        .unwrap();
    assert_eq!(cursor.rows().await.unwrap(), 10);
}

// ============================================================================
// Large Frames
// ============================================================================

const MIB: usize = 1024 * 1024;

async fn stream_fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let spec = format!("sqlite:{}", dir.path().join("large.db").display());
    let server = server();
    let conn = attach_stream(&server, ConnectionBuilder::new(&spec).user("tester"));
    conn.open(None, AckMode::Wait).await.unwrap();
    Fixture {
        server,
        conn,
        _dir: dir,
    }
}

async fn fill_blobs(conn: &Connection, count: usize, size: usize) {
    conn.immediate("CREATE TABLE b (id INTEGER, v BLOB)", AckMode::Wait)
        .await
        .unwrap();
    conn.immediate(
        &format!(
            "INSERT INTO b WITH RECURSIVE c(x) AS \
             (SELECT 0 UNION ALL SELECT x + 1 FROM c WHERE x < {}) \
             SELECT x, zeroblob({}) FROM c",
            count - 1,
            size
        ),
        AckMode::Wait,
    )
    .await
    .unwrap();
}

async fn count_rows(conn: &Connection, table: &str) -> i64 {
    let mut cursor = conn
        .execute(
            &format!("SELECT COUNT(*) FROM {}", table),
            cursor_flags::DEFAULT,
            AckMode::Wait,
        )
        .await
        .unwrap();
    cursor.data(0).await.unwrap().value.as_i64().unwrap()
}

#[tokio::test]
async fn test_wide_result_over_stream() {
    let fx = stream_fixture().await;
    fill_blobs(&fx.conn, 20, MIB).await;

    let mut cursor = fx
        .conn
        .execute("SELECT id, v FROM b ORDER BY id", cursor_flags::DEFAULT, AckMode::Wait)
        .await
        .unwrap();
    assert_eq!(cursor.rows().await.unwrap(), 20);

    let mut expected = 0i64;
    while !cursor.at_end().await.unwrap() {
        assert_eq!(cursor.data(0).await.unwrap().value.as_i64(), Some(expected));
        assert_eq!(cursor.data(1).await.unwrap().value.len(), MIB);
        expected += 1;
        cursor.forwards().await.unwrap();
    }
    assert_eq!(expected, 20);

    assert_eq!(count_rows(&fx.conn, "b").await, 20);
}

#[tokio::test]
async fn test_oversize_bind_keeps_connection() {
    let fx = stream_fixture().await;
    fx.conn
        .immediate("CREATE TABLE big (v BLOB)", AckMode::Wait)
        .await
        .unwrap();
    let insert = fx
        .conn
        .prepare("INSERT INTO big VALUES (?)", AckMode::Wait)
        .await
        .unwrap();

    for mode in [AckMode::Wait, AckMode::Deferred, AckMode::Forget] {
        match insert.bind(0, vec![0u8; MAX_MESSAGE_SIZE], mode).await {
            Err(DriverError::MessageTooLarge) => {}
            other => panic!("Expected MessageTooLarge, got {:?}", other),
        }
        assert_eq!(fx.conn.pending_acks(), 0);
    }

    insert.bind(0, vec![7u8; MIB], AckMode::Deferred).await.unwrap();
    insert.immediate(AckMode::Wait).await.unwrap();
    assert_eq!(count_rows(&fx.conn, "big").await, 1);
}

#[tokio::test]
async fn test_oversize_row_fails_one_ack() {
    let fx = stream_fixture().await;
    fill_blobs(&fx.conn, 1, MAX_MESSAGE_SIZE).await;

    match fx
        .conn
        .execute("SELECT v FROM b", cursor_flags::DEFAULT, AckMode::Wait)
        .await
    {
        Err(DriverError::MessageTooLarge) => {}
        Ok(_) => panic!("Expected MessageTooLarge, got a cursor"),
        Err(other) => panic!("Expected MessageTooLarge, got {:?}", other),
    }

    assert!(fx.conn.is_open());
    assert_eq!(count_rows(&fx.conn, "b").await, 1);
    wait_for_handles(&fx.server, 1).await;
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn test_session_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let spec = format!("sqlite:{}", dir.path().join("tcp.db").display());
    let server = server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(serve(server.clone(), listener));

    let conn = ConnectionBuilder::new(&spec)
        .user("tester")
        .prefetching(50, 10)
        .connect(&addr)
        .await
        .unwrap();
    conn.open(Some("tcp-secret"), AckMode::Wait).await.unwrap();
    fill_numbers(&conn).await;

    conn.immediate("CREATE TABLE b (data BLOB)", AckMode::Wait)
        .await
        .unwrap();
    let blob: Vec<u8> = (0..64 * 1024).map(|i| (i * 7 % 256) as u8).collect();
    let insert = conn
        .prepare("INSERT INTO b VALUES (?)", AckMode::Wait)
        .await
        .unwrap();
    insert.bind(0, blob.clone(), AckMode::Forget).await.unwrap();
    insert.immediate(AckMode::Wait).await.unwrap();

    let mut cursor = conn
        .execute("SELECT data FROM b", cursor_flags::DEFAULT, AckMode::Wait)
        .await
        .unwrap();
    assert_eq!(cursor.data(0).await.unwrap().value, Value::Blob(blob));

    let mut numbers = conn
        .execute("SELECT v FROM n ORDER BY v", cursor_flags::DEFAULT, AckMode::Deferred)
        .await
        .unwrap();
    let mut count = 0;
    while !numbers.at_end().await.unwrap() {
        count += 1;
        numbers.forwards().await.unwrap();
    }
    assert_eq!(count, TABLE_ROWS);

    drop(cursor);
    drop(numbers);
    drop(insert);
    conn.close().await.unwrap();
    wait_for_handles(&server, 0).await;
}

#[tokio::test]
async fn test_tcp_rejects_bad_magic() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(server(), listener));

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert_eq!(read.unwrap_or(0), 0);
}
