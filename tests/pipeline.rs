use std::io::Cursor;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::sleep;

use rudis::connection::ConnectOptions;
use rudis::frame::{ParseError, Reply};
use rudis::{Client, Command, Error};

async fn read_command(socket: &mut TcpStream, buf: &mut BytesMut) -> Option<Vec<String>> {
    loop {
        let mut cursor = Cursor::new(&buf[..]);
        match Reply::parse(&mut cursor) {
            Ok(Reply::Array(items)) => {
                let consumed = cursor.position() as usize;
                buf.advance(consumed);
                let tokens = items
                    .iter()
                    .map(|item| match item {
                        Reply::Bulk(data) => String::from_utf8_lossy(data).to_string(),
                        other => other.to_string(),
                    })
                    .collect();
                return Some(tokens);
            }
            Ok(other) => panic!("unexpected inbound frame {}", other),
            Err(ParseError::Incomplete) => {
                let n = socket.read_buf(buf).await.unwrap();
                if n == 0 {
                    assert!(buf.is_empty(), "client closed mid-command");
                    return None;
                }
            }
            Err(err) => panic!("malformed inbound command: {}", err),
        }
    }
}

fn spawn_script(
    listener: TcpListener,
    script: Vec<&'static [u8]>,
) -> UnboundedReceiver<Vec<String>> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::with_capacity(4096);

        for reply in script {
            let tokens = match read_command(&mut socket, &mut buf).await {
                Some(tokens) => tokens,
                None => return,
            };
            let _ = tx.send(tokens);
            if !reply.is_empty() {
                socket.write_all(reply).await.unwrap();
            }
        }

        sleep(Duration::from_millis(500)).await;
    });

    rx
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn bind() -> (TcpListener, ConnectOptions) {
    init_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, ConnectOptions::new("127.0.0.1").port(port))
}

#[tokio::test]
async fn pipeline_returns_one_reply_per_command() {
    let (listener, options) = bind().await;
    let _received = spawn_script(
        listener,
        vec![b"+OK\r\n", b"+OK\r\n", b"*2\r\n$1\r\n1\r\n$1\r\n2\r\n"],
    );

    let client = Client::connect(options).await.unwrap();

    let mut pipeline = client.pipeline();
    pipeline
        .enqueue(Command::new("SET").arg("a").arg(1))
        .enqueue(Command::new("SET").arg("b").arg(2))
        .enqueue(Command::new("MGET").arg("a").arg("b"));
    assert_eq!(pipeline.len(), 3);

    let replies = pipeline.flush().await.unwrap();

    assert_eq!(
        replies,
        vec![
            Reply::Status("OK".to_string()),
            Reply::Status("OK".to_string()),
            Reply::Array(vec![
                Reply::Bulk(Bytes::from("1")),
                Reply::Bulk(Bytes::from("2")),
            ]),
        ]
    );
}

#[tokio::test]
async fn empty_pipeline_flushes_to_nothing() {
    let (listener, options) = bind().await;
    let mut received = spawn_script(listener, vec![]);

    let client = Client::connect(options).await.unwrap();

    let replies = client.pipeline().flush().await.unwrap();
    assert!(replies.is_empty());

    // Nothing reached the wire.
    sleep(Duration::from_millis(100)).await;
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn pipeline_keeps_error_replies_in_position() {
    let (listener, options) = bind().await;
    let _received = spawn_script(
        listener,
        vec![b"+OK\r\n", b"-WRONGTYPE not a list\r\n", b":4\r\n"],
    );

    let client = Client::connect(options).await.unwrap();

    let mut pipeline = client.pipeline();
    pipeline
        .enqueue(Command::new("SET").arg("k").arg("v"))
        .enqueue(Command::new("LPUSH").arg("k").arg("x"))
        .enqueue(Command::new("APPEND").arg("k").arg("!!"));

    let replies = pipeline.flush().await.unwrap();

    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0], Reply::Status("OK".to_string()));
    assert_eq!(replies[1], Reply::Error("WRONGTYPE not a list".to_string()));
    assert_eq!(replies[2], Reply::Integer(4));
}

#[tokio::test]
async fn transaction_wraps_batch_in_multi_exec() {
    let (listener, options) = bind().await;
    let mut received = spawn_script(
        listener,
        vec![
            b"+OK\r\n",
            b"+QUEUED\r\n",
            b"+QUEUED\r\n",
            b"*2\r\n+OK\r\n:2\r\n",
        ],
    );

    let client = Client::connect(options).await.unwrap();

    let mut tx = client.tx();
    tx.enqueue(Command::new("SET").arg("k").arg(1))
        .enqueue(Command::new("INCR").arg("k"));

    let replies = tx.flush().await.unwrap();

    assert_eq!(
        replies,
        vec![Reply::Status("OK".to_string()), Reply::Integer(2)]
    );

    // The wire carried MULTI, the commands, then EXEC, in that order.
    assert_eq!(received.recv().await.unwrap(), vec!["MULTI"]);
    assert_eq!(received.recv().await.unwrap(), vec!["SET", "k", "1"]);
    assert_eq!(received.recv().await.unwrap(), vec!["INCR", "k"]);
    assert_eq!(received.recv().await.unwrap(), vec!["EXEC"]);
}

#[tokio::test]
async fn transaction_surfaces_queue_errors_per_command() {
    let (listener, options) = bind().await;
    let _received = spawn_script(
        listener,
        vec![
            b"+OK\r\n",
            b"+QUEUED\r\n",
            b"-ERR unknown command 'FROB'\r\n",
            b"-EXECABORT Transaction discarded because of previous errors.\r\n",
        ],
    );

    let client = Client::connect(options).await.unwrap();

    let mut tx = client.tx();
    tx.enqueue(Command::new("SET").arg("k").arg(1))
        .enqueue(Command::new("FROB").arg("k"));

    let replies = tx.flush().await.unwrap();

    assert_eq!(replies.len(), 2);
    assert!(matches!(
        replies[0],
        Reply::Error(ref msg) if msg.starts_with("EXECABORT")
    ));
    assert!(matches!(
        replies[1],
        Reply::Error(ref msg) if msg.starts_with("ERR unknown command")
    ));
}

#[tokio::test]
async fn transaction_discard_drops_the_tail() {
    let (listener, options) = bind().await;
    let mut received = spawn_script(listener, vec![b"+OK\r\n", b"+QUEUED\r\n", b"+OK\r\n"]);

    let client = Client::connect(options).await.unwrap();

    let mut tx = client.tx();
    tx.enqueue(Command::new("SET").arg("k").arg(1))
        .enqueue(Command::new("DISCARD"))
        .enqueue(Command::new("INCR").arg("k"));

    let replies = tx.flush().await.unwrap();

    assert_eq!(replies, vec![Reply::Status("OK".to_string())]);

    assert_eq!(received.recv().await.unwrap(), vec!["MULTI"]);
    assert_eq!(received.recv().await.unwrap(), vec!["SET", "k", "1"]);
    assert_eq!(received.recv().await.unwrap(), vec!["DISCARD"]);

    // INCR never reached the wire.
    sleep(Duration::from_millis(100)).await;
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn flush_on_closed_client_is_refused() {
    let (listener, options) = bind().await;
    let _received = spawn_script(listener, vec![]);

    let client = Client::connect(options).await.unwrap();

    let mut pipeline = client.pipeline();
    pipeline.enqueue(Command::new("PING"));

    client.close().await;

    let result = pipeline.flush().await;
    assert!(matches!(result, Err(Error::Mode(_))));
}
