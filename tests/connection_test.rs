use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tcpkit::network::{Frame, HEADER_LEN};
use tcpkit::{
    listen, AppError, CodecParams, Connection, DelimitedCodec, EventHandler, FrameCodec,
    LengthPrefixedCodec, LengthPrefixedConfig, Listener, NetworkConfig, ShutdownTrigger,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, timeout, Instant};

#[derive(Debug, PartialEq)]
enum Event {
    Data(Bytes),
    Close,
    Error(String),
}

fn record_events(connection: &Connection, tx: &UnboundedSender<Event>) {
    let data_tx = tx.clone();
    connection.on_data(move |frame| {
        let _ = data_tx.send(Event::Data(frame));
    });
    let close_tx = tx.clone();
    connection.on_close(move || {
        let _ = close_tx.send(Event::Close);
    });
    let error_tx = tx.clone();
    connection.on_error(move |err| {
        let _ = error_tx.send(Event::Error(err.to_string()));
    });
}

/// Spawns a listener whose connections report into the returned channels.
async fn start_listener(
    codec: Arc<dyn FrameCodec>,
) -> (
    SocketAddr,
    UnboundedReceiver<Event>,
    UnboundedReceiver<Connection>,
) {
    let listener = Listener::bind("127.0.0.1:0", codec).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let _ = listener
            .run(move |connection| {
                record_events(connection, &event_tx);
                let _ = conn_tx.send(connection.clone());
            })
            .await;
    });
    (addr, event_rx, conn_rx)
}

async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event in time")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_delimited_frames_across_reads() {
    let (addr, mut events, _) = start_listener(Arc::new(DelimitedCodec::default())).await;
    let mut peer = TcpStream::connect(addr).await.unwrap();

    peer.write_all(b"abc\r\ndef").await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Data(Bytes::from_static(b"abc")));
    sleep(Duration::from_millis(50)).await;
    peer.write_all(b"\r\n").await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Data(Bytes::from_static(b"def")));

    drop(peer);
    assert_eq!(next_event(&mut events).await, Event::Close);
}

#[tokio::test]
async fn test_length_prefixed_frame_split_over_writes() {
    let (addr, mut events, _) = start_listener(Arc::new(LengthPrefixedCodec::default())).await;
    let mut peer = TcpStream::connect(addr).await.unwrap();

    let wire = Frame::new(5, 42, Bytes::from_static(b"ok")).unwrap().encode();
    for chunk in [&wire[..3], &wire[3..HEADER_LEN], &wire[HEADER_LEN..]] {
        peer.write_all(chunk).await.unwrap();
        sleep(Duration::from_millis(20)).await;
    }

    let Event::Data(frame) = next_event(&mut events).await else {
        panic!("expected a data event");
    };
    assert_eq!(frame, wire);
    let decoded = Frame::decode(&frame).unwrap();
    assert_eq!(decoded.header.message_type, 5);
    assert_eq!(decoded.header.target_id, 42);
    assert_eq!(decoded.payload.as_ref(), b"ok");
}

#[tokio::test]
async fn test_oversized_pending_reports_one_error() {
    let codec = LengthPrefixedCodec::new(LengthPrefixedConfig {
        recv_buffer_capacity: 1024,
        min_free_space: 128,
        max_pending: 512,
    })
    .unwrap();
    let (addr, mut events, _) = start_listener(Arc::new(codec)).await;
    let mut peer = TcpStream::connect(addr).await.unwrap();

    // header announcing 1000 bytes, followed by more than max_pending of them
    let mut wire = vec![1u8, 0, 0x03, 0xE8, 0, 0, 0, 0, 0, 0, 0, 0];
    wire.extend(std::iter::repeat(b'x').take(700));
    peer.write_all(&wire).await.unwrap();

    let Event::Error(message) = next_event(&mut events).await else {
        panic!("expected an error event");
    };
    assert!(message.contains("too large"), "{}", message);

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), peer.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_read_timeout_fails_connection() {
    let listener = Listener::bind("127.0.0.1:0", Arc::new(DelimitedCodec::default()))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut events) = mpsc::unbounded_channel();
    let (kind_tx, mut kinds) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let _ = listener
            .run(move |connection| {
                record_events(connection, &tx);
                let kind_tx = kind_tx.clone();
                connection.on_error(move |err| {
                    if let AppError::IoError(err) = err {
                        let _ = kind_tx.send(err.kind());
                    }
                });
                connection.set_read_timeout(Some(Duration::from_millis(200)));
            })
            .await;
    });

    let mut peer = TcpStream::connect(addr).await.unwrap();
    peer.write_all(b"early\r\n").await.unwrap();
    assert_eq!(next_event(&mut events).await, Event::Data(Bytes::from_static(b"early")));

    let kind = timeout(Duration::from_secs(5), kinds.recv()).await.unwrap();
    assert_eq!(kind, Some(ErrorKind::TimedOut));
}

#[tokio::test]
async fn test_local_close_is_idempotent_and_silent() {
    let (addr, mut events, mut connections) =
        start_listener(Arc::new(DelimitedCodec::default())).await;
    let mut peer = TcpStream::connect(addr).await.unwrap();
    let connection = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(!connection.is_closed());
    connection.close();
    connection.close();
    assert!(connection.is_closed());
    timeout(Duration::from_secs(1), connection.closed()).await.unwrap();

    let write = connection.write(b"late\r\n").await;
    assert!(matches!(write, Err(AppError::IoError(_))));

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), peer.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_server_side_send_and_metadata() {
    let (addr, _, mut connections) = start_listener(Arc::new(DelimitedCodec::default())).await;
    let mut peer = TcpStream::connect(addr).await.unwrap();
    let connection = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(connection.peer_addr(), peer.local_addr().unwrap());
    assert_eq!(connection.local_addr(), addr);
    assert_eq!(connection.codec().name(), "delimited");

    connection.attributes().set("user", "alice");
    assert_eq!(connection.attributes().get_str("user").as_deref(), Some("alice"));

    let written = connection
        .send(b"hello", &CodecParams::default())
        .await
        .unwrap();
    assert_eq!(written, 7);
    connection.write(b"raw\r\n").await.unwrap();

    let mut buf = vec![0u8; 12];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello\r\nraw\r\n");
}

#[tokio::test]
async fn test_bind_by_event_name() {
    let (addr, _, mut connections) = start_listener(Arc::new(DelimitedCodec::default())).await;
    let _peer = TcpStream::connect(addr).await.unwrap();
    let connection = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(connection.bind("Close", EventHandler::close(|| {})).is_ok());
    assert!(matches!(
        connection.bind("data", EventHandler::close(|| {})),
        Err(AppError::InvalidValue(_))
    ));
    assert!(matches!(
        connection.bind("connect", EventHandler::data(|_| {})),
        Err(AppError::InvalidValue(_))
    ));
}

#[tokio::test]
async fn test_bind_errors() {
    let codec: Arc<dyn FrameCodec> = Arc::new(DelimitedCodec::default());
    assert!(matches!(
        Listener::bind("localhost", codec.clone()).await,
        Err(AppError::AddressFormat(_))
    ));
    assert!(matches!(
        Listener::bind("127.0.0.1:http", codec.clone()).await,
        Err(AppError::AddressFormat(_))
    ));
    assert!(matches!(
        listen("127.0.0.1", codec.clone(), |_| {}).await,
        Err(AppError::AddressFormat(_))
    ));

    let taken = Listener::bind("127.0.0.1:0", codec.clone()).await.unwrap();
    let address = taken.local_addr().unwrap().to_string();
    assert!(matches!(
        Listener::bind(&address, codec).await,
        Err(AppError::Bind(_))
    ));
}

#[tokio::test]
async fn test_run_until_returns_on_shutdown() {
    let listener = Listener::bind("127.0.0.1:0", Arc::new(DelimitedCodec::default()))
        .await
        .unwrap();
    let trigger = ShutdownTrigger::new();
    let shutdown = trigger.subscribe();
    let handle = tokio::spawn(async move { listener.run_until(|_| {}, shutdown).await });

    sleep(Duration::from_millis(50)).await;
    trigger.trigger();
    let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_close_aborts_write_blocked_on_silent_peer() {
    let config = NetworkConfig {
        max_connection: 1,
        ..Default::default()
    };
    let listener = Listener::bind_with("127.0.0.1:0", Arc::new(DelimitedCodec::default()), &config)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, mut connections) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let _ = listener
            .run(move |connection| {
                let _ = conn_tx.send(connection.clone());
            })
            .await;
    });

    // never reads, so the server's socket buffer fills up
    let _silent_peer = TcpStream::connect(addr).await.unwrap();
    let connection = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();

    let writer = connection.clone();
    let writing = tokio::spawn(async move {
        let chunk = vec![b'x'; 1 << 20];
        loop {
            if let Err(err) = writer.write(&chunk).await {
                return err;
            }
        }
    });
    sleep(Duration::from_millis(500)).await;
    assert!(!writing.is_finished());

    connection.close();
    let err = timeout(Duration::from_secs(3), writing)
        .await
        .expect("write still blocked after close")
        .unwrap();
    assert!(matches!(err, AppError::IoError(ref e) if e.kind() == ErrorKind::NotConnected));

    // the only connection slot is free again once the receive loop ended
    let _next_peer = TcpStream::connect(addr).await.unwrap();
    let next = timeout(Duration::from_secs(3), connections.recv())
        .await
        .expect("connection slot was not released")
        .unwrap();
    assert_ne!(next.id(), connection.id());
}

#[tokio::test]
async fn test_read_deadline_on_running_connection() {
    let (addr, mut events, mut connections) =
        start_listener(Arc::new(DelimitedCodec::default())).await;

    let _idle_peer = TcpStream::connect(addr).await.unwrap();
    let idle = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();
    let (kind_tx, mut kinds) = mpsc::unbounded_channel();
    idle.on_error(move |err| {
        if let AppError::IoError(err) = err {
            let _ = kind_tx.send(err.kind());
        }
    });
    // the receive loop is already waiting in a read without a deadline
    sleep(Duration::from_millis(50)).await;
    idle.set_read_deadline(Some(Instant::now() + Duration::from_millis(200)));

    let kind = timeout(Duration::from_secs(5), kinds.recv()).await.unwrap();
    assert_eq!(kind, Some(ErrorKind::TimedOut));
    assert!(idle.is_closed());

    let mut active_peer = TcpStream::connect(addr).await.unwrap();
    let active = timeout(Duration::from_secs(5), connections.recv())
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(50)).await;
    active.set_read_deadline(Some(Instant::now() + Duration::from_millis(200)));
    active.set_read_deadline(None);
    assert_eq!(active.read_deadline(), None);

    sleep(Duration::from_millis(500)).await;
    assert!(!active.is_closed());
    active_peer.write_all(b"still here\r\n").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        Event::Data(Bytes::from_static(b"still here"))
    );
}
