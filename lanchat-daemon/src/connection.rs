//! Per-connection protocol driver: line parsing, dispatch, acks, file
//! reception. One task per accepted socket; errors are contained to that
//! connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use lanchat_core::protocol::{encode_ack, file_end_line, AckStatus, Message, ParseError};
use lanchat_core::{dispatch, FileTransfer, RecvBuffer, Step};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::service::{Event, Shared};

/// Read size in line mode.
const READ_CHUNK: usize = 16 * 1024;
/// Read size while receiving a file payload.
const FILE_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("line is not valid UTF-8")]
    BadEncoding,
    #[error("connection closed before the file transfer completed")]
    TruncatedTransfer,
}

/// Drive one message-port connection until the peer closes or a fatal
/// parse/I-O error. There is no partial recovery within a connection; the
/// remote reconnects and resends.
pub async fn run_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<(), ConnectionError> {
    let peer = stream.peer_addr()?;
    info!(%peer, "new connection");
    let (mut reader, mut writer) = stream.into_split();

    if let Some(line) = shared.identity_line().await {
        writer.write_all(line.as_bytes()).await?;
    }

    let mut buf = RecvBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        // Drain every complete line already buffered before reading again;
        // messages bundled into one segment are handled in arrival order.
        while let Some(line) = buf.take_line() {
            let line = String::from_utf8(line).map_err(|_| ConnectionError::BadEncoding)?;
            debug!(%peer, len = line.len(), "received line");
            let msg = Message::parse(&line)?;
            let id = msg.id().to_string();
            match dispatch(msg) {
                Step::Deliver { line, notify } => shared.deliver(&line, notify).await,
                Step::Pong => debug!(%peer, "ping"),
                Step::BeginFile(transfer) => {
                    receive_file(&mut reader, &mut writer, &mut buf, transfer, &shared).await?;
                }
            }
            writer
                .write_all(encode_ack(&id, AckStatus::Done).as_bytes())
                .await?;
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            info!(%peer, "peer closed connection");
            return Ok(());
        }
        buf.extend(&chunk[..n]);
    }
}

/// Receive one declared-size payload into the transfer directory. A failed
/// transfer deletes the partial file; the error closes the connection.
async fn receive_file(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    buf: &mut RecvBuffer,
    transfer: FileTransfer,
    shared: &Shared,
) -> Result<(), ConnectionError> {
    let dir = shared.config.transfer_dir();
    fs::create_dir_all(&dir).await?;
    let path = dir.join(transfer.filename());
    match receive_file_into(reader, writer, buf, transfer, shared, &path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "file transfer failed, deleting partial file");
            let _ = fs::remove_file(&path).await;
            Err(e)
        }
    }
}

async fn receive_file_into(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    buf: &mut RecvBuffer,
    mut transfer: FileTransfer,
    shared: &Shared,
    path: &Path,
) -> Result<(), ConnectionError> {
    debug!(
        file = transfer.filename(),
        size = transfer.declared_size(),
        "receiving file"
    );
    let mut file = fs::File::create(path).await?;
    let start = Instant::now();
    let mut last_ack = Instant::now();
    let ack_interval = shared.config.ack_interval();

    // Bytes that arrived bundled with the FILE_START line come first. The
    // drain is clipped to the declared size, so anything past it stays
    // buffered for the next line scan.
    while !transfer.is_complete() && !buf.is_empty() {
        let remaining = usize::try_from(transfer.remaining()).unwrap_or(usize::MAX);
        let pending = buf.take_at_most(remaining);
        let (write, _) = transfer.split(&pending);
        file.write_all(write).await?;
    }

    let mut chunk = vec![0u8; FILE_CHUNK];
    while !transfer.is_complete() {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ConnectionError::TruncatedTransfer);
        }
        let (write, overflow) = transfer.split(&chunk[..n]);
        file.write_all(write).await?;
        // Over-read bytes belong to the next line-mode message.
        buf.give_back(overflow);
        if !transfer.is_complete() && last_ack.elapsed() >= ack_interval {
            last_ack = Instant::now();
            writer
                .write_all(
                    encode_ack(transfer.id(), AckStatus::Progress(transfer.received()))
                        .as_bytes(),
                )
                .await?;
            send_progress(shared, path, &transfer, start);
        }
    }

    file.flush().await?;
    drop(file);
    send_progress(shared, path, &transfer, start);
    info!(path = %path.display(), bytes = transfer.received(), "file transfer complete");
    shared
        .deliver(
            &file_end_line(transfer.id(), &path.display().to_string()),
            false,
        )
        .await;
    Ok(())
}

fn send_progress(shared: &Shared, path: &Path, transfer: &FileTransfer, start: Instant) {
    let _ = shared.events.send(Event::FileProgress {
        path: path.to_path_buf(),
        received: transfer.received(),
        size: transfer.declared_size(),
        elapsed_ms: start.elapsed().as_millis() as u64,
    });
}

/// Drive one subscriber-port connection: greet with the current network
/// state and the offline buffer, then fan out every delivered line.
/// Subscribers never drive protocol state; inbound bytes are drained and
/// logged.
pub async fn run_subscriber(stream: TcpStream, shared: Arc<Shared>) -> Result<(), ConnectionError> {
    let peer = stream.peer_addr()?;
    info!(%peer, "new subscriber");
    let mut rx = shared.subscribers.subscribe();
    let (mut reader, mut writer) = stream.into_split();

    if let Some(line) = shared.network_line().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    let replayed = shared.offline.drain_to_writer(&mut writer).await?;
    if replayed > 0 {
        info!(%peer, replayed, "replayed offline buffer to subscriber");
    }

    let mut inbound = vec![0u8; 4096];
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(line) => {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%peer, skipped, "subscriber lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            r = reader.read(&mut inbound) => {
                let n = r?;
                if n == 0 {
                    info!(%peer, "subscriber disconnected");
                    return Ok(());
                }
                debug!(%peer, bytes = n, "ignoring inbound subscriber bytes");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::SocketAddr;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, Duration};

    fn test_shared(
        dir: &tempfile::TempDir,
        ack_interval_ms: u64,
    ) -> (Arc<Shared>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ack_interval_ms,
            ..Config::default()
        };
        (Arc::new(Shared::new(config, tx)), rx)
    }

    async fn serve_one(
        shared: Arc<Shared>,
    ) -> (SocketAddr, JoinHandle<Result<(), ConnectionError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            run_connection(stream, shared).await
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn text_buffered_then_file_with_carried_over_ping() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir, 500);
        let (addr, server) = serve_one(shared.clone()).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        let mut acks = BufReader::new(read_half).lines();

        // No consumer attached: the text lands in the offline buffer.
        write_half.write_all(b"TEXT:1:hello\n").await.unwrap();
        assert_eq!(acks.next_line().await.unwrap().unwrap(), "ACK:1:DONE");
        let buffered = tokio::fs::read_to_string(shared.config.buffer_path())
            .await
            .unwrap();
        assert_eq!(buffered, "TEXT:1:hello\n");

        // Consumer attaches: replayed once, file cleared.
        let (tx, mut sink) = mpsc::unbounded_channel();
        *shared.message_sink.lock().await = Some(tx.clone());
        let n = shared
            .offline
            .drain(|line| tx.send(line.to_string()).is_ok())
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(sink.recv().await.unwrap(), "TEXT:1:hello");
        assert!(!shared.config.buffer_path().exists());

        // File payload and the next message in the same segment: the PING
        // bytes are carried over and parsed after the file completes.
        write_half
            .write_all(b"FILE_START:2:pic.jpg:10\n0123456789PING:3\n")
            .await
            .unwrap();
        assert_eq!(acks.next_line().await.unwrap().unwrap(), "ACK:2:DONE");
        assert_eq!(acks.next_line().await.unwrap().unwrap(), "ACK:3:DONE");

        let written = tokio::fs::read(shared.config.transfer_dir().join("pic.jpg"))
            .await
            .unwrap();
        assert_eq!(written, b"0123456789");

        // Completion is a local-only event line, not wire traffic.
        let end = sink.recv().await.unwrap();
        assert!(end.starts_with("FILE_END:2:"));
        assert!(end.ends_with("pic.jpg"));

        drop(write_half);
        drop(acks);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_line_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir, 500);
        let (addr, server) = serve_one(shared).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"NO_FIELDS\n").await.unwrap();
        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Parse(_)));
        // Server side closed; the client read returns EOF.
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_type_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir, 500);
        let (addr, server) = serve_one(shared).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"NOPE:1:x\n").await.unwrap();
        assert!(matches!(
            server.await.unwrap().unwrap_err(),
            ConnectionError::Parse(ParseError::UnknownType(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_mid_transfer_deletes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir, 500);
        let (addr, server) = serve_one(shared.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"FILE_START:4:part.bin:100\nabcdefghij")
            .await
            .unwrap();
        drop(client);

        assert!(matches!(
            server.await.unwrap().unwrap_err(),
            ConnectionError::TruncatedTransfer
        ));
        assert!(!shared.config.transfer_dir().join("part.bin").exists());
    }

    #[tokio::test]
    async fn progress_acks_are_interval_paced() {
        let dir = tempfile::tempdir().unwrap();
        // Zero interval: every socket read while incomplete acks progress.
        let (shared, mut events) = test_shared(&dir, 0);
        let (addr, server) = serve_one(shared.clone()).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        let mut acks = BufReader::new(read_half).lines();

        write_half.write_all(b"FILE_START:9:f.bin:10\n").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        write_half.write_all(b"012345").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        write_half.write_all(b"6789").await.unwrap();

        assert_eq!(acks.next_line().await.unwrap().unwrap(), "ACK:9:6");
        assert_eq!(acks.next_line().await.unwrap().unwrap(), "ACK:9:DONE");

        // Progress and completion events carry the byte accounting.
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if let Event::FileProgress { received, size, .. } = event {
                assert!(received <= size);
                last = Some(received);
            }
        }
        assert_eq!(last, Some(10));

        drop(write_half);
        drop(acks);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn identity_line_prefixes_new_connections() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir, 500);
        *shared.identity.lock().await = Some(crate::service::DeviceIdentity {
            hostname: "alpha".into(),
            token: "tok-1".into(),
        });
        let (addr, server) = serve_one(shared).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = client.into_split();
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "TEXT:NULL_ID:PN_INFO:alpha tok-1"
        );

        let _ = write_half.shutdown().await;
        drop(lines);
        let _ = server.await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_gets_greeting_buffer_and_fanout() {
        let dir = tempfile::tempdir().unwrap();
        let (shared, _events) = test_shared(&dir, 500);
        shared.offline.append("TEXT:1:backlog").await.unwrap();
        shared.devices.lock().await.push(lanchat_core::Device {
            address: "100.64.0.9".into(),
            hostname: Some("mypc.lan".into()),
            interface: None,
            is_local: true,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sub_shared = shared.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            run_subscriber(stream, sub_shared).await
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let (read_half, _write_half) = client.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = lines.next_line().await.unwrap().unwrap();
        assert!(greeting.starts_with("NETWORK:["));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "TEXT:1:backlog");

        shared.deliver("TEXT:2:live", false).await;
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "TEXT:2:live");
        // Fan-out running implies the greeting drain settled and cleared.
        assert!(!shared.config.buffer_path().exists());

        drop(lines);
        drop(_write_half);
        server.abort();
    }
}
