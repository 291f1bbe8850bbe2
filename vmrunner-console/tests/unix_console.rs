//! Console transport over a real Unix-domain socket standing in for the
//! guest's serial console.

#![cfg(unix)]

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use vmrunner_console::transport::UnixSocketConnector;
use vmrunner_console::{open_duplex, run_command, ConsoleError};

async fn serve_shell(stream: UnixStream) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let _ = write.write_all(b"/ # ").await;
    while let Ok(Some(line)) = lines.next_line().await {
        let _ = write.write_all(format!("{line}\r\n").as_bytes()).await;
        if let Some(rest) = line.strip_prefix("echo ") {
            let _ = write.write_all(format!("{rest}\r\n").as_bytes()).await;
        }
        let _ = write.write_all(b"/ # ").await;
    }
}

#[tokio::test]
async fn open_waits_for_socket_then_runs_command() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("vm-console.sock");
    let name = path.to_str().expect("utf-8 path").to_owned();

    let server_path = path.clone();
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let listener = UnixListener::bind(&server_path).expect("bind console socket");
        let (stream, _) = listener.accept().await.expect("accept");
        serve_shell(stream).await;
    });

    let channel = open_duplex(
        &UnixSocketConnector,
        &name,
        Duration::from_secs(5),
        Duration::from_millis(50),
    )
    .await
    .expect("socket appears within budget");

    let mut echoed = Vec::new();
    let captured = run_command(channel, &["echo", "hello world"], &mut echoed)
        .await
        .expect("command completes");
    let text = String::from_utf8_lossy(&captured);
    assert!(text.contains("hello world"), "captured: {text:?}");

    server.abort();
}

#[tokio::test]
async fn missing_socket_times_out() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("never.sock");

    let started = std::time::Instant::now();
    let result = open_duplex(
        &UnixSocketConnector,
        path.to_str().expect("utf-8 path"),
        Duration::from_millis(300),
        Duration::from_millis(50),
    )
    .await;
    assert!(matches!(result, Err(ConsoleError::OpenTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn guest_hangup_ends_forwarding_cleanly() {
    let (host, mut guest) = UnixStream::pair().expect("socket pair");
    guest.write_all(b"bye\r\n").await.expect("write");
    drop(guest);

    let (read, _write) = host.into_split();
    let (sink, mut shown) = tokio::io::duplex(64);
    vmrunner_console::transport::forward_to_stdout(read, sink)
        .await
        .expect("hangup is not an error");

    let mut out = Vec::new();
    shown.read_to_end(&mut out).await.expect("read");
    assert_eq!(out, b"bye\r\n");
}
