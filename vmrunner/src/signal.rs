//! Host shutdown requests.
//!
//! Ctrl-C everywhere, plus console close, logoff and system shutdown on
//! Windows and SIGTERM on Unix. A handler that cannot be installed is
//! logged and never fires.

use std::future::pending;
use std::io;

/// Resolves once the host asks this process to stop.
pub async fn shutdown_requested() {
    tokio::select! {
        () = listen("ctrl-c", tokio::signal::ctrl_c()) => {}
        () = platform() => {}
    }
}

async fn listen<F>(name: &'static str, signal: F)
where
    F: std::future::Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => tracing::info!(signal = name, "shutdown requested"),
        Err(e) => {
            tracing::warn!(signal = name, error = %e, "cannot listen for signal");
            pending::<()>().await;
        }
    }
}

#[cfg(windows)]
async fn platform() {
    use tokio::signal::windows;

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "signal stream closed")
    }

    let close = async {
        let mut stream = windows::ctrl_close()?;
        stream.recv().await.ok_or_else(closed)
    };
    let logoff = async {
        let mut stream = windows::ctrl_logoff()?;
        stream.recv().await.ok_or_else(closed)
    };
    let shutdown = async {
        let mut stream = windows::ctrl_shutdown()?;
        stream.recv().await.ok_or_else(closed)
    };

    tokio::select! {
        () = listen("ctrl-close", close) => {}
        () = listen("ctrl-logoff", logoff) => {}
        () = listen("ctrl-shutdown", shutdown) => {}
    }
}

#[cfg(unix)]
async fn platform() {
    use tokio::signal::unix::{signal, SignalKind};

    let term = async {
        let mut stream = signal(SignalKind::terminate())?;
        stream
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "signal stream closed"))
    };
    listen("sigterm", term).await;
}

#[cfg(not(any(unix, windows)))]
async fn platform() {
    pending::<()>().await;
}
