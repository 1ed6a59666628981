use bytes::Bytes;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;
use tokio::sync::mpsc;

/// Byte that detaches from an attached session (Ctrl+]).
pub const DETACH_KEY: u8 = 0x1d;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// When created, enables raw mode on the terminal. When dropped (even on panic),
/// restores the terminal to its previous state.
///
/// Raw mode is needed to capture all keystrokes (including Ctrl+C, etc.) and
/// forward them to the remote shell instead of having the local terminal
/// handle them.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current terminal size as (cols, rows).
pub fn terminal_size() -> anyhow::Result<(u16, u16)> {
    let (cols, rows) = size()?;
    Ok((cols, rows))
}

/// Read stdin on a blocking thread. The channel closes on EOF or error.
pub fn spawn_stdin_reader() -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// Terminal size changes. Once the signal source is gone, [`changed`]
/// never resolves again.
///
/// [`changed`]: ResizeWatcher::changed
pub struct ResizeWatcher {
    rx: Option<mpsc::Receiver<(u16, u16)>>,
}

impl ResizeWatcher {
    fn new(rx: mpsc::Receiver<(u16, u16)>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Next (cols, rows). Cancel-safe.
    pub async fn changed(&mut self) -> (u16, u16) {
        if let Some(rx) = &mut self.rx {
            if let Some(dims) = rx.recv().await {
                return dims;
            }
            tracing::debug!("resize watcher stopped");
            self.rx = None;
        }
        std::future::pending().await
    }
}

/// Report the new (cols, rows) whenever the terminal is resized.
pub fn spawn_resize_watcher() -> ResizeWatcher {
    let (tx, rx) = mpsc::channel::<(u16, u16)>(4);
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "cannot watch window size changes");
                return;
            }
        };
        while sigwinch.recv().await.is_some() {
            if let Ok(dims) = terminal_size() {
                if tx.send(dims).await.is_err() {
                    break;
                }
            }
        }
    });
    #[cfg(not(unix))]
    drop(tx);
    ResizeWatcher::new(rx)
}

/// Split off everything before the detach key. Returns the bytes to forward
/// and whether the key was pressed.
pub fn split_detach(data: &Bytes) -> (Bytes, bool) {
    match data.iter().position(|&b| b == DETACH_KEY) {
        Some(pos) => (data.slice(..pos), true),
        None => (data.clone(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_key_cuts_input() {
        let (fwd, detach) = split_detach(&Bytes::from_static(b"ls\r\x1dmore"));
        assert_eq!(fwd.as_ref(), b"ls\r");
        assert!(detach);

        let (fwd, detach) = split_detach(&Bytes::from_static(b"plain"));
        assert_eq!(fwd.as_ref(), b"plain");
        assert!(!detach);
    }

    #[tokio::test]
    async fn resize_watcher_goes_quiet_when_source_stops() {
        let (tx, rx) = mpsc::channel(4);
        let mut watcher = ResizeWatcher::new(rx);
        tx.send((100, 40)).await.unwrap();
        drop(tx);

        assert_eq!(watcher.changed().await, (100, 40));
        let idle = tokio::time::timeout(std::time::Duration::from_millis(50), watcher.changed()).await;
        assert!(idle.is_err());
        assert!(watcher.rx.is_none());
    }
}
