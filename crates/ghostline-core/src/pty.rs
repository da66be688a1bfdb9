//! Process Backend on top of `portable-pty`.

use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::backend::{Backend, BackendEvent, BackendSpawner, SpawnOptions, SpawnedBackend};
use crate::error::SessionError;

const READ_BUFFER_SIZE: usize = 8192;

type SharedChild = Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>;

/// Handle to an active shell PTY.
pub struct PtyBackend {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: SharedChild,
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(2),
        cols: cols.max(2),
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyBackend {
    /// Opens a PTY, starts the shell in it and spawns the reader thread.
    pub fn open(options: &SpawnOptions) -> Result<SpawnedBackend, SessionError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(options.cols, options.rows))
            .map_err(|e| SessionError::Spawn(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        if let Some(cwd) = &options.cwd {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("failed to spawn {}: {e}", options.shell)))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(format!("failed to open pty reader: {e}")))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(format!("failed to open pty writer: {e}")))?;

        let child: SharedChild = Arc::new(Mutex::new(child));
        let (events_tx, events) = mpsc::unbounded_channel();
        spawn_reader(reader, Arc::clone(&child), events_tx);

        let handle = Arc::new(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child,
        });

        Ok(SpawnedBackend { handle, events })
    }
}

/// PTY reads block, so output is pumped from a dedicated OS thread.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    child: SharedChild,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    std::thread::spawn(move || {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => {
                    if events.send(BackendEvent::Data(buffer[..count].to_vec())).is_err() {
                        // Session is gone; nobody is listening any more.
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "pty read ended");
                    break;
                }
            }
        }

        let exit_code = match child.blocking_lock().try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to read shell exit status");
                None
            }
        };
        let _ = events.send(BackendEvent::Exit(exit_code));
    });
}

#[async_trait]
impl Backend for PtyBackend {
    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::Io(format!("failed to write to pty: {e}")))?;
        writer
            .flush()
            .map_err(|e| SessionError::Io(format!("failed to flush pty: {e}")))?;
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self.master.lock().await;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| SessionError::Io(format!("failed to resize pty: {e}")))?;
        Ok(())
    }

    async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill() {
            debug!(error = %e, "shell already gone");
        }
    }
}

/// Spawns real shells in pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl BackendSpawner for PtySpawner {
    fn spawn(&self, options: &SpawnOptions) -> Result<SpawnedBackend, SessionError> {
        PtyBackend::open(options)
    }
}
