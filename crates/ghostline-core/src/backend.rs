//! The Process Backend seam: an interactive process with a duplex byte stream.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// What a running backend reports, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Data(Vec<u8>),
    /// Terminal event; nothing follows it.
    Exit(Option<i32>),
}

/// Control side of a running backend.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), SessionError>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Terminates the process. Safe to call after it has already exited.
    async fn kill(&self);
}

pub struct SpawnedBackend {
    pub handle: Arc<dyn Backend>,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
}

/// Starts backends. Implemented by [`crate::pty::PtySpawner`] and by test fakes.
pub trait BackendSpawner: Send + Sync {
    fn spawn(&self, options: &SpawnOptions) -> Result<SpawnedBackend, SessionError>;
}
