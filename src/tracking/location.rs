use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::models::position::Fix;

pub type FixStream = Pin<Box<dyn Stream<Item = Fix> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Granted,
    Denied,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location source closed")]
    Closed,
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn request_permission(&self) -> Permission;

    /// Recurring samples for as long as the stream is held.
    fn watch(&self) -> FixStream;

    /// A fix no older than `max_age`, waiting for a new sample if needed.
    /// Callers bound the wait themselves.
    async fn current_fix(&self, max_age: Duration) -> Result<Fix, LocationError>;
}

/// Location source fed from outside, e.g. by a device pushing samples over HTTP.
pub struct PushLocationProvider {
    granted: AtomicBool,
    latest: Mutex<Option<(Fix, Instant)>>,
    fixes_tx: broadcast::Sender<Fix>,
}

impl PushLocationProvider {
    pub fn new(granted: bool) -> Self {
        let (fixes_tx, _unused_rx) = broadcast::channel(64);

        Self {
            granted: AtomicBool::new(granted),
            latest: Mutex::new(None),
            fixes_tx,
        }
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    pub fn push(&self, fix: Fix) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some((fix, Instant::now()));
        }
        let _ = self.fixes_tx.send(fix);
    }
}

#[async_trait]
impl LocationProvider for PushLocationProvider {
    async fn request_permission(&self) -> Permission {
        if self.granted.load(Ordering::SeqCst) {
            Permission::Granted
        } else {
            Permission::Denied
        }
    }

    fn watch(&self) -> FixStream {
        Box::pin(BroadcastStream::new(self.fixes_tx.subscribe()).filter_map(Result::ok))
    }

    async fn current_fix(&self, max_age: Duration) -> Result<Fix, LocationError> {
        if !self.granted.load(Ordering::SeqCst) {
            return Err(LocationError::PermissionDenied);
        }

        let mut rx = self.fixes_tx.subscribe();

        let cached = self.latest.lock().ok().and_then(|latest| *latest);
        if let Some((fix, received)) = cached {
            if received.elapsed() <= max_age {
                return Ok(fix);
            }
        }

        loop {
            match rx.recv().await {
                Ok(fix) => return Ok(fix),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(LocationError::Closed),
            }
        }
    }
}
