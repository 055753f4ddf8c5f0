//! Dispatch alert shown to the driver when one of their orders goes en route.
//!
//! The alert is edge-triggered and latching: it turns on once per transition
//! and stays on until the driver dismisses it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::order::OrderId;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("alert output failed: {0}")]
pub struct AlertOutputError(pub String);

/// Device outputs the alert drives. Every call is best effort.
pub trait AlertOutputs: Send + Sync {
    fn start_audio(&self) -> Result<(), AlertOutputError>;
    fn stop_audio(&self) -> Result<(), AlertOutputError>;
    fn start_vibration(&self) -> Result<(), AlertOutputError>;
    fn stop_vibration(&self) -> Result<(), AlertOutputError>;
    fn show_notice(&self, order_id: OrderId) -> Result<(), AlertOutputError>;
    fn clear_notice(&self) -> Result<(), AlertOutputError>;
}

/// Outputs for headless runs: every action becomes a log line.
pub struct LogOutputs;

impl AlertOutputs for LogOutputs {
    fn start_audio(&self) -> Result<(), AlertOutputError> {
        info!("alert audio started");
        Ok(())
    }

    fn stop_audio(&self) -> Result<(), AlertOutputError> {
        info!("alert audio stopped");
        Ok(())
    }

    fn start_vibration(&self) -> Result<(), AlertOutputError> {
        info!("alert vibration started");
        Ok(())
    }

    fn stop_vibration(&self) -> Result<(), AlertOutputError> {
        info!("alert vibration stopped");
        Ok(())
    }

    fn show_notice(&self, order_id: OrderId) -> Result<(), AlertOutputError> {
        info!(order_id = %order_id, "alert notice shown");
        Ok(())
    }

    fn clear_notice(&self) -> Result<(), AlertOutputError> {
        info!("alert notice cleared");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "order_id")]
pub enum AlertState {
    Idle,
    Alerting(OrderId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DismissReport {
    pub was_alerting: bool,
    pub audio_stopped: bool,
    pub vibration_stopped: bool,
    pub notice_cleared: bool,
}

pub struct AlertSignal {
    state: Mutex<AlertState>,
    outputs: Arc<dyn AlertOutputs>,
    activations: AtomicU64,
}

impl AlertSignal {
    pub fn new(outputs: Arc<dyn AlertOutputs>) -> Self {
        Self {
            state: Mutex::new(AlertState::Idle),
            outputs,
            activations: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> AlertState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(AlertState::Idle)
    }

    pub fn is_alerting(&self) -> bool {
        matches!(self.state(), AlertState::Alerting(_))
    }

    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::SeqCst)
    }

    /// Moves Idle to Alerting. Returns `false` when already alerting.
    pub fn trigger(&self, order_id: OrderId) -> bool {
        {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if matches!(*state, AlertState::Alerting(_)) {
                return false;
            }
            *state = AlertState::Alerting(order_id);
        }

        self.activations.fetch_add(1, Ordering::SeqCst);
        info!(order_id = %order_id, "order en route; alert raised");

        best_effort("start audio", self.outputs.start_audio());
        best_effort("start vibration", self.outputs.start_vibration());
        best_effort("show notice", self.outputs.show_notice(order_id));
        true
    }

    /// Driver acknowledgement. Stops every output even if one of them fails.
    pub fn dismiss(&self) -> DismissReport {
        let was_alerting = match self.state.lock() {
            Ok(mut state) => {
                let was = matches!(*state, AlertState::Alerting(_));
                *state = AlertState::Idle;
                was
            }
            Err(_) => false,
        };

        let report = DismissReport {
            was_alerting,
            audio_stopped: best_effort("stop audio", self.outputs.stop_audio()),
            vibration_stopped: best_effort("stop vibration", self.outputs.stop_vibration()),
            notice_cleared: best_effort("clear notice", self.outputs.clear_notice()),
        };

        info!(was_alerting, "alert dismissed");
        report
    }
}

fn best_effort(action: &str, result: Result<(), AlertOutputError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(action, error = %err, "alert output failed");
            false
        }
    }
}
