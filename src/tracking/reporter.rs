//! Forwards device location to the backend at a bounded rate.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, DRIVERS_TABLE, Filter, Row};
use crate::geo::{bearing_deg, is_finite_point, is_plausible};
use crate::models::order::DriverId;
use crate::models::position::{Fix, GeoPoint};
use crate::observability::metrics::Metrics;
use crate::sync::normalize::{DriverField, driver_column};
use crate::tracking::location::{LocationProvider, Permission};

#[derive(Debug, Clone, Copy)]
pub struct ReporterConfig {
    pub throttle: Duration,
    pub logout_clear_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Discarded,
    Cached,
    Uploaded,
    UploadFailed,
}

impl SampleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleOutcome::Discarded => "discarded",
            SampleOutcome::Cached => "cached",
            SampleOutcome::Uploaded => "uploaded",
            SampleOutcome::UploadFailed => "upload_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Watching,
    AlreadyWatching,
    /// Permission was refused; the reporter stays idle.
    Inert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogoutReport {
    pub cleared_now: bool,
    pub fallback_scheduled: bool,
}

#[derive(Default)]
struct ReporterState {
    last_upload: Option<Instant>,
    last_fix: Option<Fix>,
    last_plausible: Option<GeoPoint>,
    permission: Option<Permission>,
}

pub struct PositionReporter {
    driver_id: DriverId,
    backend: Arc<dyn Backend>,
    config: ReporterConfig,
    metrics: Metrics,
    state: Mutex<ReporterState>,
    watch: Mutex<Option<CancellationToken>>,
    fallback_clear: Mutex<Option<JoinHandle<()>>>,
}

impl PositionReporter {
    pub fn new(
        driver_id: DriverId,
        backend: Arc<dyn Backend>,
        config: ReporterConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            driver_id,
            backend,
            config,
            metrics,
            state: Mutex::new(ReporterState::default()),
            watch: Mutex::new(None),
            fallback_clear: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReporterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn last_fix(&self) -> Option<Fix> {
        self.state().last_fix
    }

    /// Latest point worth centering a map on.
    pub fn centering_target(&self) -> Option<GeoPoint> {
        self.state().last_plausible
    }

    pub fn is_watching(&self) -> bool {
        self.watch.lock().map(|watch| watch.is_some()).unwrap_or(false)
    }

    /// Asks for permission once and starts consuming the provider's samples.
    pub async fn start(self: &Arc<Self>, provider: Arc<dyn LocationProvider>) -> StartOutcome {
        if self.is_watching() {
            return StartOutcome::AlreadyWatching;
        }

        let known = self.state().permission;
        let permission = match known {
            Some(permission) => permission,
            None => {
                let permission = provider.request_permission().await;
                self.state().permission = Some(permission);
                permission
            }
        };

        if permission == Permission::Denied {
            warn!(driver_id = %self.driver_id, "location permission denied; position reporting disabled");
            return StartOutcome::Inert;
        }

        let token = CancellationToken::new();
        {
            let Ok(mut watch) = self.watch.lock() else {
                return StartOutcome::Inert;
            };
            if watch.is_some() {
                return StartOutcome::AlreadyWatching;
            }
            *watch = Some(token.clone());
        }

        let mut samples = provider.watch();
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = samples.next() => match next {
                        Some(fix) => {
                            reporter.on_sample(fix).await;
                        }
                        None => break,
                    },
                }
            }
            debug!(driver_id = %reporter.driver_id, "location watch ended");
        });

        info!(driver_id = %self.driver_id, "location watch started");
        StartOutcome::Watching
    }

    pub fn stop(&self) {
        if let Ok(mut watch) = self.watch.lock() {
            if let Some(token) = watch.take() {
                token.cancel();
                info!(driver_id = %self.driver_id, "location watch stopped");
            }
        }
    }

    /// Handles one sample: always kept in memory, uploaded only when the
    /// throttle window since the last successful upload has passed.
    pub async fn on_sample(&self, fix: Fix) -> SampleOutcome {
        let outcome = self.process_sample(fix).await;
        self.metrics
            .position_uploads_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        outcome
    }

    async fn process_sample(&self, fix: Fix) -> SampleOutcome {
        if !is_finite_point(&fix.point) {
            return SampleOutcome::Discarded;
        }

        let (fix, due) = {
            let mut state = self.state();

            let heading = fix.heading.filter(|h| h.is_finite()).or_else(|| {
                state
                    .last_fix
                    .filter(|prev| prev.point != fix.point)
                    .map(|prev| bearing_deg(&prev.point, &fix.point))
            });
            let fix = Fix { heading, ..fix };

            state.last_fix = Some(fix);
            if is_plausible(&fix.point) {
                state.last_plausible = Some(fix.point);
            }

            let due = state
                .last_upload
                .is_none_or(|last| last.elapsed() > self.config.throttle);
            (fix, due)
        };

        if !due {
            return SampleOutcome::Cached;
        }

        let mut patch = Row::new();
        patch.insert(driver_column(DriverField::Lat).to_string(), Value::from(fix.point.lat));
        patch.insert(driver_column(DriverField::Lng).to_string(), Value::from(fix.point.lng));
        patch.insert(
            driver_column(DriverField::LastSignal).to_string(),
            Value::from(fix.taken_at.to_rfc3339()),
        );
        if let Some(heading) = fix.heading {
            patch.insert(driver_column(DriverField::Heading).to_string(), Value::from(heading));
        }

        match self.backend.update(DRIVERS_TABLE, self.own_row(), patch).await {
            Ok(_) => {
                self.state().last_upload = Some(Instant::now());
                SampleOutcome::Uploaded
            }
            Err(err) => {
                warn!(driver_id = %self.driver_id, error = %err, "position upload failed");
                SampleOutcome::UploadFailed
            }
        }
    }

    fn own_row(&self) -> Filter {
        Filter::new().eq(driver_column(DriverField::Id), self.driver_id.0)
    }

    async fn clear_position(backend: &dyn Backend, driver_id: DriverId) -> Result<(), BackendError> {
        let mut patch = Row::new();
        for field in [
            DriverField::Lat,
            DriverField::Lng,
            DriverField::Heading,
            DriverField::LastSignal,
        ] {
            patch.insert(driver_column(field).to_string(), Value::Null);
        }

        backend
            .update(
                DRIVERS_TABLE,
                Filter::new().eq(driver_column(DriverField::Id), driver_id.0),
                patch,
            )
            .await?;
        Ok(())
    }

    /// Stops the watch and clears the stored position, once now and once more
    /// after the fallback delay.
    pub async fn logout(&self) -> LogoutReport {
        self.stop();
        {
            let mut state = self.state();
            state.last_fix = None;
            state.last_plausible = None;
            state.last_upload = None;
        }

        let cleared_now = match Self::clear_position(self.backend.as_ref(), self.driver_id).await {
            Ok(()) => true,
            Err(err) => {
                warn!(driver_id = %self.driver_id, error = %err, "immediate position clear failed");
                false
            }
        };

        let backend = Arc::clone(&self.backend);
        let driver_id = self.driver_id;
        let delay = self.config.logout_clear_delay;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            match Self::clear_position(backend.as_ref(), driver_id).await {
                Ok(()) => info!(driver_id = %driver_id, "position cleared after logout"),
                Err(err) => warn!(driver_id = %driver_id, error = %err, "fallback position clear failed"),
            }
        });

        if let Ok(mut pending) = self.fallback_clear.lock() {
            if let Some(previous) = pending.replace(handle) {
                previous.abort();
            }
        }

        LogoutReport {
            cleared_now,
            fallback_scheduled: true,
        }
    }
}
