use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::alert::{AlertOutputs, AlertSignal};
use crate::backend::Backend;
use crate::config::Config;
use crate::finalize::notify::{LinkOpener, NotificationScheduler};
use crate::finalize::sequencer::{FinalizationSequencer, FinalizeConfig};
use crate::models::order::DriverId;
use crate::observability::metrics::Metrics;
use crate::store::LocalStore;
use crate::sync::repository::OrderRepository;
use crate::tracking::fleet::FleetBoard;
use crate::tracking::location::PushLocationProvider;
use crate::tracking::reporter::{PositionReporter, ReporterConfig};

/// Everything one driver session needs, shared by the HTTP handlers and the
/// background feeds.
pub struct AppState {
    pub config: Config,
    pub driver_id: DriverId,
    pub backend: Arc<dyn Backend>,
    pub location: Arc<PushLocationProvider>,
    pub alert: Arc<AlertSignal>,
    pub repo: Arc<OrderRepository>,
    pub reporter: Arc<PositionReporter>,
    pub notifications: Arc<NotificationScheduler>,
    pub sequencer: FinalizationSequencer,
    pub fleet: FleetBoard,
    pub store: Arc<LocalStore>,
    pub metrics: Metrics,
    /// Cancelled on logout; ends the realtime feeds and the refresh loop.
    pub session: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        location: Arc<PushLocationProvider>,
        outputs: Arc<dyn AlertOutputs>,
        opener: Arc<dyn LinkOpener>,
        store: LocalStore,
    ) -> Self {
        let driver_id = config
            .driver_id
            .map(DriverId)
            .or_else(|| store.driver_id())
            .unwrap_or(DriverId(1));

        let metrics = Metrics::new();
        let store = Arc::new(store);
        let alert = Arc::new(AlertSignal::new(outputs));
        let repo = Arc::new(OrderRepository::new(
            driver_id,
            backend.clone(),
            alert.clone(),
            config.fetch_limit,
            config.history_limit,
        ));
        let reporter = Arc::new(PositionReporter::new(
            driver_id,
            backend.clone(),
            ReporterConfig {
                throttle: config.position_throttle,
                logout_clear_delay: config.logout_clear_delay,
            },
            metrics.clone(),
        ));
        let notifications = Arc::new(NotificationScheduler::new(opener, config.notify_delay));
        let sequencer = FinalizationSequencer::new(
            backend.clone(),
            repo.clone(),
            location.clone(),
            store.clone(),
            notifications.clone(),
            metrics.clone(),
            FinalizeConfig {
                gps_timeout: config.gps_timeout,
                gps_max_age: config.gps_max_age,
                manager_phone: config.manager_phone.clone(),
            },
        );

        Self {
            config,
            driver_id,
            backend,
            location,
            alert,
            repo,
            reporter,
            notifications,
            sequencer,
            fleet: FleetBoard::new(),
            store,
            metrics,
            session: CancellationToken::new(),
        }
    }
}
