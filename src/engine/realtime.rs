//! Background loops of a driver session: the two realtime feeds and the
//! periodic refetch that keeps the list honest when events are missed.

use std::sync::Arc;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ChangeEvent, ChangeKind, Subscription};
use crate::state::AppState;
use crate::sync::repository::{EventOutcome, OrderRepository, RefreshOutcome};
use crate::tracking::fleet::FleetBoard;

/// Next event from `feed`, or `None` once the feed closes or the session ends.
async fn next_event(state: &AppState, feed: &mut Subscription) -> Option<ChangeEvent> {
    let table = feed.table().to_string();
    tokio::select! {
        _ = state.session.cancelled() => {
            info!(table = %table, "session ended; unsubscribing");
            None
        }
        event = feed.next() => {
            if event.is_none() {
                warn!(table = %table, "change feed closed");
            }
            event
        }
    }
}

pub async fn run_order_feed(state: Arc<AppState>, mut feed: Subscription) {
    info!(table = feed.table(), "order feed started");

    while let Some(event) = next_event(&state, &mut feed).await {
        let activations = state.alert.activations();
        let outcome = apply_order_event(&state.repo, &event);

        state
            .metrics
            .realtime_events_total
            .with_label_values(&[event.kind.as_str(), outcome.as_str()])
            .inc();
        if state.alert.activations() > activations {
            state.metrics.alerts_total.inc();
        }
        state.metrics.active_orders.set(state.repo.len() as i64);

        debug!(kind = event.kind.as_str(), outcome = outcome.as_str(), "order event applied");
    }

    info!("order feed stopped");
}

pub fn apply_order_event(repo: &OrderRepository, event: &ChangeEvent) -> EventOutcome {
    match event.kind {
        ChangeKind::Insert => event
            .new
            .as_ref()
            .map_or(EventOutcome::Ignored, |row| repo.apply_insert(row)),
        ChangeKind::Update => event
            .new
            .as_ref()
            .map_or(EventOutcome::Ignored, |row| repo.apply_update(row, event.old.as_ref())),
        ChangeKind::Delete => event
            .old
            .as_ref()
            .map_or(EventOutcome::Ignored, |row| repo.apply_delete(row)),
    }
}

pub async fn run_fleet_feed(state: Arc<AppState>, mut feed: Subscription) {
    info!(table = feed.table(), "fleet feed started");

    while let Some(event) = next_event(&state, &mut feed).await {
        apply_driver_event(&state.fleet, &event);
    }

    info!("fleet feed stopped");
}

pub fn apply_driver_event(fleet: &FleetBoard, event: &ChangeEvent) {
    match (event.kind, &event.new, &event.old) {
        (ChangeKind::Insert | ChangeKind::Update, Some(row), _) => fleet.apply_upsert(row),
        (ChangeKind::Delete, _, Some(row)) => fleet.apply_delete(row),
        _ => debug!(kind = event.kind.as_str(), "driver event without a row"),
    }
}

/// Runs one refresh and records its outcome.
pub async fn refresh_once(state: &AppState) -> Result<RefreshOutcome, BackendError> {
    let result = state.repo.refresh().await;

    let outcome = match &result {
        Ok(RefreshOutcome::Skipped) => "skipped",
        Ok(RefreshOutcome::Loaded { .. }) => "loaded",
        Err(_) => "error",
    };
    state
        .metrics
        .refreshes_total
        .with_label_values(&[outcome])
        .inc();
    state.metrics.active_orders.set(state.repo.len() as i64);

    result
}

pub async fn run_refresh_loop(state: Arc<AppState>) {
    let period = state.config.refresh_interval;
    if period.is_zero() {
        warn!("refresh interval is zero; periodic refresh disabled");
        return;
    }

    info!(interval_secs = period.as_secs(), "refresh loop started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = state.session.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match refresh_once(&state).await {
            Ok(RefreshOutcome::Loaded {
                empty_notice: true, ..
            }) => info!(driver_id = %state.driver_id, "no orders assigned yet"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "order refresh failed; keeping current list"),
        }
    }

    info!("refresh loop stopped: session ended");
}
