//! Delivered / failed workflows for the selected order.
//!
//! Each run goes validate, capture position, persist, commit locally, then
//! notify. Only validation and persistence can fail the run; once the backend
//! has accepted the write the local list is updated and nothing after that
//! can undo it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{Duration, timeout};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, Filter, ORDERS_TABLE, Row, SIGNATURES_BUCKET};
use crate::finalize::notify::{
    NotificationError, NotificationScheduler, delivered_message, failed_message,
    resolve_manager_phone, whatsapp_link,
};
use crate::geo::is_finite_point;
use crate::models::order::{OrderId, OrderStatus, ReceiverCategory, ReceiverInfo};
use crate::models::position::GeoPoint;
use crate::observability::metrics::Metrics;
use crate::store::LocalStore;
use crate::sync::normalize::{Field, column};
use crate::sync::repository::OrderRepository;
use crate::tracking::location::LocationProvider;

pub const DEFAULT_FAILURE_REASON: &str = "not informed";

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("{0}")]
    Validation(String),

    #[error("could not save order: {0}")]
    Persist(#[from] BackendError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryInput {
    pub category: String,
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    /// Encoded signature image, stored in blob storage when present.
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Scheduled,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub receiver: Option<String>,
    pub reason: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub completion: Option<GeoPoint>,
    pub signature_path: Option<String>,
    pub notification: NotificationStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FinalizeOutcome {
    /// No order selected, e.g. it was already finalized.
    NoSelection,
    Completed(FinalizeReport),
}

#[derive(Debug, Clone)]
pub struct FinalizeConfig {
    pub gps_timeout: Duration,
    pub gps_max_age: Duration,
    pub manager_phone: Option<String>,
}

pub struct FinalizationSequencer {
    backend: Arc<dyn Backend>,
    repo: Arc<OrderRepository>,
    location: Arc<dyn LocationProvider>,
    store: Arc<LocalStore>,
    notifications: Arc<NotificationScheduler>,
    metrics: Metrics,
    config: FinalizeConfig,
}

/// Checks receiver fields before anything touches the network.
pub fn validate_receiver(input: &DeliveryInput) -> Result<ReceiverInfo, FinalizeError> {
    let category = ReceiverCategory::parse(&input.category)
        .ok_or_else(|| FinalizeError::Validation("select who received the order".to_string()))?;

    let name = input.name.trim();
    if name.is_empty() {
        return Err(FinalizeError::Validation("enter the receiver's name".to_string()));
    }

    let unit = input
        .unit
        .as_deref()
        .map(str::trim)
        .filter(|unit| !unit.is_empty())
        .map(str::to_string);

    if category.requires_unit() && unit.is_none() {
        return Err(FinalizeError::Validation("enter the unit number".to_string()));
    }

    Ok(ReceiverInfo {
        category,
        name: name.to_string(),
        unit,
    })
}

impl FinalizationSequencer {
    pub fn new(
        backend: Arc<dyn Backend>,
        repo: Arc<OrderRepository>,
        location: Arc<dyn LocationProvider>,
        store: Arc<LocalStore>,
        notifications: Arc<NotificationScheduler>,
        metrics: Metrics,
        config: FinalizeConfig,
    ) -> Self {
        Self {
            backend,
            repo,
            location,
            store,
            notifications,
            metrics,
            config,
        }
    }

    pub async fn deliver(&self, input: DeliveryInput) -> Result<FinalizeOutcome, FinalizeError> {
        let result = self.run_deliver(input).await;
        self.record("delivered", &result);
        result
    }

    pub async fn fail(&self, reason: &str) -> Result<FinalizeOutcome, FinalizeError> {
        let result = self.run_fail(reason).await;
        self.record("failed", &result);
        result
    }

    fn record(&self, kind: &str, result: &Result<FinalizeOutcome, FinalizeError>) {
        let outcome = match result {
            Ok(FinalizeOutcome::Completed(_)) => "completed",
            Ok(FinalizeOutcome::NoSelection) => "no_selection",
            Err(FinalizeError::Validation(_)) => "validation",
            Err(FinalizeError::Persist(_)) => "persist",
        };
        self.metrics
            .finalizations_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    async fn run_deliver(&self, input: DeliveryInput) -> Result<FinalizeOutcome, FinalizeError> {
        let Some(order) = self.repo.selected() else {
            return Ok(FinalizeOutcome::NoSelection);
        };

        let receiver = validate_receiver(&input)?;
        let completion = self.capture_position(order.id).await;

        let signature_path = match input.signature {
            Some(bytes) => {
                let path = format!("{}/{}.png", order.id, Uuid::new_v4());
                Some(
                    self.backend
                        .upload(SIGNATURES_BUCKET, &path, bytes, true)
                        .await?,
                )
            }
            None => None,
        };

        let completed_at = Utc::now();
        let receiver_text = receiver.display();

        let mut patch = completion_patch(OrderStatus::Delivered, completed_at, completion);
        patch.insert(column(Field::Receiver).to_string(), Value::from(receiver_text.clone()));
        if let Some(path) = &signature_path {
            patch.insert(column(Field::SignaturePath).to_string(), Value::from(path.clone()));
        }

        self.persist(order.id, patch).await?;

        let message = delivered_message(&order, &receiver_text, completed_at);
        let mut done = order;
        done.status = OrderStatus::Delivered;
        done.receiver = Some(receiver_text.clone());
        done.completed_at = Some(completed_at);
        done.completion = completion;
        let order_id = done.id;
        self.repo.commit_terminal(done);

        if let Err(err) = self.store.remember_receiver(&receiver.name) {
            warn!(error = %err, "could not remember receiver name");
        }

        info!(order_id = %order_id, "order delivered");
        let notification = self.notify_manager(message).await;

        Ok(FinalizeOutcome::Completed(FinalizeReport {
            order_id,
            status: OrderStatus::Delivered,
            receiver: Some(receiver_text),
            reason: None,
            completed_at,
            completion,
            signature_path,
            notification,
        }))
    }

    async fn run_fail(&self, reason: &str) -> Result<FinalizeOutcome, FinalizeError> {
        let Some(order) = self.repo.selected() else {
            return Ok(FinalizeOutcome::NoSelection);
        };

        let reason = match reason.trim() {
            "" => DEFAULT_FAILURE_REASON.to_string(),
            trimmed => trimmed.to_string(),
        };

        let completion = self.capture_position(order.id).await;
        let completed_at = Utc::now();

        let mut patch = completion_patch(OrderStatus::Failed, completed_at, completion);
        patch.insert(column(Field::Notes).to_string(), Value::from(reason.clone()));

        self.persist(order.id, patch).await?;

        let message = failed_message(&order, &reason);
        let mut done = order;
        done.status = OrderStatus::Failed;
        done.notes = Some(reason.clone());
        done.completed_at = Some(completed_at);
        done.completion = completion;
        let order_id = done.id;
        self.repo.commit_terminal(done);

        info!(order_id = %order_id, reason = %reason, "order marked failed");
        let notification = self.notify_manager(message).await;

        Ok(FinalizeOutcome::Completed(FinalizeReport {
            order_id,
            status: OrderStatus::Failed,
            receiver: None,
            reason: Some(reason),
            completed_at,
            completion,
            signature_path: None,
            notification,
        }))
    }

    /// Best-effort position for the completion record.
    async fn capture_position(&self, order_id: OrderId) -> Option<GeoPoint> {
        let request = self.location.current_fix(self.config.gps_max_age);
        match timeout(self.config.gps_timeout, request).await {
            Ok(Ok(fix)) if is_finite_point(&fix.point) => Some(fix.point),
            Ok(Ok(_)) => {
                warn!(order_id = %order_id, "captured position is invalid; completing without it");
                None
            }
            Ok(Err(err)) => {
                warn!(order_id = %order_id, error = %err, "position unavailable; completing without it");
                None
            }
            Err(_) => {
                warn!(order_id = %order_id, "position capture timed out; completing without it");
                None
            }
        }
    }

    async fn persist(&self, order_id: OrderId, patch: Row) -> Result<(), FinalizeError> {
        let affected = self
            .backend
            .update(
                ORDERS_TABLE,
                Filter::new().eq(column(Field::Id), order_id.0),
                patch,
            )
            .await
            .inspect_err(|err| warn!(order_id = %order_id, error = %err, "order write failed"))?;

        if affected.is_empty() {
            warn!(order_id = %order_id, "order write matched no rows");
            return Err(BackendError::Rejected(format!("order {order_id} not found")).into());
        }
        Ok(())
    }

    /// Runs after the local commit; failures are logged and reported only.
    async fn notify_manager(&self, message: String) -> NotificationStatus {
        match resolve_manager_phone(self.backend.as_ref(), self.config.manager_phone.as_deref()).await {
            Ok(phone) => {
                self.notifications.schedule(whatsapp_link(&phone, &message));
                NotificationStatus::Scheduled
            }
            Err(NotificationError::Unavailable) => {
                info!("no manager phone configured; notification skipped");
                NotificationStatus::Unavailable
            }
            Err(err) => {
                warn!(error = %err, "notification skipped");
                NotificationStatus::Unavailable
            }
        }
    }
}

fn completion_patch(
    status: OrderStatus,
    completed_at: DateTime<Utc>,
    completion: Option<GeoPoint>,
) -> Row {
    let mut patch = Row::new();
    patch.insert(column(Field::Status).to_string(), Value::from(status.as_str()));
    patch.insert(
        column(Field::CompletedAt).to_string(),
        Value::from(completed_at.to_rfc3339()),
    );
    patch.insert(
        column(Field::CompletionLat).to_string(),
        completion.map_or(Value::Null, |p| Value::from(p.lat)),
    );
    patch.insert(
        column(Field::CompletionLng).to_string(),
        completion.map_or(Value::Null, |p| Value::from(p.lng)),
    );
    patch
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::alert::AlertSignal;
    use crate::alert::tests::RecordingOutputs;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::row;
    use crate::finalize::notify::tests::RecordingOpener;
    use crate::models::order::DriverId;
    use crate::models::position::Fix;
    use crate::tracking::location::PushLocationProvider;

    const NOTIFY_DELAY: Duration = Duration::from_millis(750);

    struct Harness {
        backend: Arc<MemoryBackend>,
        repo: Arc<OrderRepository>,
        location: Arc<PushLocationProvider>,
        store: Arc<LocalStore>,
        opener: Arc<RecordingOpener>,
        sequencer: FinalizationSequencer,
    }

    async fn harness(manager_phone: Option<&str>) -> Harness {
        harness_with(manager_phone, Arc::new(RecordingOpener::default())).await
    }

    async fn harness_with(manager_phone: Option<&str>, opener: Arc<RecordingOpener>) -> Harness {
        let backend = Arc::new(MemoryBackend::recording(64));
        backend.seed(
            "orders",
            vec![row([
                ("id", json!(1)),
                ("driver_id", json!(7)),
                ("status", json!("en_route")),
                ("customer", json!("Ana")),
                ("address", json!("Rua das Flores, 10")),
            ])],
        );
        if let Some(phone) = manager_phone {
            backend.seed(
                "settings",
                vec![row([("key", json!("manager_phone")), ("value", json!(phone))])],
            );
        }

        let alert = Arc::new(AlertSignal::new(Arc::new(RecordingOutputs::default())));
        let repo = Arc::new(OrderRepository::new(DriverId(7), backend.clone(), alert, 50, 10));
        repo.refresh().await.unwrap();

        let location = Arc::new(PushLocationProvider::new(true));
        let store = Arc::new(LocalStore::in_memory(20));
        let notifications = Arc::new(NotificationScheduler::new(opener.clone(), NOTIFY_DELAY));

        let sequencer = FinalizationSequencer::new(
            backend.clone(),
            repo.clone(),
            location.clone(),
            store.clone(),
            notifications,
            Metrics::new(),
            FinalizeConfig {
                gps_timeout: Duration::from_secs(10),
                gps_max_age: Duration::from_secs(5),
                manager_phone: None,
            },
        );

        Harness {
            backend,
            repo,
            location,
            store,
            opener,
            sequencer,
        }
    }

    fn input(category: &str, name: &str, unit: Option<&str>) -> DeliveryInput {
        DeliveryInput {
            category: category.to_string(),
            name: name.to_string(),
            unit: unit.map(str::to_string),
            signature: None,
        }
    }

    fn last_order_write(backend: &MemoryBackend) -> Row {
        backend
            .calls()
            .into_iter()
            .rev()
            .find(|call| call.op == "update" && call.table == "orders")
            .and_then(|call| call.row)
            .unwrap()
    }

    #[tokio::test]
    async fn empty_receiver_name_blocks_without_network() {
        let h = harness(Some("48 99999-0000")).await;
        h.repo.select(OrderId(1));
        let writes_before = h.backend.calls().len();

        let result = h.sequencer.deliver(input("customer", "  ", None)).await;

        assert!(matches!(result, Err(FinalizeError::Validation(_))));
        assert_eq!(h.backend.calls().len(), writes_before);
        assert_eq!(h.repo.len(), 1);
    }

    #[tokio::test]
    async fn apartment_requires_unit() {
        let h = harness(None).await;
        h.repo.select(OrderId(1));

        let result = h.sequencer.deliver(input("apartment", "Maria", Some(" "))).await;
        assert!(matches!(result, Err(FinalizeError::Validation(_))));

        let missing_category = validate_receiver(&input("", "Maria", None));
        assert!(matches!(missing_category, Err(FinalizeError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn gps_timeout_still_persists_without_coordinates() {
        let h = harness(None).await;
        h.repo.select(OrderId(1));

        let outcome = h
            .sequencer
            .deliver(input("doorman", "Jose", None))
            .await
            .unwrap();

        let FinalizeOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(report.completion, None);
        assert_eq!(report.notification, NotificationStatus::Unavailable);

        let patch = last_order_write(&h.backend);
        assert_eq!(patch["status"], "delivered");
        assert!(patch["completion_lat"].is_null());
        assert_eq!(patch["receiver"], "Doorman: Jose");
        assert!(h.repo.is_empty());
        assert_eq!(h.repo.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn captured_position_is_stored() {
        let h = harness(None).await;
        h.repo.select(OrderId(1));
        h.location.push(Fix {
            point: GeoPoint::new(-27.6, -48.6),
            heading: None,
            taken_at: Utc::now(),
        });

        h.sequencer
            .deliver(input("customer", "Ana", None))
            .await
            .unwrap();

        let patch = last_order_write(&h.backend);
        assert_eq!(patch["completion_lat"], -27.6);
        assert_eq!(patch["completion_lng"], -48.6);
    }

    #[tokio::test]
    async fn persist_failure_leaves_order_selected_and_listed() {
        let h = harness(None).await;
        h.location.push(Fix {
            point: GeoPoint::new(-27.6, -48.6),
            heading: None,
            taken_at: Utc::now(),
        });
        h.repo.select(OrderId(1));
        h.backend.fail_writes(true);

        let result = h.sequencer.deliver(input("customer", "Ana", None)).await;

        assert!(matches!(result, Err(FinalizeError::Persist(_))));
        assert_eq!(h.repo.len(), 1);
        assert_eq!(h.repo.selected().map(|o| o.id), Some(OrderId(1)));
        assert!(h.store.recent_receivers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notification_opens_only_after_local_commit() {
        let h = harness(Some("48 99999-0000")).await;
        h.repo.select(OrderId(1));

        let outcome = h
            .sequencer
            .deliver(input("customer", "Ana", None))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            FinalizeOutcome::Completed(FinalizeReport { notification: NotificationStatus::Scheduled, .. })
        ));
        assert!(h.repo.is_empty());
        assert!(h.opener.opened().is_empty());

        tokio::time::sleep(NOTIFY_DELAY + Duration::from_millis(10)).await;

        let opened = h.opener.opened();
        assert_eq!(opened.len(), 1);
        assert!(opened[0].starts_with("https://wa.me/5548999990000?text="));
        assert_eq!(h.store.recent_receivers(), vec!["Ana"]);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_link_does_not_revert_delivery() {
        let opener = Arc::new(RecordingOpener {
            refuse: true,
            ..Default::default()
        });
        let h = harness_with(Some("48 99999-0000"), opener).await;
        h.repo.select(OrderId(1));

        h.sequencer
            .deliver(input("customer", "Ana", None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(h.opener.opened().is_empty());
        assert!(h.repo.is_empty());
        assert_eq!(h.backend.rows("orders")[0]["status"], "delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_a_no_op() {
        let h = harness(None).await;
        h.repo.select(OrderId(1));

        h.sequencer.fail("").await.unwrap();
        let writes = h.backend.count_calls("update", "orders");
        let again = h.sequencer.fail("gate closed").await.unwrap();

        assert!(matches!(again, FinalizeOutcome::NoSelection));
        assert_eq!(h.backend.count_calls("update", "orders"), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_failure_reason_defaults() {
        let h = harness(None).await;
        h.repo.select(OrderId(1));

        h.sequencer.fail("   ").await.unwrap();

        let patch = last_order_write(&h.backend);
        assert_eq!(patch["status"], "failed");
        assert_eq!(patch["notes"], DEFAULT_FAILURE_REASON);
        assert!(h.repo.is_empty());
        assert!(h.repo.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn signature_is_uploaded_before_status_write() {
        let h = harness(None).await;
        h.repo.select(OrderId(1));
        let mut with_signature = input("customer", "Ana", None);
        with_signature.signature = Some(vec![0x89, 0x50, 0x4e, 0x47]);

        let FinalizeOutcome::Completed(report) =
            h.sequencer.deliver(with_signature).await.unwrap()
        else {
            panic!("expected completion");
        };

        let path = report.signature_path.unwrap();
        assert!(path.starts_with("1/"));
        assert_eq!(h.backend.blob("signatures", &path), Some(vec![0x89, 0x50, 0x4e, 0x47]));
        assert_eq!(last_order_write(&h.backend)["signature_path"], path.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_signature_upload_aborts_delivery() {
        let h = harness(None).await;
        h.repo.select(OrderId(1));
        h.backend.fail_uploads(true);
        let mut with_signature = input("customer", "Ana", None);
        with_signature.signature = Some(vec![1, 2, 3]);

        let result = h.sequencer.deliver(with_signature).await;

        assert!(matches!(result, Err(FinalizeError::Persist(_))));
        assert_eq!(h.backend.count_calls("update", "orders"), 0);
        assert_eq!(h.repo.len(), 1);
    }
}
