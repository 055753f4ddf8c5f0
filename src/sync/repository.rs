//! The driver's active order list.
//!
//! Three sources feed the list: full refetches, realtime row events and the
//! driver's own reordering. Every mutation runs against the latest in-memory
//! list; the only guards are the single-flight flag on `refresh` and the
//! manual-reorder flag.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::alert::AlertSignal;
use crate::backend::{Backend, BackendError, Filter, ORDERS_TABLE, Query, Row};
use crate::models::order::{DriverId, Order, OrderId, OrderStatus};
use crate::sync::normalize::{Field, column, columns, driver_of, normalize_order};
use crate::sync::recent::{Keyed, RecentList};

impl Keyed for Order {
    type Key = OrderId;

    fn key(&self) -> OrderId {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RefreshOutcome {
    /// Another refresh was already running; nothing was fetched.
    Skipped,
    Loaded { count: usize, empty_notice: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Inserted,
    Updated,
    Removed,
    Ignored,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Inserted => "inserted",
            EventOutcome::Updated => "updated",
            EventOutcome::Removed => "removed",
            EventOutcome::Ignored => "ignored",
        }
    }
}

struct RepoState {
    active: Vec<Order>,
    history: RecentList<Order>,
    manually_reordered: bool,
    selected: Option<OrderId>,
}

/// Resets the single-flight flag when the refresh ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct OrderRepository {
    driver_id: DriverId,
    backend: Arc<dyn Backend>,
    alert: Arc<AlertSignal>,
    fetch_limit: usize,
    state: Mutex<RepoState>,
    refreshing: AtomicBool,
    empty_notice_given: AtomicBool,
    changes_tx: broadcast::Sender<Vec<Order>>,
}

impl OrderRepository {
    pub fn new(
        driver_id: DriverId,
        backend: Arc<dyn Backend>,
        alert: Arc<AlertSignal>,
        fetch_limit: usize,
        history_limit: usize,
    ) -> Self {
        let (changes_tx, _unused_rx) = broadcast::channel(64);

        Self {
            driver_id,
            backend,
            alert,
            fetch_limit,
            state: Mutex::new(RepoState {
                active: Vec::new(),
                history: RecentList::new(history_limit),
                manually_reordered: false,
                selected: None,
            }),
            refreshing: AtomicBool::new(false),
            empty_notice_given: AtomicBool::new(false),
            changes_tx,
        }
    }

    pub fn driver_id(&self) -> DriverId {
        self.driver_id
    }

    fn state(&self) -> MutexGuard<'_, RepoState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshots of the active list after every change.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Vec<Order>> {
        self.changes_tx.subscribe()
    }

    fn publish(&self, snapshot: Vec<Order>) {
        let _ = self.changes_tx.send(snapshot);
    }

    pub fn snapshot(&self) -> Vec<Order> {
        self.state().active.clone()
    }

    pub fn history(&self) -> Vec<Order> {
        self.state().history.to_vec()
    }

    pub fn len(&self) -> usize {
        self.state().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().active.is_empty()
    }

    pub fn is_manually_reordered(&self) -> bool {
        self.state().manually_reordered
    }

    fn owns(&self, row: &Row) -> bool {
        driver_of(row) == Some(self.driver_id)
    }

    /// Refetches the driver's pending and en-route orders and merges them in.
    ///
    /// A call made while another refresh is outstanding returns
    /// [`RefreshOutcome::Skipped`] immediately.
    pub async fn refresh(&self) -> Result<RefreshOutcome, BackendError> {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            debug!(driver_id = %self.driver_id, "refresh already in flight");
            return Ok(RefreshOutcome::Skipped);
        }
        let _flight = FlightGuard(&self.refreshing);

        let query = Query::table(ORDERS_TABLE)
            .filter(
                Filter::new()
                    .eq_any(columns(Field::DriverId), self.driver_id.0)
                    .one_of(column(Field::Status), active_status_values()),
            )
            .order_desc(column(Field::Id))
            .limit(self.fetch_limit);

        let rows = self.backend.select(query).await?;

        let mut seen = HashSet::new();
        let fetched: Vec<Order> = rows
            .iter()
            .filter_map(|row| match normalize_order(row) {
                Ok(order) => Some(order),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable order row");
                    None
                }
            })
            .filter(|order| order.status.is_active())
            .filter(|order| order.driver_id.is_none_or(|id| id == self.driver_id))
            .filter(|order| seen.insert(order.id))
            .collect();

        let count = fetched.len();
        let empty_notice = count == 0 && !self.empty_notice_given.swap(true, Ordering::SeqCst);

        let snapshot = {
            let mut state = self.state();
            if state.manually_reordered {
                merge_preserving_order(&mut state.active, fetched);
            } else {
                state.active = fetched;
            }
            state.active.clone()
        };

        info!(driver_id = %self.driver_id, count, held = snapshot.len(), "orders refreshed");
        self.publish(snapshot);

        Ok(RefreshOutcome::Loaded {
            count,
            empty_notice,
        })
    }

    pub fn apply_insert(&self, row: &Row) -> EventOutcome {
        if !self.owns(row) {
            return EventOutcome::Ignored;
        }

        let order = match normalize_order(row) {
            Ok(order) => order,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable inserted order");
                return EventOutcome::Ignored;
            }
        };

        if !order.status.is_active() {
            return EventOutcome::Ignored;
        }

        let snapshot = {
            let mut state = self.state();
            if state.active.iter().any(|held| held.id == order.id) {
                debug!(order_id = %order.id, "insert for an order already held");
                return EventOutcome::Ignored;
            }
            state.active.insert(0, order);
            state.active.clone()
        };

        self.publish(snapshot);
        EventOutcome::Inserted
    }

    /// Applies a row update. `old` is the row as it was before the write, when
    /// the feed supplies it.
    pub fn apply_update(&self, new: &Row, old: Option<&Row>) -> EventOutcome {
        if !self.owns(new) {
            return EventOutcome::Ignored;
        }

        let order = match normalize_order(new) {
            Ok(order) => order,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable updated order");
                return EventOutcome::Ignored;
            }
        };

        if order.status.is_terminal() {
            let snapshot = {
                let mut state = self.state();
                remove_terminal(&mut state, order);
                state.active.clone()
            };
            self.publish(snapshot);
            return EventOutcome::Removed;
        }

        let previous_from_feed = old
            .and_then(|row| normalize_order(row).ok())
            .map(|previous| previous.status);

        let (previous, snapshot) = {
            let mut state = self.state();
            let previous = match state.active.iter_mut().find(|held| held.id == order.id) {
                Some(held) => {
                    let previous = held.status;
                    held.merge_from(&order);
                    Some(previous)
                }
                None => {
                    state.active.insert(0, order.clone());
                    previous_from_feed
                }
            };
            (previous, state.active.clone())
        };

        if order.status == OrderStatus::EnRoute && previous != Some(OrderStatus::EnRoute) {
            self.alert.trigger(order.id);
        }

        self.publish(snapshot);
        EventOutcome::Updated
    }

    pub fn apply_delete(&self, old: &Row) -> EventOutcome {
        if !self.owns(old) {
            return EventOutcome::Ignored;
        }

        let Some(id) = crate::sync::normalize::order_id_of(old) else {
            return EventOutcome::Ignored;
        };

        let snapshot = {
            let mut state = self.state();
            let before = state.active.len();
            state.active.retain(|held| held.id != id);
            if state.active.len() == before {
                return EventOutcome::Ignored;
            }
            if state.selected == Some(id) {
                state.selected = None;
            }
            state.active.clone()
        };

        self.publish(snapshot);
        EventOutcome::Removed
    }

    /// Moves the entry at `from` to `to` and hands list ordering to the driver.
    /// Selection is tracked by id, so a moved selected order stays selected.
    pub fn move_local(&self, from: usize, to: usize) -> bool {
        let snapshot = {
            let mut state = self.state();
            let len = state.active.len();
            if from >= len || to >= len {
                return false;
            }
            let moved = state.active.remove(from);
            state.active.insert(to, moved);
            state.manually_reordered = true;
            state.active.clone()
        };

        self.publish(snapshot);
        true
    }

    /// Selects an active order for finalization.
    pub fn select(&self, id: OrderId) -> Option<Order> {
        let mut state = self.state();
        let order = state.active.iter().find(|held| held.id == id).cloned()?;
        state.selected = Some(id);
        Some(order)
    }

    /// The selected order, resolved against the current list.
    pub fn selected(&self) -> Option<Order> {
        let state = self.state();
        let id = state.selected?;
        state.active.iter().find(|held| held.id == id).cloned()
    }

    pub fn clear_selection(&self) {
        self.state().selected = None;
    }

    /// Removes an order that reached a terminal status locally, without waiting
    /// for the realtime echo. Returns whether it was still held.
    pub fn commit_terminal(&self, order: Order) -> bool {
        let (was_held, snapshot) = {
            let mut state = self.state();
            let was_held = remove_terminal(&mut state, order);
            (was_held, state.active.clone())
        };

        self.publish(snapshot);
        was_held
    }
}

fn remove_terminal(state: &mut RepoState, order: Order) -> bool {
    let before = state.active.len();
    state.active.retain(|held| held.id != order.id);
    if state.selected == Some(order.id) {
        state.selected = None;
    }
    if order.status == OrderStatus::Delivered {
        state.history.push(order);
    }
    state.active.len() != before
}

/// Refresh merge once the driver owns the ordering: held entries keep their
/// position and take fetched fields, unseen orders go to the end, nothing is
/// dropped for being absent from the fetch.
/// Stored status values that read as pending or en route, legacy spellings
/// included.
fn active_status_values() -> Vec<Value> {
    [OrderStatus::Pending, OrderStatus::EnRoute]
        .iter()
        .flat_map(|status| status.aliases())
        .map(|alias| Value::from(*alias))
        .collect()
}

fn merge_preserving_order(active: &mut Vec<Order>, fetched: Vec<Order>) {
    for held in active.iter_mut() {
        if let Some(fresh) = fetched.iter().find(|fresh| fresh.id == held.id) {
            held.merge_from(fresh);
        }
    }

    for fresh in fetched {
        if !active.iter().any(|held| held.id == fresh.id) {
            active.push(fresh);
        }
    }
}
