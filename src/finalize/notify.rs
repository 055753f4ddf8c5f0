//! Manager notification: who to message, what to say, and the deferred
//! deep-link open.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use crate::backend::{Backend, Filter, Query, SETTINGS_TABLE};
use crate::models::order::Order;

const MANAGER_PHONE_KEY: &str = "manager_phone";
const COUNTRY_CODE: &str = "55";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NotificationError {
    #[error("no manager phone configured")]
    Unavailable,

    #[error("could not open notification link: {0}")]
    OpenFailed(String),
}

/// Platform URL handler.
#[async_trait]
pub trait LinkOpener: Send + Sync {
    async fn can_open(&self, url: &str) -> bool;

    async fn open(&self, url: &str) -> Result<(), NotificationError>;
}

/// Opener for headless runs; the link is only logged.
pub struct LogLinkOpener;

#[async_trait]
impl LinkOpener for LogLinkOpener {
    async fn can_open(&self, _url: &str) -> bool {
        true
    }

    async fn open(&self, url: &str) -> Result<(), NotificationError> {
        info!(url, "notification link opened");
        Ok(())
    }
}

/// Digits only, with the country code prefixed when missing.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if digits.starts_with(COUNTRY_CODE) {
        Some(digits)
    } else {
        Some(format!("{COUNTRY_CODE}{digits}"))
    }
}

/// Resolves the manager's phone: the configured override, else the backend
/// settings row. Lookup failures resolve to `Unavailable`.
pub async fn resolve_manager_phone(
    backend: &dyn Backend,
    configured: Option<&str>,
) -> Result<String, NotificationError> {
    if let Some(phone) = configured.and_then(normalize_phone) {
        return Ok(phone);
    }

    let query = Query::table(SETTINGS_TABLE)
        .filter(Filter::new().eq("key", MANAGER_PHONE_KEY))
        .limit(1);

    let rows = match backend.select(query).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "manager phone lookup failed");
            return Err(NotificationError::Unavailable);
        }
    };

    rows.first()
        .and_then(|row| row.get("value").or_else(|| row.get("valor")))
        .and_then(Value::as_str)
        .and_then(normalize_phone)
        .ok_or(NotificationError::Unavailable)
}

pub fn whatsapp_link(phone: &str, text: &str) -> String {
    format!(
        "https://wa.me/{phone}?text={}",
        utf8_percent_encode(text, NON_ALPHANUMERIC)
    )
}

pub fn delivered_message(order: &Order, receiver: &str, completed_at: DateTime<Utc>) -> String {
    format!(
        "Delivery completed #{}\n\nReceived by: {}\nAddress: {}\nCompleted at: {}",
        order.id,
        receiver,
        order.address,
        completed_at.format("%d/%m/%Y %H:%M")
    )
}

pub fn failed_message(order: &Order, reason: &str) -> String {
    format!(
        "ALERT: delivery not completed #{}\n\nCustomer: {}\nAddress: {}\nReason: {}",
        order.id, order.customer, order.address, reason
    )
}

/// Deferred link opens. Each scheduled open is a task that can be cancelled
/// until it fires.
pub struct NotificationScheduler {
    opener: Arc<dyn LinkOpener>,
    delay: Duration,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationScheduler {
    pub fn new(opener: Arc<dyn LinkOpener>, delay: Duration) -> Self {
        Self {
            opener,
            delay,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn schedule(&self, url: String) {
        let opener = Arc::clone(&self.opener);
        let delay = self.delay;

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if let Err(err) = open_link(opener.as_ref(), &url).await {
                warn!(error = %err, "manager notification not sent");
            }
        });

        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|task| !task.is_finished());
            pending.push(handle);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.iter().filter(|task| !task.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn cancel_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            for task in pending.drain(..) {
                task.abort();
            }
        }
    }
}

async fn open_link(opener: &dyn LinkOpener, url: &str) -> Result<(), NotificationError> {
    if !opener.can_open(url).await {
        return Err(NotificationError::OpenFailed("no handler for link".to_string()));
    }
    opener.open(url).await
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::row;

    #[derive(Default)]
    pub(crate) struct RecordingOpener {
        pub opened: Mutex<Vec<String>>,
        pub refuse: bool,
    }

    impl RecordingOpener {
        pub(crate) fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LinkOpener for RecordingOpener {
        async fn can_open(&self, _url: &str) -> bool {
            !self.refuse
        }

        async fn open(&self, url: &str) -> Result<(), NotificationError> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    #[test]
    fn phone_gets_digits_and_country_code() {
        assert_eq!(normalize_phone("(48) 99999-0000"), Some("5548999990000".to_string()));
        assert_eq!(normalize_phone("+55 48 99999-0000"), Some("5548999990000".to_string()));
        assert_eq!(normalize_phone("n/a"), None);
    }

    #[test]
    fn link_body_is_percent_encoded() {
        let link = whatsapp_link("5548999990000", "Reason: gate closed\nok");
        assert_eq!(
            link,
            "https://wa.me/5548999990000?text=Reason%3A%20gate%20closed%0Aok"
        );
    }

    #[tokio::test]
    async fn configured_phone_wins_over_backend() {
        let backend = MemoryBackend::new(8);
        backend.seed("settings", vec![row([("key", json!("manager_phone")), ("value", json!("11 2222-3333"))])]);

        assert_eq!(
            resolve_manager_phone(&backend, Some("48 1111-1111")).await,
            Ok("554811111111".to_string())
        );
        assert_eq!(
            resolve_manager_phone(&backend, None).await,
            Ok("551122223333".to_string())
        );
    }

    #[tokio::test]
    async fn missing_setting_is_unavailable() {
        let backend = MemoryBackend::new(8);
        assert_eq!(
            resolve_manager_phone(&backend, None).await,
            Err(NotificationError::Unavailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_open_fires_after_delay_and_can_be_cancelled() {
        let opener = Arc::new(RecordingOpener::default());
        let scheduler = NotificationScheduler::new(opener.clone(), Duration::from_millis(750));

        scheduler.schedule("https://wa.me/1?text=a".to_string());
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(opener.opened().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opener.opened().len(), 1);

        scheduler.schedule("https://wa.me/1?text=b".to_string());
        scheduler.cancel_pending();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(opener.opened().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_link_is_not_opened() {
        let opener = Arc::new(RecordingOpener {
            refuse: true,
            ..Default::default()
        });
        let scheduler = NotificationScheduler::new(opener.clone(), Duration::from_millis(10));

        scheduler.schedule("https://wa.me/1?text=a".to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(opener.opened().is_empty());
        assert_eq!(scheduler.pending(), 0);
    }
}
