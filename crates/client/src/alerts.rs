//! Transient user-visible alerts raised for incoming notifications.
//!
//! The presentation layer decides how an alert looks; the client only hands
//! it an [`Alert`] through an [`AlertSink`].

use std::time::Duration;

use beacon_shared::{Notification, NotificationKind};

/// How long an alert stays visible unless the sink decides otherwise.
pub const DEFAULT_ALERT_DURATION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub duration: Duration,
}

impl Alert {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            kind: notification.kind,
            title: notification.title.clone(),
            message: notification.message.clone(),
            link: notification.link.clone(),
            duration: DEFAULT_ALERT_DURATION,
        }
    }
}

/// Receiver of alerts. Implemented for plain closures.
pub trait AlertSink {
    fn show(&self, alert: &Alert);
}

impl<F: Fn(&Alert)> AlertSink for F {
    fn show(&self, alert: &Alert) {
        self(alert)
    }
}

/// Sink that writes alerts to the log, at a level matching their kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerts;

impl AlertSink for LogAlerts {
    fn show(&self, alert: &Alert) {
        let title = if alert.title.is_empty() {
            "Notification"
        } else {
            alert.title.as_str()
        };
        match alert.kind {
            NotificationKind::Error => crate::log_error!("[{}] {}", title, alert.message),
            NotificationKind::Warning => crate::log_warn!("[{}] {}", title, alert.message),
            NotificationKind::Info | NotificationKind::Success => {
                crate::log_info!("[{}] {}", title, alert.message)
            }
        }
    }
}
