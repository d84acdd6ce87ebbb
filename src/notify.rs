use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::limits::MAX_INBOX_PER_USER;
use crate::model::Window;

const CHANNEL_CAPACITY: usize = 256;

/// Context delivered to a user about one of their reservations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationNotice {
    pub user_id: Ulid,
    pub reservation_id: Ulid,
    pub garage_name: String,
    pub date: NaiveDate,
    pub window: Window,
    pub bay_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Confirmed(ReservationNotice),
    Cancelled { notice: ReservationNotice, reason: String },
}

impl UserEvent {
    pub fn notice(&self) -> &ReservationNotice {
        match self {
            UserEvent::Confirmed(notice) | UserEvent::Cancelled { notice, .. } => notice,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UserEvent::Confirmed(_) => "confirmed",
            UserEvent::Cancelled { .. } => "cancelled",
        }
    }

    /// Human-readable message for the in-app inbox.
    pub fn message(&self) -> String {
        let n = self.notice();
        match self {
            UserEvent::Confirmed(_) => match n.bay_number {
                Some(bay) => format!(
                    "Your reservation at {} on {} ({}) is confirmed, bay {bay}",
                    n.garage_name, n.date, n.window
                ),
                None => format!(
                    "Your reservation at {} on {} ({}) is confirmed",
                    n.garage_name, n.date, n.window
                ),
            },
            UserEvent::Cancelled { reason, .. } => format!(
                "Your reservation at {} on {} ({}) was cancelled: {reason}",
                n.garage_name, n.date, n.window
            ),
        }
    }
}

#[derive(Debug)]
pub struct DispatchError(pub String);

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification dispatch failed: {}", self.0)
    }
}

impl std::error::Error for DispatchError {}

/// Delivery of reservation outcomes to users. Best-effort: callers log failures
/// and never roll back on them.
#[async_trait]
pub trait NotificationDispatch: Send + Sync {
    async fn notify_confirmed(&self, notice: &ReservationNotice) -> Result<(), DispatchError>;

    async fn notify_cancelled(
        &self,
        notice: &ReservationNotice,
        reason: &str,
    ) -> Result<(), DispatchError>;
}

/// In-process dispatch: a broadcast channel per user for live listeners, plus
/// a bounded inbox of recent events for the in-app notification list.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<UserEvent>>,
    inboxes: DashMap<Ulid, VecDeque<UserEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            inboxes: DashMap::new(),
        }
    }

    /// Subscribe to live events for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: Ulid) -> broadcast::Receiver<UserEvent> {
        self.channels
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Most recent first.
    pub fn inbox(&self, user_id: &Ulid) -> Vec<UserEvent> {
        self.inboxes
            .get(user_id)
            .map(|q| q.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    fn publish(&self, event: UserEvent) {
        let user_id = event.notice().user_id;
        {
            let mut inbox = self.inboxes.entry(user_id).or_default();
            if inbox.len() >= MAX_INBOX_PER_USER {
                inbox.pop_front();
            }
            inbox.push_back(event.clone());
        }
        // No receivers is fine; the inbox keeps it.
        if let Some(sender) = self.channels.get(&user_id) {
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl NotificationDispatch for NotifyHub {
    async fn notify_confirmed(&self, notice: &ReservationNotice) -> Result<(), DispatchError> {
        self.publish(UserEvent::Confirmed(notice.clone()));
        Ok(())
    }

    async fn notify_cancelled(
        &self,
        notice: &ReservationNotice,
        reason: &str,
    ) -> Result<(), DispatchError> {
        self.publish(UserEvent::Cancelled {
            notice: notice.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}
