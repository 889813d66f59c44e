use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Notification, NotificationId, NotificationRequest};

pub const DEFAULT_CAPACITY: usize = 5;

struct QueueInner {
    items: VecDeque<Notification>,
    timers: HashMap<NotificationId, JoinHandle<()>>,
    capacity: usize,
}

/// Bounded feed of short-lived user-facing alerts. Cloning shares the queue.
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<Mutex<QueueInner>>,
    tx: Arc<watch::Sender<Vec<Notification>>>,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                timers: HashMap::new(),
                capacity: capacity.max(1),
            })),
            tx: Arc::new(tx),
        }
    }

    /// Queues a notification, evicting the oldest beyond capacity. Never blocks;
    /// expiry runs on a timer task that `dismiss` cancels.
    pub fn push(&self, request: NotificationRequest) -> NotificationId {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let expires_at = request
            .duration
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);

        let notification = Notification {
            id,
            category: request.category,
            title: request.title,
            message: request.message,
            created_at: now,
            expires_at,
        };
        debug!("Queueing notification {} ({})", notification.title, id);

        let mut inner = self.inner.lock();
        inner.items.push_back(notification);
        while inner.items.len() > inner.capacity {
            if let Some(evicted) = inner.items.pop_front() {
                if let Some(timer) = inner.timers.remove(&evicted.id) {
                    timer.abort();
                }
            }
        }

        if let Some(duration) = request.duration {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let queue = self.clone();
                    let timer = handle.spawn(async move {
                        tokio::time::sleep(duration).await;
                        queue.expire(id);
                    });
                    inner.timers.insert(id, timer);
                }
                Err(_) => warn!("No runtime available, notification {} will not auto-expire", id),
            }
        }

        self.publish(&inner);
        id
    }

    /// Removes a notification before it expires. Returns `false` if it is already gone.
    pub fn dismiss(&self, id: NotificationId) -> bool {
        let mut inner = self.inner.lock();
        if let Some(timer) = inner.timers.remove(&id) {
            timer.abort();
        }
        let removed = remove_item(&mut inner, id);
        if removed {
            self.publish(&inner);
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        inner.items.clear();
        self.publish(&inner);
    }

    pub fn list(&self) -> Vec<Notification> {
        self.inner.lock().items.iter().cloned().collect()
    }

    pub fn contains(&self, id: NotificationId) -> bool {
        self.inner.lock().items.iter().any(|n| n.id == id)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Notification>> {
        self.tx.subscribe()
    }

    fn expire(&self, id: NotificationId) {
        let mut inner = self.inner.lock();
        inner.timers.remove(&id);
        if remove_item(&mut inner, id) {
            debug!("Notification {} expired", id);
            self.publish(&inner);
        }
    }

    fn publish(&self, inner: &QueueInner) {
        self.tx.send_replace(inner.items.iter().cloned().collect());
    }
}

fn remove_item(inner: &mut QueueInner, id: NotificationId) -> bool {
    match inner.items.iter().position(|n| n.id == id) {
        Some(index) => {
            inner.items.remove(index);
            true
        }
        None => false,
    }
}
