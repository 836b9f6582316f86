/// Session synchronizer: snapshot then live delivery of a room's messages
use crate::backend::Backend;
use crate::config::Config;
use crate::directory::RoomDirectory;
use crate::error::{Result, SyncError};
use crate::message_store::MessageStore;
use crate::schema::{keys, Message, MessageCursor};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type MessageCallback = Box<dyn FnMut(Message) + Send>;
type ErrorCallback = Box<dyn FnOnce(SyncError) + Send>;

/// Capped exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.sync_max_retries,
            initial_backoff: config.sync_initial_backoff,
            max_backoff: config.sync_max_backoff,
        }
    }

    /// Delay before retry number `attempt` (0-based), somewhere in [cap/2, cap]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let cap = base
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_backoff.as_millis() as u64);
        let half = cap / 2;
        let jitter = if half == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=half)
        };
        Duration::from_millis(cap - half + jitter)
    }
}

/// The subscriber's callback, cancellable from any thread including the
/// callback's own
struct Delivery {
    callback: Mutex<Option<MessageCallback>>,
    cancelled: AtomicBool,
    /// Thread currently inside the callback
    running_on: Mutex<Option<ThreadId>>,
}

impl Delivery {
    fn new(callback: MessageCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
            cancelled: AtomicBool::new(false),
            running_on: Mutex::new(None),
        }
    }

    fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }

    /// Hand `message` to the callback; false once cancelled
    fn deliver(&self, message: Message) -> bool {
        let Ok(mut callback) = self.callback.lock() else {
            return false;
        };
        if !self.is_active() {
            return false;
        }
        let Some(on_message) = callback.as_mut() else {
            return false;
        };

        self.set_running(Some(thread::current().id()));
        on_message(message);
        self.set_running(None);

        if !self.is_active() {
            // Cancelled from inside the callback
            callback.take();
            return false;
        }
        true
    }

    /// Stop delivery; true if it was still active.
    ///
    /// From another thread this waits out a delivery in progress. From
    /// inside the callback it returns at once and the callback is dropped
    /// as soon as it returns.
    fn cancel(&self) -> bool {
        let was_active = !self.cancelled.swap(true, Ordering::SeqCst);
        let inside_callback = self
            .running_on
            .lock()
            .map(|running| *running == Some(thread::current().id()))
            .unwrap_or(false);
        if !inside_callback {
            if let Ok(mut callback) = self.callback.lock() {
                callback.take();
            }
        }
        was_active
    }

    fn set_running(&self, thread: Option<ThreadId>) {
        if let Ok(mut running) = self.running_on.lock() {
            *running = thread;
        }
    }
}

/// Handle for a live subscription; dropping it also cancels delivery
pub struct Subscription {
    id: u64,
    room_id: String,
    delivery: Arc<Delivery>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// False once cancelled or after the synchronizer gave up
    pub fn is_active(&self) -> bool {
        self.delivery.is_active()
    }

    fn cancel(&mut self) {
        self.delivery.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Clone)]
pub struct SessionSynchronizer {
    backend: Arc<dyn Backend>,
    directory: RoomDirectory,
    store: MessageStore,
    policy: RetryPolicy,
    page_size: usize,
    next_subscription: Arc<AtomicU64>,
}

impl SessionSynchronizer {
    pub fn new(
        backend: Arc<dyn Backend>,
        directory: RoomDirectory,
        store: MessageStore,
        config: &Config,
    ) -> Self {
        Self {
            backend,
            directory,
            store,
            policy: RetryPolicy::from_config(config),
            page_size: config.page_size,
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Stream a room's messages to `on_message`: everything already stored,
    /// in order, then each new message as it is appended.
    ///
    /// `on_error` runs at most once, when the upstream stays unreachable past
    /// the retry budget or fails permanently; delivery has stopped by then.
    /// Must be called from within a Tokio runtime. The subscription may be
    /// dropped or unsubscribed from inside `on_message`.
    pub fn subscribe<F, E>(&self, room_id: &str, on_message: F, on_error: E) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
        E: FnOnce(SyncError) + Send + 'static,
    {
        self.directory.get_room(room_id)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::Config("subscribe requires a Tokio runtime".to_string()))?;

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let delivery = Arc::new(Delivery::new(Box::new(on_message)));

        let task = SyncTask {
            subscription_id: id,
            room_id: room_id.to_string(),
            messages_prefix: keys::messages_prefix(room_id),
            backend: self.backend.clone(),
            store: self.store.clone(),
            policy: self.policy.clone(),
            page_size: self.page_size,
            cursor: MessageCursor::START,
            failures: 0,
            delivery: delivery.clone(),
            on_error: Some(Box::new(on_error)),
        };
        let handle = runtime.spawn(task.run());

        info!("Subscription {} opened on room {}", id, room_id);
        Ok(Subscription {
            id,
            room_id: room_id.to_string(),
            delivery,
            task: Some(handle),
        })
    }

    /// Stop delivery. No `on_message` call starts after this returns; called
    /// from inside `on_message`, that call is the last.
    pub fn unsubscribe(&self, mut subscription: Subscription) {
        subscription.cancel();
        info!(
            "Subscription {} closed on room {}",
            subscription.id, subscription.room_id
        );
    }
}

struct SyncTask {
    subscription_id: u64,
    room_id: String,
    messages_prefix: String,
    backend: Arc<dyn Backend>,
    store: MessageStore,
    policy: RetryPolicy,
    page_size: usize,
    /// Last delivered message id
    cursor: MessageCursor,
    /// Consecutive failed connection attempts
    failures: u32,
    delivery: Arc<Delivery>,
    on_error: Option<ErrorCallback>,
}

impl SyncTask {
    async fn run(mut self) {
        loop {
            if !self.is_active() {
                return;
            }
            let err = match self.session().await {
                Ok(()) => return,
                Err(e) => e,
            };

            if err.is_retryable() && self.failures < self.policy.max_retries {
                let delay = self.policy.delay(self.failures);
                self.failures += 1;
                warn!(
                    "Subscription {} lost upstream ({}), retry {}/{} in {:?}",
                    self.subscription_id, err, self.failures, self.policy.max_retries, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            error!(
                "Subscription {} on room {} giving up: {}",
                self.subscription_id, self.room_id, err
            );
            self.fail(err);
            return;
        }
    }

    /// One connected stretch: watch, backfill, then follow live changes.
    /// Returns Ok only when the subscriber is gone.
    async fn session(&mut self) -> Result<()> {
        // Watch first so nothing committed during the backfill is missed
        let mut changes = self.backend.watch()?;
        if !self.backfill()? {
            return Ok(());
        }
        self.failures = 0;
        debug!(
            "Subscription {} live on room {} after {:?}",
            self.subscription_id, self.room_id, self.cursor
        );

        loop {
            match changes.recv().await {
                Ok(change) => {
                    if !change.key.starts_with(&self.messages_prefix) {
                        continue;
                    }
                    let Some(raw) = change.value else {
                        continue;
                    };
                    let message: Message = serde_json::from_slice(&raw)?;
                    if !self.deliver(message) {
                        return Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscription {} lagged {} changes, backfilling",
                        self.subscription_id, skipped
                    );
                    if !self.backfill()? {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(SyncError::TransientUpstream(
                        "change stream closed".to_string(),
                    ));
                }
            }
        }
    }

    /// Deliver everything stored after the cursor; false if cancelled
    fn backfill(&mut self) -> Result<bool> {
        loop {
            let page = self
                .store
                .fetch_page(&self.room_id, self.cursor, self.page_size)?;
            let short = page.len() < self.page_size;
            for message in page {
                if !self.deliver(message) {
                    return Ok(false);
                }
            }
            if short {
                return Ok(true);
            }
        }
    }

    /// Hand one message to the subscriber unless already delivered.
    /// Returns false once the subscription is cancelled.
    fn deliver(&mut self, message: Message) -> bool {
        if message.id <= self.cursor.0 {
            return self.is_active();
        }
        let id = message.id;
        if !self.delivery.deliver(message) {
            return false;
        }
        self.cursor = MessageCursor(id);
        true
    }

    fn is_active(&self) -> bool {
        self.delivery.is_active()
    }

    fn fail(&mut self, err: SyncError) {
        // Drop the message callback so the handle reports inactive
        if !self.delivery.cancel() {
            return;
        }
        if let Some(on_error) = self.on_error.take() {
            on_error(err);
        }
    }
}
