use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Result,
};

/// Per-chat limiters idle past their slot are dropped once the map grows this large.
const PRUNE_AT: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Spacing between any two sends, across chats.
    pub global_min_interval: Duration,
    /// Spacing between sends to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        // Telegram allows ~30 msg/s overall and ~1 msg/s per chat.
        Self {
            global_min_interval: Duration::from_millis(40),
            per_chat_min_interval: Duration::from_millis(1050),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next: now,
        }
    }

    /// Take the next free slot; returns how long to wait for it.
    fn reserve_at(&mut self, now: Instant) -> Duration {
        let slot = self.next.max(now);
        self.next = slot + self.interval;
        slot - now
    }

    fn idle_at(&self, now: Instant) -> bool {
        self.next <= now
    }
}

/// MessagingPort decorator that spaces out outbound sends.
///
/// Broadcasts and pairing-code bursts after a restart go through here so they do
/// not trip Telegram 429s.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<ChatId, IntervalLimiter>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval, Instant::now())),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn reserve(&self, chat_id: ChatId) -> Duration {
        let now = Instant::now();
        let global_wait = self.global.lock().await.reserve_at(now);

        let mut chats = self.per_chat.lock().await;
        if chats.len() >= PRUNE_AT {
            chats.retain(|_, lim| !lim.idle_at(now));
        }
        let chat_wait = chats
            .entry(chat_id)
            .or_insert_with(|| IntervalLimiter::new(self.cfg.per_chat_min_interval, now))
            .reserve_at(now);

        global_wait.max(chat_wait)
    }

    #[cfg(test)]
    async fn tracked_chats(&self) -> usize {
        self.per_chat.lock().await.len()
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let wait = self.reserve(chat_id).await;
        if !wait.is_zero() {
            tracing::trace!(chat = chat_id.0, wait_ms = wait.as_millis() as u64, "throttling send");
            sleep(wait).await;
        }
        self.inner.send_html(chat_id, html).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::domain::MessageId;

    #[derive(Default)]
    struct RecordingMessenger {
        sent: std::sync::Mutex<Vec<(i64, String)>>,
    }

    #[async_trait::async_trait]
    impl MessagingPort for RecordingMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_html: true,
                max_message_len: 4096,
            }
        }

        async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((chat_id.0, html.to_string()));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(sent.len() as i32),
            })
        }
    }

    fn fast() -> ThrottleConfig {
        ThrottleConfig {
            global_min_interval: Duration::from_millis(1),
            per_chat_min_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn limiter_hands_out_consecutive_slots() {
        let t0 = Instant::now();
        let mut lim = IntervalLimiter::new(Duration::from_millis(200), t0);
        assert_eq!(lim.reserve_at(t0), Duration::ZERO);
        assert_eq!(lim.reserve_at(t0), Duration::from_millis(200));
        assert_eq!(
            lim.reserve_at(t0 + Duration::from_millis(50)),
            Duration::from_millis(350)
        );
        // A quiet period resets the schedule.
        let later = t0 + Duration::from_secs(5);
        assert!(lim.idle_at(later));
        assert_eq!(lim.reserve_at(later), Duration::ZERO);
    }

    #[tokio::test]
    async fn forwards_sends_in_order() {
        let inner = Arc::new(RecordingMessenger::default());
        let throttled = ThrottledMessenger::new(inner.clone(), fast());
        throttled.send_html(ChatId(1), "a").await.unwrap();
        throttled.send_html(ChatId(2), "b").await.unwrap();
        throttled.send_html(ChatId(1), "c").await.unwrap();

        let sent = inner.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                (1, "a".to_string()),
                (2, "b".to_string()),
                (1, "c".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn idle_chats_are_pruned_during_large_broadcasts() {
        let inner = Arc::new(RecordingMessenger::default());
        let throttled = ThrottledMessenger::new(
            inner.clone(),
            ThrottleConfig {
                global_min_interval: Duration::ZERO,
                per_chat_min_interval: Duration::ZERO,
            },
        );
        for chat in 0..(PRUNE_AT as i64 + 10) {
            throttled.send_html(ChatId(chat), "hi").await.unwrap();
        }
        assert!(throttled.tracked_chats().await <= PRUNE_AT);
        assert_eq!(inner.sent.lock().unwrap().len(), PRUNE_AT + 10);
    }
}
