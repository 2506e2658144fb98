//! Delayed email/SMS reminders for unread conversations.
//!
//! Delivery of a new event schedules a state check per recipient and
//! channel. When the check fires it re-reads the read history and only
//! sends when something arrived after the last reminder on that channel.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::{ChannelConfig, NotificationConfig},
    error::{ReadHistoryError, Result},
    maintainer::RecordMaintainer,
    model::{Actor, EventKind, ReadHistory, Target, TimestampField, ValidatedEvent, record_id},
    token::Token,
    validation::normalize_phone,
};

/// Tries per check before the timer service is considered down.
pub const SCHEDULE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Sms];

    pub fn name(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }

    pub fn field(self) -> TimestampField {
        match self {
            Self::Email => TimestampField::LastEmailNotification,
            Self::Sms => TimestampField::LastSmsNotification,
        }
    }

    fn event_kind(self) -> EventKind {
        match self {
            Self::Email => EventKind::EmailNotification,
            Self::Sms => EventKind::SmsNotification,
        }
    }

    fn settings(self, config: &NotificationConfig) -> &ChannelConfig {
        match self {
            Self::Email => &config.email,
            Self::Sms => &config.sms,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of a scheduled state check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationCheck {
    pub channel: Channel,
    pub user: String,
    pub target: Target,
    /// Retries already spent on this check.
    #[serde(default)]
    pub attempt: u32,
}

impl NotificationCheck {
    /// Checks for one (user, target type, target id) run one at a time.
    pub fn queue_key(&self) -> String {
        record_id(&Actor::User(self.user.clone()), &self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub user: String,
    pub subject: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedEmail {
    pub email: EmailMessage,
    /// Newest event covered by the message.
    pub last_sent: Token,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSms {
    pub phone: String,
    pub text: String,
    pub last_sent: Token,
}

#[async_trait]
pub trait TimerService: Send + Sync {
    async fn schedule_at(&self, at: DateTime<Utc>, check: NotificationCheck) -> Result<()>;
}

/// Renders reminder content. `None` means there is nothing worth sending.
#[async_trait]
pub trait NotificationContent: Send + Sync {
    async fn generate_email(&self, record: &ReadHistory) -> Result<Option<GeneratedEmail>>;
    async fn generate_sms(&self, record: &ReadHistory) -> Result<Option<GeneratedSms>>;
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_email(&self, email: &EmailMessage) -> Result<()>;
    async fn send_sms(&self, sms_id: &str, phone: &str, text: &str) -> Result<()>;
}

/// A message delivered into a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredEvent {
    pub from: Actor,
    pub recipients: Vec<Actor>,
    pub target: Target,
    pub token: Token,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The record is gone or was never created.
    Missing,
    /// A reminder already covers the newest event.
    Suppressed,
    /// Content generation found nothing to send.
    NothingToSend,
    Dispatched { last_sent: Token },
    Rescheduled { attempt: u32, at: DateTime<Utc> },
    GaveUp,
}

impl CheckOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Suppressed => "suppressed",
            Self::NothingToSend => "nothing_to_send",
            Self::Dispatched { .. } => "dispatched",
            Self::Rescheduled { .. } => "rescheduled",
            Self::GaveUp => "gave_up",
        }
    }
}

enum Attempt {
    Done(CheckOutcome),
    Failed(ReadHistoryError),
}

enum Prepared {
    Email(GeneratedEmail),
    Sms { sms: GeneratedSms, phone: String },
}

impl Prepared {
    fn last_sent(&self) -> &Token {
        match self {
            Self::Email(generated) => &generated.last_sent,
            Self::Sms { sms, .. } => &sms.last_sent,
        }
    }
}

pub struct NotificationScheduler {
    maintainer: RecordMaintainer,
    timers: Arc<dyn TimerService>,
    content: Arc<dyn NotificationContent>,
    sender: Arc<dyn NotificationSender>,
    config: NotificationConfig,
    queues: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NotificationScheduler {
    pub fn new(
        maintainer: RecordMaintainer,
        timers: Arc<dyn TimerService>,
        content: Arc<dyn NotificationContent>,
        sender: Arc<dyn NotificationSender>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            maintainer,
            timers,
            content,
            sender,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Records the delivery for sender and recipients and schedules the
    /// reminder checks it calls for. Returns the scheduled checks.
    ///
    /// Every record is updated before any timer is touched. When a check
    /// still cannot be scheduled after [`SCHEDULE_ATTEMPTS`] tries, the
    /// remaining checks are scheduled anyway and an error is returned. The
    /// call is safe to repeat.
    pub async fn on_delivered(&self, event: DeliveredEvent) -> Result<Vec<NotificationCheck>> {
        let write = ValidatedEvent::new(
            EventKind::Write,
            event.from.clone(),
            event.target.clone(),
            event.token.clone(),
        )?;
        let deliveries = event
            .recipients
            .iter()
            .filter(|recipient| **recipient != event.from)
            .map(|recipient| {
                ValidatedEvent::new(
                    EventKind::NewEvent,
                    recipient.clone(),
                    event.target.clone(),
                    event.token.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        self.maintainer.apply(&write)?;
        for delivered in &deliveries {
            self.maintainer.apply(delivered)?;
        }

        let mut pending = Vec::new();
        for delivered in &deliveries {
            let Some(user) = delivered.actor.user_id() else {
                continue;
            };
            let record = self.maintainer.get(&delivered.record_id())?;
            for channel in Channel::ALL {
                let settings = channel.settings(&self.config);
                if !settings.is_enabled_for(&event.target.target_type) {
                    continue;
                }
                if record
                    .as_ref()
                    .is_some_and(|record| reminded_since_write(record, channel))
                {
                    debug!(user, channel = channel.name(), "reminder already sent since last write");
                    continue;
                }
                let check = NotificationCheck {
                    channel,
                    user: user.to_string(),
                    target: event.target.clone(),
                    attempt: 0,
                };
                let at = Utc::now() + chrono_duration(settings.check_after());
                pending.push((at, check));
            }
        }

        let mut scheduled = Vec::new();
        let mut failures = Vec::new();
        for (at, check) in pending {
            match self.schedule(at, &check).await {
                Ok(()) => {
                    debug!(user = %check.user, channel = check.channel.name(), %at, "reminder check scheduled");
                    scheduled.push(check);
                }
                Err(err) => {
                    warn!(
                        record = %check.queue_key(),
                        channel = check.channel.name(),
                        "failed to schedule reminder check: {err}"
                    );
                    failures.push(format!("{}/{}: {err}", check.queue_key(), check.channel));
                }
            }
        }
        if !failures.is_empty() {
            return Err(ReadHistoryError::Notification(format!(
                "failed to schedule {} reminder check(s): {}",
                failures.len(),
                failures.join("; ")
            )));
        }
        Ok(scheduled)
    }

    /// Runs a fired check. Checks sharing a queue key never overlap.
    pub async fn on_timer(&self, check: NotificationCheck) -> Result<CheckOutcome> {
        let queue_key = check.queue_key();
        let lock = {
            let mut queues = self.queues.lock();
            Arc::clone(queues.entry(queue_key.clone()).or_default())
        };
        let outcome = {
            let _turn = lock.lock().await;
            self.run_with_retries(check.clone()).await
        };
        {
            let mut queues = self.queues.lock();
            if Arc::strong_count(&lock) == 2 {
                queues.remove(&queue_key);
            }
        }

        let outcome = outcome?;
        counter!(
            "readdbx_notifications_total",
            "channel" => check.channel.name(),
            "outcome" => outcome.label()
        )
        .increment(1);
        Ok(outcome)
    }

    /// Runs the check and hands failures to the timer service. When the
    /// timer service itself is down the retry happens in place after the
    /// backoff delay.
    async fn run_with_retries(&self, mut check: NotificationCheck) -> Result<CheckOutcome> {
        loop {
            let err = match self.run_check(&check).await? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Failed(err) => err,
            };

            let attempt = check.attempt + 1;
            if err.is_rejection() || attempt >= self.config.max_attempts {
                warn!(
                    record = %check.queue_key(),
                    channel = check.channel.name(),
                    attempt,
                    "giving up on reminder: {err}"
                );
                return Ok(CheckOutcome::GaveUp);
            }
            let delay = self.config.backoff_delay(attempt);
            let at = Utc::now() + chrono_duration(delay);
            let next = NotificationCheck {
                attempt,
                ..check.clone()
            };
            match self.schedule(at, &next).await {
                Ok(()) => {
                    warn!(
                        record = %check.queue_key(),
                        channel = check.channel.name(),
                        attempt,
                        %at,
                        "reminder failed, retrying: {err}"
                    );
                    return Ok(CheckOutcome::Rescheduled { attempt, at });
                }
                Err(timer_err) => {
                    warn!(
                        record = %check.queue_key(),
                        channel = check.channel.name(),
                        attempt,
                        "reminder failed ({err}) and the retry timer is unavailable ({timer_err}); retrying in place"
                    );
                    tokio::time::sleep(delay).await;
                    check = next;
                }
            }
        }
    }

    async fn run_check(&self, check: &NotificationCheck) -> Result<Attempt> {
        let id = check.queue_key();
        let Some(record) = self.maintainer.get(&id)? else {
            return Ok(Attempt::Done(CheckOutcome::Missing));
        };
        if record.timestamp(check.channel.field()) >= record.last.as_ref() {
            debug!(record = %id, channel = check.channel.name(), "reminder suppressed");
            return Ok(Attempt::Done(CheckOutcome::Suppressed));
        }

        let prepared = match self.prepare(check.channel, &record).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return Ok(Attempt::Done(CheckOutcome::NothingToSend)),
            Err(err) => return Ok(Attempt::Failed(err)),
        };
        if let Err(err) = self.dispatch(&prepared).await {
            return Ok(Attempt::Failed(err));
        }

        let last_sent = prepared.last_sent().clone();
        let sent = ValidatedEvent::new(
            check.channel.event_kind(),
            Actor::User(check.user.clone()),
            check.target.clone(),
            last_sent.clone(),
        )?;
        self.maintainer.apply(&sent)?;
        info!(record = %id, channel = check.channel.name(), last_sent = %last_sent, "reminder sent");
        Ok(Attempt::Done(CheckOutcome::Dispatched { last_sent }))
    }

    /// Hands one check to the timer service, retrying with backoff.
    async fn schedule(&self, at: DateTime<Utc>, check: &NotificationCheck) -> Result<()> {
        let mut tries = 0;
        loop {
            tries += 1;
            match self.timers.schedule_at(at, check.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if tries >= SCHEDULE_ATTEMPTS => return Err(err),
                Err(err) => {
                    debug!(record = %check.queue_key(), tries, "timer service rejected check: {err}");
                    tokio::time::sleep(self.config.backoff_delay(tries)).await;
                }
            }
        }
    }

    async fn prepare(&self, channel: Channel, record: &ReadHistory) -> Result<Option<Prepared>> {
        let timeout = self.config.generate_timeout();
        let timed_out = || {
            ReadHistoryError::Notification(format!(
                "generating {channel} content took longer than {}ms",
                timeout.as_millis()
            ))
        };
        match channel {
            Channel::Email => {
                let generated = tokio::time::timeout(timeout, self.content.generate_email(record))
                    .await
                    .map_err(|_| timed_out())??;
                Ok(generated.map(Prepared::Email))
            }
            Channel::Sms => {
                let generated = tokio::time::timeout(timeout, self.content.generate_sms(record))
                    .await
                    .map_err(|_| timed_out())??;
                generated
                    .map(|sms| {
                        let phone = normalize_phone(&sms.phone)?;
                        Ok::<_, ReadHistoryError>(Prepared::Sms { sms, phone })
                    })
                    .transpose()
            }
        }
    }

    async fn dispatch(&self, prepared: &Prepared) -> Result<()> {
        match prepared {
            Prepared::Email(generated) => self.sender.send_email(&generated.email).await,
            Prepared::Sms { sms, phone } => {
                let sms_id = Uuid::new_v4().to_string();
                self.sender.send_sms(&sms_id, phone, &sms.text).await
            }
        }
    }

    /// Runs fired checks from `receiver` until shutdown.
    pub async fn run_checks(
        self: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<NotificationCheck>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                check = receiver.recv() => {
                    let Some(check) = check else {
                        break;
                    };
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = scheduler.on_timer(check).await {
                            warn!("reminder check failed: {err}");
                        }
                    });
                }
            }
        }
    }
}

/// A reminder on `channel` went out after the recipient last wrote.
fn reminded_since_write(record: &ReadHistory, channel: Channel) -> bool {
    record.timestamp(channel.field()) > record.write.as_ref()
}

fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

/// Timer service backed by tokio sleeps. Fired checks are sent to the
/// receiver returned by [`TokioTimerService::new`].
#[derive(Clone)]
pub struct TokioTimerService {
    fired: mpsc::UnboundedSender<NotificationCheck>,
}

impl TokioTimerService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationCheck>) {
        let (fired, receiver) = mpsc::unbounded_channel();
        (Self { fired }, receiver)
    }
}

#[async_trait]
impl TimerService for TokioTimerService {
    async fn schedule_at(&self, at: DateTime<Utc>, check: NotificationCheck) -> Result<()> {
        let wait = (at - Utc::now()).to_std().unwrap_or_default();
        let fired = self.fired.clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            hand_off(&fired, check);
        });
        Ok(())
    }
}

/// Passes a fired check to the runner. Returns `false` if the runner is gone.
fn hand_off(fired: &mpsc::UnboundedSender<NotificationCheck>, check: NotificationCheck) -> bool {
    match fired.send(check) {
        Ok(()) => true,
        Err(err) => {
            counter!("readdbx_notification_checks_dropped_total").increment(1);
            warn!(
                record = %err.0.queue_key(),
                channel = err.0.channel.name(),
                "reminder check fired after the runner stopped; dropping it"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_key_matches_record_id() {
        let check = NotificationCheck {
            channel: Channel::Sms,
            user: "u1".into(),
            target: Target::new("priv", "t1").unwrap(),
            attempt: 0,
        };
        assert_eq!(check.queue_key(), "user_u1_priv_t1");
    }

    #[test]
    fn reminder_since_write_compares_tokens() {
        let mut record = ReadHistory::empty(
            Actor::User("u1".into()),
            Target::new("priv", "t1").unwrap(),
        );
        assert!(!reminded_since_write(&record, Channel::Email));
        record.last_email_notification = Some(Token::parse("b").unwrap());
        assert!(reminded_since_write(&record, Channel::Email));
        record.write = Some(Token::parse("c").unwrap());
        assert!(!reminded_since_write(&record, Channel::Email));
        assert!(!reminded_since_write(&record, Channel::Sms));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_timers_fire_after_delay() {
        let (timers, mut fired) = TokioTimerService::new();
        let check = NotificationCheck {
            channel: Channel::Email,
            user: "u1".into(),
            target: Target::new("priv", "t1").unwrap(),
            attempt: 0,
        };
        let at = Utc::now() + chrono::Duration::seconds(30);
        timers.schedule_at(at, check.clone()).await.unwrap();
        assert!(fired.try_recv().is_err());
        let received = tokio::time::timeout(std::time::Duration::from_secs(60), fired.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(check));
    }

    #[test]
    fn fired_check_without_runner_is_dropped() {
        let (timers, fired) = TokioTimerService::new();
        let check = NotificationCheck {
            channel: Channel::Sms,
            user: "u1".into(),
            target: Target::new("priv", "t1").unwrap(),
            attempt: 1,
        };
        assert!(hand_off(&timers.fired, check.clone()));
        drop(fired);
        assert!(!hand_off(&timers.fired, check));
    }
}
