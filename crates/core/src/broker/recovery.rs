//! Backoff and the recovery timers owned by the session supervisor.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::RecoveryConfig;

/// Capped exponential backoff: `base * min(2^attempt, max_multiplier)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_multiplier: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_multiplier: u32) -> Self {
        Self {
            base,
            max_multiplier: max_multiplier.max(1),
            attempt: 0,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.base_delay(), config.max_multiplier)
    }

    /// Delay for the next retry. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = 2u32
            .saturating_pow(self.attempt)
            .min(self.max_multiplier);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(multiplier)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    Reconnect,
    RecreateChannel,
}

/// Sent by a timer task when its delay has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: RecoveryKind,
    pub token: u64,
}

#[derive(Debug)]
struct PendingTimer {
    token: u64,
    task: JoinHandle<()>,
}

/// At most one pending timer per kind. Scheduling a reconnect cancels any
/// pending channel recreation.
#[derive(Debug)]
pub struct RecoveryTimers {
    backoff: Backoff,
    reconnect: Option<PendingTimer>,
    channel: Option<PendingTimer>,
    next_token: u64,
    fired: mpsc::UnboundedSender<TimerFired>,
}

impl RecoveryTimers {
    pub fn new(backoff: Backoff, fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            backoff,
            reconnect: None,
            channel: None,
            next_token: 0,
            fired,
        }
    }

    /// Returns the delay, or `None` if a reconnect is already pending.
    pub fn schedule_reconnect(&mut self) -> Option<Duration> {
        cancel(&mut self.channel);
        if self.reconnect.is_some() {
            return None;
        }
        let delay = self.backoff.next_delay();
        self.reconnect = Some(self.spawn(RecoveryKind::Reconnect, delay));
        Some(delay)
    }

    /// Returns the delay, or `None` if any recovery is already pending.
    pub fn schedule_channel_recreation(&mut self) -> Option<Duration> {
        if self.reconnect.is_some() || self.channel.is_some() {
            return None;
        }
        let delay = self.backoff.next_delay();
        self.channel = Some(self.spawn(RecoveryKind::RecreateChannel, delay));
        Some(delay)
    }

    /// Claims a fired timer. False for cancelled or superseded timers.
    pub fn claim(&mut self, fired: TimerFired) -> bool {
        let slot = match fired.kind {
            RecoveryKind::Reconnect => &mut self.reconnect,
            RecoveryKind::RecreateChannel => &mut self.channel,
        };
        if slot.as_ref().is_some_and(|p| p.token == fired.token) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn is_pending(&self, kind: RecoveryKind) -> bool {
        match kind {
            RecoveryKind::Reconnect => self.reconnect.is_some(),
            RecoveryKind::RecreateChannel => self.channel.is_some(),
        }
    }

    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    pub fn cancel_all(&mut self) {
        cancel(&mut self.reconnect);
        cancel(&mut self.channel);
    }

    fn spawn(&mut self, kind: RecoveryKind, delay: Duration) -> PendingTimer {
        self.next_token += 1;
        let token = self.next_token;
        let fired = self.fired.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(TimerFired { kind, token });
        });
        PendingTimer { token, task }
    }
}

impl Drop for RecoveryTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn cancel(slot: &mut Option<PendingTimer>) {
    if let Some(pending) = slot.take() {
        pending.task.abort();
    }
}
