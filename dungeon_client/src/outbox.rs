//! Command outbox.
//!
//! Holds every command the server has not acknowledged yet and resends it on
//! each network tick, oldest first, as much of the list as the sink can carry
//! in one send. Sending never removes anything; only `prune` (driven by
//! acknowledgments) does.
//!
//! Failed sends are retried with exponential backoff. After
//! `max_attempts` consecutive failures the outbox stops sending and reports
//! `OutboxError::RetriesExhausted` until an acknowledgment arrives or
//! `reset_retries` is called. Pending commands are kept either way.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use dungeon_shared::{
    command::{Command, Sequence},
    config::RetryConfig,
    error::OutboxError,
};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Network collaborator that transmits command batches.
#[async_trait]
pub trait CommandSink: Send {
    async fn send_batch(&mut self, commands: &[Command]) -> anyhow::Result<()>;

    /// Length of the longest prefix of `commands` a single send can carry.
    fn batch_limit(&self, commands: &[Command]) -> usize {
        commands.len()
    }
}

/// What a flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending.
    Empty,
    /// Send interval or backoff has not elapsed yet.
    NotDue,
    Sent { count: usize },
    /// Send failed; commands stay queued.
    Failed { attempt: u32, retry_in: Duration },
}

/// Buffer of unacknowledged commands.
#[derive(Debug)]
pub struct Outbox {
    pending: VecDeque<Command>,
    interval: Duration,
    retry: RetryConfig,
    last_send: Option<Instant>,
    failures: u32,
    retry_at: Option<Instant>,
    last_acked: Sequence,
    batches_sent: u64,
}

impl Outbox {
    pub fn new(interval: Duration, retry: RetryConfig) -> Self {
        Self {
            pending: VecDeque::new(),
            interval,
            retry,
            last_send: None,
            failures: 0,
            retry_at: None,
            last_acked: 0,
            batches_sent: 0,
        }
    }

    /// Appends a command. Sequences must strictly increase past anything
    /// queued or already acknowledged.
    pub fn push(&mut self, command: Command) -> Result<(), OutboxError> {
        let last = self
            .pending
            .back()
            .map_or(self.last_acked, |c| c.sequence.max(self.last_acked));
        if command.sequence <= last {
            return Err(OutboxError::NonMonotonicSequence {
                last,
                got: command.sequence,
            });
        }
        self.pending.push_back(command);
        Ok(())
    }

    /// Drops every command with `sequence <= last_sequence`. Returns how many
    /// were removed.
    pub fn prune(&mut self, last_sequence: Sequence) -> usize {
        let before = self.pending.len();
        while self
            .pending
            .front()
            .is_some_and(|c| c.sequence <= last_sequence)
        {
            self.pending.pop_front();
        }
        if last_sequence < self.last_acked {
            debug!(
                last_sequence,
                last_acked = self.last_acked,
                "Acknowledgment older than a previous one"
            );
        }
        self.last_acked = self.last_acked.max(last_sequence);
        // An acknowledgment proves the link works again.
        self.reset_retries();
        before - self.pending.len()
    }

    /// Pending commands in issuance order.
    pub fn pending(&self) -> impl DoubleEndedIterator<Item = &Command> + '_ {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Highest sequence acknowledged so far.
    pub fn last_acked(&self) -> Sequence {
        self.last_acked
    }

    /// Consecutive failed sends.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn batches_sent(&self) -> u64 {
        self.batches_sent
    }

    pub fn reset_retries(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }

    /// Empties the buffer for a new controlled entity.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.last_acked = 0;
        self.last_send = None;
        self.reset_retries();
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.retry.max_attempts
    }

    /// True if there is something to send and neither the tick interval nor
    /// a backoff is holding it back.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.pending.is_empty() || self.is_exhausted() {
            return false;
        }
        let interval_ok = self
            .last_send
            .map_or(true, |t| now.saturating_duration_since(t) >= self.interval);
        let backoff_ok = self.retry_at.map_or(true, |t| now >= t);
        interval_ok && backoff_ok
    }

    fn backoff(&self) -> Duration {
        let exp = self.failures.saturating_sub(1).min(16);
        self.retry
            .base_backoff()
            .saturating_mul(1u32 << exp)
            .min(self.retry.max_backoff())
    }

    /// Sends the pending list, or its oldest part the sink can carry, if due.
    pub async fn flush<S>(&mut self, sink: &mut S, now: Instant) -> Result<FlushOutcome, OutboxError>
    where
        S: CommandSink + ?Sized,
    {
        if self.is_exhausted() {
            return Err(OutboxError::RetriesExhausted {
                attempts: self.failures,
            });
        }
        if self.pending.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        if !self.is_due(now) {
            return Ok(FlushOutcome::NotDue);
        }

        let batch = self.pending.make_contiguous();
        let count = sink.batch_limit(batch).clamp(1, batch.len());
        let result = sink.send_batch(&batch[..count]).await;
        self.last_send = Some(now);

        match result {
            Ok(()) => {
                self.reset_retries();
                self.batches_sent += 1;
                Ok(FlushOutcome::Sent { count })
            }
            Err(e) => {
                self.failures += 1;
                let retry_in = self.backoff();
                self.retry_at = Some(now + retry_in);
                warn!(
                    error = %e,
                    attempt = self.failures,
                    pending = count,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Command batch send failed"
                );
                if self.is_exhausted() {
                    return Err(OutboxError::RetriesExhausted {
                        attempts: self.failures,
                    });
                }
                Ok(FlushOutcome::Failed {
                    attempt: self.failures,
                    retry_in,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dungeon_shared::command::Intent;

    #[derive(Default)]
    struct RecordingSink {
        batches: Vec<Vec<Sequence>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send_batch(&mut self, commands: &[Command]) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("link down");
            }
            self.batches
                .push(commands.iter().map(|c| c.sequence).collect());
            Ok(())
        }
    }

    /// Carries at most `limit` commands per send.
    struct SmallSink {
        limit: usize,
        batches: Vec<Vec<Sequence>>,
    }

    #[async_trait]
    impl CommandSink for SmallSink {
        async fn send_batch(&mut self, commands: &[Command]) -> anyhow::Result<()> {
            assert!(commands.len() <= self.limit);
            self.batches
                .push(commands.iter().map(|c| c.sequence).collect());
            Ok(())
        }

        fn batch_limit(&self, commands: &[Command]) -> usize {
            commands.len().min(self.limit)
        }
    }

    fn cmd(seq: Sequence) -> Command {
        Command::new(seq, Intent::RIGHT, 0, 0.016)
    }

    fn outbox() -> Outbox {
        Outbox::new(
            Duration::from_millis(16),
            RetryConfig {
                max_attempts: 3,
                base_backoff_ms: 10,
                max_backoff_ms: 25,
            },
        )
    }

    fn filled(seqs: impl IntoIterator<Item = Sequence>) -> Outbox {
        let mut ob = outbox();
        for s in seqs {
            ob.push(cmd(s)).unwrap();
        }
        ob
    }

    fn sequences(ob: &Outbox) -> Vec<Sequence> {
        ob.pending().map(|c| c.sequence).collect()
    }

    #[test]
    fn rejects_non_increasing_sequence() {
        let mut ob = filled([1, 2]);
        assert_eq!(
            ob.push(cmd(2)),
            Err(OutboxError::NonMonotonicSequence { last: 2, got: 2 })
        );
        ob.prune(2);
        assert!(ob.push(cmd(1)).is_err());
        assert!(ob.push(cmd(3)).is_ok());
    }

    #[test]
    fn prune_keeps_only_newer_commands() {
        for n in 0..=10 {
            let mut ob = filled(1..=8);
            ob.prune(n);
            assert!(ob.pending().all(|c| c.sequence > n), "n = {n}");
            assert_eq!(ob.len(), 8usize.saturating_sub(n as usize));
        }
    }

    #[tokio::test]
    async fn sends_whole_list_and_keeps_it() {
        let mut ob = filled([1, 2, 3]);
        let mut sink = RecordingSink::default();
        let t0 = Instant::now();

        assert_eq!(ob.flush(&mut sink, t0).await, Ok(FlushOutcome::Sent { count: 3 }));
        assert_eq!(ob.flush(&mut sink, t0).await, Ok(FlushOutcome::NotDue));

        ob.push(cmd(4)).unwrap();
        let t1 = t0 + Duration::from_millis(16);
        assert_eq!(ob.flush(&mut sink, t1).await, Ok(FlushOutcome::Sent { count: 4 }));
        assert_eq!(sink.batches, vec![vec![1, 2, 3], vec![1, 2, 3, 4]]);
        assert_eq!(sequences(&ob), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn empty_outbox_sends_nothing() {
        let mut ob = outbox();
        let mut sink = RecordingSink::default();
        assert_eq!(ob.flush(&mut sink, Instant::now()).await, Ok(FlushOutcome::Empty));
        assert!(sink.batches.is_empty());
    }

    #[tokio::test]
    async fn failures_back_off_then_exhaust() {
        let mut ob = filled([1, 2]);
        let mut sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let t0 = Instant::now();

        assert_eq!(
            ob.flush(&mut sink, t0).await,
            Ok(FlushOutcome::Failed {
                attempt: 1,
                retry_in: Duration::from_millis(10)
            })
        );
        let t1 = t0 + Duration::from_millis(20);
        assert_eq!(
            ob.flush(&mut sink, t1).await,
            Ok(FlushOutcome::Failed {
                attempt: 2,
                retry_in: Duration::from_millis(20)
            })
        );
        // Send interval has elapsed, the backoff has not.
        assert!(!ob.is_due(t1 + Duration::from_millis(17)));
        assert!(ob.is_due(t1 + Duration::from_millis(20)));

        let t2 = t1 + Duration::from_millis(40);
        assert_eq!(
            ob.flush(&mut sink, t2).await,
            Err(OutboxError::RetriesExhausted { attempts: 3 })
        );
        assert_eq!(sequences(&ob), vec![1, 2]);

        // An acknowledgment revives sending.
        sink.fail = false;
        ob.prune(1);
        let t3 = t2 + Duration::from_millis(40);
        assert_eq!(ob.flush(&mut sink, t3).await, Ok(FlushOutcome::Sent { count: 1 }));
    }

    #[tokio::test]
    async fn backoff_is_capped() {
        let mut ob = filled([1]);
        ob.retry.max_attempts = 10;
        let mut sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let mut now = Instant::now();
        let mut last = Duration::ZERO;
        for _ in 0..5 {
            if let Ok(FlushOutcome::Failed { retry_in, .. }) = ob.flush(&mut sink, now).await {
                last = retry_in;
            }
            now += Duration::from_secs(1);
        }
        assert_eq!(last, Duration::from_millis(25));
    }

    #[tokio::test]
    async fn oversized_backlog_goes_out_oldest_first() {
        let mut ob = filled(1..=5);
        let mut sink = SmallSink {
            limit: 2,
            batches: Vec::new(),
        };
        let t0 = Instant::now();

        assert_eq!(ob.flush(&mut sink, t0).await, Ok(FlushOutcome::Sent { count: 2 }));
        assert_eq!(ob.len(), 5);

        ob.prune(2);
        let t1 = t0 + Duration::from_millis(16);
        assert_eq!(ob.flush(&mut sink, t1).await, Ok(FlushOutcome::Sent { count: 2 }));
        assert_eq!(sink.batches, vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(sequences(&ob), vec![3, 4, 5]);
    }
}
