//! Outbound command sequencing.
//! Allocates transaction ids, tracks in-flight commands, matches acks and
//! decides between retry and failure when a deadline passes.

use crate::error::CommandError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_secs(1);

/// How a device confirms the commands it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acks echo the transaction id of the command
    #[default]
    TransactionId,
    /// No id echo; a response for the same dp shortly after counts as the ack
    DpEcho,
    /// Fire and forget: commands resolve once transmitted
    None,
}

/// Lifecycle of a pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Acked,
    TimedOut,
}

/// An outbound command awaiting its acknowledgment.
///
/// `W` is whatever the owner needs to resolve the caller once the command
/// settles (a oneshot sender in the device task, `()` in tests).
#[derive(Debug)]
pub struct PendingCommand<W> {
    pub transaction_id: u8,
    pub dp_id: u8,
    pub frame: Vec<u8>,
    pub sent_at: Instant,
    pub deadline: Instant,
    pub retries_remaining: u32,
    pub attempts: u32,
    pub resolution: Resolution,
    pub waiter: W,
}

/// Bytes to hand to the transport together with the id to embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub transaction_id: u8,
    pub dp_id: u8,
    pub frame: Vec<u8>,
}

/// Result of issuing a command.
#[derive(Debug)]
pub enum Issued<W> {
    /// Tracked until acked or timed out
    Awaiting(Transmission),
    /// Device never acks; the waiter is handed back for immediate resolution
    Unconfirmed(Transmission, W),
}

/// Outcome of a deadline expiring.
#[derive(Debug)]
pub enum Expired<W> {
    Retry(Transmission),
    Failed(PendingCommand<W>),
}

pub struct TransactionManager<W = ()> {
    next_id: u8,
    pending: BTreeMap<u8, PendingCommand<W>>,
    timeout: Duration,
    echo_window: Duration,
    ack_mode: AckMode,
}

impl<W> TransactionManager<W> {
    pub fn new(ack_mode: AckMode, timeout: Duration) -> Self {
        Self {
            next_id: 0,
            pending: BTreeMap::new(),
            timeout,
            echo_window: DEFAULT_ECHO_WINDOW,
            ack_mode,
        }
    }

    /// Start allocating transaction ids from `id`.
    pub fn with_initial_id(mut self, id: u8) -> Self {
        self.next_id = id;
        self
    }

    pub fn with_echo_window(mut self, window: Duration) -> Self {
        self.echo_window = window;
        self
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Every id is taken; issuing now would fail.
    pub fn is_saturated(&self) -> bool {
        self.pending.len() > u8::MAX as usize
    }

    pub fn get(&self, transaction_id: u8) -> Option<&PendingCommand<W>> {
        self.pending.get(&transaction_id)
    }

    /// Next id from the wrapping counter that is not already in flight.
    fn allocate(&mut self) -> Result<u8, CommandError> {
        for _ in 0..=u8::MAX as usize {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(CommandError::Saturated)
    }

    /// Issue a command for `dp_id`.
    ///
    /// `budget` is the number of transmissions allowed: the first send
    /// consumes one, each retry another.
    pub fn issue(
        &mut self,
        dp_id: u8,
        frame: Vec<u8>,
        budget: u32,
        waiter: W,
        now: Instant,
    ) -> Result<Issued<W>, CommandError> {
        let transaction_id = self.allocate()?;
        let transmission = Transmission {
            transaction_id,
            dp_id,
            frame: frame.clone(),
        };

        if self.ack_mode == AckMode::None {
            debug!("tx {} for dp {} is fire-and-forget", transaction_id, dp_id);
            return Ok(Issued::Unconfirmed(transmission, waiter));
        }

        debug!(
            "tx {} issued for dp {} (budget {})",
            transaction_id, dp_id, budget
        );
        self.pending.insert(
            transaction_id,
            PendingCommand {
                transaction_id,
                dp_id,
                frame,
                sent_at: now,
                deadline: now + self.timeout,
                retries_remaining: budget.saturating_sub(1),
                attempts: 1,
                resolution: Resolution::Pending,
                waiter,
            },
        );
        Ok(Issued::Awaiting(transmission))
    }

    /// Match an ack carrying `transaction_id`.
    pub fn acknowledge(&mut self, transaction_id: u8) -> Option<PendingCommand<W>> {
        let mut command = self.pending.remove(&transaction_id)?;
        command.resolution = Resolution::Acked;
        debug!(
            "tx {} acked for dp {} after {} attempt(s)",
            transaction_id, command.dp_id, command.attempts
        );
        Some(command)
    }

    /// Best-effort match of a response for `dp_id` against the oldest command
    /// for that dp sent within the echo window.
    pub fn acknowledge_dp(&mut self, dp_id: u8, now: Instant) -> Option<PendingCommand<W>> {
        if self.ack_mode != AckMode::DpEcho {
            return None;
        }
        let transaction_id = self
            .pending
            .values()
            .filter(|c| c.dp_id == dp_id && now.saturating_duration_since(c.sent_at) <= self.echo_window)
            .min_by_key(|c| c.sent_at)
            .map(|c| c.transaction_id)?;
        self.acknowledge(transaction_id)
    }

    /// Earliest deadline among in-flight commands.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|c| c.deadline).min()
    }

    /// Settle every command whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired<W>> {
        let due: Vec<u8> = self
            .pending
            .values()
            .filter(|c| c.deadline <= now)
            .map(|c| c.transaction_id)
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for old_id in due {
            let retry = self
                .pending
                .get(&old_id)
                .is_some_and(|c| c.retries_remaining > 0);

            // Allocate while the old id is still held so the retry gets a fresh one
            let new_id = if retry { self.allocate().ok() } else { None };

            let Some(mut command) = self.pending.remove(&old_id) else {
                continue;
            };

            match new_id {
                Some(transaction_id) => {
                    command.retries_remaining -= 1;
                    command.attempts += 1;
                    command.transaction_id = transaction_id;
                    command.sent_at = now;
                    command.deadline = now + self.timeout;
                    debug!(
                        "tx {} for dp {} timed out, retrying as tx {} ({} retries left)",
                        old_id, command.dp_id, transaction_id, command.retries_remaining
                    );
                    outcomes.push(Expired::Retry(Transmission {
                        transaction_id,
                        dp_id: command.dp_id,
                        frame: command.frame.clone(),
                    }));
                    self.pending.insert(transaction_id, command);
                }
                None => {
                    command.resolution = Resolution::TimedOut;
                    debug!(
                        "tx {} for dp {} timed out after {} attempt(s)",
                        old_id, command.dp_id, command.attempts
                    );
                    outcomes.push(Expired::Failed(command));
                }
            }
        }
        outcomes
    }

    /// Drop every in-flight command without retrying (device teardown).
    pub fn cancel_all(&mut self) -> Vec<PendingCommand<W>> {
        std::mem::take(&mut self.pending).into_values().collect()
    }
}
