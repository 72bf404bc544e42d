//! Retransmission state of a single confirmable message.
//!
//! The context is a plain state machine. Timers live in the task that owns
//! the exchange, which calls [`RetransmissionContext::on_timeout`] whenever
//! the current timeout elapses.

use std::time::Duration;

use rand::Rng;

use crate::config::EngineConfig;

/// Backoff stops doubling here, so deadlines stay representable.
const MAX_TIMEOUT: Duration = Duration::from_secs(1 << 32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmissionState {
    Pending,
    Acknowledged,
    Reset,
    TimedOut,
}

/// What the owner has to do after a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Send the message again and wait for the (doubled) timeout.
    Retransmit,
    /// Give up, the peer never acknowledged.
    Exhausted,
    /// The message is no longer pending, the timer fired late.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct RetransmissionContext {
    timeout: Duration,
    transmissions: u32,
    max_retransmit: u32,
    state: RetransmissionState,
}

impl RetransmissionContext {
    /// Starts tracking a message that has just been sent for the first time.
    pub fn new(config: &EngineConfig) -> RetransmissionContext {
        RetransmissionContext::with_rng(config, &mut rand::thread_rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(config: &EngineConfig, rng: &mut R) -> RetransmissionContext {
        let jitter = config.ack_jitter.clamp(0.0, 0.99);
        let factor = if jitter > 0.0 {
            1.0 + rng.gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        RetransmissionContext {
            timeout: config.ack_timeout.mul_f64(factor),
            transmissions: 1,
            max_retransmit: config.max_retransmit,
            state: RetransmissionState::Pending,
        }
    }

    /// Time to wait for an acknowledgement of the latest transmission.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Transmissions so far, including the first one.
    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn state(&self) -> RetransmissionState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == RetransmissionState::Pending
    }

    pub fn on_timeout(&mut self) -> TimeoutAction {
        if !self.is_pending() {
            return TimeoutAction::Ignore;
        }
        if self.transmissions > self.max_retransmit {
            self.state = RetransmissionState::TimedOut;
            return TimeoutAction::Exhausted;
        }
        self.transmissions += 1;
        self.timeout = self
            .timeout
            .checked_mul(2)
            .map_or(MAX_TIMEOUT, |timeout| timeout.min(MAX_TIMEOUT));
        TimeoutAction::Retransmit
    }

    /// Returns true if this call moved the message out of `Pending`.
    pub fn acknowledge(&mut self) -> bool {
        self.finish(RetransmissionState::Acknowledged)
    }

    /// Returns true if this call moved the message out of `Pending`.
    pub fn reset(&mut self) -> bool {
        self.finish(RetransmissionState::Reset)
    }

    fn finish(&mut self, state: RetransmissionState) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state = state;
        true
    }
}
