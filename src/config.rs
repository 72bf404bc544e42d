use std::time::Duration;

/// Transmission parameters and limits of an [`Endpoint`](crate::Endpoint).
///
/// Jitter and retry counts are deployment choices, not protocol constants,
/// so everything here can be tuned:
///
/// ```
/// use std::time::Duration;
/// use coap_engine::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_ack_timeout(Duration::from_secs(1))
///     .with_max_retransmit(2);
/// assert_eq!(config.max_retransmit, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Base interval before the first retransmission of a CON message.
    pub ack_timeout: Duration,
    /// The first timeout is `ack_timeout * (1 ± ack_jitter)`.
    pub ack_jitter: f64,
    /// Retransmissions after the initial send.
    pub max_retransmit: u32,
    /// How long message IDs are remembered for deduplication, and the
    /// upper bound on waiting for a separate response.
    pub exchange_lifetime: Duration,
    /// How long a NON request waits for its response.
    pub non_lifetime: Duration,
    /// Preferred block size exponent, block size is `2^(4 + szx)`.
    pub block_size_exponent: u8,
    /// Largest datagram the endpoint sends or expects to receive.
    pub max_message_size: usize,
    /// Largest body reassembled from block-wise transfers.
    pub max_body_size: usize,
    /// Length of generated tokens.
    pub token_length: usize,
    /// Capacity of the incoming request queue.
    pub request_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(2500),
            ack_jitter: 0.2,
            max_retransmit: 4,
            exchange_lifetime: Duration::from_secs(247),
            non_lifetime: Duration::from_secs(145),
            block_size_exponent: 6,
            max_message_size: 1152,
            max_body_size: 1 << 20,
            token_length: 4,
            request_queue: 32,
        }
    }
}

impl EngineConfig {
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_ack_jitter(mut self, ack_jitter: f64) -> Self {
        self.ack_jitter = ack_jitter.clamp(0.0, 0.99);
        self
    }

    pub fn with_max_retransmit(mut self, max_retransmit: u32) -> Self {
        self.max_retransmit = max_retransmit;
        self
    }

    pub fn with_exchange_lifetime(mut self, exchange_lifetime: Duration) -> Self {
        self.exchange_lifetime = exchange_lifetime;
        self
    }

    pub fn with_non_lifetime(mut self, non_lifetime: Duration) -> Self {
        self.non_lifetime = non_lifetime;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size_exponent = crate::block::size_exponent_for(block_size);
        self
    }

    pub fn with_token_length(mut self, token_length: usize) -> Self {
        self.token_length = token_length.clamp(1, 8);
        self
    }

    pub fn block_size(&self) -> usize {
        1 << (4 + self.block_size_exponent.min(6))
    }

    /// Time from the first transmission of a CON message to its last
    /// retransmission, at the largest jitter.
    pub fn max_transmit_span(&self) -> Duration {
        let backoff = (1u32 << self.max_retransmit.min(16)) - 1;
        self.ack_timeout.mul_f64(1.0 + self.ack_jitter) * backoff
    }

    /// Time from the first transmission of a CON message until the last
    /// retransmission has certainly timed out.
    pub fn max_transmit_wait(&self) -> Duration {
        let backoff = (1u32 << (self.max_retransmit.min(16) + 1)) - 1;
        self.ack_timeout.mul_f64(1.0 + self.ack_jitter) * backoff
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retransmit, 4);
        assert_eq!(config.block_size(), 1024);
        let span = config.max_transmit_span().as_millis();
        assert!((44_999..=45_000).contains(&span), "span {}", span);
        let wait = config.max_transmit_wait().as_millis();
        assert!((92_999..=93_000).contains(&wait), "wait {}", wait);
        assert!(config.exchange_lifetime > config.max_transmit_span() * 4);
    }

    #[test]
    fn test_block_size_rounds_down() {
        assert_eq!(EngineConfig::default().with_block_size(64).block_size(), 64);
        assert_eq!(EngineConfig::default().with_block_size(100).block_size(), 64);
        assert_eq!(EngineConfig::default().with_block_size(4096).block_size(), 1024);
        assert_eq!(EngineConfig::default().with_block_size(1).block_size(), 16);
    }
}
