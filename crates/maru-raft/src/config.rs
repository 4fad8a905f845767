//! Raft configuration (timeouts, limits, tuning parameters).

use std::time::Duration;

/// Raft configuration.
///
/// Controls the election and replication cadence plus client-facing waits.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// How long a follower waits without a heartbeat before starting an
    /// election.
    ///
    /// Default: 3000ms
    pub follower_timeout: Duration,

    /// Minimum randomized wait for a candidacy to resolve before the
    /// candidate gives up and drops back to follower.
    ///
    /// Default: 1000ms
    pub election_timeout_min: Duration,

    /// Maximum randomized candidacy wait.
    ///
    /// Default: 3000ms
    pub election_timeout_max: Duration,

    /// Leader tick: AppendEntries (heartbeat or with entries) goes to every
    /// peer at this interval. Must be well under `follower_timeout`.
    ///
    /// Default: 500ms
    pub heartbeat_interval: Duration,

    /// Maximum number of entries carried by one AppendEntries.
    ///
    /// Default: 10
    pub batch_size: usize,

    /// Initial live-count credit a fresh leader starts with. Each tick
    /// spends one; each ack-matched response earns one back (clamped here).
    /// Below zero the leader suspects a partition and steps down.
    ///
    /// Default: 1
    pub leader_resilience: i32,

    /// Poll granularity while a client command waits for its index to
    /// commit / apply.
    ///
    /// Default: 10ms
    pub commit_poll: Duration,

    /// Apply-loop poll granularity.
    ///
    /// Default: 10ms
    pub apply_poll: Duration,

    /// Upper bound on a client command's commit wait.
    ///
    /// Default: 5000ms
    pub propose_timeout: Duration,

    /// How often the transport retries dialing unreachable peers.
    ///
    /// Default: 3s
    pub redial_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            follower_timeout: Duration::from_millis(3000),
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_millis(500),
            batch_size: 10,
            leader_resilience: 1,
            commit_poll: Duration::from_millis(10),
            apply_poll: Duration::from_millis(10),
            propose_timeout: Duration::from_millis(5000),
            redial_interval: Duration::from_secs(3),
        }
    }
}

impl RaftConfig {
    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.follower_timeout {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < follower_timeout ({:?})",
                self.heartbeat_interval, self.follower_timeout
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.batch_size == 0 {
            return Err("batch_size must be > 0".to_string());
        }

        if self.leader_resilience < 0 {
            return Err("leader_resilience must be >= 0".to_string());
        }

        Ok(())
    }

    /// Get a randomized candidacy timeout in
    /// `[election_timeout_min, election_timeout_max]`.
    ///
    /// Each candidacy draws a fresh value; the jitter is what breaks split
    /// votes.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}
