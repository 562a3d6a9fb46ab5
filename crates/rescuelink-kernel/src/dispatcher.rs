//! [`CommandDispatcher`] – time-bounded, retried command delivery.
//!
//! Every attempt runs under `tokio::time::timeout`; a timeout counts as a
//! failed attempt.  Between attempts the dispatcher sleeps
//! `backoff_base * 2^attempt`, capped at `backoff_cap`.  When the budget is
//! spent it returns [`RescueError::RetriesExhausted`] and the caller must
//! treat the link as dead.

use std::time::Duration;

use chrono::Utc;
use rescuelink_hal::CommandLink;
use rescuelink_types::{CommandKind, CommandRecord, RescueError, Waypoint};
use tracing::{debug, error, warn};

/// One outbound command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Loiter,
    Waypoint(Waypoint),
    ReturnHome,
    Stop,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Loiter => CommandKind::Loiter,
            Command::Waypoint(_) => CommandKind::Waypoint,
            Command::ReturnHome => CommandKind::ReturnHome,
            Command::Stop => CommandKind::Stop,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per command, first attempt included.
    pub max_attempts: u32,
    /// Bound on a single link call.
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

pub struct CommandDispatcher {
    link: Box<dyn CommandLink>,
    policy: RetryPolicy,
}

impl CommandDispatcher {
    pub fn new(link: Box<dyn CommandLink>, policy: RetryPolicy) -> Self {
        Self { link, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn link_id(&self) -> &str {
        self.link.id()
    }

    /// Hand the link back for release.
    pub fn into_link(self) -> Box<dyn CommandLink> {
        self.link
    }

    /// Deliver `command`, retrying per the policy.
    ///
    /// Returns the record of the attempt the link acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`RescueError::RetriesExhausted`] once every attempt failed or
    /// timed out.
    pub async fn dispatch(&mut self, command: &Command) -> Result<CommandRecord, RescueError> {
        let kind = command.kind();
        let attempts = self.policy.max_attempts.max(1);

        for retry_count in 0..attempts {
            let record = CommandRecord {
                command_kind: kind,
                issued_at: Utc::now(),
                retry_count,
            };

            let failure = match tokio::time::timeout(self.policy.timeout, self.send(command)).await {
                Ok(Ok(())) => {
                    debug!(command = %kind, retry_count, link = self.link.id(), "command acknowledged");
                    return Ok(record);
                }
                Ok(Err(e)) => e,
                Err(_) => RescueError::CommandTimeout {
                    command: kind,
                    timeout_ms: self.policy.timeout.as_millis() as u64,
                },
            };

            warn!(
                command = %kind,
                attempt = retry_count + 1,
                max_attempts = attempts,
                error = %failure,
                "command attempt failed"
            );

            if retry_count + 1 < attempts {
                tokio::time::sleep(self.policy.backoff(retry_count)).await;
            }
        }

        error!(command = %kind, attempts, link = self.link.id(), "command retry budget exhausted");
        Err(RescueError::RetriesExhausted {
            command: kind,
            attempts,
        })
    }

    async fn send(&mut self, command: &Command) -> Result<(), RescueError> {
        match command {
            Command::Loiter => self.link.loiter().await,
            Command::Waypoint(waypoint) => self.link.send_waypoint(waypoint).await,
            Command::ReturnHome => self.link.return_home().await,
            Command::Stop => self.link.stop().await,
        }
    }
}
