use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};

use crate::coordinator::{CoordinatorActor, CoordinatorEvent};
use crate::error::CoordinationResult;
use crate::id::LeaderSessionId;
use keel_common::config;
use keel_server::actor::ActorHandle;

/// Client-side view of the external leader election service.
/// Grant and revoke notifications arrive as coordinator events; the
/// coordinator confirms an accepted session through this trait. The confirm
/// call may block on the election backend and therefore always runs off the
/// event loop.
#[async_trait]
pub trait LeaderElection: Send + Sync + 'static {
    async fn confirm(&self, session: LeaderSessionId) -> CoordinationResult<()>;
    async fn stop(&self) -> CoordinationResult<()>;
}

/// The delays between repeated confirmation attempts against the election
/// backend. The schedule is materialized up front from the configured
/// strategy; once it is exhausted, the last error is surfaced.
#[derive(Debug, Clone)]
pub struct ConfirmBackoff {
    delays: Vec<Duration>,
}

impl ConfirmBackoff {
    pub fn attempts_after_first(&self) -> usize {
        self.delays.len()
    }
}

impl From<&config::RetryStrategy> for ConfirmBackoff {
    fn from(strategy: &config::RetryStrategy) -> Self {
        let delays = match strategy {
            config::RetryStrategy::Fixed {
                max_count,
                delay_secs,
            } => {
                vec![Duration::from_secs(*delay_secs); *max_count]
            }
            config::RetryStrategy::ExponentialBackoff {
                max_count,
                initial_delay_secs,
                max_delay_secs,
                factor,
            } => {
                let cap = Duration::from_secs(*max_delay_secs);
                let mut delay = Duration::from_secs(*initial_delay_secs);
                let mut delays = Vec::with_capacity(*max_count);
                for _ in 0..*max_count {
                    delays.push(delay);
                    delay = std::cmp::min(delay * *factor, cap);
                }
                delays
            }
        };
        Self { delays }
    }
}

/// Confirms an accepted session with the election service, sleeping through
/// the backoff schedule between failed attempts.
pub async fn confirm_with_retry(
    election: &dyn LeaderElection,
    session: LeaderSessionId,
    backoff: &ConfirmBackoff,
) -> CoordinationResult<()> {
    let mut delays = backoff.delays.iter();
    loop {
        let error = match election.confirm(session).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let Some(delay) = delays.next() else {
            return Err(error);
        };
        warn!("failed to confirm leader session {session}, retrying: {error}");
        tokio::time::sleep(*delay).await;
    }
}

/// Election for deployments with a single coordinator: leadership is
/// granted immediately with a fresh session id and never revoked.
pub struct StandaloneLeaderElection {
    session: LeaderSessionId,
}

impl StandaloneLeaderElection {
    pub fn new() -> Self {
        Self {
            session: LeaderSessionId::random(),
        }
    }

    pub fn session(&self) -> LeaderSessionId {
        self.session
    }

    pub async fn start(&self, handle: &ActorHandle<CoordinatorActor>) -> CoordinationResult<()> {
        info!("granting standalone leadership with session {}", self.session);
        handle
            .send(CoordinatorEvent::GrantLeadership {
                session: self.session,
            })
            .await
    }
}

impl Default for StandaloneLeaderElection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaderElection for StandaloneLeaderElection {
    async fn confirm(&self, session: LeaderSessionId) -> CoordinationResult<()> {
        info!("confirmed standalone leader session {session}");
        Ok(())
    }

    async fn stop(&self) -> CoordinationResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::CoordinationError;

    /// Confirmation fails a fixed number of times before succeeding.
    struct FlakyElection {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyElection {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LeaderElection for FlakyElection {
        async fn confirm(&self, _session: LeaderSessionId) -> CoordinationResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(CoordinationError::internal("election backend unavailable"))
            } else {
                Ok(())
            }
        }

        async fn stop(&self) -> CoordinationResult<()> {
            Ok(())
        }
    }

    fn fixed_backoff(max_count: usize) -> ConfirmBackoff {
        ConfirmBackoff::from(&config::RetryStrategy::Fixed {
            max_count,
            delay_secs: 0,
        })
    }

    #[test]
    fn test_exponential_backoff_schedule_is_capped() {
        let backoff = ConfirmBackoff::from(&config::RetryStrategy::ExponentialBackoff {
            max_count: 4,
            initial_delay_secs: 1,
            max_delay_secs: 4,
            factor: 2,
        });
        assert_eq!(
            backoff.delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
        assert_eq!(backoff.attempts_after_first(), 4);
    }

    #[tokio::test]
    async fn test_confirm_retries_until_success() {
        let election = FlakyElection::new(2);
        let out = confirm_with_retry(&election, LeaderSessionId::random(), &fixed_backoff(3)).await;
        assert!(out.is_ok());
        assert_eq!(election.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_confirm_gives_up_after_the_schedule() {
        let election = FlakyElection::new(usize::MAX);
        let out = confirm_with_retry(&election, LeaderSessionId::random(), &fixed_backoff(2)).await;
        assert!(out.is_err());
        assert_eq!(election.calls.load(Ordering::SeqCst), 3);
    }
}
