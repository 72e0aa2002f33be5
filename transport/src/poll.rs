//! Waiting on remote conditions.

use std::time::Duration;

use tokio::time::Instant;

use crate::{FacadeResult, TransportError};

/// Interval and deadline for one polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

impl PollConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// One polling loop: call [`Poller::tick`] each time the awaited condition
/// is still false; it sleeps one interval, or fails once the deadline has
/// passed.
#[derive(Debug)]
pub struct Poller {
    what: String,
    interval: Duration,
    deadline: Option<Instant>,
}

impl Poller {
    pub fn new(what: impl Into<String>, config: PollConfig) -> Self {
        Self {
            what: what.into(),
            interval: config.interval,
            deadline: config.timeout.map(|t| Instant::now() + t),
        }
    }

    pub async fn tick(&mut self) -> FacadeResult<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout(format!(
                    "timeout waiting for {}",
                    self.what
                )));
            }
        }
        tokio::time::sleep(self.interval).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_deadline_raises_the_fixed_message() {
        let mut poller = Poller::new("job to finish", PollConfig::with_timeout(Duration::ZERO));
        let err = poller.tick().await.unwrap_err();
        assert_eq!(err.to_string(), "timeout waiting for job to finish");
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn far_deadline_allows_ticks() {
        let config = PollConfig {
            interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(3600)),
        };
        let mut poller = Poller::new("object transfer", config);
        poller.tick().await.unwrap();
        poller.tick().await.unwrap();
    }

    #[tokio::test]
    async fn no_timeout_keeps_ticking() {
        let config = PollConfig {
            interval: Duration::from_millis(1),
            timeout: None,
        };
        let mut poller = Poller::new("anything", config);
        for _ in 0..5 {
            poller.tick().await.unwrap();
        }
    }
}
