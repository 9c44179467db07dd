//! Concurrency ceiling for provisioning.
//!
//! The ceiling is soft: the count and the launch that follows are not atomic,
//! so two requests racing past a count of `ceiling - 1` can both be admitted.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::database::ports::JobRepository;

pub const DEFAULT_MAX_CONCURRENT_JOBS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveJobCount {
    Known(u64),
    /// The store could not be asked.
    Unknown,
}

/// What to do when the active count is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownCountPolicy {
    #[default]
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed,
    Denied { active: Option<u64>, ceiling: u64 },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed)
    }
}

/// Pure admission rule: deny once `active >= ceiling`.
pub fn decide(
    count: ActiveJobCount,
    ceiling: u64,
    policy: UnknownCountPolicy,
) -> AdmissionDecision {
    match (count, policy) {
        (ActiveJobCount::Known(active), _) if active < ceiling => AdmissionDecision::Allowed,
        (ActiveJobCount::Known(active), _) => AdmissionDecision::Denied {
            active: Some(active),
            ceiling,
        },
        (ActiveJobCount::Unknown, UnknownCountPolicy::FailOpen) => AdmissionDecision::Allowed,
        (ActiveJobCount::Unknown, UnknownCountPolicy::FailClosed) => {
            AdmissionDecision::Denied {
                active: None,
                ceiling,
            }
        }
    }
}

pub struct AdmissionController {
    repository: Arc<dyn JobRepository>,
    ceiling: u64,
    unknown_policy: UnknownCountPolicy,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("ceiling", &self.ceiling)
            .field("unknown_policy", &self.unknown_policy)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(repository: Arc<dyn JobRepository>, ceiling: u64) -> Self {
        Self {
            repository,
            ceiling,
            unknown_policy: UnknownCountPolicy::default(),
        }
    }

    pub fn with_unknown_policy(mut self, policy: UnknownCountPolicy) -> Self {
        self.unknown_policy = policy;
        self
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub async fn active_count(&self) -> ActiveJobCount {
        match self.repository.count_active().await {
            Ok(count) => ActiveJobCount::Known(count),
            Err(e) => {
                warn!(error = %e, "could not count active jobs");
                ActiveJobCount::Unknown
            }
        }
    }

    /// Admission for a job that has no record yet.
    pub async fn try_admit(&self) -> AdmissionDecision {
        let count = self.active_count().await;
        self.log_decision(count, decide(count, self.ceiling, self.unknown_policy))
    }

    /// Admission for a job whose own `provisioning` record is already part of
    /// the active count.
    pub async fn try_admit_recorded(&self) -> AdmissionDecision {
        let count = match self.active_count().await {
            ActiveJobCount::Known(n) => ActiveJobCount::Known(n.saturating_sub(1)),
            unknown => unknown,
        };
        self.log_decision(count, decide(count, self.ceiling, self.unknown_policy))
    }

    fn log_decision(&self, count: ActiveJobCount, decision: AdmissionDecision) -> AdmissionDecision {
        match decision {
            AdmissionDecision::Allowed => {
                debug!(?count, ceiling = self.ceiling, "admission allowed");
            }
            AdmissionDecision::Denied { active, ceiling } => {
                warn!(?active, ceiling, "admission denied, capacity limit reached");
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryJobRepository;
    use crate::job::tests::sample_job;

    #[test]
    fn denies_at_ceiling() {
        let policy = UnknownCountPolicy::FailOpen;
        assert!(decide(ActiveJobCount::Known(0), 3, policy).is_allowed());
        assert!(decide(ActiveJobCount::Known(2), 3, policy).is_allowed());
        assert_eq!(
            decide(ActiveJobCount::Known(3), 3, policy),
            AdmissionDecision::Denied {
                active: Some(3),
                ceiling: 3
            }
        );
        assert!(!decide(ActiveJobCount::Known(0), 0, policy).is_allowed());
    }

    #[test]
    fn unknown_count_follows_policy() {
        assert!(decide(ActiveJobCount::Unknown, 3, UnknownCountPolicy::FailOpen).is_allowed());
        assert_eq!(
            decide(ActiveJobCount::Unknown, 3, UnknownCountPolicy::FailClosed),
            AdmissionDecision::Denied {
                active: None,
                ceiling: 3
            }
        );
    }

    #[tokio::test]
    async fn next_job_denied_while_ceiling_active() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let controller = AdmissionController::new(repo.clone(), 2);

        for _ in 0..2 {
            assert!(controller.try_admit().await.is_allowed());
            repo.create(&sample_job()).await.unwrap();
        }
        assert!(!controller.try_admit().await.is_allowed());

        // A third recorded job sees two others active.
        repo.create(&sample_job()).await.unwrap();
        assert!(!controller.try_admit_recorded().await.is_allowed());
    }

    #[tokio::test]
    async fn recorded_job_does_not_count_against_itself() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let controller = AdmissionController::new(repo.clone(), 1);
        repo.create(&sample_job()).await.unwrap();

        assert!(controller.try_admit_recorded().await.is_allowed());
        assert!(!controller.try_admit().await.is_allowed());
    }

    #[tokio::test]
    async fn store_failure_fails_open_by_default() {
        let repo = Arc::new(InMemoryJobRepository::new());
        repo.set_count_unavailable(true);

        let open = AdmissionController::new(repo.clone(), 1);
        assert!(open.try_admit().await.is_allowed());

        let closed = AdmissionController::new(repo, 1)
            .with_unknown_policy(UnknownCountPolicy::FailClosed);
        assert!(!closed.try_admit().await.is_allowed());
    }
}
