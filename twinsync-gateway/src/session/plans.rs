use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use twinsync_core::UserId;

/// One user's live subscription: the submitted plan plus the lease
/// timestamp heartbeats refresh.
pub(crate) struct UserPlanState<P> {
    pub plan: P,
    pub last_seen: Instant,
}

/// Per-session book of user plans with lease semantics.
///
/// Every mutation path of the session (apply, touch, remove, reap) goes
/// through here under the session's plan mutex; the caller re-derives
/// the union and the `publish_allowed` gate afterwards.
pub(crate) struct PlanBook<P> {
    entries: HashMap<UserId, UserPlanState<P>>,
    lease: Duration,
}

impl<P> PlanBook<P> {
    pub fn new(lease: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            lease,
        }
    }

    /// Insert or replace a user's plan; refreshes the lease either way.
    pub fn apply(&mut self, user: &str, plan: P) {
        self.entries.insert(
            user.to_string(),
            UserPlanState {
                plan,
                last_seen: Instant::now(),
            },
        );
    }

    /// Heartbeat. Returns false for an unknown user.
    pub fn touch(&mut self, user: &str) -> bool {
        match self.entries.get_mut(user) {
            Some(state) => {
                state.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Explicit leave. Returns true if the user existed.
    pub fn remove(&mut self, user: &str) -> bool {
        self.entries.remove(user).is_some()
    }

    /// Drop every entry whose lease has lapsed; returns the evicted
    /// user ids so the caller can log and re-derive state.
    pub fn reap(&mut self) -> Vec<UserId> {
        let lease = self.lease;
        let now = Instant::now();
        let expired: Vec<UserId> = self
            .entries
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_seen) > lease)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            self.entries.remove(user);
        }
        expired
    }

    pub fn has_users(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn plans(&self) -> impl Iterator<Item = &P> + Clone {
        self.entries.values().map(|state| &state.plan)
    }
}
