//! Restart bookkeeping for crashed plugins, kept per executable.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
    /// Delay before the first restart; zero restarts immediately.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// A plugin that stayed registered this long gets a clean slate.
    pub restart_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            restart_window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct RestartState {
    count: u32,
    backoff: Duration,
    registered_at: Option<Instant>,
}

#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    states: DashMap<PathBuf, RestartState>,
    generations: DashMap<PathBuf, u64>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            states: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    fn fresh(&self) -> RestartState {
        RestartState {
            count: 0,
            backoff: self.policy.initial_backoff,
            registered_at: None,
        }
    }

    /// A plugin built from `exe` finished registration.
    pub fn on_registered(&self, exe: &Path) {
        let mut state = self
            .states
            .entry(exe.to_path_buf())
            .or_insert_with(|| self.fresh());
        state.registered_at = Some(Instant::now());
    }

    /// A registered plugin built from `exe` crashed. Returns the delay before
    /// the next attempt, or `None` once the restart budget is spent.
    pub fn on_crash(&self, exe: &Path) -> Option<Duration> {
        let mut state = self
            .states
            .entry(exe.to_path_buf())
            .or_insert_with(|| self.fresh());

        let stable = state
            .registered_at
            .is_some_and(|at| at.elapsed() >= self.policy.restart_window);
        if stable {
            *state = self.fresh();
        }
        // a run of failed respawns counts against one budget
        state.registered_at = None;

        state.count += 1;
        if self.policy.max_restarts.is_some_and(|max| state.count > max) {
            return None;
        }

        let delay = state.backoff;
        state.backoff = Duration::from_secs_f64(
            (state.backoff.as_secs_f64() * self.policy.backoff_multiplier)
                .min(self.policy.max_backoff.as_secs_f64()),
        );
        Some(delay)
    }

    /// Forget `exe`, e.g. after its file was removed. Bumps its generation
    /// so pending restart loops give up.
    pub fn forget(&self, exe: &Path) {
        self.states.remove(exe);
        *self.generations.entry(exe.to_path_buf()).or_insert(0) += 1;
    }

    pub fn generation(&self, exe: &Path) -> u64 {
        self.generations.get(exe).map_or(0, |g| *g)
    }

    pub fn restart_count(&self, exe: &Path) -> u32 {
        self.states.get(exe).map_or(0, |s| s.count)
    }
}
