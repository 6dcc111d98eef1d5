//! Routing strategies for picking a pool.
//!
//! Strategies only ever see pools currently reporting healthy, in registration
//! order:
//! - Least Loaded: fewest busy workers, earliest registration on ties
//! - Round Robin: one shared rotation cursor
//! - Random: uniform choice
//! - Affinity: pools carrying every affinity tag of the task, least loaded
//!   among them, falling back to least loaded over all

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Categorize, ErrorCategory};
use crate::task::Task;

/// Error type for routing decisions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// Zero pools currently report healthy.
    #[error("No healthy pool available")]
    NoHealthyPool,

    /// The strategy name is not recognised.
    #[error("Unknown routing strategy: {0}")]
    UnknownStrategy(String),
}

impl Categorize for RouterError {
    fn category(&self) -> ErrorCategory {
        match self {
            RouterError::NoHealthyPool => ErrorCategory::ResourceExhaustion,
            RouterError::UnknownStrategy(_) => ErrorCategory::Configuration,
        }
    }
}

/// Strategy for routing tasks to pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    #[default]
    LeastLoaded,
    RoundRobin,
    Random,
    Affinity,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::LeastLoaded => "least_loaded",
            RoutingStrategy::RoundRobin => "round_robin",
            RoutingStrategy::Random => "random",
            RoutingStrategy::Affinity => "affinity",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RoutingStrategy {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "least_loaded" => Ok(RoutingStrategy::LeastLoaded),
            "round_robin" => Ok(RoutingStrategy::RoundRobin),
            "random" => Ok(RoutingStrategy::Random),
            "affinity" => Ok(RoutingStrategy::Affinity),
            _ => Err(RouterError::UnknownStrategy(s.to_string())),
        }
    }
}

/// A healthy pool eligible for routing.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub pool_id: String,
    pub busy_workers: usize,
    pub tags: BTreeSet<String>,
}

/// Applies a routing strategy over candidates given in registration order.
#[derive(Debug)]
pub struct Router {
    strategy: RoutingStrategy,
    round_robin_cursor: AtomicUsize,
}

impl Router {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Returns the index of the selected candidate.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::NoHealthyPool` only when `candidates` is empty.
    pub fn select(&self, candidates: &[RouteCandidate], task: &Task) -> Result<usize, RouterError> {
        if candidates.is_empty() {
            return Err(RouterError::NoHealthyPool);
        }

        let index = match self.strategy {
            RoutingStrategy::LeastLoaded => least_loaded(candidates.iter().enumerate()),
            RoutingStrategy::RoundRobin => self.select_round_robin(candidates.len()),
            RoutingStrategy::Random => select_random(candidates.len()),
            RoutingStrategy::Affinity => select_affinity(candidates, task),
        };
        Ok(index)
    }

    /// Advances the cursor atomically; a cursor beyond a shrunken candidate
    /// set is taken modulo the new count.
    fn select_round_robin(&self, len: usize) -> usize {
        let previous = self
            .round_robin_cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cursor| {
                Some((cursor % len + 1) % len)
            })
            .unwrap_or_else(|cursor| cursor);
        previous % len
    }
}

fn least_loaded<'a>(candidates: impl Iterator<Item = (usize, &'a RouteCandidate)>) -> usize {
    // `min_by_key` keeps the last of equal minimums, so the index is part of the key.
    candidates
        .min_by_key(|(index, candidate)| (candidate.busy_workers, *index))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

fn select_random(len: usize) -> usize {
    use rand::RngExt;
    rand::rng().random_range(0..len)
}

fn select_affinity(candidates: &[RouteCandidate], task: &Task) -> usize {
    let matching = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.tags.is_superset(&task.affinity));

    if matching.clone().next().is_some() {
        least_loaded(matching)
    } else {
        least_loaded(candidates.iter().enumerate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(id: &str, busy: usize, tags: &[&str]) -> RouteCandidate {
        RouteCandidate {
            pool_id: id.to_string(),
            busy_workers: busy,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "round_robin".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::RoundRobin
        );
        assert_eq!(
            "Least-Loaded".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::LeastLoaded
        );
        let err = "fastest".parse::<RoutingStrategy>().unwrap_err();
        assert_eq!(err, RouterError::UnknownStrategy("fastest".to_string()));
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_empty_candidates() {
        let router = Router::new(RoutingStrategy::Random);
        let err = router.select(&[], &Task::new(json!({}))).unwrap_err();
        assert_eq!(err, RouterError::NoHealthyPool);
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
    }

    #[test]
    fn test_least_loaded_ties_break_on_registration_order() {
        let router = Router::new(RoutingStrategy::LeastLoaded);
        let task = Task::new(json!({}));

        let candidates = vec![candidate("a", 2, &[]), candidate("b", 1, &[]), candidate("c", 1, &[])];
        assert_eq!(router.select(&candidates, &task).unwrap(), 1);

        let tied = vec![candidate("a", 0, &[]), candidate("b", 0, &[]), candidate("c", 0, &[])];
        assert_eq!(router.select(&tied, &task).unwrap(), 0);
    }

    #[test]
    fn test_round_robin_visits_each_once_in_order() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        let task = Task::new(json!({}));
        let candidates = vec![candidate("a", 0, &[]), candidate("b", 0, &[]), candidate("c", 0, &[])];

        let picks: Vec<usize> = (0..3)
            .map(|_| router.select(&candidates, &task).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2]);
        assert_eq!(router.select(&candidates, &task).unwrap(), 0);
    }

    #[test]
    fn test_round_robin_clamps_when_set_shrinks() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        let task = Task::new(json!({}));
        let four: Vec<RouteCandidate> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| candidate(id, 0, &[]))
            .collect();

        for _ in 0..3 {
            router.select(&four, &task).unwrap();
        }
        // cursor is now 3; with two candidates it continues at 3 % 2
        let two = &four[..2];
        assert_eq!(router.select(two, &task).unwrap(), 1);
        assert_eq!(router.select(two, &task).unwrap(), 0);
        assert_eq!(router.select(two, &task).unwrap(), 1);
    }

    #[test]
    fn test_random_stays_in_range() {
        let router = Router::new(RoutingStrategy::Random);
        let task = Task::new(json!({}));
        let candidates = vec![candidate("a", 0, &[]), candidate("b", 0, &[])];

        let mut seen = [false; 2];
        for _ in 0..200 {
            seen[router.select(&candidates, &task).unwrap()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_affinity_prefers_matching_pools() {
        let router = Router::new(RoutingStrategy::Affinity);
        let candidates = vec![
            candidate("cpu", 0, &["cpu"]),
            candidate("gpu-a", 3, &["gpu", "cuda"]),
            candidate("gpu-b", 1, &["gpu"]),
        ];

        let gpu_task = Task::new(json!({})).with_affinity("gpu");
        assert_eq!(router.select(&candidates, &gpu_task).unwrap(), 2);

        let cuda_task = Task::new(json!({})).with_affinity("gpu").with_affinity("cuda");
        assert_eq!(router.select(&candidates, &cuda_task).unwrap(), 1);

        let tpu_task = Task::new(json!({})).with_affinity("tpu");
        assert_eq!(router.select(&candidates, &tpu_task).unwrap(), 0);
    }
}
