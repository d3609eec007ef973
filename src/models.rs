use chrono::{DateTime, Utc};
use std::net::IpAddr;

/// Per-cycle outcome classification for one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Up,
    Slow,
    Down,
}

/// Outcome of a single probe invocation.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub message: String,
}

impl ProbeResult {
    pub fn success(latency_ms: f64, message: impl Into<String>) -> Self {
        Self {
            ok: true,
            latency_ms: Some(latency_ms),
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency_ms: None,
            message: message.into(),
        }
    }
}

/// Rolling state for one configured test; mutated only via
/// [`TestState::apply`].
#[derive(Debug, Clone)]
pub struct TestState {
    history: Vec<Option<Status>>,
    write_index: usize,
    merged_cycle: Option<u64>,
    pub latency_ms: Option<f64>,
    pub last_up: Option<DateTime<Utc>>,
    pub message: String,
}

impl TestState {
    /// `capacity` is the history length; the config layer guarantees it is
    /// non-zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            history: vec![None; capacity],
            write_index: 0,
            merged_cycle: None,
            latency_ms: None,
            last_up: None,
            message: String::new(),
        }
    }

    /// `Down` on failure, `Up` below the slow threshold, `Slow` at or
    /// above it; a success without a measured latency counts as 0 ms.
    pub fn classify(result: &ProbeResult, slow_threshold_ms: f64) -> Status {
        if !result.ok {
            return Status::Down;
        }
        if result.latency_ms.unwrap_or(0.0) < slow_threshold_ms {
            Status::Up
        } else {
            Status::Slow
        }
    }

    /// Merge one probe result tagged with its dispatch cycle. Returns the
    /// written status, or `None` if the result was stale and discarded.
    pub fn apply(&mut self, cycle: u64, result: &ProbeResult, slow_threshold_ms: f64) -> Option<Status> {
        if let Some(merged) = self.merged_cycle {
            if cycle < merged {
                return None;
            }
        }
        let status = Self::classify(result, slow_threshold_ms);
        self.history[self.write_index] = Some(status);
        self.write_index = (self.write_index + 1) % self.history.len();
        self.latency_ms = if result.ok {
            Some(result.latency_ms.unwrap_or(0.0))
        } else {
            None
        };
        if result.ok {
            self.last_up = Some(Utc::now());
        }
        self.message = result.message.clone();
        self.merged_cycle = Some(cycle);
        Some(status)
    }

    /// Status written by the most recent merge, if any.
    pub fn current_status(&self) -> Option<Status> {
        let capacity = self.history.len();
        self.history[(self.write_index + capacity - 1) % capacity]
    }

    /// History resolved oldest to newest; unwritten slots are `None`.
    pub fn ordered_history(&self) -> Vec<Option<Status>> {
        let capacity = self.history.len();
        (0..capacity)
            .map(|i| self.history[(self.write_index + i) % capacity])
            .collect()
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn merged_cycle(&self) -> Option<u64> {
        self.merged_cycle
    }

    pub fn capacity(&self) -> usize {
        self.history.len()
    }
}

/// Immutable whole-system view published once per cycle for the renderer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub cycle: u64,
    pub hosts: Vec<HostView>,
}

#[derive(Debug, Clone)]
pub struct HostView {
    pub addr: IpAddr,
    pub description: String,
    pub tests: Vec<TestView>,
}

#[derive(Debug, Clone)]
pub struct TestView {
    pub label: String,
    pub status: Option<Status>,
    pub latency_ms: Option<f64>,
    pub history: Vec<Option<Status>>,
    pub last_up: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f64 = 200.0;

    #[test]
    fn classify_down_on_failure() {
        let result = ProbeResult::failure("timeout");
        assert_eq!(TestState::classify(&result, THRESHOLD), Status::Down);
    }

    #[test]
    fn classify_up_below_threshold() {
        let result = ProbeResult::success(50.0, "ok");
        assert_eq!(TestState::classify(&result, THRESHOLD), Status::Up);
    }

    #[test]
    fn classify_slow_at_and_above_threshold() {
        let at = ProbeResult::success(200.0, "ok");
        let above = ProbeResult::success(350.0, "ok");
        assert_eq!(TestState::classify(&at, THRESHOLD), Status::Slow);
        assert_eq!(TestState::classify(&above, THRESHOLD), Status::Slow);
    }

    #[test]
    fn classify_success_without_latency_is_up() {
        let result = ProbeResult {
            ok: true,
            latency_ms: None,
            message: String::new(),
        };
        assert_eq!(TestState::classify(&result, THRESHOLD), Status::Up);
    }

    #[test]
    fn failure_then_success_updates_slots_in_order() {
        // First probe times out, second succeeds at 50ms.
        let mut state = TestState::new(35);

        assert_eq!(
            state.apply(1, &ProbeResult::failure("timeout"), THRESHOLD),
            Some(Status::Down)
        );
        assert_eq!(state.ordered_history()[34], Some(Status::Down));
        assert_eq!(state.latency_ms, None);
        assert!(state.last_up.is_none());

        assert_eq!(
            state.apply(2, &ProbeResult::success(50.0, "ok"), THRESHOLD),
            Some(Status::Up)
        );
        let history = state.ordered_history();
        assert_eq!(history[33], Some(Status::Down));
        assert_eq!(history[34], Some(Status::Up));
        assert_eq!(state.latency_ms, Some(50.0));
        assert!(state.last_up.is_some());
    }

    #[test]
    fn failure_retains_previous_last_up() {
        let mut state = TestState::new(5);
        state.apply(1, &ProbeResult::success(10.0, "ok"), THRESHOLD);
        let seen = state.last_up;
        assert!(seen.is_some());

        state.apply(2, &ProbeResult::failure("refused"), THRESHOLD);
        assert_eq!(state.current_status(), Some(Status::Down));
        assert_eq!(state.last_up, seen);
        assert_eq!(state.latency_ms, None);
    }

    #[test]
    fn write_index_stays_in_bounds_and_wraps() {
        let mut state = TestState::new(5);
        assert_eq!(state.write_index(), 0);
        for cycle in 1..=5 {
            state.apply(cycle, &ProbeResult::success(1.0, "ok"), THRESHOLD);
            assert!(state.write_index() < state.capacity());
        }
        // After exactly `capacity` merges the index is back at its start.
        assert_eq!(state.write_index(), 0);
        assert!(state.ordered_history().iter().all(|slot| slot.is_some()));
    }

    #[test]
    fn history_keeps_only_most_recent_capacity_cycles() {
        // Capacity 5, seven cycles: slots hold cycles 3..=7, oldest first.
        let mut state = TestState::new(5);
        for cycle in 1..=7u64 {
            let result = if cycle % 2 == 0 {
                ProbeResult::failure("refused")
            } else {
                ProbeResult::success(1.0, "ok")
            };
            state.apply(cycle, &result, THRESHOLD);
        }
        let expected: Vec<Option<Status>> = (3..=7u64)
            .map(|cycle| {
                Some(if cycle % 2 == 0 {
                    Status::Down
                } else {
                    Status::Up
                })
            })
            .collect();
        assert_eq!(state.ordered_history(), expected);
        assert_eq!(state.write_index(), 7 % 5);
    }

    #[test]
    fn stale_cycle_result_is_discarded() {
        // Results for cycles 4 and 3 arrive out of order.
        let mut state = TestState::new(5);
        state.apply(4, &ProbeResult::success(20.0, "ok"), THRESHOLD);
        let index_after = state.write_index();

        assert_eq!(state.apply(3, &ProbeResult::failure("late"), THRESHOLD), None);
        assert_eq!(state.write_index(), index_after);
        assert_eq!(state.current_status(), Some(Status::Up));
        assert_eq!(state.latency_ms, Some(20.0));
        assert_eq!(state.merged_cycle(), Some(4));
    }

    #[test]
    fn late_result_merges_when_no_newer_one_exists() {
        // A probe that overran its cycle still counts if nothing fresher
        // has been merged for the test.
        let mut state = TestState::new(5);
        state.apply(2, &ProbeResult::failure("timeout"), THRESHOLD);
        assert_eq!(
            state.apply(2, &ProbeResult::success(5.0, "ok"), THRESHOLD),
            Some(Status::Up)
        );
    }
}
