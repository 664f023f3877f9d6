//! Stress helpers for connection contexts.
//!
//! These run many short contexts from several threads against one registry
//! and report how the serialization lock behaved.

use pasdb_core::{DbError, Registry};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total contexts attempted.
    pub total_ops: usize,
    /// Contexts entered and finished.
    pub successful_ops: usize,
    /// Contexts that timed out waiting for the lock.
    pub timed_out_ops: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, timed_out: usize, duration: Duration) -> Self {
        Self {
            total_ops: successful + timed_out,
            successful_ops: successful,
            timed_out_ops: timed_out,
            duration,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total contexts: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Timed out: {}", self.timed_out_ops);
        println!("Duration: {:?}", self.duration);
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Contexts entered per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Nested transaction levels opened inside each context.
    pub depth: usize,
    /// Time spent inside each context.
    pub hold: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 50,
            threads: 4,
            depth: 2,
            hold: Duration::from_micros(200),
        }
    }
}

/// Runs nested transactions in short contexts from several threads.
///
/// Each context begins `depth` levels, commits them all and finishes. Lock
/// timeouts are counted; any other error panics.
pub fn stress_concurrent_contexts(registry: &Registry, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let counts: Vec<(usize, usize)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|_| scope.spawn(|| run_contexts(registry, config)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("stress thread panicked"))
            .collect()
    });

    let (successful, timed_out) = counts
        .into_iter()
        .fold((0, 0), |(s, t), (ds, dt)| (s + ds, t + dt));
    StressTestResult::new(successful, timed_out, start.elapsed())
}

fn run_contexts(registry: &Registry, config: &StressConfig) -> (usize, usize) {
    let connection = registry.connection().expect("Failed to get connection");
    let mut successful = 0;
    let mut timed_out = 0;
    for _ in 0..config.operations {
        let context = match connection.enter() {
            Ok(context) => context,
            Err(DbError::LockTimeout { .. }) => {
                timed_out += 1;
                continue;
            }
            Err(err) => panic!("unexpected error entering context: {err}"),
        };
        for _ in 0..config.depth {
            context.begin().expect("begin failed");
        }
        thread::sleep(config.hold);
        for _ in 0..config.depth {
            context.commit().expect("commit failed");
        }
        assert_eq!(context.transaction_depth(), 0);
        context.finish();
        successful += 1;
    }
    (successful, timed_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestRegistry;

    #[test]
    fn test_serialized_contexts_pair_lock_calls() {
        let test = TestRegistry::serialized();
        let config = StressConfig {
            operations: 20,
            ..StressConfig::default()
        };
        let result = stress_concurrent_contexts(&test, &config);
        result.print_summary("Serialized Contexts");

        assert_eq!(result.total_ops, 80);
        assert_eq!(result.timed_out_ops, 0);
        let stats = test.lock_stats();
        assert_eq!(stats.acquired, 80);
        assert_eq!(stats.acquired, stats.released);
    }

    #[test]
    fn test_threaded_contexts_skip_lock() {
        let test = TestRegistry::memory();
        let result = stress_concurrent_contexts(&test, &StressConfig::default());

        assert_eq!(result.successful_ops, 200);
        assert_eq!(test.lock_stats().acquired, 0);
        assert_eq!(test.engine.stats().sessions_opened, 4);
    }
}
