//! Shared test utilities for the work-queue crates
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestNames`: deterministic, collision-free stream and consumer names
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestNames, TestNats};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_jetstream_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestNames::from_test_name("my_jetstream_test");
//!     let stream = names.stream("jobs");
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Name generator for streams and consumers.
///
/// JetStream names may not contain `.`, `*`, `>` or whitespace, so names are
/// built from the prefix and a seed derived from the test name.
pub struct TestNames {
    seed: u64,
}

impl TestNames {
    /// Create a generator with an explicit seed
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from the test name, so reruns produce the same names
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Stream name, e.g. `JOBS_1234`
    pub fn stream(&self, prefix: &str) -> String {
        format!("{}_{}", prefix.to_uppercase(), self.seed % 100_000)
    }

    /// Durable consumer name, e.g. `worker-1234`
    pub fn consumer(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.seed % 100_000)
    }

    /// Subject under a per-test root, e.g. `t1234.jobs.info`
    pub fn subject(&self, suffix: &str) -> String {
        format!("t{}.{}", self.seed % 100_000, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        let a = TestNames::from_test_name("drain");
        let b = TestNames::from_test_name("drain");
        assert_eq!(a.stream("jobs"), b.stream("jobs"));
        assert_eq!(a.consumer("worker"), b.consumer("worker"));
    }

    #[test]
    fn test_names_are_valid_jetstream_names() {
        let names = TestNames::new(42);
        assert_eq!(names.stream("jobs"), "JOBS_42");
        assert_eq!(names.consumer("worker"), "worker-42");
        assert_eq!(names.subject("jobs.info"), "t42.jobs.info");
        assert!(!names.stream("jobs").contains(['.', '*', '>', ' ']));
    }
}
