// Activity Processor Port
// Seam for the external emissions calculation (subprocess or in-process)

use crate::application::ShutdownToken;
use crate::domain::ActivityRecord;
use async_trait::async_trait;
use thiserror::Error;

/// Everything a processor needs to compute one activity
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub batch_id: String,
    pub org_id: String,
    pub workspace_id: String,
    pub activity_id: String,
    /// Batch deadline (epoch ms). The scheduler hard-cancels the call past it.
    pub deadline_millis: i64,
    /// Fires when the scheduler stops
    pub shutdown: ShutdownToken,
}

impl ActivityContext {
    /// Time left until the batch deadline
    pub fn remaining_millis(&self, now_millis: i64) -> i64 {
        (self.deadline_millis - now_millis).max(0)
    }
}

/// Per-activity failure. Recorded on the ActivityRef, never fatal to the batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    #[error("Calculation failed: {0}")]
    Failed(String),

    #[error("Invalid activity input: {0}")]
    InvalidInput(String),

    #[error("Calculation timed out after {0}ms")]
    Timeout(i64),

    #[error("Calculation cancelled by shutdown")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),
}

/// Activity Processor trait
///
/// Implementations:
/// - SubprocessActivityProcessor (infra-system): runs the calculator as a child process
/// - MockActivityProcessor: scripted outcomes for tests
#[async_trait]
pub trait ActivityProcessor: Send + Sync {
    /// Calculate emissions for one activity
    ///
    /// # Errors
    /// - ProcessingError::Timeout if the batch deadline passes
    /// - ProcessingError::Cancelled if `ctx.shutdown` fires
    /// - any other variant for calculation failures
    async fn process(&self, ctx: &ActivityContext) -> Result<ActivityRecord, ProcessingError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Mock processor behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Every activity yields `emissions`
        Succeed { emissions: f64 },
        /// Listed activity IDs fail, the rest yield `emissions`
        FailActivities {
            ids: HashSet<String>,
            emissions: f64,
        },
        /// Sleep, then yield `emissions`
        Delay { millis: u64, emissions: f64 },
        /// Panic with message (panic isolation testing)
        Panic(String),
        /// Never return, ignoring shutdown
        Hang,
        /// Block until shutdown, then report Cancelled
        WaitForShutdown,
    }

    /// Mock Activity Processor for testing
    pub struct MockActivityProcessor {
        behavior: MockBehavior,
        call_count: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockActivityProcessor {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior,
                call_count: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn new_success(emissions: f64) -> Self {
            Self::new(MockBehavior::Succeed { emissions })
        }

        pub fn new_failing<I, S>(ids: I, emissions: f64) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self::new(MockBehavior::FailActivities {
                ids: ids.into_iter().map(Into::into).collect(),
                emissions,
            })
        }

        pub fn new_panic_inducing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Panic(message.into()))
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Highest number of overlapping `process` calls observed
        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ActivityProcessor for MockActivityProcessor {
        async fn process(&self, ctx: &ActivityContext) -> Result<ActivityRecord, ProcessingError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            match &self.behavior {
                MockBehavior::Succeed { emissions } => Ok(ActivityRecord::new(*emissions)),
                MockBehavior::FailActivities { ids, emissions } => {
                    if ids.contains(&ctx.activity_id) {
                        Err(ProcessingError::Failed(format!(
                            "mock failure for {}",
                            ctx.activity_id
                        )))
                    } else {
                        Ok(ActivityRecord::new(*emissions))
                    }
                }
                MockBehavior::Delay { millis, emissions } => {
                    tokio::time::sleep(Duration::from_millis(*millis)).await;
                    Ok(ActivityRecord::new(*emissions))
                }
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg);
                }
                MockBehavior::Hang => {
                    std::future::pending::<()>().await;
                    Err(ProcessingError::Cancelled)
                }
                MockBehavior::WaitForShutdown => {
                    let mut shutdown = ctx.shutdown.clone();
                    shutdown.wait().await;
                    Err(ProcessingError::Cancelled)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::*;
    use super::*;
    use crate::application::shutdown_channel;

    fn ctx(activity_id: &str) -> (crate::application::ShutdownSender, ActivityContext) {
        let (tx, token) = shutdown_channel();
        let ctx = ActivityContext {
            batch_id: "batch_1".to_string(),
            org_id: "org".to_string(),
            workspace_id: "ws".to_string(),
            activity_id: activity_id.to_string(),
            deadline_millis: 10_000,
            shutdown: token,
        };
        (tx, ctx)
    }

    #[tokio::test]
    async fn test_mock_fails_listed_activities() {
        let processor = MockActivityProcessor::new_failing(["act-0"], 2.0);
        let (_tx, failing) = ctx("act-0");
        let (_tx2, passing) = ctx("act-1");

        assert!(matches!(
            processor.process(&failing).await,
            Err(ProcessingError::Failed(_))
        ));
        assert_eq!(processor.process(&passing).await.unwrap().emissions, 2.0);
        assert_eq!(processor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_wait_for_shutdown() {
        let processor = MockActivityProcessor::new(MockBehavior::WaitForShutdown);
        let (tx, ctx) = ctx("act-0");

        let handle = tokio::spawn(async move { processor.process(&ctx).await });
        tx.shutdown();
        assert_eq!(handle.await.unwrap(), Err(ProcessingError::Cancelled));
    }

    #[test]
    fn test_remaining_millis_saturates() {
        let (_tx, ctx) = ctx("act-0");
        assert_eq!(ctx.remaining_millis(4_000), 6_000);
        assert_eq!(ctx.remaining_millis(20_000), 0);
    }
}
