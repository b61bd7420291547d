// ID Provider Port (for deterministic testing)

use rand::RngCore;

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    /// Generate a new unique batch ID
    fn generate_batch_id(&self) -> String;
}

/// `batch_` followed by 16 random hex digits (production)
pub struct RandomBatchIdProvider;

impl IdProvider for RandomBatchIdProvider {
    fn generate_batch_id(&self) -> String {
        generate_batch_id()
    }
}

pub fn generate_batch_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("batch_{}", hex)
}

/// Scheduler instance name: short uuid prefix, unique per process
pub fn generate_instance_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("sched-{}", &id[..8])
}

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// `batch_seq_1`, `batch_seq_2`, ...
    pub struct SequentialIdProvider {
        next: AtomicU64,
    }

    impl SequentialIdProvider {
        pub fn new() -> Self {
            Self {
                next: AtomicU64::new(1),
            }
        }
    }

    impl Default for SequentialIdProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    impl IdProvider for SequentialIdProvider {
        fn generate_batch_id(&self) -> String {
            format!("batch_seq_{}", self.next.fetch_add(1, Ordering::SeqCst))
        }
    }
}
