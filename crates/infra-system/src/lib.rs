// CarbonBatch Infrastructure - System Adapters
// Implements: ActivityProcessor (external calculator as a child process)

pub mod subprocess_processor;

pub use subprocess_processor::{SubprocessActivityProcessor, SubprocessConfig};
