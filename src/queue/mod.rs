pub mod dead_letter;
pub mod job;
pub mod manager;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use job::{ExecutionMode, Job, JobState};
pub use manager::QueueManager;
