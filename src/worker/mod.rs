//! Worker execution engine for running jobs.
//!
//! # Components
//!
//! - [`Worker`]: the poll loop; claims a job, runs it, applies the retry policy
//! - [`JobExecutor`]: runs a job as a shell command or a registered handler
//! - [`HandlerRegistry`]: startup-time map of dynamic job handlers
//! - [`RetryPolicy`]: exponential backoff between attempts
//!
//! # Execution Flow
//!
//! 1. [`Worker::run_once`] claims the oldest pending job (now `processing`)
//! 2. [`JobExecutor::execute`] runs it
//! 3. Success marks it `completed`
//! 4. Failure marks it `failed`; with retries left the worker sleeps the
//!    backoff and requeues it, otherwise it moves to the dead-letter store
//!
//! # Known gaps
//!
//! Dynamic handlers have no timeout. A process that dies mid-execution leaves
//! its job in `processing`; nothing moves it back to `pending` automatically.

pub mod executor;
pub mod registry;
pub mod retry;
pub mod runner;

pub use executor::JobExecutor;
pub use registry::{HandlerRegistry, JobArgs, JobHandler};
pub use retry::RetryPolicy;
pub use runner::{StepOutcome, Worker};
