pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;
