//! Built-in handlers for dynamic jobs.
//!
//! Each submodule exposes one or more handler functions and is registered
//! under its dotted path by [`builtin_registry`].

pub mod add;

use crate::worker::registry::HandlerRegistry;

/// Registry holding every built-in handler.
pub fn builtin_registry() -> HandlerRegistry {
    HandlerRegistry::new().with("jobs.add", "run", add::run)
}
