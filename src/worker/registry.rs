//! Startup-time registry of dynamic job handlers.
//!
//! A dynamic job's command is a dotted reference such as `jobs.add.run`: the
//! part before the last `.` names a target (`jobs.add`) and the part after it
//! names a callable on that target (`run`). Handlers are registered once when
//! the process starts and the registry is read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::DispatchError;

/// Arguments passed to a handler: the job payload, keyed by parameter name.
pub type JobArgs = Map<String, Value>;

pub trait JobHandler: Send + Sync {
    fn call(&self, args: &JobArgs) -> Result<Value, DispatchError>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobArgs) -> Result<Value, DispatchError> + Send + Sync,
{
    fn call(&self, args: &JobArgs) -> Result<Value, DispatchError> {
        self(args)
    }
}

/// Split `target.callable` at the last separator.
pub fn split_reference(command: &str) -> Result<(&str, &str), DispatchError> {
    match command.trim().rsplit_once('.') {
        Some((target, callable)) if !target.is_empty() && !callable.is_empty() => {
            Ok((target, callable))
        }
        _ => Err(DispatchError::InvalidFormat(command.to_string())),
    }
}

/// Fetch and decode a named argument.
pub fn arg<T: DeserializeOwned>(args: &JobArgs, name: &str) -> Result<T, DispatchError> {
    let value = args
        .get(name)
        .ok_or_else(|| DispatchError::InvalidPayload(format!("missing argument {name:?}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| DispatchError::InvalidPayload(format!("argument {name:?}: {e}")))
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    targets: HashMap<String, HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as `<target>.<callable>`, replacing any previous one.
    pub fn register<H>(&mut self, target: &str, callable: &str, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.targets
            .entry(target.to_string())
            .or_default()
            .insert(callable.to_string(), Arc::new(handler));
        self
    }

    pub fn with<H>(mut self, target: &str, callable: &str, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(target, callable, handler);
        self
    }

    /// Look up the handler a dynamic command refers to.
    pub fn resolve(&self, command: &str) -> Result<Arc<dyn JobHandler>, DispatchError> {
        let (target, callable) = split_reference(command)?;
        let functions = self
            .targets
            .get(target)
            .ok_or_else(|| DispatchError::TargetNotFound(target.to_string()))?;
        functions
            .get(callable)
            .cloned()
            .ok_or_else(|| DispatchError::TargetNotFound(format!("{target}.{callable}")))
    }

    /// Registered references, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .targets
            .iter()
            .flat_map(|(target, functions)| {
                functions
                    .keys()
                    .map(move |callable| format!("{target}.{callable}"))
            })
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
