use serde_json::{Number, Value};

use crate::error::DispatchError;
use crate::worker::registry::{arg, JobArgs};

/// `jobs.add.run`: sum the numeric arguments `a` and `b`.
///
/// Integers stay integers; any float operand makes the result a float.
pub fn run(args: &JobArgs) -> Result<Value, DispatchError> {
    let a: Number = arg(args, "a")?;
    let b: Number = arg(args, "b")?;

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| DispatchError::Handler(format!("{a} + {b} overflows")));
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Number::from_f64(a + b)
            .map(Value::Number)
            .ok_or_else(|| DispatchError::Handler(format!("{a} + {b} is not finite"))),
        _ => Err(DispatchError::InvalidPayload(
            "a and b must be numbers".to_string(),
        )),
    }
}
