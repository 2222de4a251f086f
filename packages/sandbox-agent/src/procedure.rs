//! The closed set of procedure shapes a worker can evaluate.
//!
//! The dispatcher and pool never look inside a procedure blob — only the
//! worker's own deserializer does. `Procedure` is that deserializer's
//! target: a small enum covering the behaviors end-to-end tests exercise
//! (pure return, raised error, sleep/timeout, and an awaitable wrapper that
//! exercises the coroutine-style calling contract).

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Procedure {
    /// Returns `value` unchanged.
    Return { value: Vec<u8> },
    /// Doubles the little-endian i64 encoded in `value`. Exists so scenario
    /// 1 (`x*2`) has a concrete, typed procedure to drive.
    DoubleInt { value: i64 },
    /// Raises with the given kind/message, mirroring `raise ValueError(...)`.
    Raise { kind: String, message: String },
    /// Sleeps for the given duration before returning `value`, used to drive
    /// the timeout scenario (§8 scenario 4).
    Sleep { millis: u64, value: Vec<u8> },
    /// An awaitable wrapper around another procedure: evaluating it yields a
    /// future that the worker must run to completion before replying
    /// (Design Notes: "model this by requiring the worker-side runtime to
    /// expose a run-to-completion primitive").
    Awaitable { inner: Box<Procedure> },
    /// Exits the worker process immediately, before any reply is framed.
    /// Used to drive §8 scenario 5 (worker killed mid-RPC) deterministically
    /// in an integration test, in place of an external signal race.
    Crash,
}

/// Outcome of evaluating a [`Procedure`]: either the opaque result bytes, or
/// a user-level failure (kind/message/trace) the worker reports verbatim.
pub enum Outcome {
    Value(Vec<u8>),
    Raised {
        kind: String,
        message: String,
        trace: String,
    },
}

/// Evaluates `procedure` to completion, awaiting any nested `Awaitable`
/// (§4.1: "if the evaluated value is a coroutine/future-like object, the
/// worker drives it to completion before serializing the result").
pub async fn evaluate(procedure: Procedure) -> Outcome {
    match procedure {
        Procedure::Return { value } => Outcome::Value(value),
        Procedure::DoubleInt { value } => {
            let doubled = value.wrapping_mul(2);
            Outcome::Value(doubled.to_le_bytes().to_vec())
        }
        Procedure::Raise { kind, message } => Outcome::Raised {
            trace: format!("{kind}: {message}"),
            kind,
            message,
        },
        Procedure::Sleep { millis, value } => {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Outcome::Value(value)
        }
        Procedure::Awaitable { inner } => {
            // `evaluate` is itself async, so recursing into it already is
            // the run-to-completion primitive the coroutine contract asks
            // for; box the recursive future to keep this function's size
            // finite under the `Awaitable { inner: Awaitable { .. } }` case.
            Box::pin(evaluate(*inner)).await
        }
        Procedure::Crash => std::process::exit(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn double_int_doubles() {
        let outcome = evaluate(Procedure::DoubleInt { value: 21 }).await;
        match outcome {
            Outcome::Value(bytes) => assert_eq!(i64::from_le_bytes(bytes.try_into().unwrap()), 42),
            Outcome::Raised { .. } => panic!("expected a value"),
        }
    }

    #[tokio::test]
    async fn raise_reports_kind_and_message() {
        let outcome = evaluate(Procedure::Raise {
            kind: "ValueError".to_string(),
            message: "bad".to_string(),
        })
        .await;
        match outcome {
            Outcome::Raised { kind, message, .. } => {
                assert_eq!(kind, "ValueError");
                assert!(message.contains("bad"));
            }
            Outcome::Value(_) => panic!("expected a raise"),
        }
    }

    #[tokio::test]
    async fn awaitable_drives_inner_to_completion() {
        let outcome = evaluate(Procedure::Awaitable {
            inner: Box::new(Procedure::DoubleInt { value: 10 }),
        })
        .await;
        match outcome {
            Outcome::Value(bytes) => assert_eq!(i64::from_le_bytes(bytes.try_into().unwrap()), 20),
            Outcome::Raised { .. } => panic!("expected a value"),
        }
    }
}
