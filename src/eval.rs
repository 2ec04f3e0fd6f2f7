use log::debug;
use serde::Serialize;

use crate::bucket::{bucket, percentage_includes};
use crate::context::EvaluationContext;
use crate::flag::{FlagDefinition, RolloutStrategy};
use crate::segment::Segment;
use crate::store::Store;

/// Evaluate a flag definition for the given [EvaluationContext].
///
/// Evaluation has no side effects of its own and never fails: anything that prevents a decision
/// produces a disabled result with a [Reason::Error]. The session identifier is only read for
/// percentage rollouts.
pub fn evaluate(flag: &FlagDefinition, context: &EvaluationContext) -> Detail {
    match flag.rollout_strategy {
        RolloutStrategy::Off => Detail::new(false, Reason::Off),
        RolloutStrategy::On => Detail::new(true, Reason::On),
        RolloutStrategy::Percentage => {
            let id = context.session_identifier();
            Detail::new(
                percentage_includes(id, flag.rollout_percentage),
                Reason::Percentage { bucket: bucket(id) },
            )
        }
        RolloutStrategy::Segment => {
            let segment = context.active_segment();
            if segment.is_wildcard() || flag.allowed_segments.contains(&segment) {
                Detail::new(true, Reason::SegmentMatch { segment })
            } else {
                Detail::new(false, Reason::SegmentMismatch { segment })
            }
        }
        RolloutStrategy::Unrecognized => {
            debug!("flag {} has an unrecognized rollout strategy", flag.name);
            Detail::err(Error::MalformedFlag)
        }
    }
}

/// Look up `flag_name` in the store and evaluate it. A name the store does not know evaluates to
/// disabled with [Error::FlagNotFound].
pub fn evaluate_flag(store: &dyn Store, flag_name: &str, context: &EvaluationContext) -> Detail {
    match store.flag(flag_name) {
        Some(flag) => evaluate(flag, context),
        None => {
            debug!("unknown flag {} evaluated as disabled", flag_name);
            Detail::err(Error::FlagNotFound)
        }
    }
}

/// Returns true if the named flag is enabled for the context.
pub fn is_enabled(store: &dyn Store, flag_name: &str, context: &EvaluationContext) -> bool {
    evaluate_flag(store, flag_name, context).value
}

/// The result of a flag evaluation together with an explanation of how it was reached.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detail {
    /// Whether the flag is enabled.
    pub value: bool,
    /// The main factor that influenced the result.
    pub reason: Reason,
}

impl Detail {
    pub fn new(value: bool, reason: Reason) -> Self {
        Detail { value, reason }
    }

    /// Returns a disabled detail carrying `error` as its reason.
    pub fn err(error: Error) -> Self {
        Detail::new(false, Reason::Error { error })
    }
}

/// Reason describes why an evaluation produced its value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The flag's strategy is off.
    Off,
    /// The flag's strategy is on.
    On,
    /// The flag uses a percentage rollout and the session landed in `bucket`.
    Percentage {
        /// The session's bucket in `[0, 1]`.
        bucket: f64,
    },
    /// The active segment is the wildcard or one of the flag's allowed segments.
    SegmentMatch { segment: Segment },
    /// The active segment is not among the flag's allowed segments.
    SegmentMismatch { segment: Segment },
    /// The flag could not be evaluated.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

/// Error is returned via a [Reason::Error] when a flag could not be evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// No flag with the requested name exists.
    FlagNotFound,
    /// The flag's stored data could not be interpreted, e.g. its strategy is unknown.
    MalformedFlag,
}
