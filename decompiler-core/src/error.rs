//! Error kinds for the pipeline (§7).
//!
//! Per-function, per-instruction, and fixpoint-ceiling conditions are
//! ordinary values propagated with `?`; only an internal-consistency
//! violation is fatal, and those are represented as assertions rather than
//! as `DecompilerError` variants, matching the teacher's split between
//! `InterpreterError` (recoverable) and `unreachable!`/`debug_assert!`
//! (programmer error).

use thiserror::Error;

use crate::callee::CalleeId;

/// Top-level error surfaced by the orchestrator (§7).
#[derive(Debug, Error)]
pub enum DecompilerError {
    /// A cooperative cancellation token was raised; the orchestrator
    /// unwound and reports this rather than a partial result.
    #[error("decompilation canceled")]
    Canceled,

    /// Signature analysis did not reach a fixpoint within the configured
    /// iteration ceiling. The latest available signatures are still usable;
    /// this is reported as a warning-level error to the caller, not a hard
    /// failure of the whole run.
    #[error("signature analysis did not converge after {iterations} iterations")]
    SignatureFixpointExceeded { iterations: u32 },
}

/// Raised when the lifter cannot produce IR for a decoded instruction (§7).
/// Per-instruction: the orchestrator substitutes an inline-assembly
/// statement and continues.
#[derive(Debug, Error)]
#[error("cannot lift instruction at {address:#x}: {reason}")]
pub struct LiftError {
    pub address: decompiler_types::Address,
    pub reason: String,
}

/// A per-callee referrer the signature analyzer could not resolve cleanly;
/// logged as a warning and skipped rather than aborting the pass.
#[derive(Debug, Error)]
#[error("ambiguous argument evidence for callee {callee:?}")]
pub struct AmbiguousSignatureError {
    pub callee: CalleeId,
}
