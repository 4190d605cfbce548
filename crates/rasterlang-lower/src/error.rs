//! User-facing diagnostics from the lowering passes.
//!
//! Every variant names the function (and where useful the stage or
//! directive) at fault. Internal invariant violations panic instead; see
//! the error-handling notes in DESIGN.md.

use thiserror::Error;

use rasterlang_core::error::CoreError;
use rasterlang_analysis::order::OrderError;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Order(#[from] OrderError),

    /// An output function must be computed and stored at the root.
    #[error("function '{func}' is an output, so must be scheduled compute_root")]
    OutputNotRoot { func: String },

    /// compute_at / store_at names a loop that is not among the legal
    /// use-sites collected from the outer IR.
    #[error("function '{func}' has an invalid compute/store location: {reason}")]
    InvalidComputeSite { func: String, reason: String },

    /// The relative order of reduction variables in a dim list changed.
    #[error(
        "function '{func}' stage {stage}: reduction variable '{var}' reordered; \
         reduction dimensions must keep their domain order"
    )]
    ReorderedReductionVariable { func: String, stage: usize, var: String },

    /// A specialization with a failure message must come last.
    #[error("function '{func}': {reason}")]
    IllegalSpecialization { func: String, reason: String },

    /// compute_with between incompatible stages.
    #[error("invalid compute_with on '{func}': {reason}")]
    InvalidComputeWith { func: String, reason: String },

    /// An extern stage consumes a function scheduled inline.
    #[error(
        "function '{input}' cannot be scheduled inline because it is consumed \
         by the extern stage '{func}'"
    )]
    ExternWithInlinedInput { func: String, input: String },

    /// An extern stage's dim list mixes loop types illegally.
    #[error("extern function '{func}': {reason}")]
    IllegalExternLoops { func: String, reason: String },

    /// A schedule requests a device the target does not support.
    #[error("function '{func}' requires device api {api} which target '{target}' lacks")]
    UnsupportedDeviceApi { func: String, api: String, target: String },

    /// Bounds inference could not bound a required region.
    #[error("buffer '{name}' may be accessed in an unbounded way in dimension {dim}")]
    UnboundedAccess { name: String, dim: usize },

    /// Vectorized loops need a constant extent greater than one.
    #[error(
        "loop over '{loop_name}' has extent {extent}; can only vectorize loops \
         over a constant extent > 1"
    )]
    NonConstantVectorizedExtent { loop_name: String, extent: String },

    /// An explicit fold directive that cannot be honored.
    #[error("dimension '{dim}' of '{func}' cannot be folded: {reason}")]
    BadFoldDirective { func: String, dim: String, reason: String },

    /// Min/extent constraints on output buffers beyond the first are
    /// implicit and must not be given explicitly.
    #[error(
        "cannot constrain the min or extent of output buffer '{buffer}' beyond the \
         first; secondary outputs inherit them from the first output"
    )]
    SecondaryOutputConstraint { buffer: String },

    /// A function is inlined but carries directives that require a loop nest.
    #[error("function '{func}' is scheduled inline, so {reason}")]
    IllegalInlineSchedule { func: String, reason: String },
}
