//! Error types for kernel resolution and execution.
//!
//! Every failure the dispatcher can report is a [`DispatchError`]. The small
//! collaborator error types ([`ShapeError`], [`KernelError`],
//! [`DeviceError`]) are what shape-inference procedures, kernel bodies and
//! device contexts return; they are wrapped together with the operator type
//! when they cross into the dispatcher.

use core::fmt;

use thiserror::Error;

use crate::backend::{DataType, Place};

/// Result alias used throughout the crate.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failure reported by a shape-inference procedure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ShapeError(pub String);

/// Failure reported by a kernel body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct KernelError(pub String);

/// Failure reported by a device context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The device reported an asynchronous error at a synchronization point.
    #[error("asynchronous error on {place}: {message}")]
    Async {
        /// Device that failed.
        place: Place,
        /// Driver message.
        message: String,
    },
    /// No context could be created for the place.
    #[error("cannot create device context for {place}: {message}")]
    Unavailable {
        /// Requested device.
        place: Place,
        /// Reason.
        message: String,
    },
}

/// Ordered list of descriptors tried while resolving a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptLog(pub Vec<String>);

impl fmt::Display for AttemptLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("nothing");
        }
        f.write_str(&self.0.join("; "))
    }
}

/// Every failure the dispatcher can report.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No kernel was found across all fallback tiers.
    #[error("operator `{op_type}` has no kernel for this invocation (tried: {attempted})")]
    ResolutionFailure {
        /// Operator type.
        op_type: String,
        /// Every descriptor that was looked up, in order.
        attempted: AttemptLog,
    },

    /// The operator was never registered.
    ///
    /// An unregistered op type fails here rather than with
    /// [`DispatchError::ResolutionFailure`], which is reserved for registered
    /// ops whose every fallback tier missed. Callers treating "no kernel" as
    /// one case should match both.
    #[error("operator `{0}` is not registered")]
    UnknownOperator(String),

    /// The operator's kernel-type policy rejected the invocation.
    #[error("invalid invocation of `{op_type}`: {message}")]
    InvalidInvocation {
        /// Operator type.
        op_type: String,
        /// Reason.
        message: String,
    },

    /// An output contained NaN or Inf while numeric checking was enabled.
    #[error(
        "operator `{op_type}` output `{var}` contains {nan} NaN and {inf} Inf values on {place}"
    )]
    NumericFailure {
        /// Operator type.
        op_type: String,
        /// Offending variable.
        var: String,
        /// Number of NaN elements.
        nan: usize,
        /// Number of infinite elements.
        inf: usize,
        /// Place of the check.
        place: Place,
    },

    /// A device error surfaced at a synchronization point.
    #[error("device failure in `{op_type}`: {source}")]
    DeviceFailure {
        /// Operator type.
        op_type: String,
        /// Underlying device error.
        #[source]
        source: DeviceError,
    },

    /// The shape-inference procedure rejected the invocation.
    #[error("shape inference of `{op_type}` failed: {source}")]
    ShapeInferenceFailure {
        /// Operator type.
        op_type: String,
        /// Underlying error.
        #[source]
        source: ShapeError,
    },

    /// The kernel body failed.
    #[error("kernel `{kernel}` of `{op_type}` failed: {source}")]
    KernelFailure {
        /// Operator type.
        op_type: String,
        /// Kernel name or legacy descriptor.
        kernel: String,
        /// Underlying error.
        #[source]
        source: KernelError,
    },

    /// An input could not be brought to the layout/dtype/place a kernel requires.
    #[error("cannot transform `{var}` from {from} to {to}: {message}")]
    TransformFailure {
        /// Variable being transformed.
        var: String,
        /// Source dtype.
        from: DataType,
        /// Target dtype.
        to: DataType,
        /// Reason.
        message: String,
    },

    /// A registration was rejected while building the registry.
    #[error("invalid registration `{name}`: {message}")]
    InvalidRegistration {
        /// Registered name.
        name: String,
        /// Reason.
        message: String,
    },
}

impl DispatchError {
    /// Builds a [`DispatchError::InvalidInvocation`].
    pub fn invalid_invocation(op_type: &str, message: impl Into<String>) -> Self {
        Self::InvalidInvocation {
            op_type: op_type.to_string(),
            message: message.into(),
        }
    }

    /// Operator type the error refers to, if any.
    #[must_use]
    pub fn op_type(&self) -> Option<&str> {
        match self {
            Self::ResolutionFailure { op_type, .. }
            | Self::InvalidInvocation { op_type, .. }
            | Self::NumericFailure { op_type, .. }
            | Self::DeviceFailure { op_type, .. }
            | Self::ShapeInferenceFailure { op_type, .. }
            | Self::KernelFailure { op_type, .. } => Some(op_type),
            Self::UnknownOperator(op_type) => Some(op_type),
            Self::TransformFailure { .. } | Self::InvalidRegistration { .. } => None,
        }
    }
}
