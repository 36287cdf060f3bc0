//! Kernel signatures and argument mapping.
//!
//! A [`KernelSignature`] is the calling convention of a unified kernel: the
//! kernel name plus the ordered operator parameter names bound to its
//! inputs, attributes and outputs.
//!
//! [`lookup_signature`] decides which signature an operator uses:
//!
//! 1. a custom argument-mapping function registered for the op, evaluated
//!    over an [`ArgumentMappingContext`];
//! 2. a structured kernel registered under the op's own name, which gets a
//!    name-only signature;
//! 3. the default-signature table.
//!
//! No match means the operator has no unified kernel.

use std::fmt;
use std::sync::Arc;

use briny::prelude::*;

use crate::attribute::Attribute;
use crate::registry::Registry;

/// Calling convention of a unified kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KernelSignature {
    /// Kernel name in the kernel factory.
    pub name: String,
    /// Operator input names, in kernel argument order.
    pub inputs: Vec<String>,
    /// Attribute names, in kernel argument order.
    pub attributes: Vec<String>,
    /// Operator output names, in kernel argument order.
    pub outputs: Vec<String>,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

impl KernelSignature {
    /// Full signature.
    #[must_use]
    pub fn new(name: &str, inputs: &[&str], attributes: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            inputs: owned(inputs),
            attributes: owned(attributes),
            outputs: owned(outputs),
        }
    }

    /// Signature carrying only a kernel name (structured kernels).
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Whether the signature has no argument lists.
    #[must_use]
    pub fn is_name_only(&self) -> bool {
        self.inputs.is_empty() && self.attributes.is_empty() && self.outputs.is_empty()
    }
}

impl fmt::Display for KernelSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KernelSignature(name: {}; inputs: {}; attributes: {}; outputs: {})",
            self.name,
            self.inputs.join(", "),
            self.attributes.join(", "),
            self.outputs.join(", ")
        )
    }
}

fn has_duplicates(names: &[String]) -> bool {
    names
        .iter()
        .enumerate()
        .any(|(i, n)| names[..i].contains(n))
}

impl Validate for KernelSignature {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError);
        }
        if has_duplicates(&self.inputs)
            || has_duplicates(&self.attributes)
            || has_duplicates(&self.outputs)
        {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Attribute and presence queries an argument-mapping function may ask.
pub trait ArgumentMappingContext {
    /// Whether the op received a non-empty input `name`.
    fn has_input(&self, name: &str) -> bool;
    /// Whether the op received a non-empty output `name`.
    fn has_output(&self, name: &str) -> bool;
    /// Whether attribute `name` is set at the call site or by default.
    fn has_attr(&self, name: &str) -> bool;
    /// Attribute value.
    fn attr(&self, name: &str) -> Option<&Attribute>;
    /// Number of variables bound to input `name`.
    fn input_count(&self, name: &str) -> usize;
    /// Number of variables bound to output `name`.
    fn output_count(&self, name: &str) -> usize;
}

/// Custom per-operator argument mapping.
pub type ArgumentMappingFn = Arc<dyn Fn(&dyn ArgumentMappingContext) -> KernelSignature + Send + Sync>;

/// Where a resolved signature came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureSource {
    /// Custom argument-mapping function.
    ArgumentMapping,
    /// Structured kernel named after the op.
    Structured,
    /// Default-signature table.
    Default,
}

/// Signature chosen for an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSignature {
    /// The signature.
    pub signature: KernelSignature,
    /// How it was found.
    pub source: SignatureSource,
}

/// Maps an operator type to its unified-kernel signature.
///
/// Returns `None` if the operator has no unified kernel at all.
pub fn lookup_signature(
    registry: &Registry,
    op_type: &str,
    ctx: &dyn ArgumentMappingContext,
) -> Option<ResolvedSignature> {
    if let Some(map_fn) = registry.argument_mapping_fn(op_type) {
        return Some(ResolvedSignature {
            signature: map_fn(ctx),
            source: SignatureSource::ArgumentMapping,
        });
    }
    if registry.kernels().has_structured_kernel(op_type) {
        return Some(ResolvedSignature {
            signature: KernelSignature::named(op_type),
            source: SignatureSource::Structured,
        });
    }
    registry
        .default_signature(op_type)
        .map(|sig| ResolvedSignature {
            signature: sig.clone(),
            source: SignatureSource::Default,
        })
}
