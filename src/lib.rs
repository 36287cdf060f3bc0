//! briny_dispatch: operator kernel resolution and execution for dynamic-graph
//! tensor runtimes.
//!
//! Given an operator invocation (type, named inputs and outputs, attributes,
//! target place) the dispatcher decides which kernel implementation runs,
//! binds it to a device context, runs it, and applies post-execution hooks.
//!
//! # Features
//!
//! - Kernel keys derived from an operator's kernel-type policy, optionally
//!   upgraded to accelerator libraries (oneDNN, GPU DNN, XPU kernel primitives).
//! - Argument mapping from operator parameters to unified-kernel signatures.
//! - A tiered fallback chain: unified kernel, unified CPU kernel, legacy
//!   kernel, then host degradation for accelerators.
//! - Post-execution hooks: NaN/Inf checking, benchmark synchronization and
//!   complex-gradient repair.
//!
//! # Modules
//!
//! - [`backend`]: backends, layouts, dtypes and places.
//! - [`tensor`], [`variable`], [`attribute`]: the data model kernels see.
//! - [`registry`]: operator and kernel registries.
//! - [`kernel_key`], [`signature`], [`fallback`]: resolution.
//! - [`prepared`], [`context`], [`transform`], [`hooks`]: execution.
//! - [`device`]: device contexts and their pool.
//! - [`dispatcher`]: the root object tying everything together.
//! - [`ops`]: reference operators.
//! - [`config`], [`logging`], [`error`]: ambient plumbing.
//!
//! # Example
//!
//! ```rust
//! use briny_dispatch::attribute::AttributeMap;
//! use briny_dispatch::backend::Place;
//! use briny_dispatch::tensor::Tensor;
//! use briny_dispatch::variable::{NameVarMap, Variable};
//! use briny_dispatch::{ops, Dispatcher, RegistryBuilder, RuntimeFlags};
//!
//! let mut builder = RegistryBuilder::new();
//! ops::register_reference_ops(&mut builder).unwrap();
//! let dispatcher = Dispatcher::new(builder.build()).with_flags(RuntimeFlags::default());
//!
//! let mut ins = NameVarMap::new();
//! ins.insert("X".to_string(), vec![Variable::new("x").with_tensor(Tensor::new(vec![2], vec![1.0f32, 2.0]))]);
//! ins.insert("Y".to_string(), vec![Variable::new("y").with_tensor(Tensor::new(vec![1], vec![0.5f32]))]);
//! let mut outs = NameVarMap::new();
//! outs.insert("Out".to_string(), vec![Variable::new("out")]);
//!
//! let none = AttributeMap::new();
//! dispatcher.execute("add", &ins, &mut outs, &none, &none, Place::Cpu).unwrap();
//! ```

pub mod attribute;
pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod hooks;
pub mod kernel_key;
pub mod logging;
pub mod ops;
pub mod prepared;
pub mod registry;
pub mod signature;
pub mod tensor;
pub mod transform;
pub mod variable;

pub use config::RuntimeFlags;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
pub use kernel_key::KernelKey;
pub use prepared::{OperatorInvocation, PreparedOperator};
pub use registry::{Registry, RegistryBuilder};
