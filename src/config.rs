//! Runtime flags recognized by the dispatcher.
//!
//! Flags are plain data handed to a [`Dispatcher`](crate::Dispatcher) when it
//! is built. [`RuntimeFlags::from_env`] reads them from the process
//! environment, and [`RuntimeFlags::global`] keeps a snapshot taken on first
//! use for callers that want process-wide behaviour.
//!
//! | Variable                         | Effect                                      |
//! |----------------------------------|---------------------------------------------|
//! | `BRINY_CHECK_NUMERICS`           | scan outputs, fail on NaN/Inf               |
//! | `BRINY_BENCHMARK`                | wait for the device after every operator    |
//! | `BRINY_USE_ACCELERATED_LAYOUT`   | enable the library-override pass            |
//! | `BRINY_RUN_KP_KERNEL`            | allow XPU kernel-primitive upgrades         |

use lazy_static::lazy_static;

const CHECK_NUMERICS_ENV: &str = "BRINY_CHECK_NUMERICS";
const BENCHMARK_ENV: &str = "BRINY_BENCHMARK";
const USE_ACCELERATED_LAYOUT_ENV: &str = "BRINY_USE_ACCELERATED_LAYOUT";
const RUN_KP_KERNEL_ENV: &str = "BRINY_RUN_KP_KERNEL";

/// Flags with recognized effects on resolution and execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeFlags {
    /// Scan every output for NaN/Inf after compute.
    pub check_numerics: bool,
    /// Block until the device finished and surface device errors.
    pub benchmark: bool,
    /// Run the library-override pass during key resolution.
    pub use_accelerated_layout: bool,
    /// Allow upgrades of XPU keys to kernel-primitive kernels.
    pub run_kp_kernel: bool,
}

lazy_static! {
    static ref GLOBAL_FLAGS: RuntimeFlags = RuntimeFlags::from_env();
}

impl RuntimeFlags {
    /// Reads flags from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads flags through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|v| parse_bool(&v));
        Self {
            check_numerics: flag(CHECK_NUMERICS_ENV),
            benchmark: flag(BENCHMARK_ENV),
            use_accelerated_layout: flag(USE_ACCELERATED_LAYOUT_ENV),
            run_kp_kernel: flag(RUN_KP_KERNEL_ENV),
        }
    }

    /// Snapshot of the environment taken the first time this is called.
    #[must_use]
    pub fn global() -> Self {
        *GLOBAL_FLAGS
    }

    /// Sets `check_numerics`.
    #[must_use]
    pub const fn with_check_numerics(mut self, on: bool) -> Self {
        self.check_numerics = on;
        self
    }

    /// Sets `benchmark`.
    #[must_use]
    pub const fn with_benchmark(mut self, on: bool) -> Self {
        self.benchmark = on;
        self
    }

    /// Sets `use_accelerated_layout`.
    #[must_use]
    pub const fn with_accelerated_layout(mut self, on: bool) -> Self {
        self.use_accelerated_layout = on;
        self
    }

    /// Sets `run_kp_kernel`.
    #[must_use]
    pub const fn with_kp_kernel(mut self, on: bool) -> Self {
        self.run_kp_kernel = on;
        self
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}
