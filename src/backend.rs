//! Backends, layouts, data types and places.
//!
//! This module defines the vocabulary every kernel registration and every
//! resolution decision is expressed in.
//!
//! # Backends
//!
//! - `Cpu`: plain host kernels (the universal fallback).
//! - `Gpu` / `GpuDnn`: GPU kernels, the latter backed by a vendor DNN library.
//! - `OneDnn`: host kernels backed by oneDNN, with their own memory layout.
//! - `Xpu` / `Kps`: specialized accelerator kernels, `Kps` being the
//!   kernel-primitive flavour of the same device class.
//! - `Ipu`, `Custom`: further accelerator classes.
//!
//! Backends that drive the same physical device family share a
//! [`BackendClass`]; switching between two backends of the same class never
//! requires a new device context.

use core::convert::TryFrom;
use core::fmt;

/// Enumeration of kernel backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Backend {
    /// Plain host backend (default).
    #[default]
    Cpu = 0,
    /// Generic GPU backend.
    Gpu,
    /// GPU backend using a vendor DNN library.
    GpuDnn,
    /// Host backend using oneDNN.
    OneDnn,
    /// Specialized accelerator backend.
    Xpu,
    /// Kernel-primitive variant of the XPU backend.
    Kps,
    /// Graph accelerator backend.
    Ipu,
    /// Plug-in device backend.
    Custom,
    /// Wildcard used by kernel argument definitions that accept any backend.
    All,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Gpu),
            2 => Ok(Self::GpuDnn),
            3 => Ok(Self::OneDnn),
            4 => Ok(Self::Xpu),
            5 => Ok(Self::Kps),
            6 => Ok(Self::Ipu),
            7 => Ok(Self::Custom),
            8 => Ok(Self::All),
            _ => Err(()),
        }
    }
}

/// Device family a backend executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendClass {
    /// Host processor.
    Host,
    /// GPU family.
    Gpu,
    /// XPU family.
    Xpu,
    /// IPU family.
    Ipu,
    /// Plug-in devices.
    Custom,
    /// Matches every class.
    Any,
}

impl Backend {
    /// Returns the device family of this backend.
    #[must_use]
    pub const fn class(self) -> BackendClass {
        match self {
            Self::Cpu | Self::OneDnn => BackendClass::Host,
            Self::Gpu | Self::GpuDnn => BackendClass::Gpu,
            Self::Xpu | Self::Kps => BackendClass::Xpu,
            Self::Ipu => BackendClass::Ipu,
            Self::Custom => BackendClass::Custom,
            Self::All => BackendClass::Any,
        }
    }

    /// Whether the backend is bound to an accelerator library rather than
    /// being the plain backend of its class.
    #[must_use]
    pub const fn is_library_specific(self) -> bool {
        matches!(self, Self::GpuDnn | Self::OneDnn | Self::Kps)
    }

    /// The legacy library tag implied by this backend.
    #[must_use]
    pub const fn library(self) -> LibraryType {
        match self {
            Self::OneDnn => LibraryType::OneDnn,
            Self::GpuDnn => LibraryType::CuDnn,
            Self::Kps => LibraryType::Kp,
            _ => LibraryType::Plain,
        }
    }

    /// Builds the place this backend runs on, reusing `device_id` for
    /// non-host classes.
    #[must_use]
    pub const fn to_place(self, device_id: u32) -> Place {
        match self.class() {
            BackendClass::Host | BackendClass::Any => Place::Cpu,
            BackendClass::Gpu => Place::Gpu(device_id),
            BackendClass::Xpu => Place::Xpu(device_id),
            BackendClass::Ipu => Place::Ipu(device_id),
            BackendClass::Custom => Place::Custom(device_id),
        }
    }

    /// The plain backend serving `place`.
    #[must_use]
    pub const fn from_place(place: Place) -> Self {
        match place {
            Place::Cpu => Self::Cpu,
            Place::Gpu(_) => Self::Gpu,
            Place::Xpu(_) => Self::Xpu,
            Place::Ipu(_) => Self::Ipu,
            Place::Custom(_) => Self::Custom,
        }
    }
}

/// Whether two backends can share a device context.
#[must_use]
pub fn backends_are_same_class(a: Backend, b: Backend) -> bool {
    let (a, b) = (a.class(), b.class());
    a == BackendClass::Any || b == BackendClass::Any || a == b
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
            Self::GpuDnn => "GPUDNN",
            Self::OneDnn => "ONEDNN",
            Self::Xpu => "XPU",
            Self::Kps => "KPS",
            Self::Ipu => "IPU",
            Self::Custom => "CUSTOM",
            Self::All => "ALL_BACKEND",
        };
        f.write_str(name)
    }
}

/// Memory arrangement of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum DataLayout {
    /// Plain layout; kernels registered with it accept any plain tensor.
    #[default]
    Any,
    /// Channels-first.
    Nchw,
    /// Channels-last.
    Nhwc,
    /// Opaque oneDNN blocked layout.
    OneDnn,
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "Undefined(AnyLayout)",
            Self::Nchw => "NCHW",
            Self::Nhwc => "NHWC",
            Self::OneDnn => "ONEDNN",
        };
        f.write_str(name)
    }
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum DataType {
    /// Unknown / unset.
    #[default]
    Undefined,
    /// `bool`
    Bool,
    /// `i32`
    Int32,
    /// `i64`
    Int64,
    /// `f32`
    Float32,
    /// `f64`
    Float64,
    /// Complex with `f32` parts.
    Complex64,
    /// Complex with `f64` parts.
    Complex128,
}

impl DataType {
    /// Whether this is a complex type.
    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(self, Self::Complex64 | Self::Complex128)
    }

    /// Whether this is a floating point (real) type.
    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Complex64 => "complex64",
            Self::Complex128 => "complex128",
        };
        f.write_str(name)
    }
}

impl core::str::FromStr for DataType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(Self::Bool),
            "int32" => Ok(Self::Int32),
            "int64" => Ok(Self::Int64),
            "float32" => Ok(Self::Float32),
            "float64" => Ok(Self::Float64),
            "complex64" => Ok(Self::Complex64),
            "complex128" => Ok(Self::Complex128),
            _ => Err(()),
        }
    }
}

/// A concrete device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Place {
    /// The host.
    #[default]
    Cpu,
    /// GPU with the given ordinal.
    Gpu(u32),
    /// XPU with the given ordinal.
    Xpu(u32),
    /// IPU with the given ordinal.
    Ipu(u32),
    /// Plug-in device with the given ordinal.
    Custom(u32),
}

impl Place {
    /// Device ordinal (0 for the host).
    #[must_use]
    pub const fn device_id(self) -> u32 {
        match self {
            Self::Cpu => 0,
            Self::Gpu(id) | Self::Xpu(id) | Self::Ipu(id) | Self::Custom(id) => id,
        }
    }

    /// Same device family with ordinal 0.
    #[must_use]
    pub const fn family(self) -> Self {
        match self {
            Self::Cpu => Self::Cpu,
            Self::Gpu(_) => Self::Gpu(0),
            Self::Xpu(_) => Self::Xpu(0),
            Self::Ipu(_) => Self::Ipu(0),
            Self::Custom(_) => Self::Custom(0),
        }
    }

    /// Whether two places belong to the same device family.
    #[must_use]
    pub fn is_same_class(self, other: Self) -> bool {
        core::mem::discriminant(&self) == core::mem::discriminant(&other)
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("Place(cpu)"),
            Self::Gpu(id) => write!(f, "Place(gpu:{id})"),
            Self::Xpu(id) => write!(f, "Place(xpu:{id})"),
            Self::Ipu(id) => write!(f, "Place(ipu:{id})"),
            Self::Custom(id) => write!(f, "Place(custom:{id})"),
        }
    }
}

/// Accelerator library a legacy kernel was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum LibraryType {
    /// No accelerator library.
    #[default]
    Plain,
    /// oneDNN.
    OneDnn,
    /// Vendor GPU DNN library.
    CuDnn,
    /// XPU kernel primitives.
    Kp,
}

impl fmt::Display for LibraryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Plain => "PLAIN",
            Self::OneDnn => "MKLDNN",
            Self::CuDnn => "CUDNN",
            Self::Kp => "KP",
        };
        f.write_str(name)
    }
}
