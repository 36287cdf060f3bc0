//! Operator attributes.

use std::collections::BTreeMap;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// Single-precision float.
    Float(f32),
    /// Double-precision float.
    Double(f64),
    /// String.
    Str(String),
    /// List of 32-bit integers.
    Ints(Vec<i32>),
    /// List of 64-bit integers.
    Longs(Vec<i64>),
    /// List of floats.
    Floats(Vec<f32>),
    /// List of strings.
    Strs(Vec<String>),
}

impl Attribute {
    /// Boolean value, if this is a `Bool`.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value, widening `Int` to `i64`.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v as i64),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value, widening `Float` to `f64` and accepting integers.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            Self::Int(v) => Some(f64::from(*v)),
            Self::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// String value, if this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! attribute_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Attribute {
            fn from(v: $ty) -> Self {
                Self::$variant(v)
            }
        })*
    };
}

attribute_from!(
    bool => Bool,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => Str,
    Vec<i32> => Ints,
    Vec<i64> => Longs,
    Vec<f32> => Floats,
    Vec<String> => Strs,
);

impl From<&str> for Attribute {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// Attributes by name.
pub type AttributeMap = BTreeMap<String, Attribute>;

/// Read-only merge of call-site attributes over defaults.
///
/// Lookups consult the call-site map first and fall back to the defaults.
/// Neither map is modified.
#[derive(Debug, Clone, Copy)]
pub struct Attributes<'a> {
    attrs: &'a AttributeMap,
    defaults: &'a AttributeMap,
}

impl<'a> Attributes<'a> {
    /// Layers `attrs` over `defaults`.
    #[must_use]
    pub const fn new(attrs: &'a AttributeMap, defaults: &'a AttributeMap) -> Self {
        Self { attrs, defaults }
    }

    /// Looks up an attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'a Attribute> {
        self.attrs.get(name).or_else(|| self.defaults.get(name))
    }

    /// Whether the attribute is set at the call site or by default.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Call-site attributes only.
    #[must_use]
    pub const fn call_site(&self) -> &'a AttributeMap {
        self.attrs
    }

    /// Default attributes only.
    #[must_use]
    pub const fn defaults(&self) -> &'a AttributeMap {
        self.defaults
    }
}
