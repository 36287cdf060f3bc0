//! Host tensors handed to kernels.
//!
//! # Tensor Types
//!
//! - [`Tensor<T>`]: a typed N-dimensional array with row-major data, used to
//!   build and read tensors in a strongly typed way.
//! - [`DenseTensor`]: the type-erased tensor stored in variables. It always
//!   carries metadata (shape, dtype, layout, place) and only carries storage
//!   once it is *initialized*. Shape inference fills in metadata, kernels fill
//!   in storage.
//!
//! ## Design Highlights
//! - Element types are tied to [`DataType`] through the [`Element`] trait
//! - Casting between element types goes through a complex `f64` intermediate,
//!   so complex to real conversion keeps the real part
//! - The `tensor!` macro supports ergonomic tensor creation from nested arrays
//!
//! ## Example
//!
//! ```rust
//! use briny_dispatch::tensor::{DenseTensor, Tensor};
//! let t = DenseTensor::from(Tensor::new(vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]));
//! assert_eq!(t.shape(), &[2, 3]);
//! assert!(t.is_initialized());
//! ```

use num_complex::Complex;

use crate::backend::{DataLayout, DataType, Place};

/// Represents an N-dimensional tensor with a shape and flat row-major data.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Flattened, row-major elements.
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }
}

/// Type-erased element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    /// `bool` elements.
    Bool(Vec<bool>),
    /// `i32` elements.
    Int32(Vec<i32>),
    /// `i64` elements.
    Int64(Vec<i64>),
    /// `f32` elements.
    Float32(Vec<f32>),
    /// `f64` elements.
    Float64(Vec<f64>),
    /// Complex `f32` elements.
    Complex64(Vec<Complex<f32>>),
    /// Complex `f64` elements.
    Complex128(Vec<Complex<f64>>),
}

impl Storage {
    /// Element type of the storage.
    #[must_use]
    pub const fn dtype(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::Complex64(_) => DataType::Complex64,
            Self::Complex128(_) => DataType::Complex128,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Complex64(v) => v.len(),
            Self::Complex128(v) => v.len(),
        }
    }

    /// Whether the storage has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-filled storage of `len` elements, `None` for `Undefined`.
    #[must_use]
    pub fn zeros(dtype: DataType, len: usize) -> Option<Self> {
        Some(match dtype {
            DataType::Undefined => return None,
            DataType::Bool => Self::Bool(vec![false; len]),
            DataType::Int32 => Self::Int32(vec![0; len]),
            DataType::Int64 => Self::Int64(vec![0; len]),
            DataType::Float32 => Self::Float32(vec![0.0; len]),
            DataType::Float64 => Self::Float64(vec![0.0; len]),
            DataType::Complex64 => Self::Complex64(vec![Complex::new(0.0, 0.0); len]),
            DataType::Complex128 => Self::Complex128(vec![Complex::new(0.0, 0.0); len]),
        })
    }

    fn to_complex(&self) -> Vec<Complex<f64>> {
        match self {
            Self::Bool(v) => v.iter().map(|&x| Complex::new(f64::from(u8::from(x)), 0.0)).collect(),
            Self::Int32(v) => v.iter().map(|&x| Complex::new(f64::from(x), 0.0)).collect(),
            Self::Int64(v) => v.iter().map(|&x| Complex::new(x as f64, 0.0)).collect(),
            Self::Float32(v) => v.iter().map(|&x| Complex::new(f64::from(x), 0.0)).collect(),
            Self::Float64(v) => v.iter().map(|&x| Complex::new(x, 0.0)).collect(),
            Self::Complex64(v) => v
                .iter()
                .map(|x| Complex::new(f64::from(x.re), f64::from(x.im)))
                .collect(),
            Self::Complex128(v) => v.clone(),
        }
    }

    /// Converts the storage to `dtype`. Complex to real keeps the real part.
    ///
    /// Returns `None` when `dtype` is `Undefined`.
    #[must_use]
    pub fn cast(&self, dtype: DataType) -> Option<Self> {
        if self.dtype() == dtype {
            return Some(self.clone());
        }
        let values = self.to_complex();
        if dtype == DataType::Complex128 {
            return Some(Self::Complex128(values));
        }
        let it = values.iter();
        Some(match dtype {
            DataType::Undefined | DataType::Complex128 => return None,
            DataType::Bool => Self::Bool(it.map(|c| c.re != 0.0).collect()),
            DataType::Int32 => Self::Int32(it.map(|c| c.re as i32).collect()),
            DataType::Int64 => Self::Int64(it.map(|c| c.re as i64).collect()),
            DataType::Float32 => Self::Float32(it.map(|c| c.re as f32).collect()),
            DataType::Float64 => Self::Float64(it.map(|c| c.re).collect()),
            DataType::Complex64 => Self::Complex64(
                it.map(|c| Complex::new(c.re as f32, c.im as f32)).collect(),
            ),
        })
    }
}

/// Element types that can live in a [`DenseTensor`].
pub trait Element: Copy + Send + Sync + 'static {
    /// Data type tag.
    const DTYPE: DataType;
    /// Wraps a vector into storage.
    fn into_storage(data: Vec<Self>) -> Storage;
    /// Borrows storage as a slice of this element type.
    fn view(storage: &Storage) -> Option<&[Self]>;
    /// Mutably borrows storage as a slice of this element type.
    fn view_mut(storage: &mut Storage) -> Option<&mut [Self]>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DataType = DataType::$variant;

            fn into_storage(data: Vec<Self>) -> Storage {
                Storage::$variant(data)
            }

            fn view(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn view_mut(storage: &mut Storage) -> Option<&mut [Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(bool, Bool);
impl_element!(i32, Int32);
impl_element!(i64, Int64);
impl_element!(f32, Float32);
impl_element!(f64, Float64);
impl_element!(Complex<f32>, Complex64);
impl_element!(Complex<f64>, Complex128);

/// Type-erased tensor with metadata and optional storage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DenseTensor {
    shape: Vec<usize>,
    dtype: DataType,
    layout: DataLayout,
    place: Place,
    storage: Option<Storage>,
}

impl DenseTensor {
    /// Metadata-only tensor; not initialized.
    #[must_use]
    pub fn uninit(shape: impl Into<Vec<usize>>, dtype: DataType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            ..Self::default()
        }
    }

    /// Initialized tensor from raw storage.
    ///
    /// # Panics
    /// Panics if the storage length does not match the shape product.
    #[must_use]
    pub fn from_storage(shape: impl Into<Vec<usize>>, storage: Storage) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            storage.len(),
            "shape {shape:?} is incompatible with {} data elements",
            storage.len()
        );
        Self {
            shape,
            dtype: storage.dtype(),
            layout: DataLayout::Any,
            place: Place::Cpu,
            storage: Some(storage),
        }
    }

    /// Returns this tensor relabelled to `place`.
    #[must_use]
    pub fn with_place(mut self, place: Place) -> Self {
        self.place = place;
        self
    }

    /// Returns this tensor relabelled to `layout`.
    #[must_use]
    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Dimensions.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type.
    #[must_use]
    pub const fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Memory layout.
    #[must_use]
    pub const fn layout(&self) -> DataLayout {
        self.layout
    }

    /// Device holding the data.
    #[must_use]
    pub const fn place(&self) -> Place {
        self.place
    }

    /// Element count implied by the shape.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether storage is present.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.storage.is_some()
    }

    /// Raw storage, if initialized.
    #[must_use]
    pub const fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    /// Typed view of the data.
    #[must_use]
    pub fn data<T: Element>(&self) -> Option<&[T]> {
        self.storage.as_ref().and_then(T::view)
    }

    /// Typed mutable view of the data.
    pub fn data_mut<T: Element>(&mut self) -> Option<&mut [T]> {
        self.storage.as_mut().and_then(T::view_mut)
    }

    /// Overwrites shape and dtype, dropping storage that no longer matches.
    pub fn set_meta(&mut self, shape: impl Into<Vec<usize>>, dtype: DataType) {
        self.shape = shape.into();
        self.dtype = dtype;
        let numel = self.numel();
        if self
            .storage
            .as_ref()
            .is_some_and(|s| s.dtype() != dtype || s.len() != numel)
        {
            self.storage = None;
        }
    }

    /// Zero-fills storage according to the metadata, on `place`.
    ///
    /// Returns `false` if the dtype is undefined.
    pub fn allocate(&mut self, place: Place) -> bool {
        self.place = place;
        self.storage = Storage::zeros(self.dtype, self.numel());
        self.storage.is_some()
    }

    /// Replaces the data, keeping place and layout.
    ///
    /// # Panics
    /// Panics if the storage length does not match the shape product.
    pub fn set_data(&mut self, shape: impl Into<Vec<usize>>, storage: Storage) {
        let shape = shape.into();
        assert_eq!(shape.iter().product::<usize>(), storage.len(), "shape mismatch");
        self.shape = shape;
        self.dtype = storage.dtype();
        self.storage = Some(storage);
    }

    /// Converts to `dtype`, keeping shape, layout and place.
    ///
    /// Returns `None` if the tensor is not initialized or `dtype` is undefined.
    #[must_use]
    pub fn cast(&self, dtype: DataType) -> Option<Self> {
        let storage = self.storage.as_ref()?.cast(dtype)?;
        Some(Self {
            shape: self.shape.clone(),
            dtype,
            layout: self.layout,
            place: self.place,
            storage: Some(storage),
        })
    }

    /// Copies the data out as a typed tensor.
    #[must_use]
    pub fn to_tensor<T: Element>(&self) -> Option<Tensor<T>> {
        self.data::<T>()
            .map(|d| Tensor::new(self.shape.clone(), d.to_vec()))
    }
}

impl<T: Element> From<Tensor<T>> for DenseTensor {
    fn from(t: Tensor<T>) -> Self {
        Self::from_storage(t.shape, T::into_storage(t.data))
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use briny_dispatch::tensor;
/// let t = tensor!([[1.0f32, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensor::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = children[0].shape.clone();
        assert!(children.iter().all(|c| c.shape == first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensor::Tensor::new(shape, data)
    }};
}
