#![forbid(unsafe_code)]

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub const fn itemsize(self) -> usize {
        match self {
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
            Self::Bool => 1,
        }
    }

    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "f16" | "float16" | "half" => Some(Self::F16),
            "bf16" | "bfloat16" => Some(Self::BF16),
            "f32" | "float32" | "float" => Some(Self::F32),
            "f64" | "float64" | "double" => Some(Self::F64),
            "i32" | "int32" => Some(Self::I32),
            "i64" | "int64" | "long" => Some(Self::I64),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

/// Whether operations produce real data or metadata-only placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Real,
    Symbolic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Strided,
    Sparse { coalesced: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage_offset: usize,
    dtype: DType,
    device: Device,
    layout: Layout,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(dtype: DType, device: Device) -> Self {
        Self {
            shape: Vec::new(),
            strides: Vec::new(),
            storage_offset: 0,
            dtype,
            device,
            layout: Layout::Strided,
        }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType, device: Device) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            storage_offset: 0,
            dtype,
            device,
            layout: Layout::Strided,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        storage_offset: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorMetaError> {
        let meta = Self {
            shape,
            strides,
            storage_offset,
            dtype,
            device,
            layout: Layout::Strided,
        };
        meta.validate()?;
        Ok(meta)
    }

    #[must_use]
    pub fn with_storage_offset(mut self, storage_offset: usize) -> Self {
        self.storage_offset = storage_offset;
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Same dtype, device and layout with a fresh contiguous shape.
    #[must_use]
    pub fn reshaped_contiguous(&self, shape: Vec<usize>) -> Self {
        Self::from_shape(shape, self.dtype, self.device).with_layout(self.layout)
    }

    pub fn validate(&self) -> Result<(), TensorMetaError> {
        if self.shape.len() != self.strides.len() {
            return Err(TensorMetaError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }

        let max_linear_offset = self.max_linear_offset()?;
        let _ = self.storage_offset.checked_add(max_linear_offset).ok_or(
            TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            },
        )?;

        Ok(())
    }

    fn max_linear_offset(&self) -> Result<usize, TensorMetaError> {
        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            if size == 0 {
                continue;
            }

            let span = stride
                .checked_mul(size.saturating_sub(1))
                .ok_or(TensorMetaError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset.checked_add(span).ok_or(
                TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset,
                },
            )?;
        }
        Ok(max_linear_offset)
    }

    /// Number of storage elements this view needs, counting from element zero.
    pub fn required_storage_len(&self) -> Result<usize, TensorMetaError> {
        if self.numel() == 0 {
            return Ok(self.storage_offset);
        }
        let max_linear_offset = self.max_linear_offset()?;
        self.storage_offset
            .checked_add(max_linear_offset)
            .and_then(|last| last.checked_add(1))
            .ok_or(TensorMetaError::StorageOffsetOverflow {
                storage_offset: self.storage_offset,
                max_linear_offset,
            })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    #[must_use]
    pub fn is_sparse(&self) -> bool {
        matches!(self.layout, Layout::Sparse { .. })
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        if self.shape.is_empty() {
            return 1;
        }
        self.shape.iter().copied().product()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Match PyTorch semantics: singleton dimensions are contiguous
            // regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    pub fn storage_index_for(&self, index: &[usize]) -> Result<usize, TensorMetaError> {
        if index.len() != self.shape.len() {
            return Err(TensorMetaError::IndexRankMismatch {
                expected: self.shape.len(),
                actual: index.len(),
            });
        }

        let mut linear = self.storage_offset;
        for (dim, ((idx, dim_size), stride)) in index
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .zip(self.strides.iter().copied())
            .enumerate()
        {
            if idx >= dim_size {
                return Err(TensorMetaError::IndexOutOfBounds {
                    dim,
                    index: idx,
                    size: dim_size,
                });
            }

            let step = idx
                .checked_mul(stride)
                .ok_or(TensorMetaError::StrideOverflow { size: idx, stride })?;
            linear = linear
                .checked_add(step)
                .ok_or(TensorMetaError::StorageOffsetOverflow {
                    storage_offset: self.storage_offset,
                    max_linear_offset: step,
                })?;
        }

        Ok(linear)
    }

    /// Storage indices of every element in row-major logical order.
    pub fn storage_indices(&self) -> Result<Vec<usize>, TensorMetaError> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return Ok(out);
        }
        let mut index = vec![0usize; self.shape.len()];
        for _ in 0..numel {
            out.push(self.storage_index_for(&index)?);
            for dim in (0..index.len()).rev() {
                index[dim] += 1;
                if index[dim] < self.shape[dim] {
                    break;
                }
                index[dim] = 0;
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorMetaError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    StorageOffsetOverflow {
        storage_offset: usize,
        max_linear_offset: usize,
    },
    IndexRankMismatch {
        expected: usize,
        actual: usize,
    },
    IndexOutOfBounds {
        dim: usize,
        index: usize,
        size: usize,
    },
    InsufficientStorage {
        needed: usize,
        available: usize,
    },
}

impl fmt::Display for TensorMetaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::StorageOffsetOverflow {
                storage_offset,
                max_linear_offset,
            } => write!(
                f,
                "storage offset overflow for storage_offset={storage_offset}, max_linear_offset={max_linear_offset}"
            ),
            Self::IndexRankMismatch { expected, actual } => {
                write!(
                    f,
                    "index rank mismatch expected={expected}, actual={actual}"
                )
            }
            Self::IndexOutOfBounds { dim, index, size } => {
                write!(
                    f,
                    "index out of bounds at dim={dim}: index={index}, size={size}"
                )
            }
            Self::InsufficientStorage { needed, available } => {
                write!(
                    f,
                    "insufficient storage: needed={needed}, available={available}"
                )
            }
        }
    }
}

impl std::error::Error for TensorMetaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorCompatError {
    DTypeMismatch { lhs: DType, rhs: DType },
    DeviceMismatch { lhs: Device, rhs: Device },
}

impl fmt::Display for TensorCompatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DTypeMismatch { lhs, rhs } => {
                write!(f, "dtype mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::DeviceMismatch { lhs, rhs } => {
                write!(f, "device mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for TensorCompatError {}

pub fn ensure_compatible(lhs: &TensorMeta, rhs: &TensorMeta) -> Result<(), TensorCompatError> {
    if lhs.dtype() != rhs.dtype() {
        return Err(TensorCompatError::DTypeMismatch {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
        });
    }

    if lhs.device() != rhs.device() {
        return Err(TensorCompatError::DeviceMismatch {
            lhs: lhs.device(),
            rhs: rhs.device(),
        });
    }

    Ok(())
}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

/// Stable handle of a tensor value. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(pub u64);

/// Stable handle of a backing storage. Views share their base's handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageId(pub u64);

fn next_tensor_id() -> TensorId {
    TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
}

fn next_storage_id() -> StorageId {
    StorageId(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Metadata-only placeholder bound to the symbolic context that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicTensor {
    id: TensorId,
    storage_id: StorageId,
    storage_len: usize,
    context: u64,
    meta: TensorMeta,
}

impl SymbolicTensor {
    pub fn new(meta: TensorMeta, context: u64) -> Result<Self, TensorMetaError> {
        meta.validate()?;
        let storage_len = meta.required_storage_len()?;
        Ok(Self {
            id: next_tensor_id(),
            storage_id: next_storage_id(),
            storage_len,
            context,
            meta,
        })
    }

    /// Placeholder over a storage of `storage_len` elements, which may exceed
    /// what `meta` itself addresses (a view of a larger base).
    pub fn with_storage_len(
        meta: TensorMeta,
        storage_len: usize,
        context: u64,
    ) -> Result<Self, TensorMetaError> {
        let mut out = Self::new(meta, context)?;
        if storage_len < out.storage_len {
            return Err(TensorMetaError::InsufficientStorage {
                needed: out.storage_len,
                available: storage_len,
            });
        }
        out.storage_len = storage_len;
        Ok(out)
    }

    /// A new handle over the same storage.
    pub fn view_with(&self, meta: TensorMeta) -> Result<Self, TensorMetaError> {
        meta.validate()?;
        let needed = meta.required_storage_len()?;
        if needed > self.storage_len {
            return Err(TensorMetaError::InsufficientStorage {
                needed,
                available: self.storage_len,
            });
        }
        Ok(Self {
            id: next_tensor_id(),
            storage_id: self.storage_id,
            storage_len: self.storage_len,
            context: self.context,
            meta,
        })
    }

    /// The same handle with rewritten metadata, as left behind by an in-place view op.
    pub fn restrided(&self, meta: TensorMeta) -> Result<Self, TensorMetaError> {
        let mut out = self.view_with(meta)?;
        out.id = self.id;
        Ok(out)
    }

    #[must_use]
    pub fn id(&self) -> TensorId {
        self.id
    }

    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        self.storage_id
    }

    #[must_use]
    pub fn storage_len(&self) -> usize {
        self.storage_len
    }

    #[must_use]
    pub fn context(&self) -> u64 {
        self.context
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }
}

#[derive(Debug)]
pub struct Storage {
    id: StorageId,
    data: RefCell<Vec<f64>>,
}

impl Storage {
    #[must_use]
    pub fn id(&self) -> StorageId {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }

    #[must_use]
    pub fn data(&self) -> Ref<'_, Vec<f64>> {
        self.data.borrow()
    }

    #[must_use]
    pub fn data_mut(&self) -> RefMut<'_, Vec<f64>> {
        self.data.borrow_mut()
    }
}

/// Tensor backed by host memory. Values are held as `f64` whatever the
/// logical dtype; the dtype only drives byte accounting and dispatch.
#[derive(Debug, Clone)]
pub struct RealTensor {
    id: TensorId,
    storage: Rc<Storage>,
    meta: TensorMeta,
}

impl RealTensor {
    pub fn from_values(values: Vec<f64>, meta: TensorMeta) -> Result<Self, TensorMetaError> {
        meta.validate()?;
        let needed = meta.required_storage_len()?;
        if values.len() < needed {
            return Err(TensorMetaError::InsufficientStorage {
                needed,
                available: values.len(),
            });
        }
        Ok(Self {
            id: next_tensor_id(),
            storage: Rc::new(Storage {
                id: next_storage_id(),
                data: RefCell::new(values),
            }),
            meta,
        })
    }

    /// Fresh contiguous tensor with every element set to `value`.
    pub fn full(meta: &TensorMeta, value: f64) -> Result<Self, TensorMetaError> {
        let contiguous = meta.reshaped_contiguous(meta.shape().to_vec());
        Self::from_values(vec![value; contiguous.numel()], contiguous)
    }

    /// A new handle sharing this tensor's storage.
    pub fn view_with(&self, meta: TensorMeta) -> Result<Self, TensorMetaError> {
        meta.validate()?;
        let needed = meta.required_storage_len()?;
        if needed > self.storage.len() {
            return Err(TensorMetaError::InsufficientStorage {
                needed,
                available: self.storage.len(),
            });
        }
        Ok(Self {
            id: next_tensor_id(),
            storage: Rc::clone(&self.storage),
            meta,
        })
    }

    /// The same handle with rewritten metadata.
    pub fn restrided(&self, meta: TensorMeta) -> Result<Self, TensorMetaError> {
        let mut out = self.view_with(meta)?;
        out.id = self.id;
        Ok(out)
    }

    #[must_use]
    pub fn id(&self) -> TensorId {
        self.id
    }

    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        self.storage.id
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    /// Logical values in row-major order, gathered through the strides.
    pub fn values(&self) -> Result<Vec<f64>, TensorMetaError> {
        let indices = self.meta.storage_indices()?;
        let data = self.storage.data();
        Ok(indices.into_iter().map(|idx| data[idx]).collect())
    }

    /// Scatter row-major `values` through the strides into the shared storage.
    pub fn write_values(&self, values: &[f64]) -> Result<(), TensorMetaError> {
        let indices = self.meta.storage_indices()?;
        if values.len() != indices.len() {
            return Err(TensorMetaError::InsufficientStorage {
                needed: indices.len(),
                available: values.len(),
            });
        }
        let mut data = self.storage.data_mut();
        for (idx, value) in indices.into_iter().zip(values.iter().copied()) {
            data[idx] = value;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Tensor {
    Symbolic(SymbolicTensor),
    Real(RealTensor),
}

impl Tensor {
    #[must_use]
    pub fn id(&self) -> TensorId {
        match self {
            Self::Symbolic(tensor) => tensor.id(),
            Self::Real(tensor) => tensor.id(),
        }
    }

    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        match self {
            Self::Symbolic(tensor) => tensor.storage_id(),
            Self::Real(tensor) => tensor.storage_id(),
        }
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        match self {
            Self::Symbolic(tensor) => tensor.meta(),
            Self::Real(tensor) => tensor.meta(),
        }
    }

    #[must_use]
    pub fn storage_len(&self) -> usize {
        match self {
            Self::Symbolic(tensor) => tensor.storage_len(),
            Self::Real(tensor) => tensor.storage().len(),
        }
    }

    /// Bytes of the whole backing storage, not just the viewed region.
    #[must_use]
    pub fn storage_nbytes(&self) -> usize {
        self.storage_len()
            .saturating_mul(self.meta().dtype().itemsize())
    }

    #[must_use]
    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(_))
    }

    #[must_use]
    pub fn as_symbolic(&self) -> Option<&SymbolicTensor> {
        match self {
            Self::Symbolic(tensor) => Some(tensor),
            Self::Real(_) => None,
        }
    }

    #[must_use]
    pub fn as_real(&self) -> Option<&RealTensor> {
        match self {
            Self::Real(tensor) => Some(tensor),
            Self::Symbolic(_) => None,
        }
    }
}

impl From<SymbolicTensor> for Tensor {
    fn from(value: SymbolicTensor) -> Self {
        Self::Symbolic(value)
    }
}

impl From<RealTensor> for Tensor {
    fn from(value: RealTensor) -> Self {
        Self::Real(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpTags {
    /// Output is a metadata-only alias of an input.
    pub view: bool,
    /// Output is created from nothing or from an input's metadata only.
    pub create: bool,
    /// Writes into an input's storage and returns that input.
    pub inplace: bool,
    /// Rewrites an input's shape/stride in place.
    pub inplace_view: bool,
}

macro_rules! op_kinds {
    ($($variant:ident => $name:literal,)*) => {
        /// Overload-independent identity of a primitive operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum OpKind {
            $($variant,)*
        }

        impl OpKind {
            #[must_use]
            pub const fn all() -> &'static [OpKind] {
                &[$(OpKind::$variant,)*]
            }

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            #[must_use]
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

op_kinds! {
    Detach => "detach",
    View => "view",
    Reshape => "reshape",
    T => "t",
    Transpose => "transpose",
    Permute => "permute",
    Expand => "expand",
    Squeeze => "squeeze",
    Unsqueeze => "unsqueeze",
    Select => "select",
    Split => "split",
    Chunk => "chunk",
    AsStrided => "as_strided",
    Zeros => "zeros",
    Ones => "ones",
    Rand => "rand",
    Randn => "randn",
    Arange => "arange",
    ZerosLike => "zeros_like",
    OnesLike => "ones_like",
    RandLike => "rand_like",
    RandnLike => "randn_like",
    Mm => "mm",
    Addmm => "addmm",
    Bmm => "bmm",
    Baddbmm => "baddbmm",
    Add => "add",
    Sub => "sub",
    Mul => "mul",
    Div => "div",
    Relu => "relu",
    ThresholdBackward => "threshold_backward",
    Sum => "sum",
    Softmax => "softmax",
    Clone => "clone",
    Alias => "alias",
    Convolution => "convolution",
    ConvolutionBackward => "convolution_backward",
    SdpaEfficient => "scaled_dot_product_efficient_attention",
    SdpaFlash => "scaled_dot_product_flash_attention",
    SdpaEfficientBackward => "scaled_dot_product_efficient_attention_backward",
    SdpaFlashBackward => "scaled_dot_product_flash_attention_backward",
    AddInPlace => "add_",
    MulInPlace => "mul_",
    Fill => "fill_",
    Zero => "zero_",
    Copy => "copy_",
    UnsqueezeInPlace => "unsqueeze_",
    SqueezeInPlace => "squeeze_",
    TransposeInPlace => "transpose_",
    AsStridedInPlace => "as_strided_",
}

impl OpKind {
    #[must_use]
    pub const fn tags(self) -> OpTags {
        match self {
            Self::Detach
            | Self::View
            | Self::Reshape
            | Self::T
            | Self::Transpose
            | Self::Permute
            | Self::Expand
            | Self::Squeeze
            | Self::Unsqueeze
            | Self::Select
            | Self::Split
            | Self::Chunk
            | Self::AsStrided => OpTags {
                view: true,
                create: false,
                inplace: false,
                inplace_view: false,
            },
            Self::Zeros
            | Self::Ones
            | Self::Rand
            | Self::Randn
            | Self::Arange
            | Self::ZerosLike
            | Self::OnesLike
            | Self::RandLike
            | Self::RandnLike => OpTags {
                view: false,
                create: true,
                inplace: false,
                inplace_view: false,
            },
            Self::AddInPlace | Self::MulInPlace | Self::Fill | Self::Zero | Self::Copy => OpTags {
                view: false,
                create: false,
                inplace: true,
                inplace_view: false,
            },
            Self::UnsqueezeInPlace
            | Self::SqueezeInPlace
            | Self::TransposeInPlace
            | Self::AsStridedInPlace => OpTags {
                view: false,
                create: false,
                inplace: true,
                inplace_view: true,
            },
            _ => OpTags {
                view: false,
                create: false,
                inplace: false,
                inplace_view: false,
            },
        }
    }

    #[must_use]
    pub const fn is_view(self) -> bool {
        self.tags().view
    }

    /// Views and trivial creation ops carry no modeled cost.
    #[must_use]
    pub const fn is_cost_free(self) -> bool {
        let tags = self.tags();
        tags.view || tags.create
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub enum Operand {
    Tensor(Tensor),
    Scalar(f64),
    Int(i64),
    Bool(bool),
    Ints(Vec<i64>),
    DType(DType),
    Device(Device),
    None,
}

impl Operand {
    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }
}

impl From<Tensor> for Operand {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

/// One call of a primitive operation: positional and keyword operands.
#[derive(Debug, Clone)]
pub struct OpInvocation {
    pub kind: OpKind,
    pub args: Vec<Operand>,
    pub kwargs: BTreeMap<String, Operand>,
}

impl OpInvocation {
    #[must_use]
    pub fn new(kind: OpKind, args: Vec<Operand>) -> Self {
        Self {
            kind,
            args,
            kwargs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_kwarg(mut self, name: impl Into<String>, value: Operand) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// Every tensor operand, positional first, then keywords in key order.
    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.args
            .iter()
            .chain(self.kwargs.values())
            .filter_map(Operand::as_tensor)
    }

    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&Operand> {
        self.kwargs.get(name)
    }

    /// Rebuild the invocation with every operand passed through `map`.
    pub fn try_map_operands<E>(
        &self,
        mut map: impl FnMut(&Operand) -> Result<Operand, E>,
    ) -> Result<Self, E> {
        let args = self.args.iter().map(&mut map).collect::<Result<Vec<_>, _>>()?;
        let mut kwargs = BTreeMap::new();
        for (name, value) in &self.kwargs {
            kwargs.insert(name.clone(), map(value)?);
        }
        Ok(Self {
            kind: self.kind,
            args,
            kwargs,
        })
    }
}
