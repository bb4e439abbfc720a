//! The self-describing typed value: the atomic serialization unit of the
//! format. A value is a scalar or vector of one element type, laid out
//! either densely or sparsely (delta-encoded offsets of the non-zero
//! elements). Reserved in-band sentinels mark missing data and the end of
//! variable-length vectors.

use num_enum::TryFromPrimitive;

use crate::error::{Result, SavError};
use crate::pbwt::{self, PbwtState};

/// On-disk type codes, shared with BCF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum TypeKind {
    Sparse = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    Float32 = 5,
    Float64 = 6,
    String = 7,
}

impl TypeKind {
    /// Byte width of one element.
    pub fn width(self) -> usize {
        match self {
            TypeKind::Int8 | TypeKind::String | TypeKind::Sparse => 1,
            TypeKind::Int16 => 2,
            TypeKind::Int32 | TypeKind::Float32 => 4,
            TypeKind::Int64 | TypeKind::Float64 => 8,
        }
    }

    /// Smallest signed integer kind that can represent `val` outside the
    /// reserved band.
    pub fn fitting_int(val: i64) -> TypeKind {
        if val <= i64::from(i8::MAX) && val > i64::from(MISSING_INT8) + 7 {
            TypeKind::Int8
        } else if val <= i64::from(i16::MAX) && val > i64::from(MISSING_INT16) + 7 {
            TypeKind::Int16
        } else if val <= i64::from(i32::MAX) && val > i64::from(MISSING_INT32) + 7 {
            TypeKind::Int32
        } else {
            TypeKind::Int64
        }
    }

    /// Smallest unsigned integer kind that can hold a sparse offset delta.
    pub fn fitting_offset(delta: u64) -> TypeKind {
        if delta <= u64::from(u8::MAX) {
            TypeKind::Int8
        } else if delta <= u64::from(u16::MAX) {
            TypeKind::Int16
        } else if delta <= u64::from(u32::MAX) {
            TypeKind::Int32
        } else {
            TypeKind::Int64
        }
    }
}

pub const MISSING_INT8: i8 = i8::MIN;
pub const MISSING_INT16: i16 = i16::MIN;
pub const MISSING_INT32: i32 = i32::MIN;
pub const MISSING_INT64: i64 = i64::MIN;
pub const END_OF_VECTOR_INT8: i8 = i8::MIN + 1;
pub const END_OF_VECTOR_INT16: i16 = i16::MIN + 1;
pub const END_OF_VECTOR_INT32: i32 = i32::MIN + 1;
pub const END_OF_VECTOR_INT64: i64 = i64::MIN + 1;
pub const MISSING_FLOAT_BITS: u32 = 0x7F80_0001;
pub const END_OF_VECTOR_FLOAT_BITS: u32 = 0x7F80_0002;
pub const MISSING_DOUBLE_BITS: u64 = 0x7FF0_0000_0000_0001;
pub const END_OF_VECTOR_DOUBLE_BITS: u64 = 0x7FF0_0000_0000_0002;

/// One element type of a typed value. Sentinel comparisons go through bit
/// patterns, never IEEE equality.
pub trait Scalar: Copy + PartialEq + Default {
    const KIND: TypeKind;
    fn missing() -> Self;
    fn end_of_vector() -> Self;
    fn is_missing(self) -> bool;
    fn is_end_of_vector(self) -> bool;
    /// Inside the reserved band (missing, end-of-vector, or one of the
    /// remaining reserved slots).
    fn is_reserved(self) -> bool;
    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
    fn from_i64(v: i64) -> Self;
}

macro_rules! impl_int_scalar {
    ($t:ty, $kind:expr, $missing:expr) => {
        impl Scalar for $t {
            const KIND: TypeKind = $kind;
            fn missing() -> Self {
                $missing
            }
            fn end_of_vector() -> Self {
                $missing + 1
            }
            fn is_missing(self) -> bool {
                self == $missing
            }
            fn is_end_of_vector(self) -> bool {
                self == $missing + 1
            }
            fn is_reserved(self) -> bool {
                self <= $missing + 7
            }
            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_le_bytes(buf)
            }
            fn from_i64(v: i64) -> Self {
                if v == i64::from(Self::missing()) || v == MISSING_INT64 {
                    Self::missing()
                } else if v == i64::from(Self::end_of_vector()) || v == END_OF_VECTOR_INT64 {
                    Self::end_of_vector()
                } else {
                    v as $t
                }
            }
        }
    };
}

impl_int_scalar!(i8, TypeKind::Int8, MISSING_INT8);
impl_int_scalar!(i16, TypeKind::Int16, MISSING_INT16);
impl_int_scalar!(i32, TypeKind::Int32, MISSING_INT32);

impl Scalar for i64 {
    const KIND: TypeKind = TypeKind::Int64;
    fn missing() -> Self {
        MISSING_INT64
    }
    fn end_of_vector() -> Self {
        END_OF_VECTOR_INT64
    }
    fn is_missing(self) -> bool {
        self == MISSING_INT64
    }
    fn is_end_of_vector(self) -> bool {
        self == END_OF_VECTOR_INT64
    }
    fn is_reserved(self) -> bool {
        self <= MISSING_INT64 + 7
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        i64::from_le_bytes(buf)
    }
    fn from_i64(v: i64) -> Self {
        v
    }
}

impl Scalar for f32 {
    const KIND: TypeKind = TypeKind::Float32;
    fn missing() -> Self {
        f32::from_bits(MISSING_FLOAT_BITS)
    }
    fn end_of_vector() -> Self {
        f32::from_bits(END_OF_VECTOR_FLOAT_BITS)
    }
    fn is_missing(self) -> bool {
        self.to_bits() == MISSING_FLOAT_BITS
    }
    fn is_end_of_vector(self) -> bool {
        self.to_bits() == END_OF_VECTOR_FLOAT_BITS
    }
    fn is_reserved(self) -> bool {
        self.is_nan()
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        f32::from_le_bytes(buf)
    }
    fn from_i64(v: i64) -> Self {
        if v == MISSING_INT64 {
            Self::missing()
        } else if v == END_OF_VECTOR_INT64 {
            Self::end_of_vector()
        } else {
            v as f32
        }
    }
}

impl Scalar for f64 {
    const KIND: TypeKind = TypeKind::Float64;
    fn missing() -> Self {
        f64::from_bits(MISSING_DOUBLE_BITS)
    }
    fn end_of_vector() -> Self {
        f64::from_bits(END_OF_VECTOR_DOUBLE_BITS)
    }
    fn is_missing(self) -> bool {
        self.to_bits() == MISSING_DOUBLE_BITS
    }
    fn is_end_of_vector(self) -> bool {
        self.to_bits() == END_OF_VECTOR_DOUBLE_BITS
    }
    fn is_reserved(self) -> bool {
        self.is_nan()
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(buf)
    }
    fn from_i64(v: i64) -> Self {
        if v == MISSING_INT64 {
            Self::missing()
        } else if v == END_OF_VECTOR_INT64 {
            Self::end_of_vector()
        } else {
            v as f64
        }
    }
}

/// Element storage, tagged by type. Sparse values keep only the non-zero
/// elements here.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueBuf {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<u8>),
}

impl ValueBuf {
    pub fn kind(&self) -> TypeKind {
        match self {
            ValueBuf::Int8(_) => TypeKind::Int8,
            ValueBuf::Int16(_) => TypeKind::Int16,
            ValueBuf::Int32(_) => TypeKind::Int32,
            ValueBuf::Int64(_) => TypeKind::Int64,
            ValueBuf::Float32(_) => TypeKind::Float32,
            ValueBuf::Float64(_) => TypeKind::Float64,
            ValueBuf::String(_) => TypeKind::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ValueBuf::Int8(v) => v.len(),
            ValueBuf::Int16(v) => v.len(),
            ValueBuf::Int32(v) => v.len(),
            ValueBuf::Int64(v) => v.len(),
            ValueBuf::Float32(v) => v.len(),
            ValueBuf::Float64(v) => v.len(),
            ValueBuf::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        match self {
            ValueBuf::Int8(v) => v.iter().for_each(|x| x.write_le(out)),
            ValueBuf::Int16(v) => v.iter().for_each(|x| x.write_le(out)),
            ValueBuf::Int32(v) => v.iter().for_each(|x| x.write_le(out)),
            ValueBuf::Int64(v) => v.iter().for_each(|x| x.write_le(out)),
            ValueBuf::Float32(v) => v.iter().for_each(|x| x.write_le(out)),
            ValueBuf::Float64(v) => v.iter().for_each(|x| x.write_le(out)),
            ValueBuf::String(v) => out.extend_from_slice(v),
        }
    }

    pub(crate) fn from_le_bytes(kind: TypeKind, count: usize, bytes: &[u8]) -> Result<ValueBuf> {
        let width = kind.width();
        if bytes.len() < count * width {
            return Err(SavError::Truncated);
        }
        fn gather<T: Scalar>(count: usize, bytes: &[u8]) -> Vec<T> {
            let width = std::mem::size_of::<T>();
            (0..count).map(|i| T::read_le(&bytes[i * width..])).collect()
        }
        Ok(match kind {
            TypeKind::Int8 => ValueBuf::Int8(gather(count, bytes)),
            TypeKind::Int16 => ValueBuf::Int16(gather(count, bytes)),
            TypeKind::Int32 => ValueBuf::Int32(gather(count, bytes)),
            TypeKind::Int64 => ValueBuf::Int64(gather(count, bytes)),
            TypeKind::Float32 => ValueBuf::Float32(gather(count, bytes)),
            TypeKind::Float64 => ValueBuf::Float64(gather(count, bytes)),
            TypeKind::String => ValueBuf::String(bytes[..count].to_vec()),
            TypeKind::Sparse => return Err(SavError::BadType(0)),
        })
    }
}

/// Delta-encoded positions of the non-zero elements of a sparse value. The
/// absolute index of element `i` is `sum(delta[0..=i]) + i`.
#[derive(Debug, Clone, PartialEq)]
pub enum OffsetBuf {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl OffsetBuf {
    pub fn kind(&self) -> TypeKind {
        match self {
            OffsetBuf::U8(_) => TypeKind::Int8,
            OffsetBuf::U16(_) => TypeKind::Int16,
            OffsetBuf::U32(_) => TypeKind::Int32,
            OffsetBuf::U64(_) => TypeKind::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OffsetBuf::U8(v) => v.len(),
            OffsetBuf::U16(v) => v.len(),
            OffsetBuf::U32(v) => v.len(),
            OffsetBuf::U64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_deltas(deltas: &[u64], kind: TypeKind) -> OffsetBuf {
        match kind {
            TypeKind::Int8 => OffsetBuf::U8(deltas.iter().map(|&d| d as u8).collect()),
            TypeKind::Int16 => OffsetBuf::U16(deltas.iter().map(|&d| d as u16).collect()),
            TypeKind::Int32 => OffsetBuf::U32(deltas.iter().map(|&d| d as u32).collect()),
            _ => OffsetBuf::U64(deltas.to_vec()),
        }
    }

    /// Delta at position `i`.
    pub fn delta(&self, i: usize) -> u64 {
        match self {
            OffsetBuf::U8(v) => u64::from(v[i]),
            OffsetBuf::U16(v) => u64::from(v[i]),
            OffsetBuf::U32(v) => u64::from(v[i]),
            OffsetBuf::U64(v) => v[i],
        }
    }

    /// Absolute element indices.
    pub fn absolute(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len());
        let mut acc = 0u64;
        for i in 0..self.len() {
            acc += self.delta(i);
            out.push((acc + i as u64) as usize);
        }
        out
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        match self {
            OffsetBuf::U8(v) => out.extend_from_slice(v),
            OffsetBuf::U16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            OffsetBuf::U32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            OffsetBuf::U64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
    }

    pub(crate) fn from_le_bytes(kind: TypeKind, count: usize, bytes: &[u8]) -> Result<OffsetBuf> {
        let width = kind.width();
        if bytes.len() < count * width {
            return Err(SavError::Truncated);
        }
        Ok(match kind {
            TypeKind::Int8 => OffsetBuf::U8(bytes[..count].to_vec()),
            TypeKind::Int16 => OffsetBuf::U16(
                (0..count)
                    .map(|i| u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]))
                    .collect(),
            ),
            TypeKind::Int32 => OffsetBuf::U32(
                (0..count)
                    .map(|i| {
                        let mut b = [0u8; 4];
                        b.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
                        u32::from_le_bytes(b)
                    })
                    .collect(),
            ),
            TypeKind::Int64 => OffsetBuf::U64(
                (0..count)
                    .map(|i| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
                        u64::from_le_bytes(b)
                    })
                    .collect(),
            ),
            other => return Err(SavError::BadType(other as u8)),
        })
    }
}

/// A typed scalar or vector with dense or sparse layout.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    size: usize,
    values: ValueBuf,
    offsets: Option<OffsetBuf>,
    pbwt_flag: bool,
}

impl Default for TypedValue {
    fn default() -> Self {
        TypedValue {
            size: 0,
            values: ValueBuf::Int8(Vec::new()),
            offsets: None,
            pbwt_flag: false,
        }
    }
}

impl TypedValue {
    pub(crate) fn from_parts(
        size: usize,
        values: ValueBuf,
        offsets: Option<OffsetBuf>,
        pbwt_flag: bool,
    ) -> Self {
        TypedValue {
            size,
            values,
            offsets,
            pbwt_flag,
        }
    }

    /// Builds a dense integer vector, choosing the narrowest element type
    /// that holds every non-reserved value.
    pub fn from_ints(values: &[i64]) -> Self {
        let mut min = 0i64;
        let mut max = 0i64;
        for &v in values {
            if !v.is_reserved() {
                if v > max {
                    max = v;
                } else if v < min {
                    min = v;
                }
            }
        }
        let kind = match (TypeKind::fitting_int(max), TypeKind::fitting_int(min)) {
            (a, b) if (a as u8) >= (b as u8) => a,
            (_, b) => b,
        };
        let values = match kind {
            TypeKind::Int8 => ValueBuf::Int8(values.iter().map(|&v| i8::from_i64(v)).collect()),
            TypeKind::Int16 => ValueBuf::Int16(values.iter().map(|&v| i16::from_i64(v)).collect()),
            TypeKind::Int32 => ValueBuf::Int32(values.iter().map(|&v| i32::from_i64(v)).collect()),
            _ => ValueBuf::Int64(values.to_vec()),
        };
        TypedValue {
            size: values.len(),
            values,
            offsets: None,
            pbwt_flag: false,
        }
    }

    pub fn from_floats(values: &[f32]) -> Self {
        TypedValue {
            size: values.len(),
            values: ValueBuf::Float32(values.to_vec()),
            offsets: None,
            pbwt_flag: false,
        }
    }

    pub fn from_doubles(values: &[f64]) -> Self {
        TypedValue {
            size: values.len(),
            values: ValueBuf::Float64(values.to_vec()),
            offsets: None,
            pbwt_flag: false,
        }
    }

    pub fn from_string(s: &str) -> Self {
        TypedValue {
            size: s.len(),
            values: ValueBuf::String(s.as_bytes().to_vec()),
            offsets: None,
            pbwt_flag: false,
        }
    }

    pub fn int_scalar(v: i64) -> Self {
        Self::from_ints(&[v])
    }

    pub fn float_scalar(v: f32) -> Self {
        Self::from_floats(&[v])
    }

    /// Flag value (the `1` written for INFO flags).
    pub fn flag() -> Self {
        Self::from_ints(&[1])
    }

    pub fn kind(&self) -> TypeKind {
        self.values.kind()
    }

    pub fn offset_kind(&self) -> Option<TypeKind> {
        self.offsets.as_ref().map(OffsetBuf::kind)
    }

    /// Logical element count.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Stored (non-zero) element count; equals `len` for dense values.
    pub fn non_zero_len(&self) -> usize {
        if self.is_sparse() {
            self.values.len()
        } else {
            self.size
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.offsets.is_some()
    }

    pub fn pbwt_flag(&self) -> bool {
        self.pbwt_flag
    }

    pub fn values(&self) -> &ValueBuf {
        &self.values
    }

    pub fn offsets(&self) -> Option<&OffsetBuf> {
        self.offsets.as_ref()
    }

    pub fn val_width(&self) -> usize {
        self.kind().width()
    }

    pub fn off_width(&self) -> usize {
        self.offset_kind().map_or(0, TypeKind::width)
    }

    /// First element as an integer, if the value is a non-empty integer
    /// vector. Sentinels map to `None`.
    pub fn get_int(&self) -> Option<i64> {
        let v = match &self.values {
            ValueBuf::Int8(v) => v.first().map(|&x| i64::from(x)).filter(|_| !v[0].is_reserved()),
            ValueBuf::Int16(v) => v.first().map(|&x| i64::from(x)).filter(|_| !v[0].is_reserved()),
            ValueBuf::Int32(v) => v.first().map(|&x| i64::from(x)).filter(|_| !v[0].is_reserved()),
            ValueBuf::Int64(v) => v.first().copied().filter(|x| !x.is_reserved()),
            _ => None,
        };
        if self.is_sparse() {
            // a sparse leading element is only the first stored one if its
            // absolute index is zero
            let first_abs = self.offsets.as_ref().and_then(|o| o.absolute().first().copied());
            if first_abs == Some(0) {
                v
            } else if self.size > 0 {
                Some(0)
            } else {
                None
            }
        } else {
            v
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match &self.values {
            ValueBuf::String(v) => Some(String::from_utf8_lossy(v).into_owned()),
            _ => None,
        }
    }

    /// Every element widened to `i64`, dense order, sentinels preserved.
    /// `None` for float/string values.
    pub fn dense_ints(&self) -> Option<Vec<i64>> {
        fn widen<T: Scalar + Into<i64>>(v: &[T]) -> Vec<i64> {
            v.iter()
                .map(|&x| {
                    if x.is_missing() {
                        MISSING_INT64
                    } else if x.is_end_of_vector() {
                        END_OF_VECTOR_INT64
                    } else {
                        x.into()
                    }
                })
                .collect()
        }
        let stored = match &self.values {
            ValueBuf::Int8(v) => widen(v),
            ValueBuf::Int16(v) => widen(v),
            ValueBuf::Int32(v) => widen(v),
            ValueBuf::Int64(v) => v.clone(),
            _ => return None,
        };
        match &self.offsets {
            None => Some(stored),
            Some(offsets) => {
                let mut dense = vec![0i64; self.size];
                for (abs, v) in offsets.absolute().into_iter().zip(stored) {
                    dense[abs] = v;
                }
                Some(dense)
            }
        }
    }

    pub fn dense_floats(&self) -> Option<Vec<f32>> {
        let stored = match &self.values {
            ValueBuf::Float32(v) => v.clone(),
            _ => return None,
        };
        match &self.offsets {
            None => Some(stored),
            Some(offsets) => {
                let mut dense = vec![0f32; self.size];
                for (abs, v) in offsets.absolute().into_iter().zip(stored) {
                    dense[abs] = v;
                }
                Some(dense)
            }
        }
    }

    /// Lossless conversion to the sparse layout. The offset type is the
    /// smallest unsigned integer type that holds the maximum delta.
    pub fn copy_as_sparse(&self) -> Result<TypedValue> {
        if self.is_sparse() {
            return Ok(self.clone());
        }
        fn split<T: Scalar>(values: &[T]) -> (Vec<u64>, Vec<T>, u64) {
            let mut deltas = Vec::new();
            let mut kept = Vec::new();
            let mut max_delta = 0u64;
            let mut last_off = 0usize;
            for (i, &v) in values.iter().enumerate() {
                if v != T::default() {
                    let delta = (i - last_off) as u64;
                    last_off = i + 1;
                    if delta > max_delta {
                        max_delta = delta;
                    }
                    deltas.push(delta);
                    kept.push(v);
                }
            }
            (deltas, kept, max_delta)
        }
        let (deltas, values, max_delta) = match &self.values {
            ValueBuf::Int8(v) => {
                let (d, k, m) = split(v);
                (d, ValueBuf::Int8(k), m)
            }
            ValueBuf::Int16(v) => {
                let (d, k, m) = split(v);
                (d, ValueBuf::Int16(k), m)
            }
            ValueBuf::Int32(v) => {
                let (d, k, m) = split(v);
                (d, ValueBuf::Int32(k), m)
            }
            ValueBuf::Int64(v) => {
                let (d, k, m) = split(v);
                (d, ValueBuf::Int64(k), m)
            }
            ValueBuf::Float32(v) => {
                let (d, k, m) = split(v);
                (d, ValueBuf::Float32(k), m)
            }
            ValueBuf::Float64(v) => {
                let (d, k, m) = split(v);
                (d, ValueBuf::Float64(k), m)
            }
            ValueBuf::String(_) => return Err(SavError::Unsupported("string values")),
        };
        let off_kind = TypeKind::fitting_offset(max_delta);
        Ok(TypedValue {
            size: self.size,
            values,
            offsets: Some(OffsetBuf::from_deltas(&deltas, off_kind)),
            pbwt_flag: self.pbwt_flag,
        })
    }

    /// Lossless conversion to the dense layout.
    pub fn copy_as_dense(&self) -> TypedValue {
        let offsets = match &self.offsets {
            None => return self.clone(),
            Some(offsets) => offsets.absolute(),
        };
        fn expand<T: Scalar>(size: usize, abs: &[usize], stored: &[T]) -> Vec<T> {
            let mut dense = vec![T::default(); size];
            for (&i, &v) in abs.iter().zip(stored) {
                dense[i] = v;
            }
            dense
        }
        let values = match &self.values {
            ValueBuf::Int8(v) => ValueBuf::Int8(expand(self.size, &offsets, v)),
            ValueBuf::Int16(v) => ValueBuf::Int16(expand(self.size, &offsets, v)),
            ValueBuf::Int32(v) => ValueBuf::Int32(expand(self.size, &offsets, v)),
            ValueBuf::Int64(v) => ValueBuf::Int64(expand(self.size, &offsets, v)),
            ValueBuf::Float32(v) => ValueBuf::Float32(expand(self.size, &offsets, v)),
            ValueBuf::Float64(v) => ValueBuf::Float64(expand(self.size, &offsets, v)),
            ValueBuf::String(v) => ValueBuf::String(v.clone()),
        };
        TypedValue {
            size: self.size,
            values,
            offsets: None,
            pbwt_flag: self.pbwt_flag,
        }
    }

    /// Projects the value onto a subset of samples. `subset_map[i]` gives
    /// the new position of sample `i`, or `None` when dropped; the vector
    /// stride is `len / subset_map.len()`.
    pub fn subset(&self, subset_map: &[Option<usize>], kept: usize) -> Result<TypedValue> {
        let n_samples = subset_map.len();
        if n_samples == 0 || self.size % n_samples != 0 {
            return Err(SavError::BadStride {
                size: self.size,
                n_samples,
            });
        }
        let stride = self.size / n_samples;
        if let Some(offsets) = &self.offsets {
            // single pass: remap absolute indices, then re-delta
            let abs = offsets.absolute();
            let keep: Vec<usize> = abs
                .iter()
                .enumerate()
                .filter_map(|(i, &a)| {
                    subset_map[a / stride].map(|new_sample| (i, new_sample * stride + a % stride))
                })
                .map(|(i, _)| i)
                .collect();
            let new_abs: Vec<usize> = abs
                .iter()
                .filter_map(|&a| subset_map[a / stride].map(|ns| ns * stride + a % stride))
                .collect();
            let mut deltas = Vec::with_capacity(new_abs.len());
            let mut last_off = 0usize;
            let mut max_delta = 0u64;
            for &a in &new_abs {
                let d = (a - last_off) as u64;
                last_off = a + 1;
                if d > max_delta {
                    max_delta = d;
                }
                deltas.push(d);
            }
            fn pick<T: Scalar>(v: &[T], keep: &[usize]) -> Vec<T> {
                keep.iter().map(|&i| v[i]).collect()
            }
            let values = match &self.values {
                ValueBuf::Int8(v) => ValueBuf::Int8(pick(v, &keep)),
                ValueBuf::Int16(v) => ValueBuf::Int16(pick(v, &keep)),
                ValueBuf::Int32(v) => ValueBuf::Int32(pick(v, &keep)),
                ValueBuf::Int64(v) => ValueBuf::Int64(pick(v, &keep)),
                ValueBuf::Float32(v) => ValueBuf::Float32(pick(v, &keep)),
                ValueBuf::Float64(v) => ValueBuf::Float64(pick(v, &keep)),
                ValueBuf::String(_) => return Err(SavError::Unsupported("string values")),
            };
            Ok(TypedValue {
                size: kept * stride,
                values,
                offsets: Some(OffsetBuf::from_deltas(
                    &deltas,
                    TypeKind::fitting_offset(max_delta),
                )),
                pbwt_flag: self.pbwt_flag,
            })
        } else {
            fn gather<T: Scalar>(
                v: &[T],
                subset_map: &[Option<usize>],
                stride: usize,
                kept: usize,
            ) -> Vec<T> {
                let mut out = vec![T::default(); kept * stride];
                for (old, new) in subset_map.iter().enumerate() {
                    if let Some(new) = new {
                        out[new * stride..(new + 1) * stride]
                            .copy_from_slice(&v[old * stride..(old + 1) * stride]);
                    }
                }
                out
            }
            let values = match &self.values {
                ValueBuf::Int8(v) => ValueBuf::Int8(gather(v, subset_map, stride, kept)),
                ValueBuf::Int16(v) => ValueBuf::Int16(gather(v, subset_map, stride, kept)),
                ValueBuf::Int32(v) => ValueBuf::Int32(gather(v, subset_map, stride, kept)),
                ValueBuf::Int64(v) => ValueBuf::Int64(gather(v, subset_map, stride, kept)),
                ValueBuf::Float32(v) => ValueBuf::Float32(gather(v, subset_map, stride, kept)),
                ValueBuf::Float64(v) => ValueBuf::Float64(gather(v, subset_map, stride, kept)),
                ValueBuf::String(_) => return Err(SavError::Unsupported("string values")),
            };
            Ok(TypedValue {
                size: kept * stride,
                values,
                offsets: None,
                pbwt_flag: self.pbwt_flag,
            })
        }
    }

    /// Transforms internal genotype representation (-1 handled as missing)
    /// into BCF's shifted encoding `(allele + 1) << 1 | phase`.
    pub fn bcf_gt_encode(&mut self, phased: bool) {
        fn enc<T: Scalar>(values: &mut [T], phased: bool)
        where
            T: Into<i64>,
        {
            for v in values.iter_mut() {
                if v.is_end_of_vector() {
                    continue;
                }
                let allele: i64 = if v.is_missing() { -1 } else { (*v).into() };
                *v = T::from_i64(((allele + 1) << 1) | i64::from(phased));
            }
        }
        match &mut self.values {
            ValueBuf::Int8(v) => enc(v, phased),
            ValueBuf::Int16(v) => enc(v, phased),
            ValueBuf::Int32(v) => enc(v, phased),
            ValueBuf::Int64(v) => enc(v, phased),
            _ => {}
        }
    }

    /// Inverse of `bcf_gt_encode`; phase bits are discarded.
    pub fn bcf_gt_decode(&mut self) {
        fn dec<T: Scalar>(values: &mut [T])
        where
            T: Into<i64>,
        {
            for v in values.iter_mut() {
                if v.is_end_of_vector() {
                    continue;
                }
                let raw: i64 = (*v).into();
                let allele = (raw as u64 >> 1) as i64 - 1;
                *v = if allele == -1 {
                    T::missing()
                } else {
                    T::from_i64(allele)
                };
            }
        }
        match &mut self.values {
            ValueBuf::Int8(v) => dec(v),
            ValueBuf::Int16(v) => dec(v),
            ValueBuf::Int32(v) => dec(v),
            ValueBuf::Int64(v) => dec(v),
            _ => {}
        }
    }

    /// Inverse of `bcf_gt_encode` that also extracts the phase bit of each
    /// non-leading allele slot into an int8 vector of `(stride - 1) *
    /// n_samples` elements.
    pub fn bcf_gt_decode_ph(&mut self, stride: usize) -> TypedValue {
        let mut phases = Vec::new();
        fn dec<T: Scalar>(values: &mut [T], stride: usize, phases: &mut Vec<i8>)
        where
            T: Into<i64>,
        {
            for (i, v) in values.iter_mut().enumerate() {
                let ph;
                if v.is_end_of_vector() {
                    ph = END_OF_VECTOR_INT8;
                } else {
                    let raw: i64 = (*v).into();
                    ph = (raw & 1) as i8;
                    let allele = (raw as u64 >> 1) as i64 - 1;
                    *v = if allele == -1 {
                        T::missing()
                    } else {
                        T::from_i64(allele)
                    };
                }
                if stride > 0 && i % stride != 0 {
                    phases.push(ph);
                }
            }
        }
        match &mut self.values {
            ValueBuf::Int8(v) => dec(v, stride, &mut phases),
            ValueBuf::Int16(v) => dec(v, stride, &mut phases),
            ValueBuf::Int32(v) => dec(v, stride, &mut phases),
            ValueBuf::Int64(v) => dec(v, stride, &mut phases),
            _ => {}
        }
        TypedValue {
            size: phases.len(),
            values: ValueBuf::Int8(phases),
            offsets: None,
            pbwt_flag: false,
        }
    }

    /// Serialized byte length, control bytes included.
    pub fn serialized_size(&self, size_divisor: usize) -> usize {
        let mut out = Vec::new();
        self.serialize(&mut out, size_divisor);
        out.len()
    }

    /// Writes the value in its self-describing form. `size_divisor` carries
    /// the per-sample stride for the BCF profile; SAV always passes 1.
    pub fn serialize(&self, out: &mut Vec<u8>, size_divisor: usize) {
        debug_assert!(!self.is_sparse() || size_divisor == 1);
        let sz = self.size / size_divisor;
        let tag = if self.is_sparse() {
            TypeKind::Sparse as u8
        } else {
            self.kind() as u8
        };
        out.push(((sz.min(15) as u8) << 4) | tag);
        if sz >= 15 {
            serialize_typed_scalar(sz as i64, out);
        }
        if let Some(offsets) = &self.offsets {
            if self.size > 0 {
                out.push(((offsets.kind() as u8) << 4) | self.kind() as u8);
                serialize_typed_scalar(self.values.len() as i64, out);
                offsets.write_le(out);
            }
        }
        self.values.write_le(out);
    }

    /// Writes a dense small-integer value through the PBWT permutation of
    /// `state`, advancing the permutation. The type tag carries the 0x08
    /// PBWT bit.
    pub fn serialize_pbwt(&self, out: &mut Vec<u8>, state: &mut PbwtState) -> Result<()> {
        if self.is_sparse() {
            return Err(SavError::Unsupported("PBWT over sparse layout"));
        }
        if !matches!(self.kind(), TypeKind::Int8 | TypeKind::Int16) {
            return Err(SavError::Unsupported("PBWT over wide or non-integer values"));
        }
        out.push(((self.size.min(15) as u8) << 4) | 0x08 | self.kind() as u8);
        if self.size >= 15 {
            serialize_typed_scalar(self.size as i64, out);
        }
        match &self.values {
            ValueBuf::Int8(v) => {
                let sorted = pbwt::sort(v, state);
                sorted.iter().for_each(|x| x.write_le(out));
            }
            ValueBuf::Int16(v) => {
                let sorted = pbwt::sort(v, state);
                sorted.iter().for_each(|x| x.write_le(out));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Undoes the PBWT permutation of a value freshly parsed from disk.
    pub fn pbwt_unsort(&mut self, state: &mut PbwtState) -> Result<()> {
        if self.is_sparse() {
            return Err(SavError::Unsupported("PBWT over sparse layout"));
        }
        match &mut self.values {
            ValueBuf::Int8(v) => {
                let restored = pbwt::unsort(v, state);
                *v = restored;
            }
            ValueBuf::Int16(v) => {
                let restored = pbwt::unsort(v, state);
                *v = restored;
            }
            _ => return Err(SavError::Unsupported("PBWT over wide or non-integer values")),
        }
        self.pbwt_flag = false;
        Ok(())
    }
}

/// Writes a BCF typed integer scalar: one control byte `(1 << 4) | kind`
/// followed by the little-endian value of the narrowest fitting width.
pub fn serialize_typed_scalar(val: i64, out: &mut Vec<u8>) {
    let kind = TypeKind::fitting_int(val);
    out.push((1u8 << 4) | kind as u8);
    match kind {
        TypeKind::Int8 => out.push(val as i8 as u8),
        TypeKind::Int16 => out.extend_from_slice(&(val as i16).to_le_bytes()),
        TypeKind::Int32 => out.extend_from_slice(&(val as i32).to_le_bytes()),
        _ => out.extend_from_slice(&val.to_le_bytes()),
    }
}

/// Writes a BCF typed string (control byte with size nibble, escape, raw
/// bytes).
pub fn serialize_typed_str(s: &str, out: &mut Vec<u8>) {
    out.push(((s.len().min(15) as u8) << 4) | TypeKind::String as u8);
    if s.len() >= 15 {
        serialize_typed_scalar(s.len() as i64, out);
    }
    out.extend_from_slice(s.as_bytes());
}

/// Writes a BCF typed int32 vector (filter ids).
pub fn serialize_typed_int_vec(vals: &[i32], out: &mut Vec<u8>) {
    out.push(((vals.len().min(15) as u8) << 4) | TypeKind::Int32 as u8);
    if vals.len() >= 15 {
        serialize_typed_scalar(vals.len() as i64, out);
    }
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
}
