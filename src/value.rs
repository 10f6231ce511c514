use std::num::NonZero;

use ndarray::{ArcArray, IxDyn};
use rustc_hash::FxHashMap;

use crate::error::RunError;

/// Stable index of a value in a [`Graph`](crate::Graph).
///
/// Every intermediate tensor, graph input, initializer and graph output is a
/// distinct value. Value IDs are dense `u32` indices and are used to index
/// flat per-value tables in execution plans and frames.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ValueId(NonZero<u32>);

impl ValueId {
    /// Return the underlying u32 value of the ID.
    pub fn as_u32(self) -> u32 {
        self.0.get() - 1
    }

    /// Return the underlying ID value as a usize, for slice indexing.
    pub fn as_usize(self) -> usize {
        self.as_u32() as usize
    }

    /// Construct a value ID from a u32 value.
    ///
    /// Panics if the value exceeds `i32::MAX`.
    pub fn from_u32(value: u32) -> ValueId {
        // IDs are limited to `i32::MAX` so that a negative `i32` remains
        // available as a niche for serialized formats that encode missing
        // optional values that way.
        assert!(value <= i32::MAX as u32);

        // Valid IDs are in the range `[0, i32::MAX]`, so we store them as
        // values in `[1, i32::MAX + 1]` internally and reserve 0 as a niche
        // to make `Option<ValueId>` the same size as `ValueId`.
        ValueId(unsafe {
            // Safety: `value + 1` cannot be zero
            NonZero::new_unchecked(value + 1)
        })
    }
}

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_u32().fmt(f)
    }
}

impl std::fmt::Debug for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValueId({})", self.as_u32())
    }
}

/// Element type of a tensor value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Int32,
    Int8,
    UInt8,
}

impl DataType {
    /// Size of one element of this type in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Float => 4,
            DataType::Int32 => 4,
            DataType::Int8 => 1,
            DataType::UInt8 => 1,
        }
    }
}

/// Logical type of a value.
///
/// Values are usually tensors, but subgraph-bearing operators also pass
/// opaque sequence, map and optional values around. The planner never
/// attempts buffer sharing for non-tensor values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    Tensor(DataType),
    Sequence,
    Map,
    Optional,
}

impl ValueType {
    pub fn is_tensor(self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }

    /// Size of one element in bytes, if this is a tensor type.
    pub fn element_size(self) -> Option<usize> {
        match self {
            ValueType::Tensor(dtype) => Some(dtype.size()),
            _ => None,
        }
    }
}

/// Represents the size of a dimension of a runtime-provided value, such as
/// an operator input, output or intermediate value.
#[derive(Clone, Debug, PartialEq)]
pub enum Dimension {
    /// A dimension whose expected size is fixed and specified as part of the
    /// model.
    Fixed(usize),

    /// A dimension whose size is determined at runtime. The symbol provides
    /// a name to identify when different values share a size.
    Symbolic(String),
}

/// Static metadata for a value: its name, logical type and expected shape.
///
/// The shape may mix fixed and named-symbolic dimensions, or be absent
/// entirely when shape inference could not determine it.
#[derive(Clone, Debug)]
pub struct ValueInfo {
    name: String,
    ty: ValueType,
    shape: Option<Vec<Dimension>>,
}

impl ValueInfo {
    pub fn new(name: &str, ty: ValueType, shape: Option<Vec<Dimension>>) -> ValueInfo {
        ValueInfo {
            name: name.to_owned(),
            ty,
            shape,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> ValueType {
        self.ty
    }

    pub fn shape(&self) -> Option<&[Dimension]> {
        self.shape.as_deref()
    }
}

/// Bidirectional mapping between value names and [`ValueId`]s.
///
/// The map is populated while the graph is built and is read-only during
/// planning and execution.
#[derive(Default)]
pub struct ValueMap {
    ids: FxHashMap<String, ValueId>,
    names: Vec<String>,
}

impl ValueMap {
    pub fn new() -> ValueMap {
        ValueMap::default()
    }

    /// Register a new value name and return its ID.
    ///
    /// Panics if the name is already registered, as duplicate names would
    /// make the reverse mapping ambiguous.
    pub fn add(&mut self, name: &str) -> ValueId {
        let id = ValueId::from_u32(self.names.len() as u32);
        let prev = self.ids.insert(name.to_owned(), id);
        assert!(prev.is_none(), "duplicate value name \"{}\"", name);
        self.names.push(name.to_owned());
        id
    }

    /// Look up the ID of a value by name.
    pub fn id(&self, name: &str) -> Option<ValueId> {
        self.ids.get(name).copied()
    }

    /// Look up the name of a value by ID.
    pub fn name(&self, id: ValueId) -> Result<&str, RunError> {
        self.names
            .get(id.as_usize())
            .map(|s| s.as_str())
            .ok_or(RunError::IndexOutOfRange {
                index: id.as_u32(),
                len: self.names.len(),
            })
    }

    /// Number of registered values.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterate over `(name, id)` pairs in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ValueId)> + '_ {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), ValueId::from_u32(i as u32)))
    }
}

/// Reference-counted tensor storage used for runtime buffers.
///
/// Cloning bumps a reference count rather than copying, so aliased values
/// produced by the planner's reuse decisions genuinely share one allocation.
pub type TensorData<T> = ArcArray<T, IxDyn>;

/// A runtime buffer bound to a value index by the execution frame.
#[derive(Clone, Debug)]
pub enum Value {
    Float(TensorData<f32>),
    Int32(TensorData<i32>),
}

impl Value {
    /// Build a float tensor value.
    ///
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Value {
        Value::Float(
            ArcArray::from_shape_vec(IxDyn(shape), data).expect("data length does not match shape"),
        )
    }

    /// Build an int32 tensor value.
    ///
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Value {
        Value::Int32(
            ArcArray::from_shape_vec(IxDyn(shape), data).expect("data length does not match shape"),
        )
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Value::Float(_) => DataType::Float,
            Value::Int32(_) => DataType::Int32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Float(t) => t.shape(),
            Value::Int32(t) => t.shape(),
        }
    }

    /// Number of elements in the value.
    pub fn len(&self) -> usize {
        match self {
            Value::Float(t) => t.len(),
            Value::Int32(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_float(&self) -> Option<&TensorData<f32>> {
        match self {
            Value::Float(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int32(&self) -> Option<&TensorData<i32>> {
        match self {
            Value::Int32(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_float(self) -> Option<TensorData<f32>> {
        match self {
            Value::Float(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_int32(self) -> Option<TensorData<i32>> {
        match self {
            Value::Int32(t) => Some(t),
            _ => None,
        }
    }
}

impl From<TensorData<f32>> for Value {
    fn from(data: TensorData<f32>) -> Value {
        Value::Float(data)
    }
}

impl From<TensorData<i32>> for Value {
    fn from(data: TensorData<i32>) -> Value {
        Value::Int32(data)
    }
}

#[cfg(test)]
mod tests {
    use super::{DataType, Value, ValueId, ValueMap, ValueType};

    #[test]
    fn test_value_id_niche() {
        assert_eq!(
            std::mem::size_of::<Option<ValueId>>(),
            std::mem::size_of::<ValueId>()
        );
        let id = ValueId::from_u32(42);
        assert_eq!(id.as_u32(), 42);
        assert_eq!(id.as_usize(), 42);
    }

    #[test]
    fn test_value_map_round_trip() {
        let mut map = ValueMap::new();
        let x = map.add("x");
        let y = map.add("y");

        assert_eq!(map.len(), 2);
        assert_eq!(map.id("x"), Some(x));
        assert_eq!(map.id("y"), Some(y));
        assert_eq!(map.id("z"), None);
        assert_eq!(map.name(x).unwrap(), "x");
        assert_eq!(map.name(y).unwrap(), "y");

        let missing = ValueId::from_u32(7);
        assert!(map.name(missing).is_err());
    }

    #[test]
    fn test_element_sizes() {
        assert_eq!(ValueType::Tensor(DataType::Float).element_size(), Some(4));
        assert_eq!(ValueType::Tensor(DataType::Int8).element_size(), Some(1));
        assert_eq!(ValueType::Sequence.element_size(), None);
        assert!(!ValueType::Map.is_tensor());
    }

    #[test]
    fn test_value_accessors() {
        let v = Value::from_f32(&[2, 2], vec![1., 2., 3., 4.]);
        assert_eq!(v.dtype(), DataType::Float);
        assert_eq!(v.shape(), &[2, 2]);
        assert_eq!(v.len(), 4);
        assert!(v.as_float().is_some());
        assert!(v.as_int32().is_none());

        // Clones share the same allocation.
        let w = v.clone();
        let (Value::Float(a), Value::Float(b)) = (&v, &w) else {
            unreachable!();
        };
        assert_eq!(a.as_ptr(), b.as_ptr());
    }
}
