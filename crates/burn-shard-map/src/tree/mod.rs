//! Heterogeneous value trees.
//!
//! A [`Tree`] mixes array leaves with arbitrary non-array ("static") data such as
//! strings, numbers, closures or whole state handles. Sharded execution only ever sees
//! the array part; [`partition`] splits a tree into its array and non-array halves and
//! [`combine`] puts them back together.

mod convert;
mod filter;
mod path;

pub use convert::*;
pub use filter::*;
pub use path::*;

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

use crate::{Error, Tensor};

/// A nested value whose leaves are arrays, static values, boxed static subtrees or
/// placeholders.
#[derive(Clone, Debug, PartialEq)]
pub enum Tree {
    /// A numeric array.
    Array(Tensor),
    /// A non-array value.
    Static(StaticValue),
    /// A static subtree carried as a single opaque leaf.
    Boxed(StaticBox),
    /// Positional children.
    Tuple(Vec<Tree>),
    /// A named structure with named fields.
    Record(Record),
    /// A hole left behind by [`partition`].
    Empty,
}

impl Tree {
    /// Builds a tuple from anything convertible into trees.
    pub fn tuple<I, T>(children: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tree>,
    {
        Self::Tuple(children.into_iter().map(Into::into).collect())
    }

    /// Wraps any `Send + Sync` value as an opaque static leaf.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Self::Static(StaticValue::Opaque(Opaque::new(value)))
    }

    /// Whether this node is a leaf (anything but a tuple or record).
    pub fn is_leaf(&self) -> bool {
        !matches!(self, Self::Tuple(_) | Self::Record(_))
    }

    /// Short description of the node kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Array(_) => "array",
            Self::Static(_) => "static value",
            Self::Boxed(_) => "boxed static value",
            Self::Tuple(_) => "tuple",
            Self::Record(_) => "record",
            Self::Empty => "empty placeholder",
        }
    }

    /// The array held by this leaf.
    pub fn as_array(&self) -> Option<&Tensor> {
        match self {
            Self::Array(array) => Some(array),
            _ => None,
        }
    }

    /// The static value held by this leaf.
    pub fn as_static(&self) -> Option<&StaticValue> {
        match self {
            Self::Static(value) => Some(value),
            _ => None,
        }
    }

    /// The string held by this leaf.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Static(StaticValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    /// The children of a tuple node.
    pub fn as_tuple(&self) -> Option<&[Tree]> {
        match self {
            Self::Tuple(children) => Some(children),
            _ => None,
        }
    }

    /// A named field of a record node.
    pub fn field(&self, name: &str) -> Option<&Tree> {
        match self {
            Self::Record(record) => record.field(name),
            _ => None,
        }
    }

    /// Applies `f` to every array leaf in depth-first order, keeping everything else.
    pub fn try_map_arrays<F>(self, mut f: F) -> Result<Tree, Error>
    where
        F: FnMut(Tensor) -> Result<Tensor, Error>,
    {
        self.map_arrays_with(&mut f)
    }

    fn map_arrays_with<F>(self, f: &mut F) -> Result<Tree, Error>
    where
        F: FnMut(Tensor) -> Result<Tensor, Error>,
    {
        match self {
            Self::Array(array) => f(array).map(Self::Array),
            Self::Tuple(children) => children
                .into_iter()
                .map(|child| child.map_arrays_with(f))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Tuple),
            Self::Record(record) => {
                let (name, fields) = record.into_parts();
                let fields = fields
                    .into_iter()
                    .map(|(field, child)| Ok((field, child.map_arrays_with(f)?)))
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(Self::Record(Record::from_parts(name, fields)))
            }
            leaf => Ok(leaf),
        }
    }
}

/// A named structure, such as a layer with array parameters and static configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    name: String,
    fields: Vec<(String, Tree)>,
}

impl Record {
    /// Creates an empty record called `name`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field.
    pub fn with_field<S: Into<String>, T: Into<Tree>>(mut self, name: S, value: T) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// The record's type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[(String, Tree)] {
        &self.fields
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&Tree> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Removes and returns a field by name.
    pub fn take_field(&mut self, name: &str) -> Option<Tree> {
        let idx = self.fields.iter().position(|(field, _)| field == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub(crate) fn into_parts(self) -> (String, Vec<(String, Tree)>) {
        (self.name, self.fields)
    }

    pub(crate) fn from_parts(name: String, fields: Vec<(String, Tree)>) -> Self {
        Self { name, fields }
    }
}

impl From<Record> for Tree {
    fn from(record: Record) -> Self {
        Self::Record(record)
    }
}

/// Non-array leaf values.
#[derive(Clone, Debug, PartialEq)]
pub enum StaticValue {
    /// Absence of a value.
    None,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A host float (not an array).
    Float(f64),
    /// A string.
    Str(Arc<str>),
    /// Anything else, compared by identity.
    Opaque(Opaque),
}

/// A shared, type-erased value compared by identity.
///
/// Closures, handles and other values that have no tree structure of their own are
/// carried as opaque leaves. Cloning shares the underlying value.
#[derive(Clone)]
pub struct Opaque {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    /// Wraps `value`.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: core::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    /// Borrows the value as `T`, if that is its type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Name of the wrapped type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether both handles share the same value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque<{}>", self.type_name)
    }
}

/// A static subtree travelling as one indivisible leaf.
///
/// `shard_map` never looks inside a box: a boxed output under a replicated spec is taken
/// from the first instance as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct StaticBox(Arc<Tree>);

impl StaticBox {
    /// Boxes `value`.
    pub fn new(value: Tree) -> Self {
        Self(Arc::new(value))
    }

    /// Borrows the boxed tree.
    pub fn value(&self) -> &Tree {
        &self.0
    }

    /// Returns the boxed tree, cloning it only if the box is shared.
    pub fn into_value(self) -> Tree {
        Arc::unwrap_or_clone(self.0)
    }
}
