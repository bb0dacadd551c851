use alloc::sync::Arc;
use core::any::Any;

use super::{StaticValue, Tree};
use crate::{Error, Tensor};

/// Rebuilds a typed value from a [`Tree`].
///
/// Values go into a tree through [`Into<Tree>`]; this is the way back out.
pub trait FromTree: Sized {
    /// Converts `tree` into `Self`, failing if the tree has the wrong shape.
    fn from_tree(tree: Tree) -> Result<Self, Error>;
}

fn unexpected(expected: &str, found: &Tree) -> Error {
    Error::UnexpectedTree {
        expected: expected.to_string(),
        found: found.kind().to_string(),
    }
}

impl From<Tensor> for Tree {
    fn from(array: Tensor) -> Self {
        Tree::Array(array)
    }
}

impl From<StaticValue> for Tree {
    fn from(value: StaticValue) -> Self {
        Tree::Static(value)
    }
}

impl From<bool> for Tree {
    fn from(value: bool) -> Self {
        Tree::Static(StaticValue::Bool(value))
    }
}

impl From<i64> for Tree {
    fn from(value: i64) -> Self {
        Tree::Static(StaticValue::Int(value))
    }
}

impl From<f64> for Tree {
    fn from(value: f64) -> Self {
        Tree::Static(StaticValue::Float(value))
    }
}

impl From<&str> for Tree {
    fn from(value: &str) -> Self {
        Tree::Static(StaticValue::Str(Arc::from(value)))
    }
}

impl From<String> for Tree {
    fn from(value: String) -> Self {
        Tree::Static(StaticValue::Str(Arc::from(value)))
    }
}

impl<T: Into<Tree>> From<Option<T>> for Tree {
    fn from(value: Option<T>) -> Self {
        value.map_or(Tree::Static(StaticValue::None), Into::into)
    }
}

impl<T: Into<Tree>> From<Vec<T>> for Tree {
    fn from(values: Vec<T>) -> Self {
        Tree::tuple(values)
    }
}

impl<A: Into<Tree>, B: Into<Tree>> From<(A, B)> for Tree {
    fn from((a, b): (A, B)) -> Self {
        Tree::Tuple(vec![a.into(), b.into()])
    }
}

impl<A: Into<Tree>, B: Into<Tree>, C: Into<Tree>> From<(A, B, C)> for Tree {
    fn from((a, b, c): (A, B, C)) -> Self {
        Tree::Tuple(vec![a.into(), b.into(), c.into()])
    }
}

impl FromTree for Tree {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        Ok(tree)
    }
}

impl FromTree for Tensor {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        match tree {
            Tree::Array(array) => Ok(array),
            other => Err(unexpected("array", &other)),
        }
    }
}

impl FromTree for bool {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        match tree {
            Tree::Static(StaticValue::Bool(value)) => Ok(value),
            other => Err(unexpected("bool", &other)),
        }
    }
}

impl FromTree for i64 {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        match tree {
            Tree::Static(StaticValue::Int(value)) => Ok(value),
            other => Err(unexpected("integer", &other)),
        }
    }
}

impl FromTree for f64 {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        match tree {
            Tree::Static(StaticValue::Float(value)) => Ok(value),
            other => Err(unexpected("float", &other)),
        }
    }
}

impl FromTree for String {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        match tree {
            Tree::Static(StaticValue::Str(value)) => Ok(value.to_string()),
            other => Err(unexpected("string", &other)),
        }
    }
}

impl<T: FromTree> FromTree for Option<T> {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        match tree {
            Tree::Static(StaticValue::None) => Ok(None),
            other => T::from_tree(other).map(Some),
        }
    }
}

impl<T: FromTree> FromTree for Vec<T> {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        match tree {
            Tree::Tuple(children) => children.into_iter().map(T::from_tree).collect(),
            other => Err(unexpected("tuple", &other)),
        }
    }
}

impl<A: FromTree, B: FromTree> FromTree for (A, B) {
    fn from_tree(tree: Tree) -> Result<Self, Error> {
        match tree {
            Tree::Tuple(children) => match <[Tree; 2]>::try_from(children) {
                Ok([a, b]) => Ok((A::from_tree(a)?, B::from_tree(b)?)),
                Err(children) => Err(Error::UnexpectedTree {
                    expected: "tuple of length 2".to_string(),
                    found: format!("tuple of length {}", children.len()),
                }),
            },
            other => Err(unexpected("tuple of length 2", &other)),
        }
    }
}

impl Tree {
    /// Converts this tree into `T`.
    pub fn into_typed<T: FromTree>(self) -> Result<T, Error> {
        T::from_tree(self)
    }

    /// Clones the opaque value of type `T` held by this leaf.
    pub fn opaque_value<T: Any + Clone>(&self) -> Result<T, Error> {
        match self {
            Tree::Static(StaticValue::Opaque(opaque)) => opaque
                .downcast_ref::<T>()
                .cloned()
                .ok_or_else(|| Error::UnexpectedTree {
                    expected: core::any::type_name::<T>().to_string(),
                    found: opaque.type_name().to_string(),
                }),
            other => Err(unexpected("opaque value", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn typed_values_round_trip_through_trees() {
        let tree: Tree = (arr1(&[1.0f32, 2.0]).into_dyn(), "name").into();

        let (array, name): (Tensor, String) = tree.into_typed().unwrap();

        assert_eq!(array, arr1(&[1.0f32, 2.0]).into_dyn());
        assert_eq!(name, "name");
    }

    #[test]
    fn wrong_kind_is_reported() {
        let result = Tree::from("not an array").into_typed::<Tensor>();

        assert_eq!(
            result,
            Err(Error::UnexpectedTree {
                expected: "array".to_string(),
                found: "static value".to_string()
            })
        );
    }

    #[test]
    fn options_map_to_none() {
        let none = Tree::from(None::<bool>);
        let some = Tree::from(Some(true));

        assert_eq!(none.into_typed::<Option<bool>>(), Ok(None));
        assert_eq!(some.into_typed::<Option<bool>>(), Ok(Some(true)));
    }

    #[test]
    fn opaque_values_are_cloned_out() {
        let tree = Tree::opaque(42u32);

        assert_eq!(tree.opaque_value::<u32>(), Ok(42));
        assert!(tree.opaque_value::<u64>().is_err());
    }
}
