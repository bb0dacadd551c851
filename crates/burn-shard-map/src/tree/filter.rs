use super::{Record, Tree, TreePath};
use crate::Error;

/// Whether `tree` is an array leaf.
pub fn is_array(tree: &Tree) -> bool {
    matches!(tree, Tree::Array(_))
}

/// Splits `tree` into two trees of the same structure.
///
/// The first holds the leaves for which `predicate` returns `true`, the second holds the
/// others; every leaf missing from one side is replaced by [`Tree::Empty`]. Empty leaves
/// stay empty on both sides.
pub fn partition<P>(tree: Tree, predicate: P) -> (Tree, Tree)
where
    P: Fn(&Tree) -> bool,
{
    partition_with(tree, &predicate)
}

fn partition_with<P>(tree: Tree, predicate: &P) -> (Tree, Tree)
where
    P: Fn(&Tree) -> bool,
{
    match tree {
        Tree::Tuple(children) => {
            let (matching, rest) = children
                .into_iter()
                .map(|child| partition_with(child, predicate))
                .unzip();
            (Tree::Tuple(matching), Tree::Tuple(rest))
        }
        Tree::Record(record) => {
            let (name, fields) = record.into_parts();
            let (matching, rest) = fields
                .into_iter()
                .map(|(field, child)| {
                    let (matching, rest) = partition_with(child, predicate);
                    ((field.clone(), matching), (field, rest))
                })
                .unzip();
            (
                Tree::Record(Record::from_parts(name.clone(), matching)),
                Tree::Record(Record::from_parts(name, rest)),
            )
        }
        Tree::Empty => (Tree::Empty, Tree::Empty),
        leaf if predicate(&leaf) => (leaf, Tree::Empty),
        leaf => (Tree::Empty, leaf),
    }
}

/// Merges two trees of the same structure, filling the holes of `first` from `second`.
///
/// At each leaf position the first non-empty leaf wins. Fails if the interior structure
/// of the two trees differs.
pub fn combine(first: Tree, second: Tree) -> Result<Tree, Error> {
    combine_at(first, second, &TreePath::root())
}

fn combine_at(first: Tree, second: Tree, path: &TreePath) -> Result<Tree, Error> {
    match (first, second) {
        (Tree::Tuple(left), Tree::Tuple(right)) => {
            if left.len() != right.len() {
                return Err(Error::TreeStructureMismatch {
                    path: path.to_string(),
                    reason: format!("tuples of length {} and {}", left.len(), right.len()),
                });
            }
            left.into_iter()
                .zip(right)
                .enumerate()
                .map(|(idx, (left, right))| combine_at(left, right, &path.index(idx)))
                .collect::<Result<Vec<_>, _>>()
                .map(Tree::Tuple)
        }
        (Tree::Record(left), Tree::Record(right)) => {
            let (name, left) = left.into_parts();
            let (other_name, right) = right.into_parts();
            if name != other_name || left.len() != right.len() {
                return Err(Error::TreeStructureMismatch {
                    path: path.to_string(),
                    reason: format!("records '{name}' and '{other_name}' differ"),
                });
            }
            let fields = left
                .into_iter()
                .zip(right)
                .map(|((field, left), (other_field, right))| {
                    if field != other_field {
                        return Err(Error::TreeStructureMismatch {
                            path: path.to_string(),
                            reason: format!("fields '{field}' and '{other_field}' differ"),
                        });
                    }
                    let child = combine_at(left, right, &path.field(&field))?;
                    Ok((field, child))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Tree::Record(Record::from_parts(name, fields)))
        }
        (Tree::Empty, other) | (other, Tree::Empty) => Ok(other),
        (leaf, other) if leaf.is_leaf() && other.is_leaf() => Ok(leaf),
        (left, right) => Err(Error::TreeStructureMismatch {
            path: path.to_string(),
            reason: format!("cannot combine a {} with a {}", left.kind(), right.kind()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Opaque, StaticValue};
    use ndarray::arr1;
    use pretty_assertions::assert_eq;

    fn mixed() -> Tree {
        Tree::Tuple(vec![
            Tree::Array(arr1(&[1.0f32, 2.0]).into_dyn()),
            Tree::from("metadata"),
            Record::new("layer")
                .with_field("weight", arr1(&[3.0f32]).into_dyn())
                .with_field("activation", "relu")
                .into(),
        ])
    }

    #[test]
    fn partition_separates_arrays_from_static_leaves() {
        let (arrays, statics) = partition(mixed(), is_array);

        assert_eq!(
            arrays,
            Tree::Tuple(vec![
                Tree::Array(arr1(&[1.0f32, 2.0]).into_dyn()),
                Tree::Empty,
                Record::new("layer")
                    .with_field("weight", arr1(&[3.0f32]).into_dyn())
                    .with_field("activation", Tree::Empty)
                    .into(),
            ])
        );
        assert_eq!(
            statics,
            Tree::Tuple(vec![
                Tree::Empty,
                Tree::from("metadata"),
                Record::new("layer")
                    .with_field("weight", Tree::Empty)
                    .with_field("activation", "relu")
                    .into(),
            ])
        );
    }

    #[test]
    fn combine_restores_the_partitioned_tree() {
        let (arrays, statics) = partition(mixed(), is_array);

        assert_eq!(combine(arrays, statics).unwrap(), mixed());
    }

    #[test]
    fn combine_keeps_opaque_identity() {
        let handle = Opaque::new(|x: f32| x + 1.0);
        let tree = Tree::tuple([StaticValue::Opaque(handle.clone())]);

        let (arrays, statics) = partition(tree, is_array);
        let restored = combine(arrays, statics).unwrap();

        match restored.as_tuple().and_then(|items| items[0].as_static()) {
            Some(StaticValue::Opaque(restored)) => assert!(restored.ptr_eq(&handle)),
            other => panic!("unexpected leaf {other:?}"),
        }
    }

    #[test]
    fn combine_rejects_structure_mismatch() {
        let result = combine(
            Tree::Tuple(vec![Tree::Empty]),
            Tree::Tuple(vec![Tree::Empty, Tree::Empty]),
        );

        assert!(matches!(result, Err(Error::TreeStructureMismatch { .. })));
    }

    #[test]
    fn combine_of_empty_and_subtree_takes_the_subtree() {
        let subtree = Tree::tuple(["a", "b"]);

        assert_eq!(combine(Tree::Empty, subtree.clone()).unwrap(), subtree);
    }
}
