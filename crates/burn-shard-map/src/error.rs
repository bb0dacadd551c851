use thiserror::Error;

use crate::sharding::DeviceMeshError;

/// Errors produced while building, dispatching or assembling a sharded call.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum Error {
    /// Keyword arguments were passed to a wrapper that only accepts positional arguments.
    #[error("filter_shard_map takes no keyword arguments (got {names:?})")]
    KeywordArguments {
        /// The keyword names, in call order.
        names: Vec<String>,
    },

    /// The device mesh could not be constructed.
    #[error(transparent)]
    DeviceMesh(#[from] DeviceMeshError),

    /// No mesh was configured and none is active in the ambient context.
    #[error("no mesh was provided and no ambient mesh is active")]
    MissingMesh,

    /// A partition spec or axis restriction references an axis the mesh does not have.
    #[error("unknown mesh axis '{axis_name}'")]
    UnknownMeshAxis {
        /// The unknown name.
        axis_name: String,
    },

    /// A partition spec names an axis over which the mapped function is not manual.
    #[error("mesh axis '{axis_name}' is not a manual axis")]
    AxisNotManual {
        /// The axis name.
        axis_name: String,
    },

    /// The same mesh axis is used more than once in one partition spec.
    #[error("mesh axis '{axis_name}' is used twice in the spec at {path}")]
    DuplicatePartitionAxis {
        /// The repeated axis.
        axis_name: String,
        /// Location of the spec in the argument tree.
        path: String,
    },

    /// A partition spec has more dimensions than the array it describes.
    #[error("spec at {path} has rank {spec_rank} > array rank {array_rank}")]
    RankMismatch {
        /// Location of the array in the argument tree.
        path: String,
        /// Number of dimensions the spec describes.
        spec_rank: usize,
        /// Number of dimensions of the array.
        array_rank: usize,
    },

    /// An array dimension cannot be split evenly over the mesh axes sharding it.
    #[error("dimension {dimension} at {path} ({size}) splits unevenly")]
    IndivisibleDimension {
        /// Location of the array in the argument tree.
        path: String,
        /// The array dimension being split.
        dimension: usize,
        /// Its size.
        size: usize,
        /// Number of blocks it is split into.
        partitions: usize,
    },

    /// The spec tree is not a prefix of the value tree it is applied to.
    #[error("spec tree does not match value tree at {path}: {reason}")]
    SpecStructureMismatch {
        /// Location of the mismatch.
        path: String,
        /// What differs.
        reason: String,
    },

    /// `shard_map` received a non-array leaf as input.
    #[error("shard_map inputs must be arrays (at {path})")]
    NonArrayInput {
        /// Location of the leaf.
        path: String,
    },

    /// `shard_map` received a non-array leaf as output.
    #[error("shard_map outputs must be arrays (at {path})")]
    NonArrayOutput {
        /// Location of the leaf.
        path: String,
    },

    /// A boxed static output was given a spec that shards it.
    #[error("boxed static output at {path} must be fully replicated")]
    ShardedStaticOutput {
        /// Location of the box.
        path: String,
    },

    /// Different instances returned differently shaped outputs.
    #[error("output of instance {instance} differs at {path}: {reason}")]
    OutputStructureMismatch {
        /// The instance whose output differs from instance 0.
        instance: usize,
        /// Location of the mismatch.
        path: String,
        /// What differs.
        reason: String,
    },

    /// An output declared as replicated along an axis differs between instances.
    #[error("output at {path} is not replicated over '{axis_name}'")]
    ReplicationCheckFailed {
        /// Location of the output.
        path: String,
        /// The axis along which copies differ.
        axis_name: String,
    },

    /// A collective or axis query names an axis that is not bound by the enclosing shard map.
    #[error("unbound axis name '{axis_name}'")]
    UnboundAxisName {
        /// The axis name.
        axis_name: String,
    },

    /// A collective could not complete because another instance failed or returned early.
    #[error("collective aborted: another instance left before joining")]
    CollectiveAborted,

    /// Tensors passed to a collective have incompatible shapes.
    #[error("collective operand shapes differ: {expected:?} vs {got:?}")]
    CollectiveShapeMismatch {
        /// Shape of this instance's operand.
        expected: Vec<usize>,
        /// Shape of the other operand.
        got: Vec<usize>,
    },

    /// A dimension index is out of range for an array.
    #[error("dimension {dimension} is out of range for rank {rank}")]
    InvalidDimension {
        /// The requested dimension.
        dimension: usize,
        /// Rank of the array.
        rank: usize,
    },

    /// An instance panicked while running the mapped function.
    #[error("instance {instance} panicked in the mapped function")]
    ShardPanicked {
        /// The instance that panicked.
        instance: usize,
    },

    /// Two trees that should share a structure do not.
    #[error("tree structure mismatch at {path}: {reason}")]
    TreeStructureMismatch {
        /// Location of the mismatch.
        path: String,
        /// What differs.
        reason: String,
    },

    /// A tree did not have the expected kind of node or leaf.
    #[error("expected {expected}, found {found}")]
    UnexpectedTree {
        /// What was expected.
        expected: String,
        /// What was found.
        found: String,
    },

    /// A state index has no entry in the state handle.
    #[error("state has no entry for index {index}")]
    MissingStateEntry {
        /// Id of the index.
        index: u64,
    },

    /// A state entry holds a value of a different type than the index expects.
    #[error("state entry {index} does not hold a value of type {expected}")]
    StateTypeMismatch {
        /// Id of the index.
        index: u64,
        /// Type the index expects.
        expected: &'static str,
    },

    /// A tensor has the wrong shape for an operation.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape.
        got: Vec<usize>,
    },

    /// A layer configuration is invalid.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },
}
