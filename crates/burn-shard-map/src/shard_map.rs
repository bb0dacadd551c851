//! The distributed map primitive.
//!
//! [`shard_map`] runs a function once per coordinate of the manual mesh axes, each instance
//! on its own thread with its own block of every input array. Inputs and outputs are trees
//! of arrays described by [`SpecTree`]s; the only non-array leaf it accepts is a
//! [`StaticBox`](crate::tree::StaticBox) output under a fully replicated spec.

use std::thread;

use log::{debug, trace};

use crate::collective::{Rendezvous, ShardContext};
use crate::sharding::{DeviceMesh, ManualGrid, PartitionSpec, SpecTree, current_mesh};
use crate::tree::{Record, Tree, TreePath};
use crate::{Error, ShardedTensor};

/// Configuration of a shard map.
///
/// Nothing is validated here; mismatches between specs, mesh and values surface on the
/// first call.
#[derive(Clone, Debug, PartialEq)]
pub struct ShardMapConfig {
    in_specs: SpecTree,
    out_specs: SpecTree,
    mesh: Option<DeviceMesh>,
    axis_names: Vec<String>,
    check_vma: bool,
}

impl ShardMapConfig {
    /// Creates a config using the ambient mesh, every mesh axis, and replication checks.
    pub fn new<I, O>(in_specs: I, out_specs: O) -> Self
    where
        I: Into<SpecTree>,
        O: Into<SpecTree>,
    {
        Self {
            in_specs: in_specs.into(),
            out_specs: out_specs.into(),
            mesh: None,
            axis_names: Vec::new(),
            check_vma: true,
        }
    }

    /// Uses `mesh` instead of the ambient one.
    pub fn with_mesh(mut self, mesh: DeviceMesh) -> Self {
        self.mesh = Some(mesh);
        self
    }

    /// Restricts the manual axes to `axis_names`.
    pub fn with_axis_names<I, S>(mut self, axis_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.axis_names = axis_names.into_iter().map(Into::into).collect();
        self
    }

    /// Enables or disables the runtime check of replicated outputs.
    pub fn with_check_vma(mut self, check_vma: bool) -> Self {
        self.check_vma = check_vma;
        self
    }

    /// Specs of the positional arguments.
    pub fn in_specs(&self) -> &SpecTree {
        &self.in_specs
    }

    /// Specs of the output.
    pub fn out_specs(&self) -> &SpecTree {
        &self.out_specs
    }

    /// The explicit mesh, if one was given.
    pub fn mesh(&self) -> Option<&DeviceMesh> {
        self.mesh.as_ref()
    }

    /// The manual axes; empty means every mesh axis.
    pub fn axis_names(&self) -> &[String] {
        &self.axis_names
    }

    /// Whether replicated outputs are checked at runtime.
    pub fn check_vma(&self) -> bool {
        self.check_vma
    }

    /// The same config with both spec trees replaced.
    pub(crate) fn with_specs(&self, in_specs: SpecTree, out_specs: SpecTree) -> Self {
        Self {
            in_specs,
            out_specs,
            ..self.clone()
        }
    }
}

/// A function mapped over the instances of a mesh. See [`shard_map`].
#[derive(Clone, Debug)]
pub struct ShardMap<F> {
    fun: F,
    config: ShardMapConfig,
}

/// Maps `fun` over the manual axes described by `config`.
///
/// `fun` receives the positional arguments of one instance and returns its output tree.
pub fn shard_map<F>(fun: F, config: ShardMapConfig) -> ShardMap<F>
where
    F: Fn(&ShardContext<'_>, Vec<Tree>) -> Result<Tree, Error> + Sync,
{
    ShardMap { fun, config }
}

impl<F> ShardMap<F>
where
    F: Fn(&ShardContext<'_>, Vec<Tree>) -> Result<Tree, Error> + Sync,
{
    /// The configuration this map was built with.
    pub fn config(&self) -> &ShardMapConfig {
        &self.config
    }

    /// Splits `args`, runs every instance and assembles the outputs.
    pub fn call(&self, args: Vec<Tree>) -> Result<Tree, Error> {
        let mesh = match &self.config.mesh {
            Some(mesh) => mesh.clone(),
            None => current_mesh().ok_or(Error::MissingMesh)?,
        };
        let grid = ManualGrid::new(&mesh, &self.config.axis_names)?;
        let splitter = Splitter {
            mesh: &mesh,
            grid: &grid,
        };

        let root = TreePath::root();
        let inputs = splitter.split(&Tree::Tuple(args), &self.config.in_specs, &root)?;
        debug!(
            "shard_map: {} instances over manual axes {:?}",
            grid.instance_count(),
            grid.axis_names()
        );

        let outputs = self.run(&grid, inputs)?;

        let assembler = Assembler {
            splitter,
            check_vma: self.config.check_vma,
        };
        let output = assembler.assemble(outputs, &self.config.out_specs, &root)?;
        debug!("shard_map: assembled {}", output.kind());
        Ok(output)
    }

    fn run(&self, grid: &ManualGrid, inputs: Vec<Tree>) -> Result<Vec<Tree>, Error> {
        let rendezvous = Rendezvous::new(grid.instance_count());

        let results: Vec<Result<Tree, Error>> = thread::scope(|scope| {
            let handles: Vec<_> = inputs
                .into_iter()
                .enumerate()
                .map(|(instance, args)| {
                    let (fun, rendezvous) = (&self.fun, &rendezvous);
                    scope.spawn(move || {
                        let _departure = rendezvous.departure();
                        let ctx = ShardContext::new(instance, grid, rendezvous);
                        trace!("shard_map: instance {instance} at {:?}", ctx.coordinate());
                        let args = match args {
                            Tree::Tuple(args) => args,
                            other => vec![other],
                        };
                        fun(&ctx, args)
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(instance, handle)| {
                    handle
                        .join()
                        .unwrap_or(Err(Error::ShardPanicked { instance }))
                })
                .collect()
        });

        // An aborted collective is a symptom; report the instance that caused it.
        let mut outputs = Vec::with_capacity(results.len());
        let mut failure: Option<Error> = None;
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(error) => {
                    let replace = match &failure {
                        None => true,
                        Some(Error::CollectiveAborted) => {
                            !matches!(error, Error::CollectiveAborted)
                        }
                        Some(_) => false,
                    };
                    if replace {
                        failure = Some(error);
                    }
                }
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(outputs),
        }
    }
}

/// Splits an input tree into one tree per instance.
#[derive(Clone, Copy)]
struct Splitter<'a> {
    mesh: &'a DeviceMesh,
    grid: &'a ManualGrid,
}

impl Splitter<'_> {
    fn count(&self) -> usize {
        self.grid.instance_count()
    }

    fn check(&self, spec: &PartitionSpec, path: &TreePath) -> Result<(), Error> {
        spec.check_axes(self.mesh, self.grid.axis_names(), path)
    }

    fn split(&self, value: &Tree, spec: &SpecTree, path: &TreePath) -> Result<Vec<Tree>, Error> {
        if let SpecTree::Spec(spec) = spec {
            self.check(spec, path)?;
            return self.split_leaves(value, spec, path);
        }
        if matches!(value, Tree::Empty) {
            return Ok(vec![Tree::Empty; self.count()]);
        }

        let node = Node::of(value);
        let specs = node_specs(spec, &node, path, value)?;
        let columns = children(value)
            .into_iter()
            .zip(specs)
            .enumerate()
            .map(|(idx, (child, spec))| self.split(child, spec, &node.child_path(path, idx)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows(columns, self.count())
            .into_iter()
            .map(|row| node.close(row))
            .collect())
    }

    fn split_leaves(
        &self,
        value: &Tree,
        spec: &PartitionSpec,
        path: &TreePath,
    ) -> Result<Vec<Tree>, Error> {
        match value {
            Tree::Array(array) => Ok(ShardedTensor::split(array, spec, self.grid, path)?
                .into_shards()
                .into_iter()
                .map(Tree::Array)
                .collect()),
            Tree::Empty => Ok(vec![Tree::Empty; self.count()]),
            Tree::Static(_) | Tree::Boxed(_) => Err(Error::NonArrayInput {
                path: path.to_string(),
            }),
            Tree::Tuple(_) | Tree::Record(_) => {
                let node = Node::of(value);
                let columns = children(value)
                    .into_iter()
                    .enumerate()
                    .map(|(idx, child)| {
                        self.split_leaves(child, spec, &node.child_path(path, idx))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows(columns, self.count())
                    .into_iter()
                    .map(|row| node.close(row))
                    .collect())
            }
        }
    }
}

/// Rebuilds the global output tree from the per-instance outputs.
struct Assembler<'a> {
    splitter: Splitter<'a>,
    check_vma: bool,
}

impl Assembler<'_> {
    fn assemble(
        &self,
        outputs: Vec<Tree>,
        spec: &SpecTree,
        path: &TreePath,
    ) -> Result<Tree, Error> {
        if let SpecTree::Spec(spec) = spec {
            self.splitter.check(spec, path)?;
            return self.assemble_leaves(outputs, spec, path);
        }
        let Some(first) = outputs.first() else {
            return Ok(Tree::Empty);
        };
        if outputs.iter().all(|output| matches!(output, Tree::Empty)) {
            return Ok(Tree::Empty);
        }

        let node = Node::of(first);
        let specs = node_specs(spec, &node, path, first)?;
        let children = columns(outputs, &node, path)?
            .into_iter()
            .zip(specs)
            .enumerate()
            .map(|(idx, (column, spec))| self.assemble(column, spec, &node.child_path(path, idx)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(node.close(children))
    }

    fn assemble_leaves(
        &self,
        outputs: Vec<Tree>,
        spec: &PartitionSpec,
        path: &TreePath,
    ) -> Result<Tree, Error> {
        let Some(first) = outputs.first() else {
            return Ok(Tree::Empty);
        };
        match first {
            Tree::Array(_) => {
                let shards = outputs
                    .into_iter()
                    .enumerate()
                    .map(|(instance, output)| match output {
                        Tree::Array(array) => Ok(array),
                        other => Err(mismatch(instance, path, "array", &other)),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let grid = self.splitter.grid;
                ShardedTensor::from_shards(shards, spec.clone(), grid, path)?
                    .assemble(grid, self.check_vma, path)
                    .map(Tree::Array)
            }
            // Static output is never compared across instances: the first one is kept.
            Tree::Boxed(_) => {
                if !spec.is_fully_replicated() {
                    return Err(Error::ShardedStaticOutput {
                        path: path.to_string(),
                    });
                }
                let mut outputs = outputs.into_iter().enumerate();
                let first = outputs.next().map_or(Tree::Empty, |(_, output)| output);
                match outputs.find(|(_, output)| !matches!(output, Tree::Boxed(_))) {
                    Some((instance, other)) => {
                        Err(mismatch(instance, path, "boxed static value", &other))
                    }
                    None => Ok(first),
                }
            }
            Tree::Static(_) => Err(Error::NonArrayOutput {
                path: path.to_string(),
            }),
            Tree::Empty => match outputs
                .into_iter()
                .enumerate()
                .find(|(_, output)| !matches!(output, Tree::Empty))
            {
                Some((instance, other)) => {
                    Err(mismatch(instance, path, "empty placeholder", &other))
                }
                None => Ok(Tree::Empty),
            },
            Tree::Tuple(_) | Tree::Record(_) => {
                let node = Node::of(first);
                let children = columns(outputs, &node, path)?
                    .into_iter()
                    .enumerate()
                    .map(|(idx, column)| {
                        self.assemble_leaves(column, spec, &node.child_path(path, idx))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(node.close(children))
            }
        }
    }
}

/// Interior structure of a tree node, without its children.
#[derive(Clone, Debug, PartialEq)]
enum Node {
    Leaf,
    Tuple(usize),
    Record { name: String, fields: Vec<String> },
}

impl Node {
    fn of(tree: &Tree) -> Self {
        match tree {
            Tree::Tuple(children) => Self::Tuple(children.len()),
            Tree::Record(record) => Self::Record {
                name: record.name().to_string(),
                fields: record.fields().iter().map(|(name, _)| name.clone()).collect(),
            },
            _ => Self::Leaf,
        }
    }

    /// The children of `tree` if it has this structure, `tree` itself otherwise.
    fn open(&self, tree: Tree) -> Result<Vec<Tree>, Tree> {
        if Node::of(&tree) != *self {
            return Err(tree);
        }
        match tree {
            Tree::Tuple(children) => Ok(children),
            Tree::Record(record) => Ok(record
                .into_parts()
                .1
                .into_iter()
                .map(|(_, child)| child)
                .collect()),
            other => Err(other),
        }
    }

    fn close(&self, children: Vec<Tree>) -> Tree {
        match self {
            Self::Tuple(_) => Tree::Tuple(children),
            Self::Record { name, fields } => Tree::Record(Record::from_parts(
                name.clone(),
                fields.iter().cloned().zip(children).collect(),
            )),
            Self::Leaf => children.into_iter().next().unwrap_or(Tree::Empty),
        }
    }

    fn child_path(&self, path: &TreePath, idx: usize) -> TreePath {
        match self {
            Self::Record { fields, .. } => path.field(&fields[idx]),
            _ => path.index(idx),
        }
    }
}

fn children(tree: &Tree) -> Vec<&Tree> {
    match tree {
        Tree::Tuple(children) => children.iter().collect(),
        Tree::Record(record) => record.fields().iter().map(|(_, child)| child).collect(),
        _ => Vec::new(),
    }
}

/// The spec of every child of `node`, in child order.
fn node_specs<'s>(
    spec: &'s SpecTree,
    node: &Node,
    path: &TreePath,
    value: &Tree,
) -> Result<Vec<&'s SpecTree>, Error> {
    let structure = |reason: String| Error::SpecStructureMismatch {
        path: path.to_string(),
        reason,
    };
    match (spec, node) {
        (SpecTree::Tuple(specs), Node::Tuple(len)) => {
            if specs.len() != *len {
                return Err(structure(format!(
                    "spec tuple of length {} for a tuple of length {len}",
                    specs.len()
                )));
            }
            Ok(specs.iter().collect())
        }
        (SpecTree::Record(specs), Node::Record { name, fields }) => {
            if specs.len() != fields.len() {
                return Err(structure(format!(
                    "spec record with {} fields for record '{name}' with {} fields",
                    specs.len(),
                    fields.len()
                )));
            }
            fields
                .iter()
                .map(|field| {
                    specs
                        .iter()
                        .find(|(spec_field, _)| spec_field == field)
                        .map(|(_, spec)| spec)
                        .ok_or_else(|| {
                            structure(format!("no spec for field '{field}' of record '{name}'"))
                        })
                })
                .collect()
        }
        (spec, _) => Err(structure(format!(
            "{} spec for a {}",
            spec_kind(spec),
            value.kind()
        ))),
    }
}

fn spec_kind(spec: &SpecTree) -> &'static str {
    match spec {
        SpecTree::Spec(_) => "partition",
        SpecTree::Tuple(_) => "tuple",
        SpecTree::Record(_) => "record",
    }
}

fn mismatch(instance: usize, path: &TreePath, expected: &str, found: &Tree) -> Error {
    Error::OutputStructureMismatch {
        instance,
        path: path.to_string(),
        reason: format!("expected {expected}, found {}", found.kind()),
    }
}

/// Turns per-child columns (one entry per instance) into per-instance rows.
fn rows(columns: Vec<Vec<Tree>>, count: usize) -> Vec<Vec<Tree>> {
    let mut rows: Vec<Vec<Tree>> = (0..count)
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        for (row, item) in rows.iter_mut().zip(column) {
            row.push(item);
        }
    }
    rows
}

/// Turns per-instance outputs sharing the structure `node` into per-child columns.
fn columns(outputs: Vec<Tree>, node: &Node, path: &TreePath) -> Result<Vec<Vec<Tree>>, Error> {
    let width = match node {
        Node::Tuple(len) => *len,
        Node::Record { fields, .. } => fields.len(),
        Node::Leaf => 1,
    };
    let mut columns: Vec<Vec<Tree>> = (0..width)
        .map(|_| Vec::with_capacity(outputs.len()))
        .collect();
    for (instance, output) in outputs.into_iter().enumerate() {
        let items = node.open(output).map_err(|other| Error::OutputStructureMismatch {
            instance,
            path: path.to_string(),
            reason: format!("found a {} with a different structure", other.kind()),
        })?;
        for (column, item) in columns.iter_mut().zip(items) {
            column.push(item);
        }
    }
    Ok(columns)
}
