use hashbrown::HashSet;

use super::{DeviceMesh, MeshDim};
use crate::Error;
use crate::tree::TreePath;

/// Specifies how a single array dimension is distributed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DimDistribution {
    /// Dimension is sharded across one or more mesh dimensions, major to minor.
    Sharded(Vec<MeshDim>),
    /// Dimension is replicated (not sharded).
    Replicated,
}

impl DimDistribution {
    /// Shards the dimension across a single mesh dimension.
    pub fn sharded<S: Into<String>>(axis_name: S) -> Self {
        Self::Sharded(vec![MeshDim::new(axis_name)])
    }

    /// Shards the dimension across several mesh dimensions, the first being the major one.
    pub fn sharded_by<I, S>(axis_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Sharded(axis_names.into_iter().map(MeshDim::new).collect())
    }

    /// The mesh dimensions this array dimension is split over.
    pub fn mesh_dims(&self) -> &[MeshDim] {
        match self {
            Self::Sharded(dims) => dims,
            Self::Replicated => &[],
        }
    }
}

/// Describes how an array is laid out over the named axes of a mesh.
///
/// Entry `i` describes array dimension `i`; dimensions past the end of the spec are
/// replicated. An input dimension sharded over mesh axes is split into equal blocks, one
/// per coordinate of those axes. An output dimension sharded over mesh axes is rebuilt
/// by concatenating the blocks. Mesh axes that a spec does not mention mean replication
/// for inputs, and a promise that all instances agree for outputs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PartitionSpec {
    /// Distribution pattern for each array dimension
    dim_distributions: Vec<DimDistribution>,
}

impl PartitionSpec {
    /// Creates a spec from per-dimension distributions.
    pub fn new(dim_distributions: Vec<DimDistribution>) -> Self {
        Self { dim_distributions }
    }

    /// The fully replicated spec.
    pub fn replicated() -> Self {
        Self::default()
    }

    /// Shards the leading dimension over `axis_name`.
    pub fn sharded<S: Into<String>>(axis_name: S) -> Self {
        Self::new(vec![DimDistribution::sharded(axis_name)])
    }

    /// Per-dimension distributions.
    pub fn dim_distributions(&self) -> &[DimDistribution] {
        &self.dim_distributions
    }

    /// Number of array dimensions this spec describes.
    pub fn rank(&self) -> usize {
        self.dim_distributions.len()
    }

    /// Whether no dimension is sharded.
    pub fn is_fully_replicated(&self) -> bool {
        self.dim_distributions
            .iter()
            .all(|dist| dist.mesh_dims().is_empty())
    }

    /// All mesh dimensions named by this spec, in dimension order.
    pub fn mesh_dims(&self) -> impl Iterator<Item = &MeshDim> {
        self.dim_distributions
            .iter()
            .flat_map(DimDistribution::mesh_dims)
    }

    /// Checks that every named axis exists in `mesh`, is manual and is used once.
    pub(crate) fn check_axes(
        &self,
        mesh: &DeviceMesh,
        manual_axes: &[String],
        path: &TreePath,
    ) -> Result<(), Error> {
        let mut used = HashSet::new();
        for dim in self.mesh_dims() {
            if mesh.axis_index(dim.name()).is_none() {
                return Err(Error::UnknownMeshAxis {
                    axis_name: dim.name().to_string(),
                });
            }
            if !manual_axes.iter().any(|axis| axis == dim.name()) {
                return Err(Error::AxisNotManual {
                    axis_name: dim.name().to_string(),
                });
            }
            if !used.insert(dim.name()) {
                return Err(Error::DuplicatePartitionAxis {
                    axis_name: dim.name().to_string(),
                    path: path.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A tree of partition specs whose structure is a prefix of the value tree it describes.
///
/// A [`SpecTree::Spec`] leaf applies to every array below the matching position of the
/// value tree. Tuples and records must match the value tree node for node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpecTree {
    /// One spec for the whole matching subtree.
    Spec(PartitionSpec),
    /// Positional children.
    Tuple(Vec<SpecTree>),
    /// Named children, matched by name against a record.
    Record(Vec<(String, SpecTree)>),
}

impl SpecTree {
    /// A fully replicated spec leaf.
    pub fn replicated() -> Self {
        Self::Spec(PartitionSpec::replicated())
    }

    /// A tuple of spec trees.
    pub fn tuple<I, T>(children: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<SpecTree>,
    {
        Self::Tuple(children.into_iter().map(Into::into).collect())
    }

    /// A record of named spec trees.
    pub fn record<I, S, T>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<SpecTree>,
    {
        Self::Record(
            fields
                .into_iter()
                .map(|(name, spec)| (name.into(), spec.into()))
                .collect(),
        )
    }
}

impl From<PartitionSpec> for SpecTree {
    fn from(spec: PartitionSpec) -> Self {
        Self::Spec(spec)
    }
}

impl<T: Into<SpecTree>, const N: usize> From<[T; N]> for SpecTree {
    fn from(children: [T; N]) -> Self {
        Self::tuple(children)
    }
}
