use hashbrown::HashMap;
use ndarray::{ArrayD, IxDyn, Slice};

use crate::Error;
use crate::sharding::{ManualGrid, PartitionSpec};
use crate::tree::TreePath;

/// Host-side dense array used for every array leaf.
pub type Tensor = ArrayD<f32>;

/// Represents a tensor that is distributed (sharded or replicated) across the instances of a
/// shard map.
///
/// A `ShardedTensor` holds one local shard per instance, along with metadata describing how
/// the full tensor is partitioned. The distribution is defined by a [`PartitionSpec`], which
/// specifies per-dimension distribution strategies over the manual axes of a
/// [`ManualGrid`].
#[derive(Clone, Debug, PartialEq)]
pub struct ShardedTensor {
    /// Local shard of each instance, in instance order
    local_shards: Vec<Tensor>,
    /// Specification of how this tensor is sharded
    spec: PartitionSpec,
    /// Global shape of the tensor (across all instances)
    global_shape: Vec<usize>,
}

impl ShardedTensor {
    /// Splits `global` into one shard per instance of `grid`.
    pub fn split(
        global: &Tensor,
        spec: &PartitionSpec,
        grid: &ManualGrid,
        path: &TreePath,
    ) -> Result<Self, Error> {
        check_rank(spec, global.ndim(), path)?;

        let origin = vec![0; grid.axis_names().len()];
        for (dimension, (dist, &size)) in spec
            .dim_distributions()
            .iter()
            .zip(global.shape())
            .enumerate()
        {
            let (_, partitions) = grid.block(dist.mesh_dims(), &origin);
            if size % partitions != 0 {
                return Err(Error::IndivisibleDimension {
                    path: path.to_string(),
                    dimension,
                    size,
                    partitions,
                });
            }
        }

        let local_shards = (0..grid.instance_count())
            .map(|instance| {
                let blocks = blocks_for(spec, grid, global.ndim(), instance);
                global
                    .slice_each_axis(|desc| {
                        let (index, count) = blocks[desc.axis.index()];
                        let chunk = desc.len / count;
                        Slice::from(index * chunk..(index + 1) * chunk)
                    })
                    .to_owned()
            })
            .collect();

        Ok(Self {
            local_shards,
            spec: spec.clone(),
            global_shape: global.shape().to_vec(),
        })
    }

    /// Wraps the per-instance outputs of a shard map, checking that they agree in shape.
    pub fn from_shards(
        local_shards: Vec<Tensor>,
        spec: PartitionSpec,
        grid: &ManualGrid,
        path: &TreePath,
    ) -> Result<Self, Error> {
        let Some(first) = local_shards.first() else {
            return Err(Error::OutputStructureMismatch {
                instance: 0,
                path: path.to_string(),
                reason: "no instance produced a shard".to_string(),
            });
        };
        let local_shape = first.shape().to_vec();
        if let Some((instance, shard)) = local_shards
            .iter()
            .enumerate()
            .find(|(_, shard)| shard.shape() != local_shape.as_slice())
        {
            let shape = shard.shape();
            return Err(Error::OutputStructureMismatch {
                instance,
                path: path.to_string(),
                reason: format!("shard shape {shape:?} differs from {local_shape:?}"),
            });
        }
        check_rank(&spec, local_shape.len(), path)?;

        let origin = vec![0; grid.axis_names().len()];
        let global_shape = local_shape
            .iter()
            .enumerate()
            .map(|(dim, &size)| match spec.dim_distributions().get(dim) {
                Some(dist) => size * grid.block(dist.mesh_dims(), &origin).1,
                None => size,
            })
            .collect();

        Ok(Self {
            local_shards,
            spec,
            global_shape,
        })
    }

    /// Local shards in instance order.
    pub fn local_shards(&self) -> &[Tensor] {
        &self.local_shards
    }

    /// Consumes the sharded tensor, returning its local shards.
    pub fn into_shards(self) -> Vec<Tensor> {
        self.local_shards
    }

    /// The partition spec describing the layout.
    pub fn spec(&self) -> &PartitionSpec {
        &self.spec
    }

    /// Shape of the full tensor.
    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    /// Rebuilds the full tensor.
    ///
    /// Sharded dimensions are concatenated block by block. Instances that land on an already
    /// filled block must agree with it when `check_vma` is set; otherwise the lowest instance
    /// wins.
    pub fn assemble(
        &self,
        grid: &ManualGrid,
        check_vma: bool,
        path: &TreePath,
    ) -> Result<Tensor, Error> {
        let mut global = Tensor::zeros(IxDyn(&self.global_shape));
        let mut filled: HashMap<Vec<usize>, usize> = HashMap::new();

        for (instance, shard) in self.local_shards.iter().enumerate() {
            let blocks = blocks_for(&self.spec, grid, shard.ndim(), instance);
            let key: Vec<usize> = blocks.iter().map(|(index, _)| *index).collect();

            if let Some(&owner) = filled.get(&key) {
                if check_vma && self.local_shards[owner] != *shard {
                    return Err(Error::ReplicationCheckFailed {
                        path: path.to_string(),
                        axis_name: self.divergent_axis(grid, owner, instance),
                    });
                }
                continue;
            }

            global
                .slice_each_axis_mut(|desc| {
                    let (index, _) = blocks[desc.axis.index()];
                    let chunk = shard.shape()[desc.axis.index()];
                    Slice::from(index * chunk..(index + 1) * chunk)
                })
                .assign(shard);
            filled.insert(key, instance);
        }

        Ok(global)
    }

    fn divergent_axis(&self, grid: &ManualGrid, left: usize, right: usize) -> String {
        let (left, right) = (grid.coordinate(left), grid.coordinate(right));
        grid.axis_names()
            .iter()
            .enumerate()
            .find(|(pos, name)| {
                left[*pos] != right[*pos]
                    && !self.spec.mesh_dims().any(|dim| dim.name() == name.as_str())
            })
            .map(|(_, name)| name.clone())
            .unwrap_or_default()
    }
}

fn check_rank(spec: &PartitionSpec, array_rank: usize, path: &TreePath) -> Result<(), Error> {
    if spec.rank() > array_rank {
        return Err(Error::RankMismatch {
            path: path.to_string(),
            spec_rank: spec.rank(),
            array_rank,
        });
    }
    Ok(())
}

/// `(block index, block count)` of `instance` along every array dimension.
fn blocks_for(
    spec: &PartitionSpec,
    grid: &ManualGrid,
    rank: usize,
    instance: usize,
) -> Vec<(usize, usize)> {
    let coordinate = grid.coordinate(instance);
    (0..rank)
        .map(|dim| match spec.dim_distributions().get(dim) {
            Some(dist) => grid.block(dist.mesh_dims(), &coordinate),
            None => (0, 1),
        })
        .collect()
}
