use super::mesh::coordinate_for_linear_index;
use super::{DeviceMesh, MeshDim};
use crate::Error;

/// The manual axes of a shard map and the instances laid out over them.
///
/// A shard map runs its function once per coordinate of its manual axes. Instances are
/// numbered in row-major order over those axes, which keeps the mesh's axis order.
/// Mesh axes that are not manual do not multiply the instance count: data is simply
/// replicated along them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManualGrid {
    names: Vec<String>,
    sizes: Vec<usize>,
}

impl ManualGrid {
    /// Selects `axis_names` from `mesh`, or every mesh axis when `axis_names` is empty.
    pub fn new(mesh: &DeviceMesh, axis_names: &[String]) -> Result<Self, Error> {
        if let Some(unknown) = axis_names
            .iter()
            .find(|name| mesh.axis_index(name.as_str()).is_none())
        {
            return Err(Error::UnknownMeshAxis {
                axis_name: unknown.clone(),
            });
        }

        let (names, sizes) = mesh
            .axis_names()
            .into_iter()
            .zip(mesh.shape().iter().copied())
            .filter(|(name, _)| axis_names.is_empty() || axis_names.iter().any(|axis| axis == name))
            .map(|(name, size)| (name.to_string(), size))
            .unzip();

        Ok(Self { names, sizes })
    }

    /// A grid with no manual axes and a single instance.
    pub(crate) const fn empty() -> Self {
        Self {
            names: Vec::new(),
            sizes: Vec::new(),
        }
    }

    /// Manual axis names in mesh order.
    pub fn axis_names(&self) -> &[String] {
        &self.names
    }

    /// Number of instances the mapped function runs as.
    pub fn instance_count(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Position of a manual axis.
    pub fn axis_position(&self, axis_name: &str) -> Option<usize> {
        self.names.iter().position(|name| name == axis_name)
    }

    /// Size of a manual axis.
    pub fn axis_size(&self, axis_name: &str) -> Option<usize> {
        self.axis_position(axis_name).map(|pos| self.sizes[pos])
    }

    /// Coordinate of `instance` over the manual axes.
    pub fn coordinate(&self, instance: usize) -> Vec<usize> {
        coordinate_for_linear_index(instance, &self.sizes)
    }

    /// Index and count of the block that `coordinate` selects when splitting over `dims`.
    ///
    /// The first dimension is the major one. Dimensions that are not manual axes are
    /// ignored; specs are validated before they reach this point.
    pub fn block(&self, dims: &[MeshDim], coordinate: &[usize]) -> (usize, usize) {
        dims.iter()
            .filter_map(|dim| self.axis_position(dim.name()))
            .fold((0, 1), |(index, count), pos| {
                (index * self.sizes[pos] + coordinate[pos], count * self.sizes[pos])
            })
    }

    /// Instances sharing `instance`'s coordinate on every manual axis not in `axes`,
    /// in instance order.
    pub fn group(&self, instance: usize, axes: &[usize]) -> Vec<usize> {
        let origin = self.coordinate(instance);
        (0..self.instance_count())
            .filter(|&other| {
                let coordinate = self.coordinate(other);
                (0..self.sizes.len())
                    .filter(|pos| !axes.contains(pos))
                    .all(|pos| coordinate[pos] == origin[pos])
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(axes: &[&str]) -> Vec<String> {
        axes.iter().map(|axis| axis.to_string()).collect()
    }

    #[test]
    fn empty_axis_names_select_the_whole_mesh() {
        let mesh = DeviceMesh::make([2, 3], ["x", "y"]).unwrap();
        let grid = ManualGrid::new(&mesh, &[]).unwrap();

        assert_eq!(grid.axis_names(), names(&["x", "y"]).as_slice());
        assert_eq!(grid.instance_count(), 6);
        assert_eq!(grid.coordinate(4), vec![1, 1]);
    }

    #[test]
    fn axis_subset_keeps_mesh_order() {
        let mesh = DeviceMesh::make([2, 3], ["x", "y"]).unwrap();
        let grid = ManualGrid::new(&mesh, &names(&["y"])).unwrap();

        assert_eq!(grid.instance_count(), 3);
        assert_eq!(grid.axis_size("y"), Some(3));
        assert_eq!(grid.axis_size("x"), None);
    }

    #[test]
    fn unknown_axis_is_rejected() {
        let mesh = DeviceMesh::make([2], ["batch"]).unwrap();

        assert_eq!(
            ManualGrid::new(&mesh, &names(&["model"])),
            Err(Error::UnknownMeshAxis {
                axis_name: "model".to_string()
            })
        );
    }

    #[test]
    fn blocks_follow_major_to_minor_axis_order() {
        let mesh = DeviceMesh::make([2, 3], ["x", "y"]).unwrap();
        let grid = ManualGrid::new(&mesh, &[]).unwrap();
        let both = [MeshDim::new("x"), MeshDim::new("y")];
        let reversed = [MeshDim::new("y"), MeshDim::new("x")];

        assert_eq!(grid.block(&both, &[1, 2]), (5, 6));
        assert_eq!(grid.block(&both, &[1, 0]), (3, 6));
        assert_eq!(grid.block(&reversed, &[1, 0]), (1, 6));
        assert_eq!(grid.block(&[MeshDim::new("y")], &[1, 2]), (2, 3));
        assert_eq!(grid.block(&[], &[1, 2]), (0, 1));
    }

    #[test]
    fn groups_vary_only_the_reduced_axes() {
        let mesh = DeviceMesh::make([2, 2], ["x", "y"]).unwrap();
        let grid = ManualGrid::new(&mesh, &[]).unwrap();

        assert_eq!(grid.group(3, &[1]), vec![2, 3]);
        assert_eq!(grid.group(3, &[0]), vec![1, 3]);
        assert_eq!(grid.group(3, &[0, 1]), vec![0, 1, 2, 3]);
        assert_eq!(grid.group(3, &[]), vec![3]);
    }
}
