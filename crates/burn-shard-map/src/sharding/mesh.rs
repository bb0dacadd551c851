use hashbrown::{HashMap, HashSet};
use thiserror::Error;

/// Identifier of a (simulated) device taking part in a mesh.
pub type DeviceId = usize;

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions are used to define the logical structure of a device mesh.
/// Partition specs refer to them by name to say which array dimensions are split
/// across which group of devices, and collectives refer to them to say which
/// devices take part in a reduction.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The name of this dimension.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Represents a logical arrangement of devices used for parallel computation.
///
/// A `DeviceMesh` defines a structured, N-dimensional topology over a set of devices,
/// where each dimension is given a unique name (e.g., `"batch"`, `"model"`).
///
/// For example, a 2D mesh with shape `[2, 4]` and dimensions `["dp", "tp"]` represents
/// a logical grid of devices for 2-way data parallelism and 4-way tensor parallelism.
/// Devices are laid out in row-major order: the device at linear index `i` has the
/// coordinate obtained by unravelling `i` over the mesh shape.
///
/// A mesh is immutable once built and cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMesh {
    /// Devices in an n-dimensional logical arrangement
    devices: Vec<DeviceId>,
    /// Shape of the logical mesh
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh
    dims: HashMap<MeshDim, usize>,
}

/// Represents errors that can occur when constructing a `DeviceMesh`.
///
/// These errors are typically related to invalid dimension mappings or mismatches
/// between the device count and the mesh shape.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DeviceMeshError {
    /// An invalid dimension was specified.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

impl DeviceMesh {
    /// Builds a mesh over devices `0..shape.product()` with one named axis per entry of
    /// `shape`, in order.
    ///
    /// ```rust
    /// use burn_shard_map::sharding::DeviceMesh;
    ///
    /// let mesh = DeviceMesh::make([4], ["batch"]).unwrap();
    /// assert_eq!(mesh.axis_size("batch"), Some(4));
    /// ```
    pub fn make<S, I, N>(shape: S, names: I) -> Result<Self, DeviceMeshError>
    where
        S: Into<Vec<usize>>,
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let shape = shape.into();
        let devices = (0..shape.iter().product::<usize>()).collect();
        names
            .into_iter()
            .enumerate()
            .fold(DeviceMeshBuilder::new(devices, shape), |builder, (idx, name)| {
                builder.with_dim(idx, MeshDim::new(name))
            })
            .build()
    }

    /// The shape of the logical mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of devices in the mesh.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Axis names ordered by their index in the mesh shape.
    pub fn axis_names(&self) -> Vec<&str> {
        let mut names = vec![""; self.shape.len()];
        for (dim, &idx) in self.dims.iter() {
            names[idx] = dim.name();
        }
        names
    }

    /// Index of the named axis in the mesh shape.
    pub fn axis_index<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.dims.get(&MeshDim::new(axis_name.as_ref())).copied()
    }

    /// Size of the named axis.
    pub fn axis_size<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.axis_index(axis_name).map(|idx| self.shape[idx])
    }

    /// Mesh coordinate of the device at linear index `device_index`.
    pub fn coordinate_for_device_index(&self, device_index: usize) -> Option<Vec<usize>> {
        if device_index >= self.devices.len() {
            return None;
        }
        Some(coordinate_for_linear_index(device_index, &self.shape))
    }
}

/// Unravels a row-major linear index over `sizes`.
pub(crate) fn coordinate_for_linear_index(mut index: usize, sizes: &[usize]) -> Vec<usize> {
    let mut coordinate = vec![0usize; sizes.len()];
    for axis in (0..sizes.len()).rev() {
        coordinate[axis] = index % sizes[axis];
        index /= sizes[axis];
    }
    coordinate
}

/// A builder for constructing a [`DeviceMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped, the builder can
/// be used to construct the [`DeviceMesh`] instance.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder {
    /// Devices in an n-dimensional logical arrangement.
    devices: Vec<DeviceId>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
}

impl DeviceMeshBuilder {
    /// Creates a new [`DeviceMeshBuilder`] with the given devices and shape.
    ///
    /// # Arguments
    /// * `devices` - A vector of devices to be arranged in the mesh.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<DeviceId>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension represents a logical axis of parallelism and must correspond to a
    /// unique index in the shape of the mesh. Index validity and uniqueness are checked
    /// by [`build`](Self::build).
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_shard_map::sharding::{DeviceMeshBuilder, MeshDim};
    ///
    /// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::new("data_parallel"))
    ///     .with_dim(1, MeshDim::new("tensor_parallel"))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(mesh.axis_names(), vec!["data_parallel", "tensor_parallel"]);
    /// ```
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// Fails if a dimension index is out of range or mapped twice, if not every mesh
    /// dimension is named, if an axis has size zero, if a device appears twice, or if
    /// the number of devices does not match the mesh shape.
    pub fn build(self) -> Result<DeviceMesh, DeviceMeshError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for (dim, &idx) in self.dims.iter() {
            if dim.name().is_empty() {
                return Err(DeviceMeshError::InvalidDimension(
                    "Mesh dimension names must be non-empty".to_string(),
                ));
            }
            if idx >= ndim {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if seen_indices.len() != ndim {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        if let Some(idx) = self.shape.iter().position(|&size| size == 0) {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Mesh dimension {} has size 0",
                idx
            )));
        }

        let expected_devices = self.shape.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.devices.len(),
                self.shape,
            )));
        }

        let mut seen_devices = HashSet::new();
        if let Some(device) = self.devices.iter().find(|&&device| !seen_devices.insert(device)) {
            return Err(DeviceMeshError::InvalidMesh(format!(
                "Device {} appears more than once",
                device
            )));
        }

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: self.dims,
        })
    }
}
