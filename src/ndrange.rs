/// Index-space definitions.
/// A launch covers a 3D NDRange of work-items, partitioned into equally
/// sized work-groups. Unused dimensions have size 1 and offset 0.
use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};

/// 3D coordinate or extent used for item, group and range sizes.
///
/// Flattening is row-major with `z` slowest:
/// `flat = x + (z * extent.y + y) * extent.x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Dim3 {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Dim3 { x, y, z }
    }

    /// Convenience constructor for 1D extents
    pub fn x(x: usize) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }

    pub fn from_array(a: [usize; 3]) -> Self {
        Dim3::new(a[0], a[1], a[2])
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.x, self.y, self.z]
    }

    /// Total number of elements covered when used as an extent
    pub fn size(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Component `dim` (0..3). Out-of-range dimensions read as `default`.
    pub fn get_or(&self, dim: usize, default: usize) -> usize {
        match dim {
            0 => self.x,
            1 => self.y,
            2 => self.z,
            _ => default,
        }
    }

    /// Linear index of this coordinate within `extent`.
    pub fn flatten(&self, extent: Dim3) -> usize {
        self.x + (self.z * extent.y + self.y) * extent.x
    }

    /// Inverse of [`Dim3::flatten`].
    pub fn unflatten(flat: usize, extent: Dim3) -> Dim3 {
        let x = flat % extent.x;
        let y = (flat / extent.x) % extent.y;
        let z = flat / (extent.x * extent.y);
        Dim3::new(x, y, z)
    }

    /// Iterate every coordinate inside this extent in flattening order.
    pub fn iter(&self) -> impl Iterator<Item = Dim3> + use<> {
        let extent = *self;
        (0..extent.size()).map(move |flat| Dim3::unflatten(flat, extent))
    }
}

impl std::fmt::Display for Dim3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// A validated launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NDRange {
    pub work_dim: u32,
    pub global_offset: Dim3,
    pub global_size: Dim3,
    pub local_size: Dim3,
}

impl NDRange {
    /// Build an NDRange from host-supplied triples.
    ///
    /// Only the first `work_dim` entries of each slice are read. A zero or
    /// missing local size defaults to 1, a missing offset to 0. Every global
    /// dimension must be divisible by its local dimension.
    pub fn new(
        work_dim: u32,
        global_offset: &[usize],
        global_size: &[usize],
        local_size: &[usize],
    ) -> Result<Self, ConfigurationError> {
        if !(1..=3).contains(&work_dim) {
            return Err(ConfigurationError::InvalidWorkDim(work_dim));
        }

        let mut offset = [0usize; 3];
        let mut global = [1usize; 3];
        let mut local = [1usize; 3];
        for dim in 0..work_dim as usize {
            global[dim] = match global_size.get(dim) {
                Some(&size) if size > 0 => size,
                _ => return Err(ConfigurationError::EmptyRange { dim }),
            };
            if let Some(&o) = global_offset.get(dim) {
                offset[dim] = o;
            }
            if let Some(&l) = local_size.get(dim) {
                if l > 0 {
                    local[dim] = l;
                }
            }
            if global[dim] % local[dim] != 0 {
                return Err(ConfigurationError::IndivisibleRange {
                    dim,
                    global: global[dim],
                    local: local[dim],
                });
            }
        }

        Ok(NDRange {
            work_dim,
            global_offset: Dim3::from_array(offset),
            global_size: Dim3::from_array(global),
            local_size: Dim3::from_array(local),
        })
    }

    /// Number of work-groups in each dimension
    pub fn num_groups(&self) -> Dim3 {
        Dim3::new(
            self.global_size.x / self.local_size.x,
            self.global_size.y / self.local_size.y,
            self.global_size.z / self.local_size.z,
        )
    }

    /// Total number of work-groups in the launch
    pub fn total_groups(&self) -> usize {
        self.num_groups().size()
    }

    /// Work-items per group
    pub fn items_per_group(&self) -> usize {
        self.local_size.size()
    }

    /// Global id of a work-item: `group * local_size + local + offset`.
    pub fn global_id(&self, group: Dim3, local: Dim3) -> Dim3 {
        Dim3::new(
            group.x * self.local_size.x + local.x + self.global_offset.x,
            group.y * self.local_size.y + local.y + self.global_offset.y,
            group.z * self.local_size.z + local.z + self.global_offset.z,
        )
    }
}
