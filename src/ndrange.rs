//! NDRange launch geometry
//!
//! A kernel launch is described by a work dimension, a global offset, a
//! global size and a local size, each padded to three dimensions. The
//! geometry also fixes the single scalar-id convention used everywhere in
//! the crate: row-major with strides `1, S0, S0*S1`, encoded and decoded
//! with the same formula on both the race-tracking and diagnostic sides.

use serde::{Deserialize, Serialize};

/// Launch geometry for one kernel invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NDRange {
    /// Number of significant dimensions (1-3)
    pub work_dim: usize,
    /// Global work offset, padded with zeros
    pub global_offset: [usize; 3],
    /// Global work size, padded with ones
    pub global_size: [usize; 3],
    /// Local work size, padded with ones
    pub local_size: [usize; 3],
}

impl Default for NDRange {
    fn default() -> Self {
        NDRange {
            work_dim: 1,
            global_offset: [0; 3],
            global_size: [1; 3],
            local_size: [1; 3],
        }
    }
}

impl NDRange {
    /// Build a geometry from host-supplied slices, normalizing unspecified
    /// dimensions to size 1 / offset 0 and zero local sizes to 1.
    #[must_use]
    pub fn new(
        work_dim: usize,
        global_offset: &[usize],
        global_size: &[usize],
        local_size: &[usize],
    ) -> Self {
        let mut range = NDRange {
            work_dim,
            ..NDRange::default()
        };
        for i in 0..work_dim.min(3) {
            range.global_size[i] = global_size[i];
            if let Some(&offset) = global_offset.get(i) {
                range.global_offset[i] = offset;
            }
            match local_size.get(i) {
                Some(&size) if size > 0 => range.local_size[i] = size,
                _ => {}
            }
        }
        range
    }

    /// Number of work-groups along each dimension
    #[must_use]
    pub fn num_groups(&self) -> [usize; 3] {
        [
            self.global_size[0] / self.local_size[0],
            self.global_size[1] / self.local_size[1],
            self.global_size[2] / self.local_size[2],
        ]
    }

    /// Scalar id of a work-item (row-major over the global size)
    #[must_use]
    pub fn linear_work_item(&self, gid: [usize; 3]) -> usize {
        gid[0] + gid[1] * self.global_size[0] + gid[2] * self.global_size[0] * self.global_size[1]
    }

    /// Inverse of [`NDRange::linear_work_item`]
    #[must_use]
    pub fn work_item_from_linear(&self, id: usize) -> [usize; 3] {
        let s0 = self.global_size[0];
        let s1 = self.global_size[1];
        [id % s0, (id / s0) % s1, id / (s0 * s1)]
    }

    /// Scalar id of a work-group (row-major over the group counts)
    #[must_use]
    pub fn linear_work_group(&self, group: [usize; 3]) -> usize {
        let n = self.num_groups();
        group[0] + group[1] * n[0] + group[2] * n[0] * n[1]
    }

    /// Inverse of [`NDRange::linear_work_group`]
    #[must_use]
    pub fn work_group_from_linear(&self, id: usize) -> [usize; 3] {
        let n = self.num_groups();
        [id % n[0], (id / n[0]) % n[1], id / (n[0] * n[1])]
    }

    /// Work-group a global id belongs to (offsets are not applied; the
    /// debugger addresses work-items by raw global id)
    #[must_use]
    pub fn group_of(&self, gid: [usize; 3]) -> [usize; 3] {
        [
            gid[0] / self.local_size[0],
            gid[1] / self.local_size[1],
            gid[2] / self.local_size[2],
        ]
    }

    /// Local id of a global id within its work-group
    #[must_use]
    pub fn local_of(&self, gid: [usize; 3]) -> [usize; 3] {
        [
            gid[0] % self.local_size[0],
            gid[1] % self.local_size[1],
            gid[2] % self.local_size[2],
        ]
    }

    /// Linear index of a local id within a work-group (x fastest)
    #[must_use]
    pub fn local_linear(&self, lid: [usize; 3]) -> usize {
        lid[0]
            + lid[1] * self.local_size[0]
            + lid[2] * self.local_size[0] * self.local_size[1]
    }

    /// Number of work-items per work-group
    #[must_use]
    pub fn group_items(&self) -> usize {
        self.local_size[0] * self.local_size[1] * self.local_size[2]
    }
}
