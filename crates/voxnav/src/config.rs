//! Build configuration for the navmesh pipeline.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::math;
use crate::{Error, Result};

/// Region partitioning algorithm to use in the regionize stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    /// Watershed over the boundary distance field. Best region shapes.
    #[default]
    Watershed,
    /// Single monotone row sweep. Fast, produces thin elongated regions.
    Monotone,
    /// Row sweep merged into non-overlapping 2D layers.
    Layer,
}

/// Parameters controlling a single navmesh build.
///
/// Distances marked "(vx)" are in voxels, the rest in world units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Grid width along the x axis, derived by [`BuildConfig::apply_bounds`].
    #[serde(default)]
    pub width: i32,
    /// Grid height along the z axis, derived by [`BuildConfig::apply_bounds`].
    #[serde(default)]
    pub height: i32,

    /// Horizontal (xz) voxel size.
    pub cs: f32,
    /// Vertical (y) voxel size.
    pub ch: f32,

    /// Minimum bounds of the build AABB.
    #[serde(default)]
    pub bmin: Vec3,
    /// Maximum bounds of the build AABB.
    #[serde(default)]
    pub bmax: Vec3,

    /// Steepest surface slope, in degrees, still considered walkable.
    pub walkable_slope_angle: f32,
    /// Required vertical clearance for the agent (vx).
    pub walkable_height: i32,
    /// Highest step the agent can climb (vx).
    pub walkable_climb: i32,
    /// Agent radius used to erode the walkable area (vx).
    pub walkable_radius: i32,

    /// Longest allowed contour edge along mesh borders (vx). 0 disables.
    pub max_edge_len: i32,
    /// Contour simplification deviation budget, in world units.
    pub max_simplification_error: f32,

    /// Smallest isolated island kept, in voxel area.
    pub min_region_area: i32,
    /// Regions below this voxel area are merged into neighbours when possible.
    pub merge_region_area: i32,

    /// Vertex cap per polygon, at least 3.
    pub max_verts_per_poly: i32,

    /// Detail mesh sampling distance; below 0.9 the detail stage only
    /// triangulates polygon hulls without height samples.
    pub detail_sample_dist: f32,
    /// Permitted detail surface deviation from the sampled heightfield.
    pub detail_sample_max_error: f32,

    /// Width of the border frame painted with the border-region bit (vx).
    pub border_size: i32,

    /// Region partitioning algorithm.
    #[serde(default)]
    pub partition: PartitionKind,

    /// Toggle for the low-hanging-obstacle filter.
    #[serde(default = "default_true")]
    pub filter_low_hanging_obstacles: bool,
    /// Toggle for the ledge filter.
    #[serde(default = "default_true")]
    pub filter_ledge_spans: bool,
    /// Toggle for the low-clearance filter.
    #[serde(default = "default_true")]
    pub filter_low_height_spans: bool,

    /// Optional median pass over span areas to scrub classification noise.
    #[serde(default)]
    pub median_filter_areas: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            cs: 0.3,
            ch: 0.2,
            bmin: Vec3::ZERO,
            bmax: Vec3::ZERO,
            walkable_slope_angle: 45.0,
            walkable_height: 10,
            walkable_climb: 4,
            walkable_radius: 2,
            max_edge_len: 12,
            max_simplification_error: 1.3,
            min_region_area: 8,
            merge_region_area: 20,
            max_verts_per_poly: 6,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
            border_size: 0,
            partition: PartitionKind::Watershed,
            filter_low_hanging_obstacles: true,
            filter_ledge_spans: true,
            filter_low_height_spans: true,
            median_filter_areas: false,
        }
    }
}

impl BuildConfig {
    /// Sets the build AABB and derives the grid dimensions from it.
    pub fn apply_bounds(&mut self, bmin: Vec3, bmax: Vec3) {
        self.bmin = bmin;
        self.bmax = bmax;
        let (w, h) = math::calc_grid_size(bmin, bmax, self.cs);
        self.width = w;
        self.height = h;
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cs <= 0.0 || self.ch <= 0.0 {
            return Err(Error::InvalidConfig("voxel sizes must be positive"));
        }
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::InvalidConfig("grid is empty; set bounds first"));
        }
        if !(0.0..=90.0).contains(&self.walkable_slope_angle) {
            return Err(Error::InvalidConfig(
                "walkable slope angle must be in [0, 90] degrees",
            ));
        }
        if self.walkable_height < 3 {
            return Err(Error::InvalidConfig("walkable height must be at least 3 voxels"));
        }
        if self.max_verts_per_poly < 3 {
            return Err(Error::InvalidConfig("polygons need at least 3 vertices"));
        }
        Ok(())
    }
}
