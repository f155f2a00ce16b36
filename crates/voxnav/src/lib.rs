//! voxnav: voxel-based navigation mesh generation.
//!
//! Takes a triangle soup and an agent profile and produces a set of convex
//! polygons (plus optional per-polygon height detail) approximating the
//! walkable surface, through an eight-stage pipeline: rasterize, filter,
//! compact, erode, distance field, regionize, contours, polygon and detail
//! meshes.

mod area;
mod compact;
mod config;
mod context;
mod contour;
mod detail;
mod distance;
mod filter;
mod heightfield;
mod math;
mod polymesh;
mod rasterize;
mod region;

pub use area::{
    erode_walkable_area, mark_area, mark_box_area, mark_convex_poly_area, mark_cylinder_area,
    median_filter_walkable_area, offset_poly, AreaMarker, ConvexVolume,
};
pub use compact::{CompactCell, CompactHeightfield, CompactSpan, MAX_LAYERS, NOT_CONNECTED};
pub use config::{BuildConfig, PartitionKind};
pub use context::{BuildContext, LogEntry, LogLevel, ScopedTimer, StageTimer};
pub use contour::{
    build_contours, Contour, ContourBuildFlags, ContourSet, ContourVertex, AREA_BORDER,
    BORDER_VERTEX, CONTOUR_REG_MASK,
};
pub use detail::{build_poly_mesh_detail, PolyMeshDetail};
pub use distance::build_distance_field;
pub use filter::{
    filter_ledge_spans, filter_low_hanging_walkable_obstacles, filter_walkable_low_height_spans,
};
pub use heightfield::{Heightfield, Span};
pub use math::{calc_bounds, calc_grid_size, NULL_AREA, SPAN_MAX_HEIGHT, WALKABLE_AREA};
pub use polymesh::{build_poly_mesh, PolyMesh, MESH_NULL_IDX, MULTIPLE_REGS};
pub use rasterize::{
    clear_unwalkable_triangles, mark_walkable_triangles, rasterize_triangle, rasterize_triangles,
};
pub use region::{
    build_layer_regions, build_regions_monotone, build_regions_watershed, BORDER_REG,
};

/// Errors surfaced by the build pipeline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid input mesh: {0}")]
    InvalidMesh(String),

    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),

    #[error("navmesh build failed: {0}")]
    Build(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A caller-defined link between two points off the generated mesh,
/// carried through the build untouched.
#[derive(Debug, Clone)]
pub struct OffMeshConnection {
    pub start: glam::Vec3,
    pub end: glam::Vec3,
    pub radius: f32,
    pub bidirectional: bool,
    pub area: u8,
    pub flags: u16,
}

/// Output of one build: the polygon mesh, its height detail, and the
/// off-mesh connections handed in by the caller.
#[derive(Debug, Clone)]
pub struct NavMeshBuild {
    pub poly_mesh: PolyMesh,
    pub detail_mesh: PolyMeshDetail,
    pub off_mesh_connections: Vec<OffMeshConnection>,
}

/// Drives the eight pipeline stages for one configuration.
#[derive(Debug, Default)]
pub struct NavMeshBuilder {
    config: BuildConfig,
    markers: Vec<AreaMarker>,
    off_mesh_connections: Vec<OffMeshConnection>,
    contour_flags: ContourBuildFlags,
}

impl NavMeshBuilder {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            markers: Vec::new(),
            off_mesh_connections: Vec::new(),
            contour_flags: ContourBuildFlags::default(),
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Adds an area marker applied between erosion and partitioning.
    pub fn add_marker(&mut self, marker: AreaMarker) -> &mut Self {
        self.markers.push(marker);
        self
    }

    /// Adds a convex area marker; shorthand for the most common
    /// [`AreaMarker`] shape.
    pub fn add_volume(&mut self, volume: ConvexVolume) -> &mut Self {
        self.markers.push(AreaMarker::ConvexPoly(volume));
        self
    }

    /// Adds an off-mesh connection forwarded verbatim into the output.
    pub fn add_off_mesh_connection(&mut self, connection: OffMeshConnection) -> &mut Self {
        self.off_mesh_connections.push(connection);
        self
    }

    pub fn set_contour_flags(&mut self, flags: ContourBuildFlags) -> &mut Self {
        self.contour_flags = flags;
        self
    }

    fn validate_input(verts: &[f32], indices: &[i32]) -> Result<()> {
        if verts.len() % 3 != 0 {
            return Err(Error::InvalidMesh(
                "vertex array length must be a multiple of 3".into(),
            ));
        }
        if indices.len() % 3 != 0 {
            return Err(Error::InvalidMesh(
                "index array length must be a multiple of 3".into(),
            ));
        }
        let nverts = (verts.len() / 3) as i32;
        if let Some(&bad) = indices.iter().find(|&&i| i < 0 || i >= nverts) {
            return Err(Error::InvalidMesh(format!(
                "triangle index {bad} out of range (vertex count {nverts})"
            )));
        }
        Ok(())
    }

    /// Stages 1-3: rasterizes the soup and filters the heightfield.
    ///
    /// `tri_areas` optionally overrides per-triangle area ids; the slope
    /// test then only upgrades still-null triangles.
    pub fn build_heightfield(
        &self,
        ctx: &mut BuildContext,
        verts: &[f32],
        indices: &[i32],
        tri_areas: Option<&[u8]>,
    ) -> Result<Heightfield> {
        let cfg = &self.config;
        cfg.validate()?;
        Self::validate_input(verts, indices)?;

        let mut hf = Heightfield::new(cfg.width, cfg.height, cfg.bmin, cfg.bmax, cfg.cs, cfg.ch);

        let ntris = indices.len() / 3;
        let mut areas = match tri_areas {
            Some(overrides) => {
                if overrides.len() != ntris {
                    return Err(Error::InvalidMesh(
                        "area override length does not match triangle count".into(),
                    ));
                }
                overrides.to_vec()
            }
            None => vec![NULL_AREA; ntris],
        };
        mark_walkable_triangles(cfg.walkable_slope_angle, verts, indices, &mut areas);

        rasterize_triangles(ctx, verts, indices, &areas, &mut hf, cfg.walkable_climb)?;

        // The recovery pass widens the walkable set the ledge pass audits,
        // so the order is fixed.
        if cfg.filter_low_hanging_obstacles {
            filter_low_hanging_walkable_obstacles(ctx, cfg.walkable_climb, &mut hf);
        }
        if cfg.filter_ledge_spans {
            filter_ledge_spans(ctx, cfg.walkable_height, cfg.walkable_climb, &mut hf);
        }
        if cfg.filter_low_height_spans {
            filter_walkable_low_height_spans(ctx, cfg.walkable_height, &mut hf);
        }

        Ok(hf)
    }

    /// Stages 4a-4d: compaction, erosion, area markers, partitioning.
    pub fn build_compact(
        &self,
        ctx: &mut BuildContext,
        hf: &Heightfield,
    ) -> Result<CompactHeightfield> {
        let cfg = &self.config;
        let mut chf = CompactHeightfield::build_from_heightfield(
            ctx,
            cfg.walkable_height,
            cfg.walkable_climb,
            hf,
        )?;

        if cfg.walkable_radius > 0 {
            erode_walkable_area(ctx, cfg.walkable_radius, &mut chf)?;
        }
        if cfg.median_filter_areas {
            median_filter_walkable_area(ctx, &mut chf)?;
        }
        for marker in &self.markers {
            mark_area(ctx, marker, &mut chf);
        }

        match cfg.partition {
            PartitionKind::Watershed => {
                build_distance_field(ctx, &mut chf)?;
                build_regions_watershed(
                    ctx,
                    &mut chf,
                    cfg.border_size,
                    cfg.min_region_area,
                    cfg.merge_region_area,
                )?;
            }
            PartitionKind::Monotone => {
                build_regions_monotone(
                    ctx,
                    &mut chf,
                    cfg.border_size,
                    cfg.min_region_area,
                    cfg.merge_region_area,
                )?;
            }
            PartitionKind::Layer => {
                build_layer_regions(ctx, &mut chf, cfg.border_size, cfg.min_region_area)?;
            }
        }

        Ok(chf)
    }

    /// Runs the full pipeline.
    pub fn build(
        &self,
        ctx: &mut BuildContext,
        verts: &[f32],
        indices: &[i32],
    ) -> Result<NavMeshBuild> {
        self.build_with_areas(ctx, verts, indices, None)
    }

    /// Runs the full pipeline with optional per-triangle area overrides.
    pub fn build_with_areas(
        &self,
        ctx: &mut BuildContext,
        verts: &[f32],
        indices: &[i32],
        tri_areas: Option<&[u8]>,
    ) -> Result<NavMeshBuild> {
        let total = ScopedTimer::start(ctx, StageTimer::Total);
        let cfg = &self.config;

        let hf = self.build_heightfield(ctx, verts, indices, tri_areas)?;
        let chf = self.build_compact(ctx, &hf)?;
        drop(hf);

        let cset = build_contours(
            ctx,
            &chf,
            cfg.max_simplification_error,
            cfg.max_edge_len,
            self.contour_flags,
        )?;

        let poly_mesh = build_poly_mesh(ctx, &cset, cfg.max_verts_per_poly as usize)?;

        // Below this distance the detail stage stops sampling heights and
        // only triangulates polygon hulls.
        let sample_dist = if cfg.detail_sample_dist < 0.9 {
            0.0
        } else {
            cfg.detail_sample_dist
        };
        let detail_mesh = build_poly_mesh_detail(
            ctx,
            &poly_mesh,
            &chf,
            sample_dist,
            cfg.detail_sample_max_error,
        )?;

        total.finish(ctx);
        Ok(NavMeshBuild {
            poly_mesh,
            detail_mesh,
            off_mesh_connections: self.off_mesh_connections.clone(),
        })
    }
}
