//! Walkable-area edits on the compact heightfield: erosion by agent radius,
//! an optional median scrub, and area markers for caller-defined volumes.

use crate::compact::CompactHeightfield;
use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::math::{self, NULL_AREA};
use crate::{Error, Result};

/// A convex area marker: a polygon footprint with a vertical extent and the
/// area id to stamp onto every walkable span inside it.
#[derive(Debug, Clone)]
pub struct ConvexVolume {
    /// Footprint vertices, `x,y,z` triples; y is ignored.
    pub verts: Vec<f32>,
    pub ymin: f32,
    pub ymax: f32,
    pub area: u8,
}

/// A caller-defined area stamp, applied to the compact field between
/// erosion and partitioning.
#[derive(Debug, Clone)]
pub enum AreaMarker {
    /// Axis-aligned world-space box.
    Box {
        bmin: [f32; 3],
        bmax: [f32; 3],
        area: u8,
    },
    /// Convex polygon footprint with a vertical extent.
    ConvexPoly(ConvexVolume),
    /// Vertical cylinder standing on `position`.
    Cylinder {
        position: [f32; 3],
        radius: f32,
        height: f32,
        area: u8,
    },
}

/// Applies one marker to the compact heightfield.
pub fn mark_area(ctx: &mut BuildContext, marker: &AreaMarker, chf: &mut CompactHeightfield) {
    match marker {
        AreaMarker::Box { bmin, bmax, area } => mark_box_area(ctx, *bmin, *bmax, *area, chf),
        AreaMarker::ConvexPoly(volume) => mark_convex_poly_area(ctx, volume, chf),
        AreaMarker::Cylinder {
            position,
            radius,
            height,
            area,
        } => mark_cylinder_area(ctx, *position, *radius, *height, *area, chf),
    }
}

/// Marks spans closer to the walkable boundary than `radius` voxels as
/// unwalkable, using a 3x3 chamfer distance transform (orthogonal cost 2,
/// diagonal cost 3).
pub fn erode_walkable_area(
    ctx: &mut BuildContext,
    radius: i32,
    chf: &mut CompactHeightfield,
) -> Result<()> {
    let timer = ScopedTimer::start(ctx, StageTimer::Erode);

    let w = chf.width;
    let h = chf.height;
    let mut dist = vec![0xffu8; chf.span_count];

    // Seed: unwalkable spans and spans missing a walkable cardinal
    // neighbour start at distance zero.
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] == NULL_AREA {
                    dist[i] = 0;
                    continue;
                }
                let span = chf.spans[i];
                let mut connected = 0;
                for dir in 0..4 {
                    match chf.neighbor_index(x, z, &span, dir) {
                        Some(n) if chf.areas[n] != NULL_AREA => connected += 1,
                        _ => break,
                    }
                }
                if connected != 4 {
                    dist[i] = 0;
                }
            }
        }
    }

    let relax = |dist: &mut [u8], i: usize, neighbor: usize, cost: u8| {
        let candidate = dist[neighbor].saturating_add(cost);
        if candidate < dist[i] {
            dist[i] = candidate;
        }
    };

    // Forward pass: pull from (-1,0), (-1,-1), (0,-1), (1,-1).
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                if let Some(a) = chf.neighbor_index(x, z, &span, 0) {
                    relax(&mut dist, i, a, 2);
                    let aspan = chf.spans[a];
                    if let Some(b) =
                        chf.neighbor_index(x + math::dir_offset_x(0), z, &aspan, 3)
                    {
                        relax(&mut dist, i, b, 3);
                    }
                }
                if let Some(a) = chf.neighbor_index(x, z, &span, 3) {
                    relax(&mut dist, i, a, 2);
                    let aspan = chf.spans[a];
                    if let Some(b) =
                        chf.neighbor_index(x, z + math::dir_offset_z(3), &aspan, 2)
                    {
                        relax(&mut dist, i, b, 3);
                    }
                }
            }
        }
    }

    // Backward pass: pull from (1,0), (1,1), (0,1), (-1,1).
    for z in (0..h).rev() {
        for x in (0..w).rev() {
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                if let Some(a) = chf.neighbor_index(x, z, &span, 2) {
                    relax(&mut dist, i, a, 2);
                    let aspan = chf.spans[a];
                    if let Some(b) =
                        chf.neighbor_index(x + math::dir_offset_x(2), z, &aspan, 1)
                    {
                        relax(&mut dist, i, b, 3);
                    }
                }
                if let Some(a) = chf.neighbor_index(x, z, &span, 1) {
                    relax(&mut dist, i, a, 2);
                    let aspan = chf.spans[a];
                    if let Some(b) =
                        chf.neighbor_index(x, z + math::dir_offset_z(1), &aspan, 0)
                    {
                        relax(&mut dist, i, b, 3);
                    }
                }
            }
        }
    }

    // Orthogonal steps cost 2, so a radius of r voxels is a distance of 2r.
    let min_boundary_distance = (radius * 2).min(0xff) as u8;
    for i in 0..chf.span_count {
        if dist[i] < min_boundary_distance {
            chf.areas[i] = NULL_AREA;
        }
    }

    timer.finish(ctx);
    Ok(())
}

/// Median pass over span areas: each walkable span takes the median of its
/// 3x3 neighbourhood (missing neighbours contribute the span's own area).
/// Smooths out single-span classification noise.
pub fn median_filter_walkable_area(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
) -> Result<()> {
    let timer = ScopedTimer::start(ctx, StageTimer::MarkAreas);

    let w = chf.width;
    let h = chf.height;
    let mut scrubbed = vec![0xffu8; chf.span_count];

    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] == NULL_AREA {
                    scrubbed[i] = chf.areas[i];
                    continue;
                }
                let span = chf.spans[i];
                let mut neighborhood = [chf.areas[i]; 9];
                for dir in 0..4 {
                    if let Some(a) = chf.neighbor_index(x, z, &span, dir) {
                        if chf.areas[a] != NULL_AREA {
                            neighborhood[dir * 2] = chf.areas[a];
                        }
                        let aspan = chf.spans[a];
                        let dir2 = (dir + 1) & 0x3;
                        let ax = x + math::dir_offset_x(dir);
                        let az = z + math::dir_offset_z(dir);
                        if let Some(b) = chf.neighbor_index(ax, az, &aspan, dir2) {
                            if chf.areas[b] != NULL_AREA {
                                neighborhood[dir * 2 + 1] = chf.areas[b];
                            }
                        }
                    }
                }
                neighborhood.sort_unstable();
                scrubbed[i] = neighborhood[4];
            }
        }
    }

    chf.areas.copy_from_slice(&scrubbed);
    timer.finish(ctx);
    Ok(())
}

/// Stamps `area` onto walkable spans whose floor lies inside the world-space
/// box.
pub fn mark_box_area(
    ctx: &mut BuildContext,
    bmin: [f32; 3],
    bmax: [f32; 3],
    area: u8,
    chf: &mut CompactHeightfield,
) {
    let timer = ScopedTimer::start(ctx, StageTimer::MarkAreas);

    let min_x = ((bmin[0] - chf.bmin.x) / chf.cs) as i32;
    let min_y = ((bmin[1] - chf.bmin.y) / chf.ch) as i32;
    let min_z = ((bmin[2] - chf.bmin.z) / chf.cs) as i32;
    let max_x = ((bmax[0] - chf.bmin.x) / chf.cs) as i32;
    let max_y = ((bmax[1] - chf.bmin.y) / chf.ch) as i32;
    let max_z = ((bmax[2] - chf.bmin.z) / chf.cs) as i32;

    if max_x < 0 || min_x >= chf.width || max_z < 0 || min_z >= chf.height {
        timer.finish(ctx);
        return;
    }
    let min_x = min_x.max(0);
    let max_x = max_x.min(chf.width - 1);
    let min_z = min_z.max(0);
    let max_z = max_z.min(chf.height - 1);

    for z in min_z..=max_z {
        for x in min_x..=max_x {
            for i in chf.cell_spans(x, z) {
                let y = chf.spans[i].y as i32;
                if y < min_y || y > max_y || chf.areas[i] == NULL_AREA {
                    continue;
                }
                chf.areas[i] = area;
            }
        }
    }
    timer.finish(ctx);
}

fn point_in_poly(verts: &[f32], px: f32, pz: f32) -> bool {
    let n = verts.len() / 3;
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (vix, viz) = (verts[i * 3], verts[i * 3 + 2]);
        let (vjx, vjz) = (verts[j * 3], verts[j * 3 + 2]);
        if (viz > pz) != (vjz > pz) && px < (vjx - vix) * (pz - viz) / (vjz - viz) + vix {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Stamps `volume.area` onto walkable spans whose column centre falls inside
/// the volume footprint and whose floor is inside its vertical extent.
pub fn mark_convex_poly_area(
    ctx: &mut BuildContext,
    volume: &ConvexVolume,
    chf: &mut CompactHeightfield,
) {
    let timer = ScopedTimer::start(ctx, StageTimer::MarkAreas);

    let (fp_min, fp_max) = math::calc_bounds(&volume.verts);
    let min_x = (((fp_min.x - chf.bmin.x) / chf.cs) as i32).max(0);
    let max_x = (((fp_max.x - chf.bmin.x) / chf.cs) as i32).min(chf.width - 1);
    let min_z = (((fp_min.z - chf.bmin.z) / chf.cs) as i32).max(0);
    let max_z = (((fp_max.z - chf.bmin.z) / chf.cs) as i32).min(chf.height - 1);
    let min_y = ((volume.ymin - chf.bmin.y) / chf.ch) as i32;
    let max_y = ((volume.ymax - chf.bmin.y) / chf.ch) as i32;

    if max_x < 0 || min_x >= chf.width || max_z < 0 || min_z >= chf.height {
        timer.finish(ctx);
        return;
    }

    for z in min_z..=max_z {
        for x in min_x..=max_x {
            let px = chf.bmin.x + (x as f32 + 0.5) * chf.cs;
            let pz = chf.bmin.z + (z as f32 + 0.5) * chf.cs;
            if !point_in_poly(&volume.verts, px, pz) {
                continue;
            }
            for i in chf.cell_spans(x, z) {
                let y = chf.spans[i].y as i32;
                if y < min_y || y > max_y || chf.areas[i] == NULL_AREA {
                    continue;
                }
                chf.areas[i] = volume.area;
            }
        }
    }
    timer.finish(ctx);
}

/// Stamps `area` onto walkable spans inside a vertical cylinder.
pub fn mark_cylinder_area(
    ctx: &mut BuildContext,
    position: [f32; 3],
    radius: f32,
    height: f32,
    area: u8,
    chf: &mut CompactHeightfield,
) {
    let timer = ScopedTimer::start(ctx, StageTimer::MarkAreas);

    let min_x = (((position[0] - radius - chf.bmin.x) / chf.cs) as i32).max(0);
    let max_x = (((position[0] + radius - chf.bmin.x) / chf.cs) as i32).min(chf.width - 1);
    let min_z = (((position[2] - radius - chf.bmin.z) / chf.cs) as i32).max(0);
    let max_z = (((position[2] + radius - chf.bmin.z) / chf.cs) as i32).min(chf.height - 1);
    let min_y = ((position[1] - chf.bmin.y) / chf.ch) as i32;
    let max_y = ((position[1] + height - chf.bmin.y) / chf.ch) as i32;
    let radius_sq = radius * radius;

    for z in min_z..=max_z {
        for x in min_x..=max_x {
            let dx = chf.bmin.x + (x as f32 + 0.5) * chf.cs - position[0];
            let dz = chf.bmin.z + (z as f32 + 0.5) * chf.cs - position[2];
            if dx * dx + dz * dz >= radius_sq {
                continue;
            }
            for i in chf.cell_spans(x, z) {
                let y = chf.spans[i].y as i32;
                if chf.areas[i] != NULL_AREA && y >= min_y && y <= max_y {
                    chf.areas[i] = area;
                }
            }
        }
    }
    timer.finish(ctx);
}

/// Offsets a convex polygon outline outward (negative `offset` shrinks it),
/// mitering corners and beveling them past the miter limit. Returns the
/// offset outline, or an error when `max_out_verts` cannot hold it.
pub fn offset_poly(verts: &[f32], offset: f32, max_out_verts: usize) -> Result<Vec<f32>> {
    // Past this ratio a mitered corner spikes too far out and is beveled
    // instead.
    const MITER_LIMIT: f32 = 1.20;

    let n = verts.len() / 3;
    let mut out: Vec<f32> = Vec::new();

    let normalize_2d = |x: f32, z: f32| {
        let mag_sq = x * x + z * z;
        if mag_sq > 1e-6 {
            let inv = 1.0 / mag_sq.sqrt();
            (x * inv, z * inv)
        } else {
            (x, z)
        }
    };

    for b in 0..n {
        let a = (b + n - 1) % n;
        let c = (b + 1) % n;
        let va = &verts[a * 3..a * 3 + 3];
        let vb = &verts[b * 3..b * 3 + 3];
        let vc = &verts[c * 3..c * 3 + 3];

        let (prev_dx, prev_dz) = normalize_2d(vb[0] - va[0], vb[2] - va[2]);
        let (curr_dx, curr_dz) = normalize_2d(vc[0] - vb[0], vc[2] - vb[2]);
        let cross = curr_dx * prev_dz - prev_dx * curr_dz;

        // CCW perpendiculars of the two segments.
        let (prev_nx, prev_nz) = (-prev_dz, prev_dx);
        let (curr_nx, curr_nz) = (-curr_dz, curr_dx);

        let mut miter_x = (prev_nx + curr_nx) * 0.5;
        let mut miter_z = (prev_nz + curr_nz) * 0.5;
        let miter_sq = miter_x * miter_x + miter_z * miter_z;
        let bevel = miter_sq * MITER_LIMIT * MITER_LIMIT < 1.0;
        if miter_sq > 1e-6 {
            let scale = 1.0 / miter_sq;
            miter_x *= scale;
            miter_z *= scale;
        }

        if bevel && cross < 0.0 {
            if out.len() / 3 + 2 > max_out_verts {
                return Err(Error::Build("offset polygon exceeds output capacity"));
            }
            let d = (1.0 - (prev_dx * curr_dx + prev_dz * curr_dz)) * 0.5;
            out.extend_from_slice(&[
                vb[0] + (-prev_nx + prev_dx * d) * offset,
                vb[1],
                vb[2] + (-prev_nz + prev_dz * d) * offset,
            ]);
            out.extend_from_slice(&[
                vb[0] + (-curr_nx - curr_dx * d) * offset,
                vb[1],
                vb[2] + (-curr_nz - curr_dz * d) * offset,
            ]);
        } else {
            if out.len() / 3 + 1 > max_out_verts {
                return Err(Error::Build("offset polygon exceeds output capacity"));
            }
            out.extend_from_slice(&[
                vb[0] - miter_x * offset,
                vb[1],
                vb[2] - miter_z * offset,
            ]);
        }
    }
    Ok(out)
}
