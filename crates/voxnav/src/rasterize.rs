//! Conservative triangle voxelization into the solid heightfield.
//!
//! Each triangle is clipped row by row along z, then column by column along
//! x, with a Sutherland-Hodgman half-plane split. The y extent of every
//! cell-local piece is quantized and inserted via `Heightfield::add_span`.

use glam::Vec3;

use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::heightfield::Heightfield;
use crate::math::{self, SPAN_MAX_HEIGHT, NULL_AREA, WALKABLE_AREA};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X = 0,
    Z = 2,
}

/// Clipping buffer: a triangle split against one cell boundary at a time
/// never exceeds 7 vertices.
type ClipPoly = [Vec3; 7];

/// Splits a convex polygon at `axis = offset` into the piece at or below the
/// plane (`out_below`) and the piece above it (`out_above`). A vertex lying
/// exactly on the plane is emitted to both pieces exactly once, so crossing
/// edges never produce duplicated planar vertices.
fn divide_poly(
    input: &ClipPoly,
    n: usize,
    out_below: &mut ClipPoly,
    out_above: &mut ClipPoly,
    offset: f32,
    axis: Axis,
) -> (usize, usize) {
    debug_assert!(n <= 7);
    let component = |v: &Vec3| if axis == Axis::X { v.x } else { v.z };

    let mut delta = [0.0f32; 7];
    for (i, d) in delta.iter_mut().enumerate().take(n) {
        *d = offset - component(&input[i]);
    }

    let mut nb = 0;
    let mut na = 0;
    let mut j = n - 1;
    for i in 0..n {
        let same_side = (delta[i] >= 0.0) == (delta[j] >= 0.0);
        if !same_side {
            let s = delta[j] / (delta[j] - delta[i]);
            let hit = input[j] + (input[i] - input[j]) * s;
            out_below[nb] = hit;
            out_above[na] = hit;
            nb += 1;
            na += 1;
            // The crossing vertex itself goes to whichever side it is on;
            // vertices on the plane were already emitted as the hit point.
            if delta[i] > 0.0 {
                out_below[nb] = input[i];
                nb += 1;
            } else if delta[i] < 0.0 {
                out_above[na] = input[i];
                na += 1;
            }
        } else {
            if delta[i] >= 0.0 {
                out_below[nb] = input[i];
                nb += 1;
                if delta[i] != 0.0 {
                    j = i;
                    continue;
                }
            }
            out_above[na] = input[i];
            na += 1;
        }
        j = i;
    }
    (nb, na)
}

fn rasterize_tri(
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
    area: u8,
    hf: &mut Heightfield,
    flag_merge_threshold: i32,
) -> Result<()> {
    let tri_min = v0.min(v1).min(v2);
    let tri_max = v0.max(v1).max(v2);
    if !math::overlap_bounds(tri_min, tri_max, hf.bmin, hf.bmax) {
        return Ok(());
    }

    let w = hf.width;
    let h = hf.height;
    let by = hf.bmax.y - hf.bmin.y;
    let inv_cs = 1.0 / hf.cs;
    let inv_ch = 1.0 / hf.ch;

    // A start of -1 lets the first split cut the polygon cleanly at the grid
    // edge without ever writing a span outside it.
    let z0 = (((tri_min.z - hf.bmin.z) * inv_cs) as i32).clamp(-1, h - 1);
    let z1 = (((tri_max.z - hf.bmin.z) * inv_cs) as i32).clamp(0, h - 1);

    let mut carry: ClipPoly = [v0; 7];
    carry[1] = v1;
    carry[2] = v2;
    let mut n_carry = 3;

    let mut row: ClipPoly = [Vec3::ZERO; 7];
    let mut scratch_a: ClipPoly = [Vec3::ZERO; 7];
    let mut scratch_b: ClipPoly = [Vec3::ZERO; 7];

    for z in z0..=z1 {
        if n_carry < 3 {
            break;
        }
        let row_top = hf.bmin.z + (z + 1) as f32 * hf.cs;
        let (n_row, n_rest) = divide_poly(&carry, n_carry, &mut row, &mut scratch_a, row_top, Axis::Z);
        std::mem::swap(&mut carry, &mut scratch_a);
        n_carry = n_rest;
        if n_row < 3 || z < 0 {
            continue;
        }

        let mut min_x = row[0].x;
        let mut max_x = row[0].x;
        for v in row.iter().take(n_row).skip(1) {
            min_x = min_x.min(v.x);
            max_x = max_x.max(v.x);
        }
        let x0_raw = ((min_x - hf.bmin.x) * inv_cs) as i32;
        let x1_raw = ((max_x - hf.bmin.x) * inv_cs) as i32;
        if x1_raw < 0 || x0_raw >= w {
            continue;
        }
        let x0 = x0_raw.clamp(-1, w - 1);
        let x1 = x1_raw.clamp(0, w - 1);

        let mut n_strip = n_row;
        for x in x0..=x1 {
            if n_strip < 3 {
                break;
            }
            let col_right = hf.bmin.x + (x + 1) as f32 * hf.cs;
            let (n_cell, n_rest) =
                divide_poly(&row, n_strip, &mut scratch_a, &mut scratch_b, col_right, Axis::X);
            std::mem::swap(&mut row, &mut scratch_b);
            n_strip = n_rest;
            if n_cell < 3 || x < 0 {
                continue;
            }

            let mut span_min = scratch_a[0].y;
            let mut span_max = scratch_a[0].y;
            for v in scratch_a.iter().take(n_cell).skip(1) {
                span_min = span_min.min(v.y);
                span_max = span_max.max(v.y);
            }
            span_min -= hf.bmin.y;
            span_max -= hf.bmin.y;
            if span_max < 0.0 || span_min > by {
                continue;
            }
            let span_min = span_min.max(0.0);
            let span_max = span_max.min(by);

            let smin = ((span_min * inv_ch).floor() as i32).clamp(0, SPAN_MAX_HEIGHT) as u16;
            let smax = ((span_max * inv_ch).ceil() as i32)
                .clamp(smin as i32 + 1, SPAN_MAX_HEIGHT) as u16;
            hf.add_span(x, z, smin, smax, area, flag_merge_threshold)?;
        }
    }
    Ok(())
}

/// Rasterizes one triangle into the heightfield.
pub fn rasterize_triangle(
    ctx: &mut BuildContext,
    v0: Vec3,
    v1: Vec3,
    v2: Vec3,
    area: u8,
    hf: &mut Heightfield,
    flag_merge_threshold: i32,
) -> Result<()> {
    let timer = ScopedTimer::start(ctx, StageTimer::Rasterize);
    let result = rasterize_tri(v0, v1, v2, area, hf, flag_merge_threshold);
    timer.finish(ctx);
    if result.is_err() {
        ctx.error("rasterize", "out of memory while adding spans");
    }
    result
}

/// Rasterizes indexed triangles with one area id per triangle.
pub fn rasterize_triangles(
    ctx: &mut BuildContext,
    verts: &[f32],
    indices: &[i32],
    tri_areas: &[u8],
    hf: &mut Heightfield,
    flag_merge_threshold: i32,
) -> Result<()> {
    let timer = ScopedTimer::start(ctx, StageTimer::Rasterize);
    let vertex = |i: i32| {
        let base = i as usize * 3;
        Vec3::new(verts[base], verts[base + 1], verts[base + 2])
    };
    for (tri, &area) in indices.chunks_exact(3).zip(tri_areas) {
        let result = rasterize_tri(
            vertex(tri[0]),
            vertex(tri[1]),
            vertex(tri[2]),
            area,
            hf,
            flag_merge_threshold,
        );
        if result.is_err() {
            timer.finish(ctx);
            ctx.error("rasterize", "out of memory while adding spans");
            return result;
        }
    }
    timer.finish(ctx);
    Ok(())
}

fn triangle_normal(v0: Vec3, v1: Vec3, v2: Vec3) -> Vec3 {
    (v1 - v0).cross(v2 - v0).normalize_or_zero()
}

/// Upgrades the area id of triangles flatter than `walkable_slope_angle` to
/// [`WALKABLE_AREA`]. Existing non-null overrides are never downgraded.
pub fn mark_walkable_triangles(
    walkable_slope_angle: f32,
    verts: &[f32],
    indices: &[i32],
    tri_areas: &mut [u8],
) {
    let walkable_thr = math::deg_to_rad(walkable_slope_angle).cos();
    let vertex = |i: i32| {
        let base = i as usize * 3;
        Vec3::new(verts[base], verts[base + 1], verts[base + 2])
    };
    for (tri, area) in indices.chunks_exact(3).zip(tri_areas.iter_mut()) {
        let norm = triangle_normal(vertex(tri[0]), vertex(tri[1]), vertex(tri[2]));
        if norm.y > walkable_thr && *area == NULL_AREA {
            *area = WALKABLE_AREA;
        }
    }
}

/// Inverse of [`mark_walkable_triangles`]: clears the area id of triangles
/// steeper than the walkable slope.
pub fn clear_unwalkable_triangles(
    walkable_slope_angle: f32,
    verts: &[f32],
    indices: &[i32],
    tri_areas: &mut [u8],
) {
    let walkable_thr = math::deg_to_rad(walkable_slope_angle).cos();
    let vertex = |i: i32| {
        let base = i as usize * 3;
        Vec3::new(verts[base], verts[base + 1], verts[base + 2])
    };
    for (tri, area) in indices.chunks_exact(3).zip(tri_areas.iter_mut()) {
        let norm = triangle_normal(vertex(tri[0]), vertex(tri[1]), vertex(tri[2]));
        if norm.y <= walkable_thr {
            *area = NULL_AREA;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(w: i32, h: i32) -> Heightfield {
        Heightfield::new(
            w,
            h,
            Vec3::ZERO,
            Vec3::new(w as f32, 4.0, h as f32),
            1.0,
            1.0,
        )
    }

    #[test]
    fn divide_poly_splits_a_triangle() {
        let mut input: ClipPoly = [Vec3::ZERO; 7];
        input[0] = Vec3::new(0.0, 0.0, 0.0);
        input[1] = Vec3::new(2.0, 0.0, 0.0);
        input[2] = Vec3::new(2.0, 0.0, 2.0);
        let mut below = [Vec3::ZERO; 7];
        let mut above = [Vec3::ZERO; 7];
        let (nb, na) = divide_poly(&input, 3, &mut below, &mut above, 1.0, Axis::X);
        assert_eq!(nb, 3);
        assert_eq!(na, 4);
        for v in below.iter().take(nb) {
            assert!(v.x <= 1.0 + 1e-6);
        }
        for v in above.iter().take(na) {
            assert!(v.x >= 1.0 - 1e-6);
        }
    }

    #[test]
    fn axis_aligned_box_fills_expected_columns() {
        // A closed 2x2.5x2 box filling the whole field footprint: every
        // column gets exactly one merged span from floor to ceiling.
        let mut hf = field(2, 2);
        let mut ctx = BuildContext::new();
        let height = 2.5f32;
        let corners = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 2.0),
            Vec3::new(0.0, 0.0, 2.0),
        ];
        // Top and bottom quads plus the four sides, triangulated.
        let top = |p: Vec3| Vec3::new(p.x, height, p.z);
        let faces: Vec<[Vec3; 3]> = vec![
            [corners[0], corners[1], corners[2]],
            [corners[0], corners[2], corners[3]],
            [top(corners[0]), top(corners[2]), top(corners[1])],
            [top(corners[0]), top(corners[3]), top(corners[2])],
            [corners[0], top(corners[0]), top(corners[1])],
            [corners[0], top(corners[1]), corners[1]],
            [corners[1], top(corners[1]), top(corners[2])],
            [corners[1], top(corners[2]), corners[2]],
            [corners[2], top(corners[2]), top(corners[3])],
            [corners[2], top(corners[3]), corners[3]],
            [corners[3], top(corners[3]), top(corners[0])],
            [corners[3], top(corners[0]), corners[0]],
        ];
        for f in faces {
            rasterize_triangle(&mut ctx, f[0], f[1], f[2], 1, &mut hf, 1).unwrap();
        }
        for z in 0..2 {
            for x in 0..2 {
                let spans: Vec<_> = hf.column(x, z).collect();
                assert_eq!(spans.len(), 1, "column ({x},{z})");
                assert_eq!(spans[0].smin, 0);
                assert_eq!(spans[0].smax, 3); // ceil(2.5 / ch)
            }
        }
    }

    #[test]
    fn triangles_outside_the_grid_leave_it_empty() {
        let mut hf = field(4, 4);
        let mut ctx = BuildContext::new();
        rasterize_triangle(
            &mut ctx,
            Vec3::new(10.0, 0.0, 10.0),
            Vec3::new(12.0, 0.0, 10.0),
            Vec3::new(12.0, 0.0, 12.0),
            1,
            &mut hf,
            1,
        )
        .unwrap();
        assert_eq!(hf.walkable_span_count(), 0);
    }

    #[test]
    fn straddling_triangle_only_writes_inside() {
        let mut hf = field(4, 4);
        let mut ctx = BuildContext::new();
        rasterize_triangle(
            &mut ctx,
            Vec3::new(-2.0, 0.0, 0.5),
            Vec3::new(2.0, 0.0, 0.5),
            Vec3::new(2.0, 0.0, 2.5),
            1,
            &mut hf,
            1,
        )
        .unwrap();
        assert!(hf.walkable_span_count() > 0);
        // The triangle only reaches rows z = 0..3; later rows stay empty.
        for z in 3..4 {
            for x in 0..4 {
                assert_eq!(hf.column(x, z).count(), 0);
            }
        }
    }

    #[test]
    fn slope_marking_respects_threshold() {
        // One flat triangle, one 60-degree ramp.
        let verts = [
            0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, // flat
            0.0, 0.0, 0.0, 1.0, 1.732, 0.0, 0.0, 0.0, 1.0, // steep
        ];
        let indices = [0, 1, 2, 3, 4, 5];
        let mut areas = [NULL_AREA; 2];
        mark_walkable_triangles(45.0, &verts, &indices, &mut areas);
        assert_eq!(areas[0], WALKABLE_AREA);
        assert_eq!(areas[1], NULL_AREA);
    }

    #[test]
    fn clearing_removes_steep_overrides() {
        let verts = [0.0, 0.0, 0.0, 1.0, 1.732, 0.0, 0.0, 0.0, 1.0];
        let indices = [0, 1, 2];
        let mut areas = [5u8];
        clear_unwalkable_triangles(45.0, &verts, &indices, &mut areas);
        assert_eq!(areas[0], NULL_AREA);
    }
}
