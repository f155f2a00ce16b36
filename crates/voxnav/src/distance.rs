//! Boundary distance field over the compact heightfield.
//!
//! Two-pass 3x3 chamfer transform (orthogonal cost 2, diagonal cost 3)
//! seeded at area boundaries, followed by one box blur that preserves the
//! seeds. The watershed partitioner descends this field level by level.

use crate::compact::CompactHeightfield;
use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::math;
use crate::Result;

fn calculate_distance_field(chf: &CompactHeightfield, src: &mut [u16]) -> u16 {
    let w = chf.width;
    let h = chf.height;

    src.fill(0xffff);

    // Seed every span that has a missing cardinal neighbour or an area-id
    // change across one.
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                let area = chf.areas[i];
                let mut matching = 0;
                for dir in 0..4 {
                    if let Some(n) = chf.neighbor_index(x, z, &span, dir) {
                        if chf.areas[n] == area {
                            matching += 1;
                        }
                    }
                }
                if matching != 4 {
                    src[i] = 0;
                }
            }
        }
    }

    let relax = |src: &mut [u16], i: usize, neighbor: usize, cost: u16| {
        let candidate = src[neighbor].saturating_add(cost);
        if candidate < src[i] {
            src[i] = candidate;
        }
    };

    // Forward pass: (-1,0), (-1,-1), (0,-1), (1,-1).
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                if let Some(a) = chf.neighbor_index(x, z, &span, 0) {
                    relax(src, i, a, 2);
                    let aspan = chf.spans[a];
                    if let Some(b) = chf.neighbor_index(x + math::dir_offset_x(0), z, &aspan, 3) {
                        relax(src, i, b, 3);
                    }
                }
                if let Some(a) = chf.neighbor_index(x, z, &span, 3) {
                    relax(src, i, a, 2);
                    let aspan = chf.spans[a];
                    if let Some(b) = chf.neighbor_index(x, z + math::dir_offset_z(3), &aspan, 2) {
                        relax(src, i, b, 3);
                    }
                }
            }
        }
    }

    // Backward pass: (1,0), (1,1), (0,1), (-1,1).
    for z in (0..h).rev() {
        for x in (0..w).rev() {
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                if let Some(a) = chf.neighbor_index(x, z, &span, 2) {
                    relax(src, i, a, 2);
                    let aspan = chf.spans[a];
                    if let Some(b) = chf.neighbor_index(x + math::dir_offset_x(2), z, &aspan, 1) {
                        relax(src, i, b, 3);
                    }
                }
                if let Some(a) = chf.neighbor_index(x, z, &span, 1) {
                    relax(src, i, a, 2);
                    let aspan = chf.spans[a];
                    if let Some(b) = chf.neighbor_index(x, z + math::dir_offset_z(1), &aspan, 0) {
                        relax(src, i, b, 3);
                    }
                }
            }
        }
    }

    src.iter().copied().max().unwrap_or(0)
}

/// 3x3 box blur over span distances. Seeds at or below `threshold * 2` are
/// kept verbatim; missing neighbours contribute the span's own value.
fn box_blur(chf: &CompactHeightfield, threshold: u16, src: &[u16], dst: &mut [u16]) {
    let w = chf.width;
    let h = chf.height;
    let threshold = threshold * 2;

    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                let cd = src[i];
                if cd <= threshold {
                    dst[i] = cd;
                    continue;
                }
                let mut sum = cd as i32;
                for dir in 0..4 {
                    if let Some(a) = chf.neighbor_index(x, z, &span, dir) {
                        sum += src[a] as i32;
                        let aspan = chf.spans[a];
                        let dir2 = (dir + 1) & 0x3;
                        let ax = x + math::dir_offset_x(dir);
                        let az = z + math::dir_offset_z(dir);
                        if let Some(b) = chf.neighbor_index(ax, az, &aspan, dir2) {
                            sum += src[b] as i32;
                        } else {
                            sum += cd as i32;
                        }
                    } else {
                        sum += cd as i32 * 2;
                    }
                }
                dst[i] = ((sum + 5) / 9) as u16;
            }
        }
    }
}

/// Computes `chf.dist` and `chf.max_distance` for watershed partitioning.
pub fn build_distance_field(ctx: &mut BuildContext, chf: &mut CompactHeightfield) -> Result<()> {
    let timer = ScopedTimer::start(ctx, StageTimer::DistanceField);

    let mut src = vec![0u16; chf.span_count];
    let mut dst = vec![0u16; chf.span_count];

    let max_distance = calculate_distance_field(chf, &mut src);
    chf.max_distance = max_distance;

    box_blur(chf, 1, &src, &mut dst);
    chf.dist = dst;

    timer.finish(ctx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heightfield::Heightfield;
    use crate::math::WALKABLE_AREA;
    use glam::Vec3;

    fn open_grid(w: i32, h: i32) -> CompactHeightfield {
        let mut hf = Heightfield::new(
            w,
            h,
            Vec3::ZERO,
            Vec3::new(w as f32, 10.0, h as f32),
            1.0,
            1.0,
        );
        for z in 0..h {
            for x in 0..w {
                hf.add_span(x, z, 0, 1, WALKABLE_AREA, 1).unwrap();
            }
        }
        let mut ctx = BuildContext::new();
        CompactHeightfield::build_from_heightfield(&mut ctx, 2, 1, &hf).unwrap()
    }

    #[test]
    fn distance_grows_toward_the_centre() {
        let mut chf = open_grid(9, 9);
        let mut ctx = BuildContext::new();
        build_distance_field(&mut ctx, &mut chf).unwrap();
        let rim = chf.cell_spans(0, 4).next().unwrap();
        let centre = chf.cell_spans(4, 4).next().unwrap();
        assert_eq!(chf.dist[rim], 0);
        assert!(chf.dist[centre] > chf.dist[rim]);
        assert!(chf.max_distance >= chf.dist[centre]);
    }

    #[test]
    fn seeds_survive_the_blur() {
        let mut chf = open_grid(6, 6);
        let mut ctx = BuildContext::new();
        build_distance_field(&mut ctx, &mut chf).unwrap();
        for z in 0..6 {
            for i in chf.cell_spans(0, z) {
                assert_eq!(chf.dist[i], 0);
            }
        }
    }

    #[test]
    fn area_changes_seed_the_field() {
        let mut chf = open_grid(8, 8);
        // Split the grid into two areas down the middle.
        for z in 0..8 {
            for x in 4..8 {
                for i in chf.cell_spans(x, z) {
                    chf.areas[i] = 5;
                }
            }
        }
        let mut ctx = BuildContext::new();
        build_distance_field(&mut ctx, &mut chf).unwrap();
        // Spans on both sides of the area change are seeds.
        let left = chf.cell_spans(3, 4).next().unwrap();
        let right = chf.cell_spans(4, 4).next().unwrap();
        assert_eq!(chf.dist[left], 0);
        assert_eq!(chf.dist[right], 0);
    }
}
