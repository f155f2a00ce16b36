//! Property tests for span insertion and compaction invariants.

use glam::Vec3;
use proptest::prelude::*;
use voxnav::{BuildContext, CompactHeightfield, Heightfield};

const GRID: i32 = 8;

fn arb_span() -> impl Strategy<Value = (i32, i32, u16, u16, u8)> {
    (
        0..GRID,
        0..GRID,
        0u16..200,
        1u16..40,
        prop_oneof![Just(0u8), 1u8..=63],
    )
        .prop_map(|(x, z, smin, extent, area)| (x, z, smin, smin + extent, area))
}

fn build_field(spans: &[(i32, i32, u16, u16, u8)], merge_threshold: i32) -> Heightfield {
    let mut hf = Heightfield::new(
        GRID,
        GRID,
        Vec3::ZERO,
        Vec3::new(GRID as f32, 64.0, GRID as f32),
        1.0,
        1.0,
    );
    for &(x, z, smin, smax, area) in spans {
        hf.add_span(x, z, smin, smax, area, merge_threshold).unwrap();
    }
    hf
}

proptest! {
    /// Columns stay sorted and pairwise disjoint no matter the insertion
    /// order or overlap pattern.
    #[test]
    fn columns_stay_sorted_and_disjoint(
        spans in prop::collection::vec(arb_span(), 1..120),
        merge_threshold in 0i32..8,
    ) {
        let hf = build_field(&spans, merge_threshold);
        for z in 0..GRID {
            for x in 0..GRID {
                let column: Vec<(u16, u16)> =
                    hf.column(x, z).map(|s| (s.smin, s.smax)).collect();
                for span in &column {
                    prop_assert!(span.0 < span.1);
                }
                for pair in column.windows(2) {
                    prop_assert!(pair[0].1 < pair[1].0,
                        "overlapping or touching spans {:?}", pair);
                }
            }
        }
    }

    /// Every inserted solid voxel is covered by some span afterwards.
    #[test]
    fn inserted_voxels_stay_covered(
        spans in prop::collection::vec(arb_span(), 1..60),
    ) {
        let hf = build_field(&spans, 1);
        for &(x, z, smin, smax, _) in &spans {
            let covered = hf.column(x, z).any(|s| s.smin <= smin && s.smax >= smax);
            prop_assert!(covered, "span [{smin},{smax}) at ({x},{z}) lost");
        }
    }

    /// Compaction preserves the column structure: spans are contiguous per
    /// cell and ascend strictly in y, and every link is reciprocal.
    #[test]
    fn compaction_invariants_hold(
        spans in prop::collection::vec(arb_span(), 1..80),
        // Keep the climb at most half the clearance so each open span can
        // reach only one layer of a neighbour column; reverse links are
        // then exact.
        (walkable_height, walkable_climb) in (2i32..8).prop_flat_map(|h| (Just(h), 0..=h / 2)),
    ) {
        let hf = build_field(&spans, 1);
        let mut ctx = BuildContext::new();
        let chf = CompactHeightfield::build_from_heightfield(
            &mut ctx,
            walkable_height,
            walkable_climb,
            &hf,
        ).unwrap();

        let mut next_start = 0u32;
        for z in 0..GRID {
            for x in 0..GRID {
                let cell = chf.cell(x, z);
                prop_assert!(cell.index >= next_start);
                next_start = cell.index + cell.count as u32;

                let ys: Vec<u16> = chf.cell_spans(x, z).map(|i| chf.spans[i].y).collect();
                for pair in ys.windows(2) {
                    prop_assert!(pair[0] < pair[1]);
                }

                for i in chf.cell_spans(x, z) {
                    let span = chf.spans[i];
                    for dir in 0..4 {
                        if let Some(n) = chf.neighbor_index(x, z, &span, dir) {
                            let nx = x + [-1, 0, 1, 0][dir];
                            let nz = z + [0, 1, 0, -1][dir];
                            let back = chf.neighbor_index(
                                nx,
                                nz,
                                &chf.spans[n],
                                (dir + 2) & 0x3,
                            );
                            // The reverse link either points back or is
                            // unconnected; it never points elsewhere.
                            if let Some(back) = back {
                                prop_assert_eq!(back, i);
                            }
                        }
                    }
                }
            }
        }
    }
}
