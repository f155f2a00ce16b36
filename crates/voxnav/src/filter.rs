//! Heightfield filter passes.
//!
//! Three independent passes over the solid heightfield. Each only rewrites
//! span area ids; none adds or removes spans. The pipeline runs them in
//! order: low-hanging obstacles, ledges, low clearance.

use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::heightfield::{Heightfield, SPAN_NONE};
use crate::math::{self, NULL_AREA};

const MAX_HEIGHT: i32 = 0xffff;

/// Recovers unwalkable spans sitting directly on top of a walkable surface
/// when the step between their tops is within `walkable_climb`.
///
/// The walkability of the previous span is sampled before this pass touched
/// it, so a staircase of unwalkable spans is not relabeled wholesale.
pub fn filter_low_hanging_walkable_obstacles(
    ctx: &mut BuildContext,
    walkable_climb: i32,
    hf: &mut Heightfield,
) {
    let timer = ScopedTimer::start(ctx, StageTimer::Filter);

    for z in 0..hf.height {
        for x in 0..hf.width {
            let mut previous_smax = 0i32;
            let mut previous_was_walkable = false;
            let mut previous_area = NULL_AREA;

            let mut cur = hf.head(x, z);
            while cur != SPAN_NONE {
                let span = *hf.span(cur);
                let walkable = span.area != NULL_AREA;

                if !walkable
                    && previous_was_walkable
                    && span.smax as i32 - previous_smax <= walkable_climb
                {
                    hf.span_mut(cur).area = previous_area;
                }

                previous_was_walkable = walkable;
                previous_area = hf.span(cur).area;
                previous_smax = span.smax as i32;
                cur = span.next;
            }
        }
    }

    timer.finish(ctx);
}

/// Marks spans next to ledges as unwalkable.
///
/// A span becomes a ledge when a neighbour direction is missing entirely
/// (off-grid, or no gap wide enough to traverse), when the deepest reachable
/// drop exceeds `walkable_climb`, or when the spread between the lowest and
/// highest traversable neighbour floors exceeds `walkable_climb`.
pub fn filter_ledge_spans(
    ctx: &mut BuildContext,
    walkable_height: i32,
    walkable_climb: i32,
    hf: &mut Heightfield,
) {
    let timer = ScopedTimer::start(ctx, StageTimer::Filter);

    for z in 0..hf.height {
        for x in 0..hf.width {
            let mut cur = hf.head(x, z);
            while cur != SPAN_NONE {
                let span = *hf.span(cur);
                if span.area == NULL_AREA {
                    cur = span.next;
                    continue;
                }

                let floor = span.smax as i32;
                let ceiling = if span.next != SPAN_NONE {
                    hf.span(span.next).smin as i32
                } else {
                    MAX_HEIGHT
                };

                let mut lowest_neighbor_diff = MAX_HEIGHT;
                let mut lowest_traversable_floor = floor;
                let mut highest_traversable_floor = floor;

                for dir in 0..4 {
                    let nx = x + math::dir_offset_x(dir);
                    let nz = z + math::dir_offset_z(dir);
                    if nx < 0 || nz < 0 || nx >= hf.width || nz >= hf.height {
                        // Off-grid counts as an unclimbable drop.
                        lowest_neighbor_diff = -walkable_climb - 1;
                        break;
                    }

                    let mut neighbor = hf.head(nx, nz);
                    let mut neighbor_ceiling = if neighbor != SPAN_NONE {
                        hf.span(neighbor).smin as i32
                    } else {
                        MAX_HEIGHT
                    };

                    // A gap under the whole neighbour column wide enough to
                    // fall through is a ledge as well.
                    if ceiling.min(neighbor_ceiling) - floor >= walkable_height {
                        lowest_neighbor_diff = -walkable_climb - 1;
                        break;
                    }

                    while neighbor != SPAN_NONE {
                        let nspan = *hf.span(neighbor);
                        let neighbor_floor = nspan.smax as i32;
                        neighbor_ceiling = if nspan.next != SPAN_NONE {
                            hf.span(nspan.next).smin as i32
                        } else {
                            MAX_HEIGHT
                        };

                        if ceiling.min(neighbor_ceiling) - floor.max(neighbor_floor)
                            < walkable_height
                        {
                            neighbor = nspan.next;
                            continue;
                        }

                        let diff = neighbor_floor - floor;
                        lowest_neighbor_diff = lowest_neighbor_diff.min(diff);

                        if diff.abs() <= walkable_climb {
                            lowest_traversable_floor =
                                lowest_traversable_floor.min(neighbor_floor);
                            highest_traversable_floor =
                                highest_traversable_floor.max(neighbor_floor);
                        } else if diff < -walkable_climb {
                            break;
                        }
                        neighbor = nspan.next;
                    }
                }

                if lowest_neighbor_diff < -walkable_climb
                    || highest_traversable_floor - lowest_traversable_floor > walkable_climb
                {
                    hf.span_mut(cur).area = NULL_AREA;
                }

                cur = span.next;
            }
        }
    }

    timer.finish(ctx);
}

/// Clears spans whose open clearance above the floor is below
/// `walkable_height`.
pub fn filter_walkable_low_height_spans(
    ctx: &mut BuildContext,
    walkable_height: i32,
    hf: &mut Heightfield,
) {
    let timer = ScopedTimer::start(ctx, StageTimer::Filter);

    for z in 0..hf.height {
        for x in 0..hf.width {
            let mut cur = hf.head(x, z);
            while cur != SPAN_NONE {
                let span = *hf.span(cur);
                let floor = span.smax as i32;
                let ceiling = if span.next != SPAN_NONE {
                    hf.span(span.next).smin as i32
                } else {
                    MAX_HEIGHT
                };
                if ceiling - floor < walkable_height {
                    hf.span_mut(cur).area = NULL_AREA;
                }
                cur = span.next;
            }
        }
    }

    timer.finish(ctx);
}
