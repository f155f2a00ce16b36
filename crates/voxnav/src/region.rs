//! Region partitioning of the compact heightfield.
//!
//! Three interchangeable algorithms write a region id into every walkable
//! span: watershed growth over the boundary distance field, a monotone row
//! sweep, and a row sweep merged into 2D layers. Watershed and monotone
//! share a post-process that drops small islands, merges small regions into
//! neighbours, and renumbers ids densely.

use crate::compact::CompactHeightfield;
use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::math::{self, NULL_AREA};
use crate::{Error, Result};

/// High bit marking spans painted by the tile border frame. Border regions
/// are created first and never merged.
pub const BORDER_REG: u16 = 0x8000;

/// Safety valve for boundary walks.
const MAX_CONTOUR_ITERS: usize = 40_000;

#[derive(Debug, Clone, Copy)]
struct LevelStackEntry {
    x: i32,
    z: i32,
    /// Span index, or `usize::MAX` once consumed.
    index: usize,
}

const CONSUMED: usize = usize::MAX;

/// Bookkeeping for one region during post-processing.
#[derive(Debug, Clone)]
struct Region {
    span_count: i32,
    id: u16,
    area_type: u8,
    remap: bool,
    visited: bool,
    overlap: bool,
    connects_to_border: bool,
    ymin: u16,
    ymax: u16,
    /// Ordered ring of neighbouring region ids along the contour.
    connections: Vec<u16>,
    /// Region ids stacked in the same columns as this one.
    floors: Vec<u16>,
}

impl Region {
    fn new(id: u16) -> Self {
        Self {
            span_count: 0,
            id,
            area_type: 0,
            remap: false,
            visited: false,
            overlap: false,
            connects_to_border: false,
            ymin: 0xffff,
            ymax: 0,
            connections: Vec::new(),
            floors: Vec::new(),
        }
    }
}

fn paint_rect_region(
    min_x: i32,
    max_x: i32,
    min_z: i32,
    max_z: i32,
    region_id: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
) {
    for z in min_z..max_z {
        for x in min_x..max_x {
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] != NULL_AREA {
                    src_reg[i] = region_id;
                }
            }
        }
    }
}

fn flood_region(
    x: i32,
    z: i32,
    i: usize,
    level: u16,
    region_id: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
    src_dist: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
) -> bool {
    let area = chf.areas[i];

    stack.clear();
    stack.push(LevelStackEntry { x, z, index: i });
    src_reg[i] = region_id;
    src_dist[i] = 0;

    let lev = level.saturating_sub(2);
    let mut count = 0;

    while let Some(back) = stack.pop() {
        let (cx, cz, ci) = (back.x, back.z, back.index);
        let span = chf.spans[ci];

        // If any 8-neighbour already belongs to another region, withdraw
        // this span so regions do not bleed across narrow saddles. The
        // diagonal is reached by a two-hop walk through the rotated
        // direction.
        let mut other = 0u16;
        'dirs: for dir in 0..4 {
            if let Some(ai) = chf.neighbor_index(cx, cz, &span, dir) {
                if chf.areas[ai] != area {
                    continue;
                }
                let nr = src_reg[ai];
                if nr & BORDER_REG != 0 {
                    continue;
                }
                if nr != 0 && nr != region_id {
                    other = nr;
                    break 'dirs;
                }
                let aspan = chf.spans[ai];
                let dir2 = (dir + 1) & 0x3;
                let ax = cx + math::dir_offset_x(dir);
                let az = cz + math::dir_offset_z(dir);
                if let Some(ai2) = chf.neighbor_index(ax, az, &aspan, dir2) {
                    if chf.areas[ai2] != area {
                        continue;
                    }
                    let nr2 = src_reg[ai2];
                    if nr2 != 0 && nr2 != region_id {
                        other = nr2;
                        break 'dirs;
                    }
                }
            }
        }
        if other != 0 {
            src_reg[ci] = 0;
            continue;
        }

        count += 1;

        for dir in 0..4 {
            if let Some(ai) = chf.neighbor_index(cx, cz, &span, dir) {
                if chf.areas[ai] != area {
                    continue;
                }
                if chf.dist[ai] >= lev && src_reg[ai] == 0 {
                    src_reg[ai] = region_id;
                    src_dist[ai] = 0;
                    stack.push(LevelStackEntry {
                        x: cx + math::dir_offset_x(dir),
                        z: cz + math::dir_offset_z(dir),
                        index: ai,
                    });
                }
            }
        }
    }

    count > 0
}

fn expand_regions(
    max_iter: i32,
    level: u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
    src_dist: &mut [u16],
    stack: &mut Vec<LevelStackEntry>,
    fill_stack: bool,
) {
    let w = chf.width;
    let h = chf.height;

    if fill_stack {
        stack.clear();
        for z in 0..h {
            for x in 0..w {
                for i in chf.cell_spans(x, z) {
                    if chf.dist[i] >= level && src_reg[i] == 0 && chf.areas[i] != NULL_AREA {
                        stack.push(LevelStackEntry { x, z, index: i });
                    }
                }
            }
        }
    } else {
        for entry in stack.iter_mut() {
            if entry.index != CONSUMED && src_reg[entry.index] != 0 {
                entry.index = CONSUMED;
            }
        }
    }

    let mut iter = 0;
    // Writes are batched so one round sees a consistent snapshot.
    let mut dirty: Vec<(usize, u16, u16)> = Vec::new();

    while !stack.is_empty() {
        let mut failed = 0usize;
        dirty.clear();

        for entry in stack.iter_mut() {
            let i = entry.index;
            if i == CONSUMED {
                failed += 1;
                continue;
            }
            let mut r = src_reg[i];
            let mut d2 = 0xffffu16;
            let area = chf.areas[i];
            let span = chf.spans[i];
            for dir in 0..4 {
                if let Some(ai) = chf.neighbor_index(entry.x, entry.z, &span, dir) {
                    if chf.areas[ai] != area {
                        continue;
                    }
                    if src_reg[ai] > 0
                        && src_reg[ai] & BORDER_REG == 0
                        && src_dist[ai].saturating_add(2) < d2
                    {
                        r = src_reg[ai];
                        d2 = src_dist[ai].saturating_add(2);
                    }
                }
            }
            if r != 0 {
                entry.index = CONSUMED;
                dirty.push((i, r, d2));
            } else {
                failed += 1;
            }
        }

        for &(i, r, d2) in &dirty {
            src_reg[i] = r;
            src_dist[i] = d2;
        }

        if failed == stack.len() {
            break;
        }
        if level > 0 {
            iter += 1;
            if iter >= max_iter {
                break;
            }
        }
    }
}

fn sort_cells_by_level(
    start_level: u16,
    chf: &CompactHeightfield,
    src_reg: &[u16],
    stacks: &mut [Vec<LevelStackEntry>],
    log_levels_per_stack: u16,
) {
    let start_level = start_level >> log_levels_per_stack;
    for stack in stacks.iter_mut() {
        stack.clear();
    }
    for z in 0..chf.height {
        for x in 0..chf.width {
            for i in chf.cell_spans(x, z) {
                if chf.areas[i] == NULL_AREA || src_reg[i] != 0 {
                    continue;
                }
                let level = chf.dist[i] >> log_levels_per_stack;
                let s_id = start_level.saturating_sub(level) as usize;
                if s_id >= stacks.len() {
                    continue;
                }
                stacks[s_id].push(LevelStackEntry { x, z, index: i });
            }
        }
    }
}

fn append_stacks(
    src_stack: &[LevelStackEntry],
    dst_stack: &mut Vec<LevelStackEntry>,
    src_reg: &[u16],
) {
    for &entry in src_stack {
        if entry.index != CONSUMED && src_reg[entry.index] == 0 {
            dst_stack.push(entry);
        }
    }
}

fn remove_adjacent_neighbours(region: &mut Region) {
    let conns = &mut region.connections;
    let mut i = 0;
    while i < conns.len() && conns.len() > 1 {
        let ni = (i + 1) % conns.len();
        if conns[i] == conns[ni] {
            conns.remove(ni);
        } else {
            i += 1;
        }
    }
}

fn replace_neighbour(region: &mut Region, old_id: u16, new_id: u16) {
    let mut changed = false;
    for conn in region.connections.iter_mut() {
        if *conn == old_id {
            *conn = new_id;
            changed = true;
        }
    }
    for floor in region.floors.iter_mut() {
        if *floor == old_id {
            *floor = new_id;
        }
    }
    if changed {
        remove_adjacent_neighbours(region);
    }
}

fn can_merge_with_region(a: &Region, b: &Region) -> bool {
    if a.area_type != b.area_type {
        return false;
    }
    // The shared boundary must be a single segment.
    let shared = a.connections.iter().filter(|&&c| c == b.id).count();
    if shared > 1 {
        return false;
    }
    // Vertically stacked regions never merge.
    if a.floors.contains(&b.id) {
        return false;
    }
    true
}

fn add_unique_floor_region(region: &mut Region, id: u16) {
    if !region.floors.contains(&id) {
        region.floors.push(id);
    }
}

/// Merges `b` into `a`, stitching the two contour rings together at the
/// points where they reference each other.
fn merge_region_pair(a: &mut Region, b: &mut Region) -> bool {
    let aid = a.id;
    let bid = b.id;

    let acon = a.connections.clone();
    let bcon = b.connections.clone();

    let Some(insa) = acon.iter().position(|&c| c == bid) else {
        return false;
    };
    let Some(insb) = bcon.iter().position(|&c| c == aid) else {
        return false;
    };

    a.connections.clear();
    let na = acon.len();
    for i in 0..na.saturating_sub(1) {
        a.connections.push(acon[(insa + 1 + i) % na]);
    }
    let nb = bcon.len();
    for i in 0..nb.saturating_sub(1) {
        a.connections.push(bcon[(insb + 1 + i) % nb]);
    }
    remove_adjacent_neighbours(a);

    for &floor in &b.floors {
        add_unique_floor_region(a, floor);
    }
    a.span_count += b.span_count;
    b.span_count = 0;
    b.connections.clear();
    true
}

fn is_region_connected_to_border(region: &Region) -> bool {
    region.connections.contains(&0)
}

/// True when the neighbour of span `i` in `dir` carries a different region.
fn is_solid_edge(
    chf: &CompactHeightfield,
    src_reg: &[u16],
    x: i32,
    z: i32,
    i: usize,
    dir: usize,
) -> bool {
    let span = chf.spans[i];
    let r = chf
        .neighbor_index(x, z, &span, dir)
        .map(|ai| src_reg[ai])
        .unwrap_or(0);
    r != src_reg[i]
}

/// Follows a region boundary clockwise and records the ring of neighbouring
/// region ids. On a solid edge the neighbour is recorded and the walk turns
/// clockwise; otherwise it steps forward and turns counter-clockwise.
fn walk_contour(
    mut x: i32,
    mut z: i32,
    mut i: usize,
    mut dir: usize,
    chf: &CompactHeightfield,
    src_reg: &[u16],
    contour: &mut Vec<u16>,
) {
    let start_dir = dir;
    let start_i = i;

    let span = chf.spans[i];
    let mut cur_reg = chf
        .neighbor_index(x, z, &span, dir)
        .map(|ai| src_reg[ai])
        .unwrap_or(0);
    contour.push(cur_reg);

    for _ in 0..MAX_CONTOUR_ITERS {
        let span = chf.spans[i];
        if is_solid_edge(chf, src_reg, x, z, i, dir) {
            let r = chf
                .neighbor_index(x, z, &span, dir)
                .map(|ai| src_reg[ai])
                .unwrap_or(0);
            if r != cur_reg {
                cur_reg = r;
                contour.push(cur_reg);
            }
            dir = (dir + 1) & 0x3;
        } else {
            let Some(ni) = chf.neighbor_index(x, z, &span, dir) else {
                return;
            };
            x += math::dir_offset_x(dir);
            z += math::dir_offset_z(dir);
            i = ni;
            dir = (dir + 3) & 0x3;
        }

        if start_i == i && start_dir == dir {
            break;
        }
    }

    // A boundary segment shared twice in a row collapses to one entry.
    let mut j = 0;
    while contour.len() > 1 && j < contour.len() {
        let nj = (j + 1) % contour.len();
        if contour[j] == contour[nj] {
            contour.remove(nj);
        } else {
            j += 1;
        }
    }
}

/// Shared post-process for watershed and monotone partitioning: island drop,
/// small-region merge, dense renumbering.
fn merge_and_filter_regions(
    ctx: &mut BuildContext,
    min_region_area: i32,
    merge_region_area: i32,
    max_region_id: &mut u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
) -> Result<Vec<u16>> {
    let w = chf.width;
    let h = chf.height;
    let nreg = *max_region_id as usize + 1;

    let mut regions: Vec<Region> = (0..nreg).map(|i| Region::new(i as u16)).collect();

    // Gather region sizes, stacked floors, and contour neighbour rings.
    for z in 0..h {
        for x in 0..w {
            let cell = chf.cell_spans(x, z);
            for i in cell.clone() {
                let r = src_reg[i];
                if r == 0 || r as usize >= nreg {
                    continue;
                }
                regions[r as usize].span_count += 1;

                for j in cell.clone() {
                    if i == j {
                        continue;
                    }
                    let floor_id = src_reg[j];
                    if floor_id == 0 || floor_id as usize >= nreg {
                        continue;
                    }
                    if floor_id == r {
                        regions[r as usize].overlap = true;
                    }
                    add_unique_floor_region(&mut regions[r as usize], floor_id);
                }

                if !regions[r as usize].connections.is_empty() {
                    continue;
                }
                regions[r as usize].area_type = chf.areas[i];

                if let Some(dir) = (0..4).find(|&d| is_solid_edge(chf, src_reg, x, z, i, d)) {
                    let mut ring = Vec::new();
                    walk_contour(x, z, i, dir, chf, src_reg, &mut ring);
                    regions[r as usize].connections = ring;
                }
            }
        }
    }

    // Drop connected components that are too small and do not touch a tile
    // border.
    let mut stack: Vec<usize> = Vec::with_capacity(32);
    let mut trace: Vec<usize> = Vec::with_capacity(32);
    for i in 0..nreg {
        if regions[i].id == 0 || regions[i].id & BORDER_REG != 0 {
            continue;
        }
        if regions[i].span_count == 0 || regions[i].visited {
            continue;
        }

        let mut connects_to_border = false;
        let mut span_count = 0;
        stack.clear();
        trace.clear();
        regions[i].visited = true;
        stack.push(i);

        while let Some(ri) = stack.pop() {
            span_count += regions[ri].span_count;
            trace.push(ri);
            let connections = regions[ri].connections.clone();
            for conn in connections {
                if conn & BORDER_REG != 0 {
                    connects_to_border = true;
                    continue;
                }
                let nei = conn as usize;
                if regions[nei].visited
                    || regions[nei].id == 0
                    || regions[nei].id & BORDER_REG != 0
                {
                    continue;
                }
                stack.push(regions[nei].id as usize);
                regions[nei].visited = true;
            }
        }

        if span_count < min_region_area && !connects_to_border {
            for &t in &trace {
                regions[t].span_count = 0;
                regions[t].id = 0;
            }
        }
    }

    // Merge small regions into the smallest mergeable neighbour until the
    // set stabilizes.
    loop {
        let mut merge_count = 0;
        for i in 0..nreg {
            let (id, span_count, overlap) =
                (regions[i].id, regions[i].span_count, regions[i].overlap);
            if id == 0 || id & BORDER_REG != 0 || overlap || span_count == 0 {
                continue;
            }
            if span_count > merge_region_area && is_region_connected_to_border(&regions[i]) {
                continue;
            }

            let mut smallest = i32::MAX;
            let mut merge_id = id;
            for &conn in &regions[i].connections {
                if conn & BORDER_REG != 0 {
                    continue;
                }
                let m = conn as usize;
                if m >= nreg {
                    continue;
                }
                let mreg = &regions[m];
                if mreg.id == 0 || mreg.id & BORDER_REG != 0 || mreg.overlap {
                    continue;
                }
                if mreg.span_count < smallest
                    && can_merge_with_region(&regions[i], mreg)
                    && can_merge_with_region(mreg, &regions[i])
                {
                    smallest = mreg.span_count;
                    merge_id = mreg.id;
                }
            }

            if merge_id != id {
                let old_id = id;
                let target = merge_id as usize;
                let (merged, source) = {
                    let mut source = regions[i].clone();
                    let ok = merge_region_pair(&mut regions[target], &mut source);
                    (ok, source)
                };
                if merged {
                    regions[i] = source;
                    for region in regions.iter_mut() {
                        if region.id == 0 || region.id & BORDER_REG != 0 {
                            continue;
                        }
                        if region.id == old_id {
                            region.id = merge_id;
                        }
                        replace_neighbour(region, old_id, merge_id);
                    }
                    merge_count += 1;
                }
            }
        }
        if merge_count == 0 {
            break;
        }
    }

    // Renumber surviving regions densely from 1.
    for region in regions.iter_mut() {
        region.remap = region.id != 0 && region.id & BORDER_REG == 0;
    }
    let mut next_id = 0u16;
    for i in 0..nreg {
        if !regions[i].remap {
            continue;
        }
        next_id += 1;
        let old_id = regions[i].id;
        for region in regions.iter_mut().skip(i) {
            if region.id == old_id {
                region.id = next_id;
                region.remap = false;
            }
        }
    }
    *max_region_id = next_id;

    for reg in src_reg.iter_mut() {
        if *reg & BORDER_REG == 0 {
            *reg = regions[*reg as usize].id;
        }
    }

    let overlaps: Vec<u16> = regions
        .iter()
        .filter(|r| r.overlap)
        .map(|r| r.id)
        .collect();
    if !overlaps.is_empty() {
        ctx.warn(
            "regions",
            format!("{} overlapping regions after merge", overlaps.len()),
        );
    }
    Ok(overlaps)
}

fn add_unique_connection(region: &mut Region, id: u16) {
    if !region.connections.contains(&id) {
        region.connections.push(id);
    }
}

/// Post-process for layer partitioning: merges same-component regions that
/// do not overlap vertically into one layer id each.
fn merge_and_filter_layer_regions(
    _ctx: &mut BuildContext,
    min_region_area: i32,
    max_region_id: &mut u16,
    chf: &CompactHeightfield,
    src_reg: &mut [u16],
) -> Result<()> {
    let w = chf.width;
    let h = chf.height;
    let nreg = *max_region_id as usize + 1;

    let mut regions: Vec<Region> = (0..nreg).map(|i| Region::new(i as u16)).collect();

    // Topology: sizes, vertical extents, unordered neighbour sets, floors.
    let mut column_regs: Vec<u16> = Vec::with_capacity(32);
    for z in 0..h {
        for x in 0..w {
            column_regs.clear();
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                let ri = src_reg[i];
                if ri == 0 || ri as usize >= nreg {
                    continue;
                }
                {
                    let region = &mut regions[ri as usize];
                    region.span_count += 1;
                    region.area_type = chf.areas[i];
                    region.ymin = region.ymin.min(span.y);
                    region.ymax = region.ymax.max(span.y);
                }
                column_regs.push(ri);

                for dir in 0..4 {
                    if let Some(ai) = chf.neighbor_index(x, z, &span, dir) {
                        let rai = src_reg[ai];
                        if rai > 0 && (rai as usize) < nreg && rai != ri {
                            add_unique_connection(&mut regions[ri as usize], rai);
                        }
                        if rai & BORDER_REG != 0 {
                            regions[ri as usize].connects_to_border = true;
                        }
                    }
                }
            }

            for a in 0..column_regs.len() {
                for b in a + 1..column_regs.len() {
                    if column_regs[a] != column_regs[b] {
                        let (ra, rb) = (column_regs[a], column_regs[b]);
                        add_unique_floor_region(&mut regions[ra as usize], rb);
                        add_unique_floor_region(&mut regions[rb as usize], ra);
                    }
                }
            }
        }
    }

    // BFS over the adjacency, refusing merges that would stack two spans of
    // one column into the same layer.
    let mut layer_id = 1u16;
    for region in regions.iter_mut() {
        region.id = 0;
    }

    let mut queue: Vec<usize> = Vec::with_capacity(32);
    for root_idx in 1..nreg {
        if regions[root_idx].id != 0 {
            continue;
        }
        regions[root_idx].id = layer_id;
        queue.clear();
        queue.push(root_idx);

        while !queue.is_empty() {
            let reg_idx = queue.remove(0);
            let connections = regions[reg_idx].connections.clone();
            let area_type = regions[reg_idx].area_type;
            for conn in connections {
                let nei = conn as usize;
                if nei >= nreg || regions[nei].id != 0 {
                    continue;
                }
                if regions[nei].area_type != area_type {
                    continue;
                }
                if regions[root_idx].floors.contains(&conn) {
                    continue;
                }

                queue.push(nei);
                regions[nei].id = layer_id;

                let nei_floors = regions[nei].floors.clone();
                for floor in nei_floors {
                    add_unique_floor_region(&mut regions[root_idx], floor);
                }
                regions[root_idx].ymin = regions[root_idx].ymin.min(regions[nei].ymin);
                regions[root_idx].ymax = regions[root_idx].ymax.max(regions[nei].ymax);
                regions[root_idx].span_count += regions[nei].span_count;
                regions[nei].span_count = 0;
                regions[root_idx].connects_to_border =
                    regions[root_idx].connects_to_border || regions[nei].connects_to_border;
            }
        }

        layer_id += 1;
    }

    // Drop small layers.
    for i in 0..nreg {
        if regions[i].span_count > 0
            && regions[i].span_count < min_region_area
            && !regions[i].connects_to_border
        {
            let dead = regions[i].id;
            for region in regions.iter_mut() {
                if region.id == dead {
                    region.id = 0;
                }
            }
        }
    }

    // Dense renumbering, identical to the non-layer path.
    for region in regions.iter_mut() {
        region.remap = region.id != 0 && region.id & BORDER_REG == 0;
    }
    let mut next_id = 0u16;
    for i in 0..nreg {
        if !regions[i].remap {
            continue;
        }
        next_id += 1;
        let old_id = regions[i].id;
        for region in regions.iter_mut().skip(i) {
            if region.id == old_id {
                region.id = next_id;
                region.remap = false;
            }
        }
    }
    *max_region_id = next_id;

    for reg in src_reg.iter_mut() {
        if *reg & BORDER_REG == 0 {
            *reg = regions[*reg as usize].id;
        }
    }

    Ok(())
}

fn paint_borders(
    chf: &CompactHeightfield,
    border_size: i32,
    src_reg: &mut [u16],
    region_id: &mut u16,
) {
    let w = chf.width;
    let h = chf.height;
    let bw = w.min(border_size);
    let bh = h.min(border_size);
    paint_rect_region(0, bw, 0, h, *region_id | BORDER_REG, chf, src_reg);
    *region_id += 1;
    paint_rect_region(w - bw, w, 0, h, *region_id | BORDER_REG, chf, src_reg);
    *region_id += 1;
    paint_rect_region(0, w, 0, bh, *region_id | BORDER_REG, chf, src_reg);
    *region_id += 1;
    paint_rect_region(0, w, h - bh, h, *region_id | BORDER_REG, chf, src_reg);
    *region_id += 1;
}

/// Watershed partitioning over the boundary distance field.
///
/// The distance field must have been built already (the builder runs
/// [`crate::distance::build_distance_field`] right before this).
pub fn build_regions_watershed(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
    border_size: i32,
    min_region_area: i32,
    merge_region_area: i32,
) -> Result<()> {
    debug_assert_eq!(chf.dist.len(), chf.span_count);
    let timer = ScopedTimer::start(ctx, StageTimer::Regions);

    let span_count = chf.span_count;
    let mut src_reg = vec![0u16; span_count];
    let mut src_dist = vec![0u16; span_count];

    const LOG_NB_STACKS: u16 = 3;
    const NB_STACKS: usize = 1 << LOG_NB_STACKS;
    let mut lvl_stacks: [Vec<LevelStackEntry>; NB_STACKS] = Default::default();
    let mut stack: Vec<LevelStackEntry> = Vec::with_capacity(256);

    let mut region_id = 1u16;
    let mut level = (chf.max_distance + 1) & !1u16;

    // More expansion iterations per level means the watershed overflows
    // further before new seeds are planted, simplifying region borders.
    let expand_iters = 8;

    if border_size > 0 {
        paint_borders(chf, border_size, &mut src_reg, &mut region_id);
    }
    chf.border_size = border_size;

    let mut s_id: i32 = -1;
    while level > 0 {
        level = level.saturating_sub(2);
        s_id = (s_id + 1) & (NB_STACKS as i32 - 1);

        if s_id == 0 {
            sort_cells_by_level(level, chf, &src_reg, &mut lvl_stacks, 1);
        } else {
            let (left, right) = lvl_stacks.split_at_mut(s_id as usize);
            append_stacks(&left[s_id as usize - 1], &mut right[0], &src_reg);
        }

        expand_regions(
            expand_iters,
            level,
            chf,
            &mut src_reg,
            &mut src_dist,
            &mut lvl_stacks[s_id as usize],
            false,
        );

        for j in 0..lvl_stacks[s_id as usize].len() {
            let entry = lvl_stacks[s_id as usize][j];
            if entry.index == CONSUMED || src_reg[entry.index] != 0 {
                continue;
            }
            if flood_region(
                entry.x,
                entry.z,
                entry.index,
                level,
                region_id,
                chf,
                &mut src_reg,
                &mut src_dist,
                &mut stack,
            ) {
                if region_id == 0xffff {
                    timer.finish(ctx);
                    ctx.error("regions", "region id overflow");
                    return Err(Error::Build("region id overflow"));
                }
                region_id += 1;
            }
        }
    }

    expand_regions(
        expand_iters * 8,
        0,
        chf,
        &mut src_reg,
        &mut src_dist,
        &mut stack,
        true,
    );

    let mut max_region_id = region_id;
    merge_and_filter_regions(
        ctx,
        min_region_area,
        merge_region_area,
        &mut max_region_id,
        chf,
        &mut src_reg,
    )?;
    chf.max_regions = max_region_id;
    log::debug!("watershed settled on {} regions", max_region_id);

    for (span, &reg) in chf.spans.iter_mut().zip(&src_reg) {
        span.reg = reg;
    }

    timer.finish(ctx);
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
struct SweepSpan {
    /// Row-local id.
    rid: u16,
    /// Committed global id.
    id: u16,
    /// Samples matched against the previous row.
    ns: u16,
    /// Candidate region in the previous row, `NULL_NEI` when ambiguous.
    nei: u16,
}

const NULL_NEI: u16 = 0xffff;

fn sweep_rows(
    chf: &CompactHeightfield,
    border_size: i32,
    src_reg: &mut [u16],
    region_id: &mut u16,
) {
    let w = chf.width;
    let h = chf.height;
    let nsweeps = w.max(h) as usize + 1;
    let mut sweeps = vec![SweepSpan::default(); nsweeps];
    let mut prev_counts: Vec<i32> = Vec::with_capacity(256);

    for z in border_size..h - border_size {
        prev_counts.clear();
        prev_counts.resize(*region_id as usize + 1, 0);
        let mut rid = 1u16;

        for x in border_size..w - border_size {
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                if chf.areas[i] == NULL_AREA {
                    continue;
                }

                // Inherit from -x when the neighbour is a plain span of the
                // same area.
                let mut previd = 0u16;
                if let Some(ai) = chf.neighbor_index(x, z, &span, 0) {
                    if src_reg[ai] & BORDER_REG == 0 && chf.areas[i] == chf.areas[ai] {
                        previd = src_reg[ai];
                    }
                }

                if previd == 0 {
                    previd = rid;
                    rid += 1;
                    if previd as usize >= sweeps.len() {
                        sweeps.resize(previd as usize + 1, SweepSpan::default());
                    }
                    sweeps[previd as usize] = SweepSpan {
                        rid: previd,
                        id: 0,
                        ns: 0,
                        nei: 0,
                    };
                }

                // Sample the -z neighbour to decide whether this sweep can
                // adopt a region from the previous row.
                if let Some(ai) = chf.neighbor_index(x, z, &span, 3) {
                    let nr = src_reg[ai];
                    if nr != 0 && nr & BORDER_REG == 0 && chf.areas[i] == chf.areas[ai] {
                        let sweep = &mut sweeps[previd as usize];
                        if sweep.nei == 0 || sweep.nei == nr {
                            sweep.nei = nr;
                            sweep.ns += 1;
                            prev_counts[nr as usize] += 1;
                        } else {
                            sweep.nei = NULL_NEI;
                        }
                    }
                }

                src_reg[i] = previd;
            }
        }

        // Commit row-local ids: adopt the previous row's region only when
        // every sample agreed and the counts match.
        for i in 1..rid {
            let sweep = &mut sweeps[i as usize];
            if sweep.nei != NULL_NEI
                && sweep.nei != 0
                && prev_counts[sweep.nei as usize] == sweep.ns as i32
            {
                sweep.id = sweep.nei;
            } else {
                sweep.id = *region_id;
                *region_id += 1;
            }
        }

        for x in border_size..w - border_size {
            for i in chf.cell_spans(x, z) {
                if src_reg[i] > 0 && src_reg[i] < rid {
                    src_reg[i] = sweeps[src_reg[i] as usize].id;
                }
            }
        }
    }
}

/// Monotone partitioning: a single row sweep with no holes or overlaps,
/// producing thin elongated regions.
pub fn build_regions_monotone(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
    border_size: i32,
    min_region_area: i32,
    merge_region_area: i32,
) -> Result<()> {
    let timer = ScopedTimer::start(ctx, StageTimer::Regions);

    let mut src_reg = vec![0u16; chf.span_count];
    let mut region_id = 1u16;

    if border_size > 0 {
        paint_borders(chf, border_size, &mut src_reg, &mut region_id);
    }
    chf.border_size = border_size;

    sweep_rows(chf, border_size, &mut src_reg, &mut region_id);

    let mut max_region_id = region_id;
    merge_and_filter_regions(
        ctx,
        min_region_area,
        merge_region_area,
        &mut max_region_id,
        chf,
        &mut src_reg,
    )?;
    chf.max_regions = max_region_id;

    for (span, &reg) in chf.spans.iter_mut().zip(&src_reg) {
        span.reg = reg;
    }

    timer.finish(ctx);
    Ok(())
}

/// Layer partitioning: the monotone row sweep merged into 2D layers whose
/// spans never overlap vertically.
pub fn build_layer_regions(
    ctx: &mut BuildContext,
    chf: &mut CompactHeightfield,
    border_size: i32,
    min_region_area: i32,
) -> Result<()> {
    let timer = ScopedTimer::start(ctx, StageTimer::Regions);

    let mut src_reg = vec![0u16; chf.span_count];
    let mut region_id = 1u16;

    if border_size > 0 {
        paint_borders(chf, border_size, &mut src_reg, &mut region_id);
    }
    chf.border_size = border_size;

    sweep_rows(chf, border_size, &mut src_reg, &mut region_id);

    let mut max_region_id = region_id;
    merge_and_filter_layer_regions(ctx, min_region_area, &mut max_region_id, chf, &mut src_reg)?;
    chf.max_regions = max_region_id;

    for (span, &reg) in chf.spans.iter_mut().zip(&src_reg) {
        span.reg = reg;
    }

    timer.finish(ctx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance;
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

    fn two_islands() -> CompactHeightfield {
        // Two 4x8 plates separated by an empty strip.
        let mut hf = Heightfield::new(
            12,
            8,
            Vec3::ZERO,
            Vec3::new(12.0, 10.0, 8.0),
            1.0,
            1.0,
        );
        for z in 0..8 {
            for x in 0..4 {
                hf.add_span(x, z, 0, 1, WALKABLE_AREA, 1).unwrap();
            }
            for x in 8..12 {
                hf.add_span(x, z, 0, 1, WALKABLE_AREA, 1).unwrap();
            }
        }
        let mut ctx = BuildContext::new();
        CompactHeightfield::build_from_heightfield(&mut ctx, 2, 1, &hf).unwrap()
    }

    fn assert_all_walkable_have_regions(chf: &CompactHeightfield) {
        for i in 0..chf.span_count {
            if chf.areas[i] != NULL_AREA {
                assert_ne!(chf.spans[i].reg, 0, "span {i} has no region");
            }
        }
    }

    fn region_set(chf: &CompactHeightfield) -> std::collections::BTreeSet<u16> {
        chf.spans
            .iter()
            .map(|s| s.reg & !BORDER_REG)
            .filter(|&r| r != 0)
            .collect()
    }

    #[test]
    fn watershed_covers_one_plate_with_one_region() {
        let mut chf = open_grid(10, 10);
        let mut ctx = BuildContext::new();
        distance::build_distance_field(&mut ctx, &mut chf).unwrap();
        build_regions_watershed(&mut ctx, &mut chf, 0, 2, 10).unwrap();
        assert_all_walkable_have_regions(&chf);
        assert_eq!(region_set(&chf).len(), 1);
        assert_eq!(chf.max_regions, 1);
    }

    #[test]
    fn watershed_separates_islands() {
        let mut chf = two_islands();
        let mut ctx = BuildContext::new();
        distance::build_distance_field(&mut ctx, &mut chf).unwrap();
        build_regions_watershed(&mut ctx, &mut chf, 0, 2, 100).unwrap();
        assert_all_walkable_have_regions(&chf);
        assert_eq!(region_set(&chf).len(), 2);
    }

    #[test]
    fn small_islands_are_dropped() {
        // One large plate and a 2x2 crumb.
        let mut hf = Heightfield::new(
            12,
            8,
            Vec3::ZERO,
            Vec3::new(12.0, 10.0, 8.0),
            1.0,
            1.0,
        );
        for z in 0..8 {
            for x in 0..8 {
                hf.add_span(x, z, 0, 1, WALKABLE_AREA, 1).unwrap();
            }
        }
        for z in 3..5 {
            for x in 10..12 {
                hf.add_span(x, z, 0, 1, WALKABLE_AREA, 1).unwrap();
            }
        }
        let mut ctx = BuildContext::new();
        let mut chf = CompactHeightfield::build_from_heightfield(&mut ctx, 2, 1, &hf).unwrap();
        distance::build_distance_field(&mut ctx, &mut chf).unwrap();
        build_regions_watershed(&mut ctx, &mut chf, 0, 8, 20).unwrap();
        // The 4-span crumb is below min_region_area and vanished.
        assert_eq!(region_set(&chf).len(), 1);
        for z in 3..5 {
            for x in 10..12 {
                for i in chf.cell_spans(x, z) {
                    assert_eq!(chf.spans[i].reg, 0);
                }
            }
        }
    }

    #[test]
    fn monotone_produces_no_column_sharing() {
        let mut chf = open_grid(10, 10);
        let mut ctx = BuildContext::new();
        build_regions_monotone(&mut ctx, &mut chf, 0, 2, 10).unwrap();
        assert_all_walkable_have_regions(&chf);
        for z in 0..10 {
            for x in 0..10 {
                let regs: Vec<u16> =
                    chf.cell_spans(x, z).map(|i| chf.spans[i].reg).collect();
                let mut dedup = regs.clone();
                dedup.sort_unstable();
                dedup.dedup();
                assert_eq!(regs.len(), dedup.len());
            }
        }
    }

    #[test]
    fn layer_regions_cover_the_plate() {
        let mut chf = open_grid(10, 10);
        let mut ctx = BuildContext::new();
        build_layer_regions(&mut ctx, &mut chf, 0, 2).unwrap();
        assert_all_walkable_have_regions(&chf);
        assert_eq!(region_set(&chf).len(), 1);
    }

    #[test]
    fn border_frame_is_painted_and_kept() {
        let mut chf = open_grid(12, 12);
        let mut ctx = BuildContext::new();
        distance::build_distance_field(&mut ctx, &mut chf).unwrap();
        build_regions_watershed(&mut ctx, &mut chf, 2, 2, 10).unwrap();
        let corner = chf.cell_spans(0, 0).next().unwrap();
        assert_ne!(chf.spans[corner].reg & BORDER_REG, 0);
        let centre = chf.cell_spans(6, 6).next().unwrap();
        assert_eq!(chf.spans[centre].reg & BORDER_REG, 0);
        assert_ne!(chf.spans[centre].reg, 0);
    }
}
