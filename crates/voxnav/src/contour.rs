//! Contour extraction: per-region boundary tracing and simplification.
//!
//! Each region's outline is traced one unit edge at a time into a raw
//! vertex ring, then simplified with Douglas-Peucker against the raw chain.
//! Hole contours (negative winding) are spliced into their region's outer
//! outline so downstream triangulation sees a single ring per region.

use glam::Vec3;

use crate::compact::CompactHeightfield;
use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::math;
use crate::region::BORDER_REG;
use crate::Result;

/// Vertex meta flag: the vertex lies on a tile border.
pub const BORDER_VERTEX: u32 = 0x10000;
/// Vertex meta flag: the area id changes across the edge.
pub const AREA_BORDER: u32 = 0x20000;
/// Mask extracting the neighbour region id from a vertex meta word.
pub const CONTOUR_REG_MASK: u32 = 0xffff;

const MAX_CONTOUR_ITERS: usize = 40_000;

/// Which edge classes get subdivided to `max_edge_len` during
/// simplification.
#[derive(Debug, Clone, Copy)]
pub struct ContourBuildFlags {
    /// Subdivide edges bordering unwalkable space.
    pub tess_wall_edges: bool,
    /// Subdivide edges between different areas.
    pub tess_area_edges: bool,
}

impl Default for ContourBuildFlags {
    fn default() -> Self {
        Self {
            tess_wall_edges: true,
            tess_area_edges: false,
        }
    }
}

/// One contour vertex in voxel units. `meta` holds the adjacent region id
/// in its low 16 bits plus [`BORDER_VERTEX`] / [`AREA_BORDER`] flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContourVertex {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub meta: u32,
}

impl ContourVertex {
    #[inline]
    pub fn region(&self) -> u16 {
        (self.meta & CONTOUR_REG_MASK) as u16
    }

    #[inline]
    pub fn is_border_vertex(&self) -> bool {
        self.meta & BORDER_VERTEX != 0
    }

    #[inline]
    pub fn is_area_border(&self) -> bool {
        self.meta & AREA_BORDER != 0
    }
}

/// The traced outline of one region.
#[derive(Debug, Clone)]
pub struct Contour {
    /// Simplified vertex ring.
    pub verts: Vec<ContourVertex>,
    /// Raw ring, one vertex per unit boundary edge.
    pub rverts: Vec<ContourVertex>,
    pub reg: u16,
    pub area: u8,
}

/// All contours of one build plus the grid metadata to map them back to
/// world space.
#[derive(Debug, Clone)]
pub struct ContourSet {
    pub contours: Vec<Contour>,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    pub width: i32,
    pub height: i32,
    pub border_size: i32,
    pub max_error: f32,
}

/// Corner height for the vertex between `dir` and `dir+1`, the maximum
/// floor of the four spans meeting there. Also reports whether the corner
/// is a removable border vertex (two matching exterior regions beside two
/// same-area interior ones).
fn get_corner_height(
    x: i32,
    z: i32,
    i: usize,
    dir: usize,
    chf: &CompactHeightfield,
) -> (i32, bool) {
    let span = chf.spans[i];
    let mut height = span.y as i32;
    let dirp = (dir + 1) & 0x3;
    let mut regs = [0u32; 4];
    regs[0] = chf.spans[i].reg as u32 | ((chf.areas[i] as u32) << 16);

    if let Some(ai) = chf.neighbor_index(x, z, &span, dir) {
        let aspan = chf.spans[ai];
        height = height.max(aspan.y as i32);
        regs[1] = aspan.reg as u32 | ((chf.areas[ai] as u32) << 16);
        let ax = x + math::dir_offset_x(dir);
        let az = z + math::dir_offset_z(dir);
        if let Some(ai2) = chf.neighbor_index(ax, az, &aspan, dirp) {
            let aspan2 = chf.spans[ai2];
            height = height.max(aspan2.y as i32);
            regs[2] = aspan2.reg as u32 | ((chf.areas[ai2] as u32) << 16);
        }
    }
    if let Some(ai) = chf.neighbor_index(x, z, &span, dirp) {
        let aspan = chf.spans[ai];
        height = height.max(aspan.y as i32);
        regs[3] = aspan.reg as u32 | ((chf.areas[ai] as u32) << 16);
        let ax = x + math::dir_offset_x(dirp);
        let az = z + math::dir_offset_z(dirp);
        if let Some(ai2) = chf.neighbor_index(ax, az, &aspan, dir) {
            let aspan2 = chf.spans[ai2];
            height = height.max(aspan2.y as i32);
            regs[2] = aspan2.reg as u32 | ((chf.areas[ai2] as u32) << 16);
        }
    }

    let mut is_border_vertex = false;
    for j in 0..4 {
        let a = j;
        let b = (j + 1) & 0x3;
        let c = (j + 2) & 0x3;
        let d = (j + 3) & 0x3;
        let two_same_exts =
            regs[a] & regs[b] & BORDER_REG as u32 != 0 && regs[a] == regs[b];
        let two_ints = (regs[c] | regs[d]) & BORDER_REG as u32 == 0;
        let ints_same_area = regs[c] >> 16 == regs[d] >> 16;
        let no_zeros = regs[a] != 0 && regs[b] != 0 && regs[c] != 0 && regs[d] != 0;
        if two_same_exts && two_ints && ints_same_area && no_zeros {
            is_border_vertex = true;
            break;
        }
    }
    (height, is_border_vertex)
}

/// Traces one region boundary, emitting a vertex per unit edge. `edge_flags`
/// holds a bit per unvisited boundary direction and is consumed as the walk
/// passes each edge.
fn trace_contour(
    mut x: i32,
    mut z: i32,
    mut i: usize,
    chf: &CompactHeightfield,
    edge_flags: &mut [u8],
    points: &mut Vec<[i32; 4]>,
) {
    let mut dir = 0usize;
    while edge_flags[i] & (1 << dir) == 0 {
        dir += 1;
        if dir >= 4 {
            return;
        }
    }
    let start_dir = dir;
    let start_i = i;
    let area = chf.areas[i];

    for _ in 0..MAX_CONTOUR_ITERS {
        if edge_flags[i] & (1 << dir) != 0 {
            let (py, is_border_vertex) = get_corner_height(x, z, i, dir, chf);
            let mut px = x;
            let mut pz = z;
            match dir {
                0 => pz += 1,
                1 => {
                    px += 1;
                    pz += 1;
                }
                2 => px += 1,
                _ => {}
            }
            let mut r = 0i32;
            let span = chf.spans[i];
            if let Some(ai) = chf.neighbor_index(x, z, &span, dir) {
                r = chf.spans[ai].reg as i32;
                if area != chf.areas[ai] {
                    r |= AREA_BORDER as i32;
                }
            }
            if is_border_vertex {
                r |= BORDER_VERTEX as i32;
            }
            points.push([px, py, pz, r]);

            edge_flags[i] &= !(1 << dir);
            dir = (dir + 1) & 0x3;
        } else {
            let span = chf.spans[i];
            let Some(ni) = chf.neighbor_index(x, z, &span, dir) else {
                // The edge flag promised a connection; bail out rather than
                // loop forever.
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
}

/// Douglas-Peucker simplification of a raw contour against itself, keeping
/// region-change vertices as anchors and optionally subdividing long edges.
fn simplify_contour(
    points: &[[i32; 4]],
    simplified: &mut Vec<[i32; 4]>,
    max_error: f32,
    max_edge_len: i32,
    flags: ContourBuildFlags,
) {
    let pn = points.len();

    // Portal vertices (where the neighbour region changes) anchor the
    // simplified shape.
    let has_connections = points
        .iter()
        .any(|p| p[3] & CONTOUR_REG_MASK as i32 != 0);
    if has_connections {
        for i in 0..pn {
            let ii = (i + 1) % pn;
            let different_regs =
                points[i][3] & CONTOUR_REG_MASK as i32 != points[ii][3] & CONTOUR_REG_MASK as i32;
            let area_borders =
                points[i][3] & AREA_BORDER as i32 != points[ii][3] & AREA_BORDER as i32;
            if different_regs || area_borders {
                simplified.push([points[i][0], points[i][1], points[i][2], i as i32]);
            }
        }
    }

    if simplified.is_empty() {
        // Closed island contour: seed with the lower-left and upper-right
        // vertices.
        let mut ll = 0usize;
        let mut ur = 0usize;
        for (i, p) in points.iter().enumerate() {
            let q = points[ll];
            if p[0] < q[0] || (p[0] == q[0] && p[2] < q[2]) {
                ll = i;
            }
            let q = points[ur];
            if p[0] > q[0] || (p[0] == q[0] && p[2] > q[2]) {
                ur = i;
            }
        }
        simplified.push([points[ll][0], points[ll][1], points[ll][2], ll as i32]);
        simplified.push([points[ur][0], points[ur][1], points[ur][2], ur as i32]);
    }

    // Insert raw points until every one is within the error budget of its
    // simplified segment.
    let mut i = 0usize;
    while i < simplified.len() {
        let ii = (i + 1) % simplified.len();

        let mut ax = simplified[i][0];
        let mut az = simplified[i][2];
        let ai = simplified[i][3];
        let mut bx = simplified[ii][0];
        let mut bz = simplified[ii][2];
        let bi = simplified[ii][3];

        let mut maxd = 0.0f32;
        let mut maxi = -1i32;

        // Walk the raw chain in lexicographic order so opposing contours of
        // a shared edge simplify identically.
        let (mut ci, cinc, endi) = if bx > ax || (bx == ax && bz > az) {
            (((ai + 1) % pn as i32) as usize, 1usize, bi as usize)
        } else {
            std::mem::swap(&mut ax, &mut bx);
            std::mem::swap(&mut az, &mut bz);
            ((bi as usize + pn - 1) % pn, pn - 1, ai as usize)
        };

        if points[ci][3] & CONTOUR_REG_MASK as i32 == 0
            || points[ci][3] & AREA_BORDER as i32 != 0
        {
            while ci != endi {
                let d = math::dist_pt_seg_2d(points[ci][0], points[ci][2], ax, az, bx, bz);
                if d > maxd {
                    maxd = d;
                    maxi = ci as i32;
                }
                ci = (ci + cinc) % pn;
            }
        }

        if maxi != -1 && maxd > max_error * max_error {
            let p = points[maxi as usize];
            simplified.insert(i + 1, [p[0], p[1], p[2], maxi]);
        } else {
            i += 1;
        }
    }

    // Subdivide edges past max_edge_len on the requested edge classes.
    if max_edge_len > 0 && (flags.tess_wall_edges || flags.tess_area_edges) {
        let mut i = 0usize;
        while i < simplified.len() {
            let ii = (i + 1) % simplified.len();
            let ax = simplified[i][0];
            let az = simplified[i][2];
            let ai = simplified[i][3];
            let bx = simplified[ii][0];
            let bz = simplified[ii][2];
            let bi = simplified[ii][3];

            let ci = ((ai + 1) % pn as i32) as usize;
            let mut tess = false;
            if flags.tess_wall_edges && points[ci][3] & CONTOUR_REG_MASK as i32 == 0 {
                tess = true;
            }
            if flags.tess_area_edges && points[ci][3] & AREA_BORDER as i32 != 0 {
                tess = true;
            }

            let mut maxi = -1i32;
            if tess {
                let dx = bx - ax;
                let dz = bz - az;
                if dx * dx + dz * dz > max_edge_len * max_edge_len {
                    let n = if bi < ai {
                        bi + pn as i32 - ai
                    } else {
                        bi - ai
                    };
                    if n > 1 {
                        maxi = if bx > ax || (bx == ax && bz > az) {
                            (ai + n / 2) % pn as i32
                        } else {
                            (ai + (n + 1) / 2) % pn as i32
                        };
                    }
                }
            }

            if maxi != -1 {
                let p = points[maxi as usize];
                simplified.insert(i + 1, [p[0], p[1], p[2], maxi]);
            } else {
                i += 1;
            }
        }
    }

    // Each simplified vertex takes the neighbour region of the raw vertex
    // after it and keeps the raw vertex's border flag.
    for v in simplified.iter_mut() {
        let ai = ((v[3] + 1) % pn as i32) as usize;
        let bi = v[3] as usize;
        v[3] = (points[ai][3] & (CONTOUR_REG_MASK | AREA_BORDER) as i32)
            | (points[bi][3] & BORDER_VERTEX as i32);
    }
}

fn remove_degenerate_segments(simplified: &mut Vec<[i32; 4]>) {
    let mut i = 0usize;
    while i < simplified.len() {
        let ni = (i + 1) % simplified.len();
        if simplified[i][0] == simplified[ni][0] && simplified[i][2] == simplified[ni][2] {
            simplified.remove(i);
        } else {
            i += 1;
        }
        if simplified.len() < 3 {
            break;
        }
    }
}

/// Signed area of the contour on the xz plane, positive for the trace
/// winding of region outlines; holes come out negative.
fn calc_area_2d(verts: &[ContourVertex]) -> i32 {
    let mut area = 0i32;
    let n = verts.len();
    let mut j = n - 1;
    for i in 0..n {
        area += verts[i].x * verts[j].z - verts[j].x * verts[i].z;
        j = i;
    }
    (area + 1) / 2
}

fn find_left_most_vertex(contour: &Contour) -> (i32, i32, usize) {
    let mut minx = contour.verts[0].x;
    let mut minz = contour.verts[0].z;
    let mut leftmost = 0usize;
    for (i, v) in contour.verts.iter().enumerate().skip(1) {
        if v.x < minx || (v.x == minx && v.z < minz) {
            minx = v.x;
            minz = v.z;
            leftmost = i;
        }
    }
    (minx, minz, leftmost)
}

fn xz(v: &ContourVertex) -> (i32, i32) {
    (v.x, v.z)
}

/// Whether segment `d0-d1` crosses any edge of `verts`, ignoring edges
/// incident to vertex `skip` and edges that share an endpoint with the
/// segment.
fn intersect_seg_contour(
    d0: &ContourVertex,
    d1: &ContourVertex,
    skip: i32,
    verts: &[ContourVertex],
) -> bool {
    let n = verts.len();
    for k in 0..n {
        let k1 = (k + 1) % n;
        if k as i32 == skip || k1 as i32 == skip {
            continue;
        }
        let p0 = &verts[k];
        let p1 = &verts[k1];
        if xz(d0) == xz(p0) || xz(d1) == xz(p0) || xz(d0) == xz(p1) || xz(d1) == xz(p1) {
            continue;
        }
        if math::intersect(xz(d0), xz(d1), xz(p0), xz(p1)) {
            return true;
        }
    }
    false
}

fn in_cone(i: usize, verts: &[ContourVertex], pj: &ContourVertex) -> bool {
    let n = verts.len();
    let pi = xz(&verts[i]);
    let pi1 = xz(&verts[(i + 1) % n]);
    let pin1 = xz(&verts[(i + n - 1) % n]);
    let pj = xz(pj);
    if math::left_on(pin1, pi, pi1) {
        math::left(pi, pj, pin1) && math::left(pj, pi, pi1)
    } else {
        !(math::left_on(pi, pj, pi1) && math::left_on(pj, pi, pin1))
    }
}

/// Splices hole `b` into outline `a` along the diagonal `ia - ib`,
/// duplicating both junction vertices.
fn merge_contours(a: &mut Contour, b: &Contour, ia: usize, ib: usize) {
    let na = a.verts.len();
    let nb = b.verts.len();
    let mut merged = Vec::with_capacity(na + nb + 2);
    for i in 0..=na {
        merged.push(a.verts[(ia + i) % na]);
    }
    for i in 0..=nb {
        merged.push(b.verts[(ib + i) % nb]);
    }
    a.verts = merged;
}

#[derive(Clone)]
struct ContourHole {
    contour_idx: usize,
    minx: i32,
    minz: i32,
    leftmost: usize,
}

/// Merges every hole of one region into its outline through the first
/// non-intersecting diagonal from the hole's leftmost vertex.
fn merge_region_holes(
    ctx: &mut BuildContext,
    contours: &mut [Contour],
    outline_idx: usize,
    holes: &mut [ContourHole],
) {
    holes.sort_by_key(|h| (h.minx, h.minz));

    for hi in 0..holes.len() {
        let hole_idx = holes[hi].contour_idx;
        let mut index: i32 = -1;
        let mut best_vertex = holes[hi].leftmost;

        for _ in 0..contours[hole_idx].verts.len() {
            // Candidate outline vertices visible from the hole corner,
            // closest first.
            let corner = contours[hole_idx].verts[best_vertex];
            let mut diagonals: Vec<(usize, i32)> = Vec::new();
            {
                let outline = &contours[outline_idx];
                for j in 0..outline.verts.len() {
                    if in_cone(j, &outline.verts, &corner) {
                        let dx = outline.verts[j].x - corner.x;
                        let dz = outline.verts[j].z - corner.z;
                        diagonals.push((j, dx * dx + dz * dz));
                    }
                }
            }
            diagonals.sort_by_key(|d| d.1);

            for &(vert, _) in &diagonals {
                let pt = contours[outline_idx].verts[vert];
                let mut intersects = intersect_seg_contour(
                    &pt,
                    &corner,
                    vert as i32,
                    &contours[outline_idx].verts,
                );
                for hole in holes.iter().skip(hi) {
                    if intersects {
                        break;
                    }
                    intersects |=
                        intersect_seg_contour(&pt, &corner, -1, &contours[hole.contour_idx].verts);
                }
                if !intersects {
                    index = vert as i32;
                    break;
                }
            }
            if index != -1 {
                break;
            }
            best_vertex = (best_vertex + 1) % contours[hole_idx].verts.len();
        }

        if index == -1 {
            ctx.warn(
                "contours",
                format!(
                    "failed to find merge diagonal for hole in region {}",
                    contours[outline_idx].reg
                ),
            );
            continue;
        }

        let hole = contours[hole_idx].clone();
        merge_contours(&mut contours[outline_idx], &hole, index as usize, best_vertex);
        contours[hole_idx].verts.clear();
    }
}

/// Builds the contour set for a regionized compact heightfield.
pub fn build_contours(
    ctx: &mut BuildContext,
    chf: &CompactHeightfield,
    max_error: f32,
    max_edge_len: i32,
    flags: ContourBuildFlags,
) -> Result<ContourSet> {
    let timer = ScopedTimer::start(ctx, StageTimer::Contours);

    let w = chf.width;
    let h = chf.height;
    let border_size = chf.border_size;

    let mut bmin = chf.bmin;
    let mut bmax = chf.bmax;
    if border_size > 0 {
        let pad = border_size as f32 * chf.cs;
        bmin.x += pad;
        bmin.z += pad;
        bmax.x -= pad;
        bmax.z -= pad;
    }

    // One bit per span and direction: set where the neighbour belongs to a
    // different region.
    let mut edge_flags = vec![0u8; chf.span_count];
    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                let span = chf.spans[i];
                if span.reg == 0 || span.reg & BORDER_REG != 0 {
                    edge_flags[i] = 0;
                    continue;
                }
                let mut connected = 0u8;
                for dir in 0..4 {
                    let r = chf
                        .neighbor_index(x, z, &span, dir)
                        .map(|ai| chf.spans[ai].reg)
                        .unwrap_or(0);
                    if r == span.reg {
                        connected |= 1 << dir;
                    }
                }
                edge_flags[i] = connected ^ 0xf;
            }
        }
    }

    let mut contours: Vec<Contour> = Vec::new();
    let mut raw: Vec<[i32; 4]> = Vec::with_capacity(256);
    let mut simplified: Vec<[i32; 4]> = Vec::with_capacity(64);

    for z in 0..h {
        for x in 0..w {
            for i in chf.cell_spans(x, z) {
                if edge_flags[i] == 0 || edge_flags[i] == 0xf {
                    edge_flags[i] = 0;
                    continue;
                }
                let reg = chf.spans[i].reg;
                if reg == 0 || reg & BORDER_REG != 0 {
                    continue;
                }
                let area = chf.areas[i];

                raw.clear();
                simplified.clear();
                trace_contour(x, z, i, chf, &mut edge_flags, &mut raw);
                if raw.is_empty() {
                    log::debug!("empty trace for region {reg} at ({x},{z})");
                    continue;
                }

                simplify_contour(&raw, &mut simplified, max_error, max_edge_len, flags);
                remove_degenerate_segments(&mut simplified);

                if simplified.len() < 3 {
                    continue;
                }

                let to_vertex = |p: &[i32; 4]| ContourVertex {
                    x: p[0] - border_size,
                    y: p[1],
                    z: p[2] - border_size,
                    meta: p[3] as u32,
                };
                contours.push(Contour {
                    verts: simplified.iter().map(to_vertex).collect(),
                    rverts: raw.iter().map(to_vertex).collect(),
                    reg,
                    area,
                });
            }
        }
    }

    // Splice hole contours (negative winding) into their region outlines.
    let windings: Vec<i32> = contours
        .iter()
        .map(|c| if calc_area_2d(&c.verts) < 0 { -1 } else { 1 })
        .collect();
    if windings.iter().any(|&w| w < 0) {
        let nregions = chf.max_regions as usize + 1;
        let mut outlines: Vec<Option<usize>> = vec![None; nregions];
        let mut region_holes: Vec<Vec<ContourHole>> = vec![Vec::new(); nregions];

        for (idx, contour) in contours.iter().enumerate() {
            let reg = contour.reg as usize;
            if reg >= nregions {
                continue;
            }
            if windings[idx] > 0 {
                if outlines[reg].is_some() {
                    ctx.error(
                        "contours",
                        format!("region {} has multiple outlines", contour.reg),
                    );
                }
                outlines[reg] = Some(idx);
            } else {
                let (minx, minz, leftmost) = find_left_most_vertex(contour);
                region_holes[reg].push(ContourHole {
                    contour_idx: idx,
                    minx,
                    minz,
                    leftmost,
                });
            }
        }

        for reg in 0..nregions {
            if region_holes[reg].is_empty() {
                continue;
            }
            match outlines[reg] {
                Some(outline_idx) => {
                    merge_region_holes(ctx, &mut contours, outline_idx, &mut region_holes[reg]);
                }
                None => {
                    ctx.warn(
                        "contours",
                        format!("region {reg} has holes but no outline"),
                    );
                }
            }
        }

        contours.retain(|c| !c.verts.is_empty());
    }

    let cset = ContourSet {
        contours,
        bmin,
        bmax,
        cs: chf.cs,
        ch: chf.ch,
        width: w - border_size * 2,
        height: h - border_size * 2,
        border_size,
        max_error,
    };

    ctx.info(
        "contours",
        format!("extracted {} contours", cset.contours.len()),
    );
    timer.finish(ctx);
    Ok(cset)
}
