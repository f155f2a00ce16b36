//! Convex polygon mesh built from the contour set.
//!
//! Each contour is ear-clipped into triangles, the triangles are merged
//! into convex polygons of up to `nvp` vertices, and vertices are welded
//! through a spatial hash. Polygon edges then get neighbour links and
//! portal direction codes for tile stitching.

use glam::Vec3;

use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::contour::{ContourSet, BORDER_VERTEX};
use crate::math;
use crate::{Error, Result};

/// Sentinel for unused polygon slots and unlinked edges.
pub const MESH_NULL_IDX: u16 = 0xffff;
/// Region id given to polygons whose triangles came from different regions.
pub const MULTIPLE_REGS: u16 = 0;

const VERTEX_BUCKET_COUNT: usize = 1 << 12;

/// The navmesh polygon soup in voxel coordinates.
///
/// `polys` has a stride of `2 * nvp` per polygon: `nvp` vertex indices
/// followed by `nvp` neighbour entries. A neighbour entry is the adjacent
/// polygon id, `MESH_NULL_IDX` for none, or `0x8000 | dir` on a tile
/// border where `dir` encodes the facing direction.
#[derive(Debug, Clone)]
pub struct PolyMesh {
    pub verts: Vec<u16>,
    pub polys: Vec<u16>,
    pub regs: Vec<u16>,
    pub flags: Vec<u16>,
    pub areas: Vec<u8>,
    pub nverts: usize,
    pub npolys: usize,
    pub nvp: usize,
    pub bmin: Vec3,
    pub bmax: Vec3,
    pub cs: f32,
    pub ch: f32,
    pub border_size: i32,
    pub max_edge_error: f32,
}

impl PolyMesh {
    /// Vertex indices of polygon `i` (the used prefix of its slot row).
    pub fn poly_verts(&self, i: usize) -> &[u16] {
        let row = &self.polys[i * self.nvp * 2..i * self.nvp * 2 + self.nvp];
        let n = count_poly_verts(row, self.nvp);
        &row[..n]
    }

    /// Neighbour entries of polygon `i`.
    pub fn poly_neis(&self, i: usize) -> &[u16] {
        &self.polys[i * self.nvp * 2 + self.nvp..i * self.nvp * 2 + self.nvp * 2]
    }
}

#[inline]
fn count_poly_verts(poly: &[u16], nvp: usize) -> usize {
    poly.iter()
        .take(nvp)
        .position(|&v| v == MESH_NULL_IDX)
        .unwrap_or(nvp)
}

#[inline]
fn prev(i: usize, n: usize) -> usize {
    if i >= 1 {
        i - 1
    } else {
        n - 1
    }
}

#[inline]
fn next(i: usize, n: usize) -> usize {
    if i + 1 < n {
        i + 1
    } else {
        0
    }
}

const EAR_FLAG: i32 = i32::MIN; // high bit marks a clippable ear tip
const INDEX_MASK: i32 = 0x0fff_ffff;

fn vert_xz(verts: &[[i32; 4]], index: i32) -> (i32, i32) {
    let v = verts[(index & INDEX_MASK) as usize];
    (v[0], v[2])
}

fn in_cone(i: usize, j: usize, n: usize, verts: &[[i32; 4]], indices: &[i32]) -> bool {
    let pi = vert_xz(verts, indices[i]);
    let pj = vert_xz(verts, indices[j]);
    let pi1 = vert_xz(verts, indices[next(i, n)]);
    let pin1 = vert_xz(verts, indices[prev(i, n)]);
    if math::left_on(pin1, pi, pi1) {
        math::left(pi, pj, pin1) && math::left(pj, pi, pi1)
    } else {
        !(math::left_on(pi, pj, pi1) && math::left_on(pj, pi, pin1))
    }
}

fn in_cone_loose(i: usize, j: usize, n: usize, verts: &[[i32; 4]], indices: &[i32]) -> bool {
    let pi = vert_xz(verts, indices[i]);
    let pj = vert_xz(verts, indices[j]);
    let pi1 = vert_xz(verts, indices[next(i, n)]);
    let pin1 = vert_xz(verts, indices[prev(i, n)]);
    if math::left_on(pin1, pi, pi1) {
        math::left_on(pi, pj, pin1) && math::left_on(pj, pi, pi1)
    } else {
        !(math::left_on(pi, pj, pi1) && math::left_on(pj, pi, pin1))
    }
}

fn diagonalie(i: usize, j: usize, n: usize, verts: &[[i32; 4]], indices: &[i32]) -> bool {
    let d0 = vert_xz(verts, indices[i]);
    let d1 = vert_xz(verts, indices[j]);
    for k in 0..n {
        let k1 = next(k, n);
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = vert_xz(verts, indices[k]);
        let p1 = vert_xz(verts, indices[k1]);
        if d0 == p0 || d1 == p0 || d0 == p1 || d1 == p1 {
            continue;
        }
        if math::intersect(d0, d1, p0, p1) {
            return false;
        }
    }
    true
}

fn diagonalie_loose(i: usize, j: usize, n: usize, verts: &[[i32; 4]], indices: &[i32]) -> bool {
    let d0 = vert_xz(verts, indices[i]);
    let d1 = vert_xz(verts, indices[j]);
    for k in 0..n {
        let k1 = next(k, n);
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = vert_xz(verts, indices[k]);
        let p1 = vert_xz(verts, indices[k1]);
        if d0 == p0 || d1 == p0 || d0 == p1 || d1 == p1 {
            continue;
        }
        if math::intersect_prop(d0, d1, p0, p1) {
            return false;
        }
    }
    true
}

fn diagonal(i: usize, j: usize, n: usize, verts: &[[i32; 4]], indices: &[i32]) -> bool {
    in_cone(i, j, n, verts, indices) && diagonalie(i, j, n, verts, indices)
}

fn diagonal_loose(i: usize, j: usize, n: usize, verts: &[[i32; 4]], indices: &[i32]) -> bool {
    in_cone_loose(i, j, n, verts, indices) && diagonalie_loose(i, j, n, verts, indices)
}

/// Ear-clip triangulation. Returns the triangle count, negated when the
/// polygon degenerated and only a partial result was produced.
fn triangulate(n: usize, verts: &[[i32; 4]], indices: &mut Vec<i32>, tris: &mut Vec<i32>) -> i32 {
    let mut ntris = 0;
    tris.clear();

    for i in 0..n {
        let i1 = next(i, n);
        let i2 = next(i1, n);
        if diagonal(i, i2, n, verts, indices) {
            indices[i1] |= EAR_FLAG;
        }
    }

    let mut n = n;
    while n > 3 {
        let mut min_len = -1i32;
        let mut mini = -1i32;
        for i in 0..n {
            let i1 = next(i, n);
            if indices[i1] & EAR_FLAG != 0 {
                let p0 = vert_xz(verts, indices[i]);
                let p2 = vert_xz(verts, indices[next(i1, n)]);
                let dx = p2.0 - p0.0;
                let dz = p2.1 - p0.1;
                let len = dx * dx + dz * dz;
                if min_len < 0 || len < min_len {
                    min_len = len;
                    mini = i as i32;
                }
            }
        }

        if mini == -1 {
            // The contour warped enough that no strict ear remains; retry
            // with relaxed predicates before giving up.
            for i in 0..n {
                let i1 = next(i, n);
                let i2 = next(i1, n);
                if diagonal_loose(i, i2, n, verts, indices) {
                    let p0 = vert_xz(verts, indices[i]);
                    let p2 = vert_xz(verts, indices[next(i2, n)]);
                    let dx = p2.0 - p0.0;
                    let dz = p2.1 - p0.1;
                    let len = dx * dx + dz * dz;
                    if min_len < 0 || len < min_len {
                        min_len = len;
                        mini = i as i32;
                    }
                }
            }
            if mini == -1 {
                return -ntris;
            }
        }

        let i = mini as usize;
        let i1 = next(i, n);
        let i2 = next(i1, n);

        tris.push(indices[i] & INDEX_MASK);
        tris.push(indices[i1] & INDEX_MASK);
        tris.push(indices[i2] & INDEX_MASK);
        ntris += 1;

        // Clip the ear tip P[i1].
        n -= 1;
        for k in i1..n {
            indices[k] = indices[k + 1];
        }

        let i1 = if i1 >= n { 0 } else { i1 };
        let i = prev(i1, n);
        if diagonal(prev(i, n), i1, n, verts, indices) {
            indices[i] |= EAR_FLAG;
        } else {
            indices[i] &= INDEX_MASK;
        }
        if diagonal(i, next(i1, n), n, verts, indices) {
            indices[i1] |= EAR_FLAG;
        } else {
            indices[i1] &= INDEX_MASK;
        }
    }

    tris.push(indices[0] & INDEX_MASK);
    tris.push(indices[1] & INDEX_MASK);
    tris.push(indices[2] & INDEX_MASK);
    ntris += 1;
    ntris
}

#[inline]
fn compute_vertex_hash(x: i32, z: i32) -> usize {
    const H1: u32 = 0x8da6_b343;
    const H3: u32 = 0xcb1a_b31f;
    let n = H1.wrapping_mul(x as u32).wrapping_add(H3.wrapping_mul(z as u32));
    (n & (VERTEX_BUCKET_COUNT as u32 - 1)) as usize
}

/// Welds a vertex through the spatial hash: exact x/z match, y within two
/// units (collapsing the region-parity jitter of contour corner heights).
fn add_vertex(
    x: u16,
    y: u16,
    z: u16,
    verts: &mut Vec<u16>,
    first_vert: &mut [i32],
    next_vert: &mut Vec<i32>,
) -> u16 {
    let bucket = compute_vertex_hash(x as i32, z as i32);
    let mut i = first_vert[bucket];
    while i != -1 {
        let v = &verts[i as usize * 3..i as usize * 3 + 3];
        if v[0] == x && (v[1] as i32 - y as i32).abs() <= 2 && v[2] == z {
            return i as u16;
        }
        i = next_vert[i as usize];
    }

    let i = (verts.len() / 3) as i32;
    verts.extend_from_slice(&[x, y, z]);
    next_vert.push(first_vert[bucket]);
    first_vert[bucket] = i;
    i as u16
}

fn uleft(a: &[u16], b: &[u16], c: &[u16]) -> bool {
    (b[0] as i32 - a[0] as i32) * (c[2] as i32 - a[2] as i32)
        - (c[0] as i32 - a[0] as i32) * (b[2] as i32 - a[2] as i32)
        < 0
}

/// Merge candidate score for two polygons: the squared length of their
/// shared edge, or -1 when merging is impossible (no shared edge, vertex
/// budget exceeded, or the result would be non-convex).
fn get_poly_merge_value(
    pa: &[u16],
    pb: &[u16],
    verts: &[u16],
    nvp: usize,
) -> (i32, usize, usize) {
    let na = count_poly_verts(pa, nvp);
    let nb = count_poly_verts(pb, nvp);

    if na + nb - 2 > nvp {
        return (-1, 0, 0);
    }

    let mut ea = usize::MAX;
    let mut eb = usize::MAX;
    'outer: for i in 0..na {
        let mut va0 = pa[i];
        let mut va1 = pa[(i + 1) % na];
        if va0 > va1 {
            std::mem::swap(&mut va0, &mut va1);
        }
        for j in 0..nb {
            let mut vb0 = pb[j];
            let mut vb1 = pb[(j + 1) % nb];
            if vb0 > vb1 {
                std::mem::swap(&mut vb0, &mut vb1);
            }
            if va0 == vb0 && va1 == vb1 {
                ea = i;
                eb = j;
                break 'outer;
            }
        }
    }
    if ea == usize::MAX {
        return (-1, 0, 0);
    }

    // Both junction corners must stay convex.
    let va = pa[(ea + na - 1) % na] as usize;
    let vb = pa[ea] as usize;
    let vc = pb[(eb + 2) % nb] as usize;
    if !uleft(&verts[va * 3..], &verts[vb * 3..], &verts[vc * 3..]) {
        return (-1, 0, 0);
    }
    let va = pb[(eb + nb - 1) % nb] as usize;
    let vb = pb[eb] as usize;
    let vc = pa[(ea + 2) % na] as usize;
    if !uleft(&verts[va * 3..], &verts[vb * 3..], &verts[vc * 3..]) {
        return (-1, 0, 0);
    }

    let va = pa[ea] as usize;
    let vb = pa[(ea + 1) % na] as usize;
    let dx = verts[va * 3] as i32 - verts[vb * 3] as i32;
    let dz = verts[va * 3 + 2] as i32 - verts[vb * 3 + 2] as i32;
    (dx * dx + dz * dz, ea, eb)
}

fn merge_poly_verts(pa: &[u16], pb: &[u16], ea: usize, eb: usize, nvp: usize) -> Vec<u16> {
    let na = count_poly_verts(pa, nvp);
    let nb = count_poly_verts(pb, nvp);
    let mut merged = vec![MESH_NULL_IDX; nvp];
    let mut n = 0;
    for i in 0..na - 1 {
        merged[n] = pa[(ea + 1 + i) % na];
        n += 1;
    }
    for i in 0..nb - 1 {
        merged[n] = pb[(eb + 1 + i) % nb];
        n += 1;
    }
    merged
}

/// Repeated best-first merge of a polygon soup; the longest shared edge is
/// removed first. `regs` is updated alongside when provided.
fn merge_polygon_soup(
    polys: &mut Vec<Vec<u16>>,
    regs: Option<&mut Vec<u16>>,
    verts: &[u16],
    nvp: usize,
) {
    let mut regs = regs;
    loop {
        let mut best_merge_val = 0;
        let mut best = (0usize, 0usize, 0usize, 0usize);
        for j in 0..polys.len().saturating_sub(1) {
            for k in j + 1..polys.len() {
                let (v, ea, eb) = get_poly_merge_value(&polys[j], &polys[k], verts, nvp);
                if v > best_merge_val {
                    best_merge_val = v;
                    best = (j, k, ea, eb);
                }
            }
        }
        if best_merge_val == 0 {
            break;
        }
        let (pa, pb, ea, eb) = best;
        let merged = merge_poly_verts(&polys[pa], &polys[pb], ea, eb, nvp);
        polys[pa] = merged;
        polys.swap_remove(pb);
        if let Some(regs) = regs.as_deref_mut() {
            if regs[pa] != regs[pb] {
                regs[pa] = MULTIPLE_REGS;
            }
            regs.swap_remove(pb);
        }
    }
}

/// A border vertex can be removed when the polygons around it leave a
/// closed fan with at most two open edges.
fn can_remove_vertex(mesh: &PolyMesh, rem: u16) -> bool {
    let nvp = mesh.nvp;

    let mut num_touched_verts = 0;
    let mut num_remaining_edges = 0;
    for i in 0..mesh.npolys {
        let p = &mesh.polys[i * nvp * 2..i * nvp * 2 + nvp];
        let nv = count_poly_verts(p, nvp);
        let mut num_removed = 0;
        let mut num_verts = 0;
        for &v in p.iter().take(nv) {
            if v == rem {
                num_touched_verts += 1;
                num_removed += 1;
            }
            num_verts += 1;
        }
        if num_removed > 0 {
            num_remaining_edges += num_verts - (num_removed + 1);
        }
    }
    if num_remaining_edges <= 2 {
        return false;
    }

    // Count open edges around the removed vertex.
    let max_edges = num_touched_verts * 2;
    let mut edges: Vec<[i32; 3]> = Vec::with_capacity(max_edges);
    for i in 0..mesh.npolys {
        let p = &mesh.polys[i * nvp * 2..i * nvp * 2 + nvp];
        let nv = count_poly_verts(p, nvp);
        let mut k = nv - 1;
        for j in 0..nv {
            if p[j] == rem || p[k] == rem {
                let (a, b) = if p[j] == rem { (p[j], p[k]) } else { (p[k], p[j]) };
                debug_assert_eq!(a, rem);
                if let Some(e) = edges.iter_mut().find(|e| e[1] == b as i32) {
                    e[2] += 1;
                } else {
                    edges.push([a as i32, b as i32, 1]);
                }
            }
            k = j;
        }
    }

    let num_open_edges = edges.iter().filter(|e| e[2] < 2).count();
    num_open_edges <= 2
}

/// Removes vertex `rem`, retriangulating the hole left behind.
fn remove_vertex(ctx: &mut BuildContext, mesh: &mut PolyMesh, rem: u16) -> Result<()> {
    let nvp = mesh.nvp;

    // Pull out every polygon using the vertex, keeping their loose edges.
    let mut edges: Vec<[i32; 4]> = Vec::new(); // a, b, reg, area
    let mut i = 0;
    while i < mesh.npolys {
        let p = mesh.polys[i * nvp * 2..i * nvp * 2 + nvp].to_vec();
        let nv = count_poly_verts(&p, nvp);
        if !p.iter().take(nv).any(|&v| v == rem) {
            i += 1;
            continue;
        }
        let mut k = nv - 1;
        for j in 0..nv {
            if p[j] != rem && p[k] != rem {
                edges.push([p[k] as i32, p[j] as i32, mesh.regs[i] as i32, mesh.areas[i] as i32]);
            }
            k = j;
        }
        // Swap-remove the polygon.
        let last = mesh.npolys - 1;
        if i != last {
            let (src_start, dst_start) = (last * nvp * 2, i * nvp * 2);
            for off in 0..nvp {
                mesh.polys[dst_start + off] = mesh.polys[src_start + off];
            }
            mesh.regs[i] = mesh.regs[last];
            mesh.areas[i] = mesh.areas[last];
        }
        mesh.polys[last * nvp * 2..last * nvp * 2 + nvp * 2].fill(MESH_NULL_IDX);
        mesh.polys[i * nvp * 2 + nvp..i * nvp * 2 + nvp * 2].fill(MESH_NULL_IDX);
        mesh.npolys -= 1;
    }

    // Drop the vertex and remap every index above it.
    let rem_usize = rem as usize;
    mesh.verts.drain(rem_usize * 3..rem_usize * 3 + 3);
    mesh.nverts -= 1;
    for i in 0..mesh.npolys {
        let p = &mut mesh.polys[i * nvp * 2..i * nvp * 2 + nvp];
        let nv = count_poly_verts(p, nvp);
        for v in p.iter_mut().take(nv) {
            if *v > rem {
                *v -= 1;
            }
        }
    }
    for e in edges.iter_mut() {
        if e[0] > rem as i32 {
            e[0] -= 1;
        }
        if e[1] > rem as i32 {
            e[1] -= 1;
        }
    }

    if edges.is_empty() {
        return Ok(());
    }

    // Stitch the loose edges into a hole loop.
    let mut hole: Vec<i32> = vec![edges[0][0]];
    let mut hreg: Vec<i32> = vec![edges[0][2]];
    let mut harea: Vec<i32> = vec![edges[0][3]];
    {
        let start = edges.remove(0);
        hole.push(start[1]);
        hreg.push(start[2]);
        harea.push(start[3]);
    }
    while !edges.is_empty() {
        let mut matched = false;
        let mut i = 0;
        while i < edges.len() {
            let [ea, eb, r, a] = edges[i];
            let mut add = false;
            if hole.first() == Some(&eb) {
                hole.insert(0, ea);
                hreg.insert(0, r);
                harea.insert(0, a);
                add = true;
            } else if hole.last() == Some(&ea) {
                hole.push(eb);
                hreg.push(r);
                harea.push(a);
                add = true;
            }
            if add {
                edges.swap_remove(i);
                matched = true;
            } else {
                i += 1;
            }
        }
        if !matched {
            break;
        }
    }
    // The loop closes on itself; drop the duplicated endpoint.
    if hole.len() > 1 && hole.first() == hole.last() {
        hole.pop();
        hreg.pop();
        harea.pop();
    }

    if hole.len() < 3 {
        return Ok(());
    }

    // Triangulate the hole.
    let nhole = hole.len();
    let tverts: Vec<[i32; 4]> = hole
        .iter()
        .map(|&pi| {
            let v = &mesh.verts[pi as usize * 3..pi as usize * 3 + 3];
            [v[0] as i32, v[1] as i32, v[2] as i32, 0]
        })
        .collect();
    let mut thole: Vec<i32> = (0..nhole as i32).collect();
    let mut tris: Vec<i32> = Vec::new();
    let mut ntris = triangulate(nhole, &tverts, &mut thole, &mut tris);
    if ntris < 0 {
        ntris = -ntris;
        ctx.warn("polymesh", "vertex removal produced a degenerate hole");
    }

    // Merge the hole triangles back into polygons.
    let mut polys: Vec<Vec<u16>> = Vec::new();
    let mut pregs: Vec<u16> = Vec::new();
    let mut pareas: Vec<u8> = Vec::new();
    for t in tris.chunks_exact(3).take(ntris as usize) {
        if t[0] == t[1] || t[0] == t[2] || t[1] == t[2] {
            continue;
        }
        let mut poly = vec![MESH_NULL_IDX; nvp];
        poly[0] = hole[t[0] as usize] as u16;
        poly[1] = hole[t[1] as usize] as u16;
        poly[2] = hole[t[2] as usize] as u16;
        polys.push(poly);
        let (r0, r1, r2) = (
            hreg[t[0] as usize],
            hreg[t[1] as usize],
            hreg[t[2] as usize],
        );
        pregs.push(if r0 != r1 || r1 != r2 {
            MULTIPLE_REGS
        } else {
            r0 as u16
        });
        pareas.push(harea[t[0] as usize] as u8);
    }
    if polys.is_empty() {
        return Ok(());
    }

    if nvp > 3 {
        merge_polygon_soup(&mut polys, Some(&mut pregs), &mesh.verts, nvp);
    }

    let max_polys = mesh.polys.len() / (nvp * 2);
    for (poly, (reg, area)) in polys.iter().zip(pregs.iter().zip(&pareas)) {
        if mesh.npolys >= max_polys {
            return Err(Error::Build("too many polygons after vertex removal"));
        }
        let base = mesh.npolys * nvp * 2;
        mesh.polys[base..base + nvp * 2].fill(MESH_NULL_IDX);
        mesh.polys[base..base + nvp].copy_from_slice(poly);
        mesh.regs[mesh.npolys] = *reg;
        mesh.areas[mesh.npolys] = *area;
        mesh.npolys += 1;
    }
    Ok(())
}

/// Edge adjacency over the polygon soup, crediting each interior edge to
/// both of its polygons.
fn build_mesh_adjacency(mesh: &mut PolyMesh) {
    let nvp = mesh.nvp;
    let npolys = mesh.npolys;
    let nverts = mesh.nverts;

    #[derive(Clone, Copy, Default)]
    struct Edge {
        vert: [u16; 2],
        poly_edge: [u16; 2],
        poly: [u16; 2],
    }

    let max_edge_count = npolys * nvp;
    let mut first_edge = vec![MESH_NULL_IDX; nverts];
    let mut next_edge = vec![MESH_NULL_IDX; max_edge_count];
    let mut edges: Vec<Edge> = Vec::with_capacity(max_edge_count);

    for i in 0..npolys {
        let t = &mesh.polys[i * nvp * 2..i * nvp * 2 + nvp];
        let nv = count_poly_verts(t, nvp);
        for j in 0..nv {
            let v0 = t[j];
            let v1 = t[next(j, nv)];
            if v0 < v1 {
                let edge_idx = edges.len();
                edges.push(Edge {
                    vert: [v0, v1],
                    poly: [i as u16, i as u16],
                    poly_edge: [j as u16, 0],
                });
                next_edge[edge_idx] = first_edge[v0 as usize];
                first_edge[v0 as usize] = edge_idx as u16;
            }
        }
    }

    for i in 0..npolys {
        let t = mesh.polys[i * nvp * 2..i * nvp * 2 + nvp].to_vec();
        let nv = count_poly_verts(&t, nvp);
        for j in 0..nv {
            let v0 = t[j];
            let v1 = t[next(j, nv)];
            if v0 > v1 {
                let mut e = first_edge[v1 as usize];
                while e != MESH_NULL_IDX {
                    let edge = &mut edges[e as usize];
                    if edge.vert[1] == v0 && edge.poly[0] == edge.poly[1] {
                        edge.poly[1] = i as u16;
                        edge.poly_edge[1] = j as u16;
                        break;
                    }
                    e = next_edge[e as usize];
                }
            }
        }
    }

    for edge in &edges {
        if edge.poly[0] != edge.poly[1] {
            let p0 = edge.poly[0] as usize;
            let p1 = edge.poly[1] as usize;
            mesh.polys[p0 * nvp * 2 + nvp + edge.poly_edge[0] as usize] = edge.poly[1];
            mesh.polys[p1 * nvp * 2 + nvp + edge.poly_edge[1] as usize] = edge.poly[0];
        }
    }
}

/// Tags unlinked edges lying on the tile frame with `0x8000 | dir` so
/// adjacent tiles can be stitched later.
fn find_portal_edges(mesh: &mut PolyMesh, cset: &ContourSet) {
    if mesh.border_size <= 0 {
        return;
    }
    let nvp = mesh.nvp;
    let w = cset.width as u16;
    let h = cset.height as u16;

    for i in 0..mesh.npolys {
        let base = i * nvp * 2;
        let nv = count_poly_verts(&mesh.polys[base..base + nvp], nvp);
        for j in 0..nv {
            if mesh.polys[base + nvp + j] != MESH_NULL_IDX {
                continue;
            }
            let va = mesh.polys[base + j] as usize;
            let vb = mesh.polys[base + next(j, nv)] as usize;
            let (vax, vaz) = (mesh.verts[va * 3], mesh.verts[va * 3 + 2]);
            let (vbx, vbz) = (mesh.verts[vb * 3], mesh.verts[vb * 3 + 2]);
            if vax == 0 && vbx == 0 {
                mesh.polys[base + nvp + j] = 0x8000;
            } else if vaz == h && vbz == h {
                mesh.polys[base + nvp + j] = 0x8000 | 1;
            } else if vax == w && vbx == w {
                mesh.polys[base + nvp + j] = 0x8000 | 2;
            } else if vaz == 0 && vbz == 0 {
                mesh.polys[base + nvp + j] = 0x8000 | 3;
            }
        }
    }
}

/// Builds the convex polygon mesh from a contour set.
pub fn build_poly_mesh(
    ctx: &mut BuildContext,
    cset: &ContourSet,
    nvp: usize,
) -> Result<PolyMesh> {
    let timer = ScopedTimer::start(ctx, StageTimer::PolyMesh);

    let mut max_vertices = 0;
    let mut max_tris = 0;
    let mut max_verts_per_cont = 0;
    for contour in &cset.contours {
        if contour.verts.len() < 3 {
            continue;
        }
        max_vertices += contour.verts.len();
        max_tris += contour.verts.len() - 2;
        max_verts_per_cont = max_verts_per_cont.max(contour.verts.len());
    }
    if max_vertices >= 0xfffe {
        timer.finish(ctx);
        return Err(Error::Build("too many vertices in contour set"));
    }

    let mut mesh = PolyMesh {
        verts: Vec::with_capacity(max_vertices * 3),
        polys: vec![MESH_NULL_IDX; max_tris * nvp * 2],
        regs: vec![0; max_tris],
        flags: Vec::new(),
        areas: vec![0; max_tris],
        nverts: 0,
        npolys: 0,
        nvp,
        bmin: cset.bmin,
        bmax: cset.bmax,
        cs: cset.cs,
        ch: cset.ch,
        border_size: cset.border_size,
        max_edge_error: cset.max_error,
    };

    let mut vflags = vec![false; max_vertices];
    let mut first_vert = vec![-1i32; VERTEX_BUCKET_COUNT];
    let mut next_vert: Vec<i32> = Vec::with_capacity(max_vertices);

    let mut indices: Vec<i32> = Vec::with_capacity(max_verts_per_cont);
    let mut tris: Vec<i32> = Vec::with_capacity(max_verts_per_cont * 3);

    for contour in &cset.contours {
        if contour.verts.len() < 3 {
            continue;
        }
        let nverts = contour.verts.len();

        indices.clear();
        indices.extend(0..nverts as i32);
        let tverts: Vec<[i32; 4]> = contour
            .verts
            .iter()
            .map(|v| [v.x, v.y, v.z, 0])
            .collect();

        let mut ntris = triangulate(nverts, &tverts, &mut indices, &mut tris);
        if ntris <= 0 {
            // Isolate the pathology to this region and keep what was
            // salvaged.
            ctx.warn(
                "polymesh",
                format!("bad triangulation for region {}", contour.reg),
            );
            ntris = -ntris;
        }
        if ntris == 0 {
            continue;
        }

        // Weld contour vertices into the shared pool.
        let mut welded: Vec<u16> = Vec::with_capacity(nverts);
        for v in &contour.verts {
            let idx = add_vertex(
                v.x as u16,
                v.y as u16,
                v.z as u16,
                &mut mesh.verts,
                &mut first_vert,
                &mut next_vert,
            );
            if v.meta & BORDER_VERTEX != 0 {
                vflags[idx as usize] = true;
            }
            welded.push(idx);
        }

        let mut polys: Vec<Vec<u16>> = Vec::new();
        for t in tris.chunks_exact(3).take(ntris as usize) {
            if t[0] == t[1] || t[0] == t[2] || t[1] == t[2] {
                continue;
            }
            let mut poly = vec![MESH_NULL_IDX; nvp];
            poly[0] = welded[t[0] as usize];
            poly[1] = welded[t[1] as usize];
            poly[2] = welded[t[2] as usize];
            polys.push(poly);
        }
        if polys.is_empty() {
            continue;
        }

        if nvp > 3 {
            merge_polygon_soup(&mut polys, None, &mesh.verts, nvp);
        }

        for poly in &polys {
            if mesh.npolys >= max_tris {
                timer.finish(ctx);
                return Err(Error::Build("polygon budget exceeded"));
            }
            let base = mesh.npolys * nvp * 2;
            mesh.polys[base..base + nvp].copy_from_slice(poly);
            mesh.regs[mesh.npolys] = contour.reg;
            mesh.areas[mesh.npolys] = contour.area;
            mesh.npolys += 1;
        }
    }
    mesh.nverts = mesh.verts.len() / 3;

    // Remove border vertices sitting on straight chains.
    let mut i = 0;
    while i < mesh.nverts {
        if vflags[i] {
            if !can_remove_vertex(&mesh, i as u16) {
                i += 1;
                continue;
            }
            remove_vertex(ctx, &mut mesh, i as u16)?;
            vflags.remove(i);
            continue;
        }
        i += 1;
    }

    build_mesh_adjacency(&mut mesh);
    find_portal_edges(&mut mesh, cset);

    mesh.flags = vec![0; mesh.npolys];
    mesh.polys.truncate(mesh.npolys * nvp * 2);
    mesh.regs.truncate(mesh.npolys);
    mesh.areas.truncate(mesh.npolys);

    if mesh.nverts > 0xffff {
        timer.finish(ctx);
        return Err(Error::Build("vertex count exceeds 16-bit index range"));
    }
    ctx.info(
        "polymesh",
        format!("{} polygons over {} vertices", mesh.npolys, mesh.nverts),
    );
    timer.finish(ctx);
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::{Contour, ContourVertex};

    fn vertex(x: i32, y: i32, z: i32) -> ContourVertex {
        ContourVertex { x, y, z, meta: 0 }
    }

    fn square_cset() -> ContourSet {
        ContourSet {
            contours: vec![Contour {
                verts: vec![
                    vertex(0, 0, 0),
                    vertex(0, 0, 4),
                    vertex(4, 0, 4),
                    vertex(4, 0, 0),
                ],
                rverts: Vec::new(),
                reg: 1,
                area: 63,
            }],
            bmin: Vec3::ZERO,
            bmax: Vec3::new(4.0, 1.0, 4.0),
            cs: 1.0,
            ch: 1.0,
            width: 4,
            height: 4,
            border_size: 0,
            max_error: 1.3,
        }
    }

    #[test]
    fn square_contour_becomes_one_quad() {
        let mut ctx = BuildContext::new();
        let mesh = build_poly_mesh(&mut ctx, &square_cset(), 6).unwrap();
        assert_eq!(mesh.npolys, 1);
        assert_eq!(mesh.nverts, 4);
        assert_eq!(mesh.poly_verts(0).len(), 4);
        assert_eq!(mesh.regs[0], 1);
        assert_eq!(mesh.areas[0], 63);
    }

    #[test]
    fn triangulate_convex_polygon() {
        let verts: Vec<[i32; 4]> = vec![
            [0, 0, 0, 0],
            [0, 0, 4, 0],
            [4, 0, 4, 0],
            [4, 0, 0, 0],
        ];
        let mut indices: Vec<i32> = (0..4).collect();
        let mut tris = Vec::new();
        let ntris = triangulate(4, &verts, &mut indices, &mut tris);
        assert_eq!(ntris, 2);
        assert_eq!(tris.len(), 6);
    }

    #[test]
    fn triangulate_l_shape_avoids_the_notch() {
        // Concave hexagon (an L). Every triangle must stay inside it.
        let verts: Vec<[i32; 4]> = vec![
            [0, 0, 0, 0],
            [0, 0, 4, 0],
            [4, 0, 4, 0],
            [4, 0, 2, 0],
            [2, 0, 2, 0],
            [2, 0, 0, 0],
        ];
        let mut indices: Vec<i32> = (0..6).collect();
        let mut tris = Vec::new();
        let ntris = triangulate(6, &verts, &mut indices, &mut tris);
        assert_eq!(ntris, 4);
        // The notch corner (4, 0) xz=(4,0) is outside the polygon; no
        // triangle may contain the point (3, 1) which sits in the notch.
        for t in tris.chunks_exact(3) {
            let a = (verts[t[0] as usize][0], verts[t[0] as usize][2]);
            let b = (verts[t[1] as usize][0], verts[t[1] as usize][2]);
            let c = (verts[t[2] as usize][0], verts[t[2] as usize][2]);
            let p = (3, 1);
            let inside = math::area2(a, b, p).signum() == math::area2(b, c, p).signum()
                && math::area2(b, c, p).signum() == math::area2(c, a, p).signum()
                && math::area2(a, b, p).signum() != 0;
            assert!(!inside, "triangle {t:?} covers the notch");
        }
    }

    #[test]
    fn vertices_are_welded_across_contours() {
        let mut cset = square_cset();
        // Second region sharing an edge with the first.
        cset.contours.push(Contour {
            verts: vec![
                vertex(4, 0, 0),
                vertex(4, 0, 4),
                vertex(8, 0, 4),
                vertex(8, 0, 0),
            ],
            rverts: Vec::new(),
            reg: 2,
            area: 63,
        });
        let mut ctx = BuildContext::new();
        let mesh = build_poly_mesh(&mut ctx, &cset, 6).unwrap();
        assert_eq!(mesh.npolys, 2);
        // 8 corners, 2 shared.
        assert_eq!(mesh.nverts, 6);
    }

    #[test]
    fn adjacency_is_reciprocal() {
        let mut cset = square_cset();
        cset.contours.push(Contour {
            verts: vec![
                vertex(4, 0, 0),
                vertex(4, 0, 4),
                vertex(8, 0, 4),
                vertex(8, 0, 0),
            ],
            rverts: Vec::new(),
            reg: 2,
            area: 63,
        });
        let mut ctx = BuildContext::new();
        let mesh = build_poly_mesh(&mut ctx, &cset, 6).unwrap();
        let mut linked_pairs = 0;
        for i in 0..mesh.npolys {
            let neis = mesh.poly_neis(i);
            let nv = mesh.poly_verts(i).len();
            for &nei in neis.iter().take(nv) {
                if nei == MESH_NULL_IDX || nei & 0x8000 != 0 {
                    continue;
                }
                linked_pairs += 1;
                // The neighbour must point back at polygon i.
                let back = mesh.poly_neis(nei as usize);
                let back_nv = mesh.poly_verts(nei as usize).len();
                assert!(back.iter().take(back_nv).any(|&b| b == i as u16));
            }
        }
        assert_eq!(linked_pairs, 2);
    }

    #[test]
    fn polygons_stay_convex_after_merge() {
        let mut ctx = BuildContext::new();
        let mesh = build_poly_mesh(&mut ctx, &square_cset(), 6).unwrap();
        for i in 0..mesh.npolys {
            let verts = mesh.poly_verts(i);
            let n = verts.len();
            assert!(n >= 3 && n <= mesh.nvp);
            for j in 0..n {
                let a = verts[j] as usize;
                let b = verts[(j + 1) % n] as usize;
                let c = verts[(j + 2) % n] as usize;
                assert!(uleft(
                    &mesh.verts[a * 3..],
                    &mesh.verts[b * 3..],
                    &mesh.verts[c * 3..]
                ));
            }
        }
    }
}
