//! Detail mesh: per-polygon height sampling and triangulation.
//!
//! For every navmesh polygon a height patch is flood-filled from the
//! compact field, the polygon edges and interior are sampled at
//! `sample_dist`, and samples deviating more than `sample_max_error` from
//! the surface become extra vertices. The point set is triangulated with a
//! Delaunay facet-completion pass constrained to the polygon hull.

use crate::compact::CompactHeightfield;
use crate::context::{BuildContext, ScopedTimer, StageTimer};
use crate::math;
use crate::polymesh::{PolyMesh, MESH_NULL_IDX, MULTIPLE_REGS};
use crate::Result;

const UNSET_HEIGHT: u16 = 0xffff;
const MAX_VERTS: usize = 127;
// Delaunay worst case is 2n - 2 - k triangles (k hull vertices).
const MAX_TRIS: usize = 255;
const MAX_VERTS_PER_EDGE: usize = 32;

const EV_UNDEF: i32 = -1;
const EV_HULL: i32 = -2;

/// Detail sub-meshes for every polygon of a [`PolyMesh`].
///
/// `meshes[i]` is `(vert_base, vert_count, tri_base, tri_count)`; vertices
/// are world-space floats and each triangle carries a flags byte with two
/// bits per edge (non-zero = the edge lies on the polygon boundary).
#[derive(Debug, Clone, Default)]
pub struct PolyMeshDetail {
    pub meshes: Vec<[u32; 4]>,
    pub verts: Vec<f32>,
    pub tris: Vec<[u8; 4]>,
}

/// Height samples over one polygon's grid footprint.
#[derive(Debug, Default)]
struct HeightPatch {
    data: Vec<u16>,
    xmin: i32,
    zmin: i32,
    width: i32,
    height: i32,
}

#[inline]
fn vdot2(ax: f32, az: f32, bx: f32, bz: f32) -> f32 {
    ax * bx + az * bz
}

#[inline]
fn vdist2(a: &[f32], b: &[f32]) -> f32 {
    let dx = b[0] - a[0];
    let dz = b[2] - a[2];
    (dx * dx + dz * dz).sqrt()
}

#[inline]
fn vcross2(p1: &[f32], p2: &[f32], p3: &[f32]) -> f32 {
    let u1 = p2[0] - p1[0];
    let v1 = p2[2] - p1[2];
    let u2 = p3[0] - p1[0];
    let v2 = p3[2] - p1[2];
    u1 * v2 - v1 * u2
}

/// Circumcircle of a triangle projected to xz, computed relative to `p1`
/// to dodge precision loss. Returns the centre and radius.
fn circum_circle(p1: &[f32], p2: &[f32], p3: &[f32]) -> ([f32; 3], f32) {
    const EPS: f32 = 1e-6;
    let v2 = [p2[0] - p1[0], 0.0, p2[2] - p1[2]];
    let v3 = [p3[0] - p1[0], 0.0, p3[2] - p1[2]];
    let origin = [0.0f32; 3];

    let cp = vcross2(&origin, &v2, &v3);
    if cp.abs() > EPS {
        let v2_sq = vdot2(v2[0], v2[2], v2[0], v2[2]);
        let v3_sq = vdot2(v3[0], v3[2], v3[0], v3[2]);
        let cx = (v2_sq * v3[2] - v3_sq * v2[2]) / (2.0 * cp);
        let cz = (v3_sq * v2[0] - v2_sq * v3[0]) / (2.0 * cp);
        let r = (cx * cx + cz * cz).sqrt();
        ([cx + p1[0], p1[1], cz + p1[2]], r)
    } else {
        ([p1[0], p1[1], p1[2]], 0.0)
    }
}

fn dist_pt_seg(pt: &[f32], p: &[f32], q: &[f32]) -> f32 {
    let pqx = q[0] - p[0];
    let pqy = q[1] - p[1];
    let pqz = q[2] - p[2];
    let dx = pt[0] - p[0];
    let dy = pt[1] - p[1];
    let dz = pt[2] - p[2];
    let d = pqx * pqx + pqy * pqy + pqz * pqz;
    let mut t = pqx * dx + pqy * dy + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let dx = p[0] + t * pqx - pt[0];
    let dy = p[1] + t * pqy - pt[1];
    let dz = p[2] + t * pqz - pt[2];
    dx * dx + dy * dy + dz * dz
}

fn dist_pt_seg_2d(pt: &[f32], p: &[f32], q: &[f32]) -> f32 {
    let pqx = q[0] - p[0];
    let pqz = q[2] - p[2];
    let dx = pt[0] - p[0];
    let dz = pt[2] - p[2];
    let d = pqx * pqx + pqz * pqz;
    let mut t = pqx * dx + pqz * dz;
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);
    let dx = p[0] + t * pqx - pt[0];
    let dz = p[2] + t * pqz - pt[2];
    dx * dx + dz * dz
}

/// Vertical distance from `p` to the triangle when its xz projection falls
/// inside; `f32::MAX` otherwise.
fn dist_pt_tri(p: &[f32], a: &[f32], b: &[f32], c: &[f32]) -> f32 {
    let v0 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let v1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v2 = [p[0] - a[0], p[1] - a[1], p[2] - a[2]];

    let dot00 = vdot2(v0[0], v0[2], v0[0], v0[2]);
    let dot01 = vdot2(v0[0], v0[2], v1[0], v1[2]);
    let dot02 = vdot2(v0[0], v0[2], v2[0], v2[2]);
    let dot11 = vdot2(v1[0], v1[2], v1[0], v1[2]);
    let dot12 = vdot2(v1[0], v1[2], v2[0], v2[2]);

    let inv_denom = 1.0 / (dot00 * dot11 - dot01 * dot01);
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    const EPS: f32 = 1e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a[1] + v0[1] * u + v1[1] * v;
        (y - p[1]).abs()
    } else {
        f32::MAX
    }
}

/// Vertical distance from `p` to the triangulated surface, or -1 when the
/// point projects outside every triangle.
fn dist_to_tri_mesh(p: &[f32], verts: &[f32], tris: &[i32]) -> f32 {
    let mut dmin = f32::MAX;
    for t in tris.chunks_exact(4) {
        let va = &verts[t[0] as usize * 3..];
        let vb = &verts[t[1] as usize * 3..];
        let vc = &verts[t[2] as usize * 3..];
        let d = dist_pt_tri(p, va, vb, vc);
        if d < dmin {
            dmin = d;
        }
    }
    if dmin == f32::MAX {
        -1.0
    } else {
        dmin
    }
}

/// Signed xz distance from `p` to the polygon outline; negative inside.
fn dist_to_poly(verts: &[f32], nverts: usize, p: &[f32]) -> f32 {
    let mut dmin = f32::MAX;
    let mut inside = false;
    let mut j = nverts - 1;
    for i in 0..nverts {
        let vi = &verts[i * 3..];
        let vj = &verts[j * 3..];
        if (vi[2] > p[2]) != (vj[2] > p[2])
            && p[0] < (vj[0] - vi[0]) * (p[2] - vi[2]) / (vj[2] - vi[2]) + vi[0]
        {
            inside = !inside;
        }
        dmin = dmin.min(dist_pt_seg_2d(p, vj, vi));
        j = i;
    }
    if inside {
        -dmin
    } else {
        dmin
    }
}

/// Looks up the patch height at a world position, spiralling outward up to
/// `radius` cells when the exact cell was never filled.
fn get_height(fx: f32, fy: f32, fz: f32, ics: f32, ch: f32, radius: i32, hp: &HeightPatch) -> u16 {
    let ix = ((fx * ics + 0.01).floor() as i32 - hp.xmin).clamp(0, hp.width - 1);
    let iz = ((fz * ics + 0.01).floor() as i32 - hp.zmin).clamp(0, hp.height - 1);
    let mut h = hp.data[(ix + iz * hp.width) as usize];
    if h != UNSET_HEIGHT {
        return h;
    }

    // Spiral ring by ring; stop at the first ring that produced a value.
    let (mut x, mut z, mut dx, mut dz) = (1i32, 0i32, 1i32, 0i32);
    let max_size = radius * 2 + 1;
    let max_iter = max_size * max_size - 1;
    let mut next_ring_iter_start = 8;
    let mut next_ring_iters = 16;
    let mut dmin = f32::MAX;
    for i in 0..max_iter {
        let nx = ix + x;
        let nz = iz + z;
        if nx >= 0 && nz >= 0 && nx < hp.width && nz < hp.height {
            let nh = hp.data[(nx + nz * hp.width) as usize];
            if nh != UNSET_HEIGHT {
                let d = (nh as f32 * ch - fy).abs();
                if d < dmin {
                    h = nh;
                    dmin = d;
                }
            }
        }
        if i + 1 == next_ring_iter_start {
            if h != UNSET_HEIGHT {
                break;
            }
            next_ring_iter_start += next_ring_iters;
            next_ring_iters += 8;
        }
        if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
            std::mem::swap(&mut dx, &mut dz);
            dx = -dx;
        }
        x += dx;
        z += dz;
    }
    h
}

fn find_edge(edges: &[i32], s: i32, t: i32) -> i32 {
    for (i, e) in edges.chunks_exact(4).enumerate() {
        if (e[0] == s && e[1] == t) || (e[0] == t && e[1] == s) {
            return i as i32;
        }
    }
    EV_UNDEF
}

fn add_edge(ctx: &mut BuildContext, edges: &mut Vec<i32>, max_edges: usize, s: i32, t: i32, l: i32, r: i32) {
    if edges.len() / 4 >= max_edges {
        ctx.error("detail", "edge budget exceeded in delaunay hull");
        return;
    }
    if find_edge(edges, s, t) == EV_UNDEF {
        edges.extend_from_slice(&[s, t, l, r]);
    }
}

fn update_left_face(edges: &mut [i32], e: usize, s: i32, t: i32, f: i32) {
    let e = &mut edges[e * 4..e * 4 + 4];
    if e[0] == s && e[1] == t && e[2] == EV_UNDEF {
        e[2] = f;
    } else if e[1] == s && e[0] == t && e[3] == EV_UNDEF {
        e[3] = f;
    }
}

fn overlap_seg_seg_2d(a: &[f32], b: &[f32], c: &[f32], d: &[f32]) -> bool {
    let a1 = vcross2(a, b, d);
    let a2 = vcross2(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = vcross2(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

fn overlap_edges(pts: &[f32], edges: &[i32], s1: i32, t1: i32) -> bool {
    for e in edges.chunks_exact(4) {
        let (s0, t0) = (e[0], e[1]);
        if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
            continue;
        }
        if overlap_seg_seg_2d(
            &pts[s0 as usize * 3..],
            &pts[t0 as usize * 3..],
            &pts[s1 as usize * 3..],
            &pts[t1 as usize * 3..],
        ) {
            return true;
        }
    }
    false
}

fn complete_facet(
    ctx: &mut BuildContext,
    pts: &[f32],
    npts: usize,
    edges: &mut Vec<i32>,
    max_edges: usize,
    nfaces: &mut i32,
    e: usize,
) {
    const EPS: f32 = 1e-5;

    let (s, t) = {
        let edge = &edges[e * 4..e * 4 + 4];
        if edge[2] == EV_UNDEF {
            (edge[0], edge[1])
        } else if edge[3] == EV_UNDEF {
            (edge[1], edge[0])
        } else {
            return;
        }
    };

    // Best point left of the edge by the Delaunay circumcircle criterion.
    let mut pt = npts;
    let mut c = [0.0f32; 3];
    let mut r = -1.0f32;
    for u in 0..npts {
        if u as i32 == s || u as i32 == t {
            continue;
        }
        if vcross2(&pts[s as usize * 3..], &pts[t as usize * 3..], &pts[u * 3..]) > EPS {
            if r < 0.0 {
                pt = u;
                let (cc, rr) = circum_circle(
                    &pts[s as usize * 3..],
                    &pts[t as usize * 3..],
                    &pts[u * 3..],
                );
                c = cc;
                r = rr;
                continue;
            }
            let d = vdist2(&c, &pts[u * 3..]);
            let tol = 0.001;
            if d > r * (1.0 + tol) {
                continue;
            } else if d < r * (1.0 - tol) {
                pt = u;
                let (cc, rr) = circum_circle(
                    &pts[s as usize * 3..],
                    &pts[t as usize * 3..],
                    &pts[u * 3..],
                );
                c = cc;
                r = rr;
            } else {
                // On the epsilon ring: accept only if the new edges stay
                // planar-valid.
                if overlap_edges(pts, edges, s, u as i32) {
                    continue;
                }
                if overlap_edges(pts, edges, t, u as i32) {
                    continue;
                }
                pt = u;
                let (cc, rr) = circum_circle(
                    &pts[s as usize * 3..],
                    &pts[t as usize * 3..],
                    &pts[u * 3..],
                );
                c = cc;
                r = rr;
            }
        }
    }

    if pt < npts {
        update_left_face(edges, e, s, t, *nfaces);
        let found = find_edge(edges, pt as i32, s);
        if found == EV_UNDEF {
            add_edge(ctx, edges, max_edges, pt as i32, s, *nfaces, EV_UNDEF);
        } else {
            update_left_face(edges, found as usize, pt as i32, s, *nfaces);
        }
        let found = find_edge(edges, t, pt as i32);
        if found == EV_UNDEF {
            add_edge(ctx, edges, max_edges, t, pt as i32, *nfaces, EV_UNDEF);
        } else {
            update_left_face(edges, found as usize, t, pt as i32, *nfaces);
        }
        *nfaces += 1;
    } else {
        update_left_face(edges, e, s, t, EV_HULL);
    }
}

/// Delaunay triangulation of the point set constrained to the hull ring.
/// Output triangles are 4 ints each (three indices plus padding).
fn delaunay_hull(
    ctx: &mut BuildContext,
    npts: usize,
    pts: &[f32],
    hull: &[usize],
    tris: &mut Vec<i32>,
) {
    let max_edges = npts * 10;
    let mut edges: Vec<i32> = Vec::with_capacity(max_edges * 4);
    let mut nfaces = 0i32;

    let nhull = hull.len();
    if nhull > 0 {
        let mut j = nhull - 1;
        for i in 0..nhull {
            add_edge(
                ctx,
                &mut edges,
                max_edges,
                hull[j] as i32,
                hull[i] as i32,
                EV_HULL,
                EV_UNDEF,
            );
            j = i;
        }
    }

    let mut current_edge = 0usize;
    while current_edge < edges.len() / 4 {
        if edges[current_edge * 4 + 2] == EV_UNDEF {
            complete_facet(ctx, pts, npts, &mut edges, max_edges, &mut nfaces, current_edge);
        }
        if edges[current_edge * 4 + 3] == EV_UNDEF {
            complete_facet(ctx, pts, npts, &mut edges, max_edges, &mut nfaces, current_edge);
        }
        current_edge += 1;
    }

    tris.clear();
    tris.resize(nfaces as usize * 4, -1);
    for e in edges.chunks_exact(4) {
        if e[3] >= 0 {
            let t = &mut tris[e[3] as usize * 4..e[3] as usize * 4 + 4];
            if t[0] == -1 {
                t[0] = e[0];
                t[1] = e[1];
            } else if t[0] == e[1] {
                t[2] = e[0];
            } else if t[1] == e[0] {
                t[2] = e[1];
            }
        }
        if e[2] >= 0 {
            let t = &mut tris[e[2] as usize * 4..e[2] as usize * 4 + 4];
            if t[0] == -1 {
                t[0] = e[1];
                t[1] = e[0];
            } else if t[0] == e[0] {
                t[2] = e[1];
            } else if t[1] == e[1] {
                t[2] = e[0];
            }
        }
    }

    let mut i = 0;
    while i < tris.len() / 4 {
        let t = &tris[i * 4..i * 4 + 4];
        if t[0] == -1 || t[1] == -1 || t[2] == -1 {
            ctx.warn("detail", "removing dangling face from delaunay hull");
            let last = tris.len() / 4 - 1;
            for k in 0..4 {
                tris[i * 4 + k] = tris[last * 4 + k];
            }
            tris.truncate(last * 4);
        } else {
            i += 1;
        }
    }
}

#[inline]
fn jitter_x(i: usize) -> f32 {
    (((i as u32).wrapping_mul(0x8da6_b343) & 0xffff) as f32 / 65535.0 * 2.0) - 1.0
}

#[inline]
fn jitter_z(i: usize) -> f32 {
    (((i as u32).wrapping_mul(0xd816_3841) & 0xffff) as f32 / 65535.0 * 2.0) - 1.0
}

/// Builds the detail surface for one polygon: hull edge sampling, interior
/// samples worst-error first, Delaunay retriangulation after each insert.
#[allow(clippy::too_many_arguments)]
fn build_poly_detail(
    ctx: &mut BuildContext,
    poly: &[f32],
    npoly: usize,
    sample_dist: f32,
    sample_max_error: f32,
    height_search_radius: i32,
    chf: &CompactHeightfield,
    hp: &HeightPatch,
    verts: &mut Vec<f32>,
    tris: &mut Vec<i32>,
) {
    let mut hull: Vec<usize> = Vec::with_capacity(MAX_VERTS);
    let mut edge_buf = [0.0f32; (MAX_VERTS_PER_EDGE + 1) * 3];

    verts.clear();
    verts.extend_from_slice(&poly[..npoly * 3]);
    let cs = chf.cs;
    let ics = 1.0 / cs;

    // Tessellate outlines first so height values are seamless across
    // polygon boundaries.
    if sample_dist > 0.0 {
        let mut j = npoly - 1;
        for i in 0..npoly {
            let mut vj = &poly[j * 3..j * 3 + 3];
            let mut vi = &poly[i * 3..i * 3 + 3];
            // Walk every shared edge in the same direction so both sides
            // insert identical sample points.
            let mut swapped = false;
            if (vj[0] - vi[0]).abs() < 1e-6 {
                if vj[2] > vi[2] {
                    std::mem::swap(&mut vj, &mut vi);
                    swapped = true;
                }
            } else if vj[0] > vi[0] {
                std::mem::swap(&mut vj, &mut vi);
                swapped = true;
            }

            let dx = vi[0] - vj[0];
            let dy = vi[1] - vj[1];
            let dz = vi[2] - vj[2];
            let d = (dx * dx + dz * dz).sqrt();
            let mut nn = 1 + (d / sample_dist).floor() as usize;
            if nn >= MAX_VERTS_PER_EDGE {
                nn = MAX_VERTS_PER_EDGE - 1;
            }
            if verts.len() / 3 + nn >= MAX_VERTS {
                nn = (MAX_VERTS - 1).saturating_sub(verts.len() / 3);
            }
            if nn == 0 {
                hull.push(j);
                j = i;
                continue;
            }
            for k in 0..=nn {
                let u = k as f32 / nn as f32;
                let pos = &mut edge_buf[k * 3..k * 3 + 3];
                pos[0] = vj[0] + dx * u;
                pos[1] = vj[1] + dy * u;
                pos[2] = vj[2] + dz * u;
                pos[1] =
                    get_height(pos[0], pos[1], pos[2], ics, chf.ch, height_search_radius, hp)
                        as f32
                        * chf.ch;
            }
            // Keep edge samples that deviate more than the error budget.
            let mut idx = [0usize; MAX_VERTS_PER_EDGE];
            idx[1] = nn;
            let mut nidx = 2;
            let mut k = 0;
            while k < nidx - 1 {
                let a = idx[k];
                let b = idx[k + 1];
                let va = &edge_buf[a * 3..a * 3 + 3];
                let vb = &edge_buf[b * 3..b * 3 + 3];
                let mut maxd = 0.0f32;
                let mut maxi = usize::MAX;
                for m in a + 1..b {
                    let dev = dist_pt_seg(&edge_buf[m * 3..m * 3 + 3], va, vb);
                    if dev > maxd {
                        maxd = dev;
                        maxi = m;
                    }
                }
                if maxi != usize::MAX && maxd > math::sqr(sample_max_error) {
                    for m in (k + 1..nidx).rev() {
                        idx[m + 1] = idx[m];
                    }
                    idx[k + 1] = maxi;
                    nidx += 1;
                } else {
                    k += 1;
                }
            }

            hull.push(j);
            if swapped {
                for k in (1..nidx - 1).rev() {
                    let v = &edge_buf[idx[k] * 3..idx[k] * 3 + 3];
                    hull.push(verts.len() / 3);
                    verts.extend_from_slice(v);
                }
            } else {
                for k in 1..nidx - 1 {
                    let v = &edge_buf[idx[k] * 3..idx[k] * 3 + 3];
                    hull.push(verts.len() / 3);
                    verts.extend_from_slice(v);
                }
            }
            j = i;
        }
    } else {
        hull.extend(0..npoly);
    }

    delaunay_hull(ctx, verts.len() / 3, verts, &hull, tris);
    if tris.is_empty() {
        ctx.warn(
            "detail",
            format!("could not triangulate polygon ({} verts)", verts.len() / 3),
        );
        for i in 2..verts.len() / 3 {
            tris.extend_from_slice(&[0, i as i32 - 1, i as i32, 0]);
        }
        return;
    }

    if sample_dist > 0.0 {
        // Interior grid samples.
        let (bmin, bmax) = math::calc_bounds(&poly[..npoly * 3]);
        let x0 = (bmin.x / sample_dist).floor() as i32;
        let x1 = (bmax.x / sample_dist).ceil() as i32;
        let z0 = (bmin.z / sample_dist).floor() as i32;
        let z1 = (bmax.z / sample_dist).ceil() as i32;

        let mut samples: Vec<[i32; 4]> = Vec::new();
        for z in z0..z1 {
            for x in x0..x1 {
                let pt = [
                    x as f32 * sample_dist,
                    (bmax.y + bmin.y) * 0.5,
                    z as f32 * sample_dist,
                ];
                // Skip samples hugging the outline; the edge pass owns those.
                if dist_to_poly(poly, npoly, &pt) > -sample_dist / 2.0 {
                    continue;
                }
                let y = get_height(pt[0], pt[1], pt[2], ics, chf.ch, height_search_radius, hp);
                samples.push([x, y as i32, z, 0]);
            }
        }

        // Insert worst-error samples until everything fits the budget.
        let nsamples = samples.len();
        for _ in 0..nsamples {
            if verts.len() / 3 >= MAX_VERTS {
                break;
            }
            let mut bestpt = [0.0f32; 3];
            let mut bestd = 0.0f32;
            let mut besti = usize::MAX;
            for (i, s) in samples.iter().enumerate() {
                if s[3] != 0 {
                    continue;
                }
                // Jitter off the grid to avoid symmetric degeneracies.
                let pt = [
                    s[0] as f32 * sample_dist + jitter_x(i) * cs * 0.1,
                    s[1] as f32 * chf.ch,
                    s[2] as f32 * sample_dist + jitter_z(i) * cs * 0.1,
                ];
                let d = dist_to_tri_mesh(&pt, verts, tris);
                if d < 0.0 {
                    continue;
                }
                if d > bestd {
                    bestd = d;
                    besti = i;
                    bestpt = pt;
                }
            }
            if bestd <= sample_max_error || besti == usize::MAX {
                break;
            }
            samples[besti][3] = 1;
            verts.extend_from_slice(&bestpt);
            delaunay_hull(ctx, verts.len() / 3, verts, &hull, tris);
        }
    }

    if tris.len() / 4 > MAX_TRIS {
        tris.truncate(MAX_TRIS * 4);
        ctx.warn("detail", "shrinking detail triangle count to budget");
    }
}

/// Fills the patch with floor heights of spans belonging to `region`,
/// seeding a BFS that spreads into cells the region does not cover.
#[allow(clippy::too_many_arguments)]
fn get_height_data(
    chf: &CompactHeightfield,
    poly: &[u16],
    npoly: usize,
    mesh_verts: &[u16],
    bs: i32,
    hp: &mut HeightPatch,
    queue: &mut Vec<(i32, i32, usize)>,
    region: u16,
) {
    queue.clear();
    hp.data.clear();
    hp.data.resize((hp.width * hp.height) as usize, UNSET_HEIGHT);

    let mut empty = true;

    // Polygons stitched from multiple regions may overlap other geometry;
    // their patch is seeded from the polygon centre instead.
    if region != MULTIPLE_REGS {
        for hz in 0..hp.height {
            let z = hp.zmin + hz + bs;
            for hx in 0..hp.width {
                let x = hp.xmin + hx + bs;
                for i in chf.cell_spans(x, z) {
                    let span = chf.spans[i];
                    if span.reg != region {
                        continue;
                    }
                    hp.data[(hx + hz * hp.width) as usize] = span.y;
                    empty = false;
                    let border = (0..4).any(|dir| {
                        chf.neighbor_index(x, z, &span, dir)
                            .map(|ai| chf.spans[ai].reg != region)
                            .unwrap_or(false)
                    });
                    if border {
                        queue.push((x, z, i));
                    }
                    break;
                }
            }
        }
    }

    if empty {
        seed_array_with_poly_center(chf, poly, npoly, mesh_verts, bs, hp, queue);
    }

    // BFS outward from the region border, copying each span's floor.
    let mut head = 0;
    while head < queue.len() {
        let (cx, cz, ci) = queue[head];
        head += 1;
        let span = chf.spans[ci];
        for dir in 0..4 {
            let Some(ai) = chf.neighbor_index(cx, cz, &span, dir) else {
                continue;
            };
            let ax = cx + math::dir_offset_x(dir);
            let az = cz + math::dir_offset_z(dir);
            let hx = ax - hp.xmin - bs;
            let hz = az - hp.zmin - bs;
            if hx < 0 || hx >= hp.width || hz < 0 || hz >= hp.height {
                continue;
            }
            if hp.data[(hx + hz * hp.width) as usize] != UNSET_HEIGHT {
                continue;
            }
            hp.data[(hx + hz * hp.width) as usize] = chf.spans[ai].y;
            queue.push((ax, az, ai));
        }
    }
}

/// DFS from the span nearest a polygon vertex toward the polygon centre;
/// the landing span seeds the height patch.
fn seed_array_with_poly_center(
    chf: &CompactHeightfield,
    poly: &[u16],
    npoly: usize,
    mesh_verts: &[u16],
    bs: i32,
    hp: &mut HeightPatch,
    queue: &mut Vec<(i32, i32, usize)>,
) {
    const OFFSET: [i32; 18] = [0, 0, -1, -1, 0, -1, 1, -1, 1, 0, 1, 1, 0, 1, -1, 1, -1, 0];

    let mut start_x = 0;
    let mut start_z = 0;
    let mut start_span = usize::MAX;
    let mut dmin = UNSET_HEIGHT as i32;
    'search: for j in 0..npoly {
        for k in 0..9 {
            let v = &mesh_verts[poly[j] as usize * 3..poly[j] as usize * 3 + 3];
            let ax = v[0] as i32 + OFFSET[k * 2];
            let ay = v[1] as i32;
            let az = v[2] as i32 + OFFSET[k * 2 + 1];
            if ax < hp.xmin || ax >= hp.xmin + hp.width || az < hp.zmin || az >= hp.zmin + hp.height
            {
                continue;
            }
            for i in chf.cell_spans(ax + bs, az + bs) {
                let d = (ay - chf.spans[i].y as i32).abs();
                if d < dmin {
                    start_x = ax;
                    start_z = az;
                    start_span = i;
                    dmin = d;
                }
            }
            if dmin == 0 {
                break 'search;
            }
        }
    }
    if start_span == usize::MAX {
        return;
    }

    let mut pcx = 0;
    let mut pcz = 0;
    for j in 0..npoly {
        let v = &mesh_verts[poly[j] as usize * 3..poly[j] as usize * 3 + 3];
        pcx += v[0] as i32;
        pcz += v[2] as i32;
    }
    pcx /= npoly as i32;
    pcz /= npoly as i32;

    // DFS toward the centre, preferring the direct direction but recording
    // every visited node; contour simplification can force detours.
    let mut stack: Vec<(i32, i32, usize)> = vec![(start_x, start_z, start_span)];
    let mut dirs = [0usize, 1, 2, 3];
    hp.data.fill(0);

    let mut cx = -1;
    let mut cz = -1;
    let mut ci = usize::MAX;
    loop {
        let Some(top) = stack.pop() else {
            log::warn!("walk toward polygon center failed to reach it");
            break;
        };
        (cx, cz, ci) = top;
        if cx == pcx && cz == pcz {
            break;
        }

        let direct_dir = if cx == pcx {
            math::dir_for_offset(0, if pcz > cz { 1 } else { -1 })
        } else {
            math::dir_for_offset(if pcx > cx { 1 } else { -1 }, 0)
        };
        // dirs is the identity permutation outside this scope, so the
        // preferred direction can be indexed directly.
        dirs.swap(direct_dir, 3);

        let span = chf.spans[ci];
        for &dir in dirs.iter() {
            if span.con(dir) == crate::compact::NOT_CONNECTED {
                continue;
            }
            let nx = cx + math::dir_offset_x(dir);
            let nz = cz + math::dir_offset_z(dir);
            let hpx = nx - hp.xmin;
            let hpz = nz - hp.zmin;
            if hpx < 0 || hpx >= hp.width || hpz < 0 || hpz >= hp.height {
                continue;
            }
            if hp.data[(hpx + hpz * hp.width) as usize] != 0 {
                continue;
            }
            hp.data[(hpx + hpz * hp.width) as usize] = 1;
            let ai = chf.cell(nx + bs, nz + bs).index as usize + span.con(dir) as usize;
            stack.push((nx, nz, ai));
        }
        dirs.swap(direct_dir, 3);
    }

    queue.clear();
    hp.data.fill(UNSET_HEIGHT);
    if ci != usize::MAX {
        queue.push((cx + bs, cz + bs, ci));
        hp.data[((cx - hp.xmin) + (cz - hp.zmin) * hp.width) as usize] = chf.spans[ci].y;
    }
}

fn get_edge_flags(va: &[f32], vb: &[f32], vpoly: &[f32], npoly: usize) -> u8 {
    // Matches the runtime's detail-edge convention: bit set when the edge
    // lies along the polygon boundary.
    let thr_sqr = math::sqr(0.001f32);
    let mut j = npoly - 1;
    for i in 0..npoly {
        let pj = &vpoly[j * 3..];
        let pi = &vpoly[i * 3..];
        if dist_pt_seg_2d(va, pj, pi) < thr_sqr && dist_pt_seg_2d(vb, pj, pi) < thr_sqr {
            return 1;
        }
        j = i;
    }
    0
}

fn get_tri_flags(va: &[f32], vb: &[f32], vc: &[f32], vpoly: &[f32], npoly: usize) -> u8 {
    let mut flags = 0u8;
    flags |= get_edge_flags(va, vb, vpoly, npoly);
    flags |= get_edge_flags(vb, vc, vpoly, npoly) << 2;
    flags |= get_edge_flags(vc, va, vpoly, npoly) << 4;
    flags
}

/// Builds the detail mesh for every polygon of `mesh`.
pub fn build_poly_mesh_detail(
    ctx: &mut BuildContext,
    mesh: &PolyMesh,
    chf: &CompactHeightfield,
    sample_dist: f32,
    sample_max_error: f32,
) -> Result<PolyMeshDetail> {
    let timer = ScopedTimer::start(ctx, StageTimer::DetailMesh);

    let mut dmesh = PolyMeshDetail::default();
    if mesh.nverts == 0 || mesh.npolys == 0 {
        timer.finish(ctx);
        return Ok(dmesh);
    }

    let nvp = mesh.nvp;
    let cs = mesh.cs;
    let ch = mesh.ch;
    let orig = mesh.bmin;
    let bs = mesh.border_size;
    let height_search_radius = 1.max(mesh.max_edge_error.ceil() as i32);

    // Per-polygon patch bounds, padded by one cell.
    let mut bounds: Vec<[i32; 4]> = Vec::with_capacity(mesh.npolys);
    let mut maxhw = 0;
    let mut maxhh = 0;
    for i in 0..mesh.npolys {
        let p = &mesh.polys[i * nvp * 2..i * nvp * 2 + nvp];
        let mut xmin = chf.width;
        let mut xmax = 0;
        let mut zmin = chf.height;
        let mut zmax = 0;
        for &vi in p.iter().take_while(|&&v| v != MESH_NULL_IDX) {
            let v = &mesh.verts[vi as usize * 3..vi as usize * 3 + 3];
            xmin = xmin.min(v[0] as i32);
            xmax = xmax.max(v[0] as i32);
            zmin = zmin.min(v[2] as i32);
            zmax = zmax.max(v[2] as i32);
        }
        let xmin = 0.max(xmin - 1);
        let xmax = chf.width.min(xmax + 1);
        let zmin = 0.max(zmin - 1);
        let zmax = chf.height.min(zmax + 1);
        bounds.push([xmin, xmax, zmin, zmax]);
        if xmin < xmax && zmin < zmax {
            maxhw = maxhw.max(xmax - xmin);
            maxhh = maxhh.max(zmax - zmin);
        }
    }

    let mut hp = HeightPatch {
        data: Vec::with_capacity((maxhw * maxhh) as usize),
        ..HeightPatch::default()
    };
    let mut queue: Vec<(i32, i32, usize)> = Vec::with_capacity(512);
    let mut poly_verts: Vec<f32> = Vec::with_capacity(nvp * 3);
    let mut verts: Vec<f32> = Vec::with_capacity(256 * 3);
    let mut tris: Vec<i32> = Vec::with_capacity(512);

    dmesh.meshes.reserve(mesh.npolys);

    for i in 0..mesh.npolys {
        let p = &mesh.polys[i * nvp * 2..i * nvp * 2 + nvp];

        poly_verts.clear();
        let mut npoly = 0;
        for &vi in p.iter().take_while(|&&v| v != MESH_NULL_IDX) {
            let v = &mesh.verts[vi as usize * 3..vi as usize * 3 + 3];
            poly_verts.extend_from_slice(&[
                v[0] as f32 * cs,
                v[1] as f32 * ch,
                v[2] as f32 * cs,
            ]);
            npoly += 1;
        }

        hp.xmin = bounds[i][0];
        hp.zmin = bounds[i][2];
        hp.width = bounds[i][1] - bounds[i][0];
        hp.height = bounds[i][3] - bounds[i][2];
        if hp.width <= 0 || hp.height <= 0 {
            // Degenerate footprint; emit an empty submesh to keep the
            // per-polygon indexing aligned.
            let base = (dmesh.verts.len() / 3) as u32;
            dmesh.meshes.push([base, 0, dmesh.tris.len() as u32, 0]);
            continue;
        }
        get_height_data(
            chf,
            p,
            npoly,
            &mesh.verts,
            bs,
            &mut hp,
            &mut queue,
            mesh.regs[i],
        );

        build_poly_detail(
            ctx,
            &poly_verts,
            npoly,
            sample_dist,
            sample_max_error,
            height_search_radius,
            chf,
            &hp,
            &mut verts,
            &mut tris,
        );

        // Shift to world space.
        let nverts = verts.len() / 3;
        for v in verts.chunks_exact_mut(3) {
            v[0] += orig.x;
            v[1] += orig.y + chf.ch;
            v[2] += orig.z;
        }
        for v in poly_verts.chunks_exact_mut(3) {
            v[0] += orig.x;
            v[1] += orig.y;
            v[2] += orig.z;
        }

        let ntris = tris.len() / 4;
        let vert_base = dmesh.verts.len() / 3;
        let tri_base = dmesh.tris.len();
        dmesh.meshes.push([
            vert_base as u32,
            nverts as u32,
            tri_base as u32,
            ntris as u32,
        ]);

        dmesh.verts.extend_from_slice(&verts);
        for t in tris.chunks_exact(4) {
            let flags = get_tri_flags(
                &verts[t[0] as usize * 3..],
                &verts[t[1] as usize * 3..],
                &verts[t[2] as usize * 3..],
                &poly_verts,
                npoly,
            );
            dmesh.tris.push([t[0] as u8, t[1] as u8, t[2] as u8, flags]);
        }
    }

    ctx.info(
        "detail",
        format!(
            "{} submeshes, {} vertices, {} triangles",
            dmesh.meshes.len(),
            dmesh.verts.len() / 3,
            dmesh.tris.len()
        ),
    );
    timer.finish(ctx);
    Ok(dmesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::{build_contours, ContourBuildFlags};
    use crate::distance;
    use crate::heightfield::Heightfield;
    use crate::math::WALKABLE_AREA;
    use crate::polymesh::build_poly_mesh;
    use crate::region;
    use glam::Vec3;

    fn build_plate() -> (PolyMesh, CompactHeightfield) {
        let mut hf = Heightfield::new(
            8,
            8,
            Vec3::ZERO,
            Vec3::new(8.0, 4.0, 8.0),
            1.0,
            0.5,
        );
        for z in 0..8 {
            for x in 0..8 {
                hf.add_span(x, z, 0, 1, WALKABLE_AREA, 1).unwrap();
            }
        }
        let mut ctx = BuildContext::new();
        let mut chf = CompactHeightfield::build_from_heightfield(&mut ctx, 2, 1, &hf).unwrap();
        distance::build_distance_field(&mut ctx, &mut chf).unwrap();
        region::build_regions_watershed(&mut ctx, &mut chf, 0, 2, 100).unwrap();
        let cset = build_contours(&mut ctx, &chf, 1.3, 12, ContourBuildFlags::default()).unwrap();
        let mesh = build_poly_mesh(&mut ctx, &cset, 6).unwrap();
        (mesh, chf)
    }

    #[test]
    fn flat_quad_detail_has_two_triangles() {
        let (mesh, chf) = build_plate();
        let mut ctx = BuildContext::new();
        let dmesh = build_poly_mesh_detail(&mut ctx, &mesh, &chf, 0.0, 1.0).unwrap();
        assert_eq!(dmesh.meshes.len(), mesh.npolys);
        let [vbase, vcount, _tbase, tcount] = dmesh.meshes[0];
        assert_eq!(vbase, 0);
        assert_eq!(vcount, 4);
        assert_eq!(tcount, 2);
    }

    #[test]
    fn detail_vertices_are_world_space() {
        let (mesh, chf) = build_plate();
        let mut ctx = BuildContext::new();
        let dmesh = build_poly_mesh_detail(&mut ctx, &mesh, &chf, 2.0, 1.0).unwrap();
        for v in dmesh.verts.chunks_exact(3) {
            assert!((0.0..=8.0).contains(&v[0]));
            assert!((0.0..=8.0).contains(&v[2]));
            // Plate floor sits at one cell height.
            assert!((v[1] - 1.0).abs() < 1.01);
        }
    }

    #[test]
    fn boundary_edges_are_flagged_external() {
        let (mesh, chf) = build_plate();
        let mut ctx = BuildContext::new();
        let dmesh = build_poly_mesh_detail(&mut ctx, &mesh, &chf, 0.0, 1.0).unwrap();
        // A flat quad fans into two triangles; each has boundary edges.
        let mut boundary_edges = 0;
        for t in &dmesh.tris {
            for e in 0..3 {
                if (t[3] >> (e * 2)) & 0x3 != 0 {
                    boundary_edges += 1;
                }
            }
        }
        assert!(boundary_edges >= 4);
    }

    #[test]
    fn delaunay_hull_of_a_square_is_two_triangles() {
        // Ring order matches the contour trace winding: interior lies to
        // the right of consecutive hull edges.
        let pts = vec![
            0.0, 0.0, 0.0, //
            0.0, 0.0, 4.0, //
            4.0, 0.0, 4.0, //
            4.0, 0.0, 0.0,
        ];
        let hull = vec![0usize, 1, 2, 3];
        let mut ctx = BuildContext::new();
        let mut tris = Vec::new();
        delaunay_hull(&mut ctx, 4, &pts, &hull, &mut tris);
        assert_eq!(tris.len() / 4, 2);
        for t in tris.chunks_exact(4) {
            assert!(t[0] >= 0 && t[1] >= 0 && t[2] >= 0);
        }
    }

    #[test]
    fn spiral_height_lookup_recovers_missing_cells() {
        let hp = HeightPatch {
            data: vec![UNSET_HEIGHT, 7, UNSET_HEIGHT, UNSET_HEIGHT],
            xmin: 0,
            zmin: 0,
            width: 2,
            height: 2,
        };
        let h = get_height(0.1, 0.0, 0.1, 1.0, 0.5, 2, &hp);
        assert_eq!(h, 7);
    }
}
