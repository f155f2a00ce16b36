//! End-to-end pipeline scenarios on small hand-built scenes.

use glam::Vec3;
use voxnav::{
    AreaMarker, BuildConfig, BuildContext, NavMeshBuilder, OffMeshConnection, PartitionKind,
    PolyMesh, MESH_NULL_IDX, WALKABLE_AREA,
};

/// Triangle soup under construction.
#[derive(Default)]
struct Scene {
    verts: Vec<f32>,
    indices: Vec<i32>,
}

impl Scene {
    fn push_vert(&mut self, v: Vec3) -> i32 {
        let idx = (self.verts.len() / 3) as i32;
        self.verts.extend_from_slice(&[v.x, v.y, v.z]);
        idx
    }

    /// Horizontal quad (two triangles) given its four corners in ring order.
    fn quad(&mut self, a: Vec3, b: Vec3, c: Vec3, d: Vec3) {
        let ia = self.push_vert(a);
        let ib = self.push_vert(b);
        let ic = self.push_vert(c);
        let id = self.push_vert(d);
        self.indices.extend_from_slice(&[ia, ib, ic, ia, ic, id]);
    }

    /// Flat axis-aligned square at `y` spanning `[x0, x1] x [z0, z1]`.
    fn flat_square(&mut self, x0: f32, x1: f32, z0: f32, z1: f32, y: f32) {
        self.quad(
            Vec3::new(x0, y, z0),
            Vec3::new(x0, y, z1),
            Vec3::new(x1, y, z1),
            Vec3::new(x1, y, z0),
        );
    }

    /// Sloped quad rising from `y0` at `x0` to `y1` at `x1`.
    fn ramp(&mut self, x0: f32, x1: f32, z0: f32, z1: f32, y0: f32, y1: f32) {
        self.quad(
            Vec3::new(x0, y0, z0),
            Vec3::new(x0, y0, z1),
            Vec3::new(x1, y1, z1),
            Vec3::new(x1, y1, z0),
        );
    }

    /// Closed vertical cylinder approximated by `sides` wall quads.
    fn cylinder(&mut self, centre: Vec3, radius: f32, height: f32, sides: usize) {
        for i in 0..sides {
            let a0 = i as f32 / sides as f32 * std::f32::consts::TAU;
            let a1 = (i + 1) as f32 / sides as f32 * std::f32::consts::TAU;
            let p0 = centre + Vec3::new(a0.cos() * radius, 0.0, a0.sin() * radius);
            let p1 = centre + Vec3::new(a1.cos() * radius, 0.0, a1.sin() * radius);
            self.quad(
                p0,
                p1,
                p1 + Vec3::new(0.0, height, 0.0),
                p0 + Vec3::new(0.0, height, 0.0),
            );
        }
    }
}

fn standard_config(scene: &Scene) -> BuildConfig {
    let mut cfg = BuildConfig {
        cs: 0.3,
        ch: 0.2,
        walkable_slope_angle: 45.0,
        walkable_height: 10,
        walkable_climb: 4,
        walkable_radius: 2,
        max_verts_per_poly: 6,
        min_region_area: 8,
        merge_region_area: 20,
        max_edge_len: 12,
        max_simplification_error: 1.3,
        ..BuildConfig::default()
    };
    let (bmin, bmax) = voxnav::calc_bounds(&scene.verts);
    // Pad vertically so walls and surfaces are fully inside the grid.
    cfg.apply_bounds(
        bmin - Vec3::new(0.0, 0.5, 0.0),
        bmax + Vec3::new(0.0, 1.0, 0.0),
    );
    cfg
}

/// Number of connected components over the polygon adjacency links.
fn connected_components(mesh: &PolyMesh) -> usize {
    if mesh.npolys == 0 {
        return 0;
    }
    let mut seen = vec![false; mesh.npolys];
    let mut components = 0;
    for start in 0..mesh.npolys {
        if seen[start] {
            continue;
        }
        components += 1;
        let mut stack = vec![start];
        seen[start] = true;
        while let Some(p) = stack.pop() {
            let nv = mesh.poly_verts(p).len();
            for &nei in mesh.poly_neis(p).iter().take(nv) {
                if nei == MESH_NULL_IDX || nei & 0x8000 != 0 {
                    continue;
                }
                let nei = nei as usize;
                if !seen[nei] {
                    seen[nei] = true;
                    stack.push(nei);
                }
            }
        }
    }
    components
}

/// Even-odd test of a voxel-space point against a polygon's xz projection.
fn poly_contains_xz(mesh: &PolyMesh, poly: usize, px: f32, pz: f32) -> bool {
    let verts = mesh.poly_verts(poly);
    let n = verts.len();
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let vi = &mesh.verts[verts[i] as usize * 3..];
        let vj = &mesh.verts[verts[j] as usize * 3..];
        let (vix, viz) = (vi[0] as f32, vi[2] as f32);
        let (vjx, vjz) = (vj[0] as f32, vj[2] as f32);
        if (viz > pz) != (vjz > pz) && px < (vjx - vix) * (pz - viz) / (vjz - viz) + vix {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[test]
fn flat_square_builds_one_quad_with_detail() {
    let mut scene = Scene::default();
    scene.flat_square(0.0, 3.0, 0.0, 3.0, 0.0);
    let cfg = standard_config(&scene);
    let builder = NavMeshBuilder::new(cfg);
    let mut ctx = BuildContext::new();

    let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
    let mesh = &build.poly_mesh;

    assert_eq!(mesh.npolys, 1);
    assert_eq!(mesh.poly_verts(0).len(), 4);
    // One region over the whole plate.
    assert!(mesh.regs.iter().all(|&r| r == mesh.regs[0]));
    // Detail of a flat quad is two triangles.
    assert_eq!(build.detail_mesh.meshes.len(), 1);
    assert_eq!(build.detail_mesh.meshes[0][3], 2);
}

#[test]
fn steep_ramp_separates_the_levels() {
    // Two plates 1.5 m apart joined by a 1 m run: a 56 degree ramp, past
    // the 45 degree walkable limit.
    let mut scene = Scene::default();
    scene.flat_square(0.0, 3.0, 0.0, 3.0, 0.0);
    scene.ramp(3.0, 4.0, 0.0, 3.0, 0.0, 1.5);
    scene.flat_square(4.0, 7.0, 0.0, 3.0, 1.5);
    let cfg = standard_config(&scene);
    let builder = NavMeshBuilder::new(cfg.clone());
    let mut ctx = BuildContext::new();

    // The ramp surface is classified unwalkable already in the heightfield.
    let hf = builder
        .build_heightfield(&mut ctx, &scene.verts, &scene.indices, None)
        .unwrap();
    let ramp_x = ((3.5 - cfg.bmin.x) / cfg.cs) as i32;
    let ramp_z = ((1.5 - cfg.bmin.z) / cfg.cs) as i32;
    for span in hf.column(ramp_x, ramp_z) {
        assert_eq!(span.area, 0, "ramp span should be unwalkable");
    }

    let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
    let mesh = &build.poly_mesh;
    assert!(mesh.npolys >= 2);
    assert_eq!(connected_components(mesh), 2);

    // No polygon mixes vertices from both levels (about 7.5 voxels apart).
    for p in 0..mesh.npolys {
        let ys: Vec<u16> = mesh
            .poly_verts(p)
            .iter()
            .map(|&v| mesh.verts[v as usize * 3 + 1])
            .collect();
        let spread = ys.iter().max().unwrap() - ys.iter().min().unwrap();
        assert!(spread < 5, "polygon {p} bridges the levels");
    }
}

#[test]
fn gentle_ramp_connects_the_levels() {
    // Same two plates, but the run is stretched to 3 m: a 26.6 degree
    // slope inside the walkable limit.
    let mut scene = Scene::default();
    scene.flat_square(0.0, 3.0, 0.0, 3.0, 0.0);
    scene.ramp(3.0, 6.0, 0.0, 3.0, 0.0, 1.5);
    scene.flat_square(6.0, 9.0, 0.0, 3.0, 1.5);
    let cfg = standard_config(&scene);
    let builder = NavMeshBuilder::new(cfg);
    let mut ctx = BuildContext::new();

    let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
    let mesh = &build.poly_mesh;
    assert!(mesh.npolys >= 3);
    assert_eq!(connected_components(mesh), 1);

    // The walkable surface covers both levels.
    let ys: Vec<u16> = (0..mesh.nverts)
        .map(|i| mesh.verts[i * 3 + 1])
        .collect();
    let spread = ys.iter().max().unwrap() - ys.iter().min().unwrap();
    assert!(spread >= 6, "mesh should span the full height range");
}

#[test]
fn cylindrical_obstacle_leaves_a_ring() {
    let mut scene = Scene::default();
    scene.flat_square(0.0, 6.0, 0.0, 6.0, 0.0);
    scene.cylinder(Vec3::new(3.0, 0.0, 3.0), 0.4, 2.5, 12);
    let cfg = standard_config(&scene);
    let centre_x = (3.0 - cfg.bmin.x) / cfg.cs;
    let centre_z = (3.0 - cfg.bmin.z) / cfg.cs;
    let builder = NavMeshBuilder::new(cfg);
    let mut ctx = BuildContext::new();

    let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
    let mesh = &build.poly_mesh;

    // A ring of convex polygons around the hole, all connected.
    assert!(mesh.npolys >= 4, "expected a ring, got {} polys", mesh.npolys);
    assert_eq!(connected_components(mesh), 1);
    for p in 0..mesh.npolys {
        assert!(
            !poly_contains_xz(mesh, p, centre_x, centre_z),
            "polygon {p} covers the obstacle"
        );
    }
}

#[test]
fn low_step_is_climbed() {
    // A 0.3 m step: 1.5 voxels of climb against a budget of 4.
    let mut scene = Scene::default();
    scene.flat_square(0.0, 1.5, 0.0, 3.0, 0.0);
    scene.flat_square(1.5, 3.0, 0.0, 3.0, 0.3);
    let cfg = standard_config(&scene);
    let builder = NavMeshBuilder::new(cfg);
    let mut ctx = BuildContext::new();

    let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
    let mesh = &build.poly_mesh;
    assert!(mesh.npolys >= 1);
    assert_eq!(connected_components(mesh), 1);
}

#[test]
fn empty_input_builds_empty_mesh() {
    let mut cfg = BuildConfig::default();
    cfg.apply_bounds(Vec3::ZERO, Vec3::new(3.0, 2.0, 3.0));
    let builder = NavMeshBuilder::new(cfg);
    let mut ctx = BuildContext::new();

    let build = builder.build(&mut ctx, &[], &[]).unwrap();
    assert_eq!(build.poly_mesh.npolys, 0);
    assert_eq!(build.poly_mesh.nverts, 0);
    assert!(build.detail_mesh.meshes.is_empty());
}

#[test]
fn monotone_and_layer_partitions_cover_the_plate() {
    for partition in [PartitionKind::Monotone, PartitionKind::Layer] {
        let mut scene = Scene::default();
        scene.flat_square(0.0, 3.0, 0.0, 3.0, 0.0);
        let mut cfg = standard_config(&scene);
        cfg.partition = partition;
        let builder = NavMeshBuilder::new(cfg);
        let mut ctx = BuildContext::new();

        let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
        assert!(
            build.poly_mesh.npolys >= 1,
            "{partition:?} produced an empty mesh"
        );
        assert_eq!(connected_components(&build.poly_mesh), 1);
    }
}

#[test]
fn area_markers_reach_the_polygon_mesh() {
    let mut scene = Scene::default();
    scene.flat_square(0.0, 3.0, 0.0, 3.0, 0.0);
    let cfg = standard_config(&scene);
    let mut builder = NavMeshBuilder::new(cfg);
    // Stamp the western half of the plate with a custom area id.
    builder.add_marker(AreaMarker::Box {
        bmin: [0.0, -1.0, 0.0],
        bmax: [1.5, 1.0, 3.0],
        area: 21,
    });
    let mut ctx = BuildContext::new();

    let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
    let areas = &build.poly_mesh.areas;
    assert!(areas.iter().any(|&a| a == 21), "marked area missing");
    assert!(areas.iter().any(|&a| a == WALKABLE_AREA), "default area missing");
}

#[test]
fn off_mesh_connections_pass_through_unchanged() {
    let mut scene = Scene::default();
    scene.flat_square(0.0, 3.0, 0.0, 3.0, 0.0);
    let cfg = standard_config(&scene);
    let mut builder = NavMeshBuilder::new(cfg);
    builder.add_off_mesh_connection(OffMeshConnection {
        start: Vec3::new(0.5, 0.0, 0.5),
        end: Vec3::new(2.5, 0.0, 2.5),
        radius: 0.4,
        bidirectional: true,
        area: 5,
        flags: 0x10,
    });
    let mut ctx = BuildContext::new();

    let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
    assert_eq!(build.off_mesh_connections.len(), 1);
    let conn = &build.off_mesh_connections[0];
    assert_eq!(conn.start, Vec3::new(0.5, 0.0, 0.5));
    assert_eq!(conn.area, 5);
    assert_eq!(conn.flags, 0x10);
    assert!(conn.bidirectional);
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let mut cfg = BuildConfig::default();
    cfg.apply_bounds(Vec3::ZERO, Vec3::new(3.0, 2.0, 3.0));
    cfg.walkable_height = 2;
    let builder = NavMeshBuilder::new(cfg);
    let mut ctx = BuildContext::new();
    assert!(builder.build(&mut ctx, &[], &[]).is_err());
}

#[test]
fn polygon_neighbours_are_reciprocal() {
    let mut scene = Scene::default();
    scene.flat_square(0.0, 9.0, 0.0, 9.0, 0.0);
    let cfg = standard_config(&scene);
    let builder = NavMeshBuilder::new(cfg);
    let mut ctx = BuildContext::new();

    let build = builder.build(&mut ctx, &scene.verts, &scene.indices).unwrap();
    let mesh = &build.poly_mesh;
    for p in 0..mesh.npolys {
        let nv = mesh.poly_verts(p).len();
        assert!(nv >= 3 && nv <= mesh.nvp);
        for &nei in mesh.poly_neis(p).iter().take(nv) {
            if nei == MESH_NULL_IDX || nei & 0x8000 != 0 {
                continue;
            }
            let back_nv = mesh.poly_verts(nei as usize).len();
            assert!(mesh
                .poly_neis(nei as usize)
                .iter()
                .take(back_nv)
                .any(|&b| b == p as u16));
        }
    }
}
