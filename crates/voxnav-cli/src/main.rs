//! Command line front end for the voxnav build pipeline.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use voxnav::{BuildConfig, BuildContext, LogLevel, NavMeshBuild, NavMeshBuilder, PartitionKind};

/// Voxel navmesh generation from triangle meshes.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a navigation mesh from an OBJ file and print statistics.
    Build {
        /// Input mesh file (OBJ format).
        #[clap(long)]
        input: PathBuf,

        /// Optional JSON build configuration; when given it replaces the
        /// whole configuration and the flags below are ignored.
        #[clap(long)]
        config: Option<PathBuf>,

        /// Write the polygon mesh as an OBJ file for inspection.
        #[clap(long)]
        dump_obj: Option<PathBuf>,

        /// Horizontal voxel size.
        #[clap(long, default_value = "0.3")]
        cs: f32,

        /// Vertical voxel size.
        #[clap(long, default_value = "0.2")]
        ch: f32,

        /// Maximum walkable slope in degrees.
        #[clap(long, default_value = "45.0")]
        walkable_slope_angle: f32,

        /// Required agent clearance in voxels.
        #[clap(long, default_value = "10")]
        walkable_height: i32,

        /// Maximum climbable step in voxels.
        #[clap(long, default_value = "4")]
        walkable_climb: i32,

        /// Agent radius in voxels, eroded off the walkable area.
        #[clap(long, default_value = "2")]
        walkable_radius: i32,

        /// Longest contour border edge in voxels (0 disables splitting).
        #[clap(long, default_value = "12")]
        max_edge_len: i32,

        /// Contour simplification deviation in world units.
        #[clap(long, default_value = "1.3")]
        max_simplification_error: f32,

        /// Smallest kept island area in voxels.
        #[clap(long, default_value = "8")]
        min_region_area: i32,

        /// Regions below this area merge into neighbours when possible.
        #[clap(long, default_value = "20")]
        merge_region_area: i32,

        /// Vertex cap per polygon.
        #[clap(long, default_value = "6")]
        max_verts_per_poly: i32,

        /// Detail sampling distance in world units (< 0.9 disables).
        #[clap(long, default_value = "6.0")]
        detail_sample_dist: f32,

        /// Detail surface deviation budget in world units.
        #[clap(long, default_value = "1.0")]
        detail_sample_max_error: f32,

        /// Region partitioning algorithm.
        #[clap(long, value_enum, default_value = "watershed")]
        partition: PartitionArg,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PartitionArg {
    Watershed,
    Monotone,
    Layer,
}

impl From<PartitionArg> for PartitionKind {
    fn from(value: PartitionArg) -> Self {
        match value {
            PartitionArg::Watershed => PartitionKind::Watershed,
            PartitionArg::Monotone => PartitionKind::Monotone,
            PartitionArg::Layer => PartitionKind::Layer,
        }
    }
}

/// Minimal OBJ reader: vertices and (fan-triangulated) faces.
fn load_obj(path: &Path) -> Result<(Vec<f32>, Vec<i32>)> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut verts: Vec<f32> = Vec::new();
    let mut indices: Vec<i32> = Vec::new();

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("v") => {
                let mut coord = |name| {
                    tokens
                        .next()
                        .with_context(|| format!("line {}: missing {name}", lineno + 1))?
                        .parse::<f32>()
                        .with_context(|| format!("line {}: bad {name}", lineno + 1))
                };
                let x = coord("x")?;
                let y = coord("y")?;
                let z = coord("z")?;
                verts.extend_from_slice(&[x, y, z]);
            }
            Some("f") => {
                let face: Vec<i32> = tokens
                    .map(|t| {
                        let vert = t.split('/').next().unwrap_or(t);
                        vert.parse::<i32>()
                            .with_context(|| format!("line {}: bad face index", lineno + 1))
                    })
                    .collect::<Result<_>>()?;
                if face.len() < 3 {
                    bail!("line {}: face with fewer than 3 vertices", lineno + 1);
                }
                for i in 1..face.len() - 1 {
                    // OBJ indices are 1-based.
                    indices.extend_from_slice(&[face[0] - 1, face[i] - 1, face[i + 1] - 1]);
                }
            }
            _ => {}
        }
    }
    if verts.is_empty() {
        bail!("{} contains no vertices", path.display());
    }
    Ok((verts, indices))
}

fn dump_poly_mesh_obj(build: &NavMeshBuild, path: &Path) -> Result<()> {
    let mesh = &build.poly_mesh;
    let mut out = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    for v in mesh.verts.chunks_exact(3) {
        writeln!(
            out,
            "v {} {} {}",
            mesh.bmin.x + v[0] as f32 * mesh.cs,
            mesh.bmin.y + v[1] as f32 * mesh.ch,
            mesh.bmin.z + v[2] as f32 * mesh.cs,
        )?;
    }
    for p in 0..mesh.npolys {
        let verts = mesh.poly_verts(p);
        let ids: Vec<String> = verts.iter().map(|&v| (v + 1).to_string()).collect();
        writeln!(out, "f {}", ids.join(" "))?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_build(
    input: &Path,
    config_path: Option<&Path>,
    dump_obj: Option<&Path>,
    mut cfg: BuildConfig,
) -> Result<()> {
    if let Some(path) = config_path {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        cfg = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
    }

    let (verts, indices) = load_obj(input)?;
    let (bmin, bmax) = voxnav::calc_bounds(&verts);
    cfg.apply_bounds(bmin, bmax);

    println!(
        "input: {} vertices, {} triangles, grid {}x{}",
        verts.len() / 3,
        indices.len() / 3,
        cfg.width,
        cfg.height,
    );

    let builder = NavMeshBuilder::new(cfg);
    let mut ctx = BuildContext::new();
    let build = builder
        .build(&mut ctx, &verts, &indices)
        .context("navmesh build failed")?;

    let mesh = &build.poly_mesh;
    println!(
        "polymesh: {} polygons, {} vertices",
        mesh.npolys, mesh.nverts
    );
    println!(
        "detail:   {} submeshes, {} vertices, {} triangles",
        build.detail_mesh.meshes.len(),
        build.detail_mesh.verts.len() / 3,
        build.detail_mesh.tris.len(),
    );

    println!("timings:");
    for (stage, duration) in ctx.timer_summary() {
        println!("  {:14} {:8.2} ms", format!("{stage:?}"), duration.as_secs_f64() * 1000.0);
    }
    for entry in ctx.logs() {
        if entry.level >= LogLevel::Warning {
            println!("{:?} [{}] {}", entry.level, entry.category, entry.message);
        }
    }

    if let Some(path) = dump_obj {
        dump_poly_mesh_obj(&build, path)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Commands::Build {
            input,
            config,
            dump_obj,
            cs,
            ch,
            walkable_slope_angle,
            walkable_height,
            walkable_climb,
            walkable_radius,
            max_edge_len,
            max_simplification_error,
            min_region_area,
            merge_region_area,
            max_verts_per_poly,
            detail_sample_dist,
            detail_sample_max_error,
            partition,
        } => {
            let cfg = BuildConfig {
                cs,
                ch,
                walkable_slope_angle,
                walkable_height,
                walkable_climb,
                walkable_radius,
                max_edge_len,
                max_simplification_error,
                min_region_area,
                merge_region_area,
                max_verts_per_poly,
                detail_sample_dist,
                detail_sample_max_error,
                partition: partition.into(),
                ..BuildConfig::default()
            };
            run_build(
                input.as_path(),
                config.as_deref(),
                dump_obj.as_deref(),
                cfg,
            )
        }
    }
}
