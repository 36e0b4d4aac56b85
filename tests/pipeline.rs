use std::{
    cell::Cell,
    path::Path,
    sync::atomic::AtomicBool,
};

use approx::assert_relative_eq;
use calimesh::{
    config::Config,
    datatypes::{ElementKind, Mesh},
    error::{CalimeshError, Result},
    exporter::{msh::format_msh, stl::write_stl, vtk::read_vtk, OutputFormat},
    intensity::IntensityVolume,
    mesher::{VolumeMeshEngine, VolumeMeshOutput},
    pipeline::{self, Engines, Segment, Stage},
    remesher::RemeshEngine,
};
use nalgebra::{Matrix3, Point3, Vector3};

fn cube_surface(side: f64) -> Mesh {
    let points = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(side, 0.0, 0.0),
        Point3::new(side, side, 0.0),
        Point3::new(0.0, side, 0.0),
        Point3::new(0.0, 0.0, side),
        Point3::new(side, 0.0, side),
        Point3::new(side, side, side),
        Point3::new(0.0, side, side),
    ];
    let triangles = [
        [0, 2, 1],
        [0, 3, 2],
        [4, 5, 6],
        [4, 6, 7],
        [0, 1, 5],
        [0, 5, 4],
        [1, 2, 6],
        [1, 6, 5],
        [2, 3, 7],
        [2, 7, 6],
        [3, 0, 4],
        [3, 4, 7],
    ];
    Mesh::from_triangles(points, &triangles).unwrap()
}

/// `n³` cubes of side `spacing`, six tetrahedra each
fn lattice(n: usize, spacing: f64) -> Mesh {
    let side = n + 1;
    let index = |x: usize, y: usize, z: usize| x + side * (y + side * z);

    let mut points = Vec::new();
    for z in 0..side {
        for y in 0..side {
            for x in 0..side {
                points.push(Point3::new(x as f64, y as f64, z as f64) * spacing);
            }
        }
    }

    let mut tets = Vec::new();
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let corner = |b: usize| index(x + (b & 1), y + ((b >> 1) & 1), z + ((b >> 2) & 1));
                for [a, b, c, d] in [[0, 1, 3, 7], [0, 1, 5, 7], [0, 2, 3, 7], [0, 2, 6, 7], [0, 4, 5, 7], [0, 4, 6, 7]] {
                    tets.push([corner(a), corner(b), corner(c), corner(d)]);
                }
            }
        }
    }
    Mesh::from_tetrahedra(points, &tets).unwrap()
}

/// Mean tetrahedral edge length of [`lattice`] per unit spacing
fn lattice_edge_factor() -> f64 {
    (3.0 + 2.0 * 2.0_f64.sqrt() + 3.0_f64.sqrt()) / 6.0
}

/// Cube whose mean triangle edge is `scale / sqrt(points)`
struct FakeRemesher {
    scale: f64,
}

impl RemeshEngine for FakeRemesher {
    fn name(&self) -> &str {
        "fake"
    }

    fn remesh(&self, _surface: &Mesh, points: usize) -> Result<Mesh> {
        let mean = self.scale / (points as f64).sqrt();
        Ok(cube_surface(mean * 3.0 / (2.0 + 2.0_f64.sqrt())))
    }
}

/// 162 tetrahedra whose mean edge is `element_size`, boundary triangles
/// echoed in front like a real mesher does
struct FakeMesher {
    calls: Cell<usize>,
}

impl VolumeMeshEngine for FakeMesher {
    fn name(&self) -> &str {
        "fake"
    }

    fn generate(&self, surface: &Mesh, element_size: f64) -> Result<VolumeMeshOutput> {
        self.calls.set(self.calls.get() + 1);
        let volume = lattice(3, element_size / lattice_edge_factor());

        let mut blocks = surface.blocks.clone();
        blocks.extend(volume.blocks);
        let mesh = Mesh::new(volume.points, blocks)?;
        Ok(VolumeMeshOutput {
            native: format_msh(&mesh),
            mesh,
        })
    }
}

/// 10³ voxels of spacing 0.5 at the origin, all at 500 HU
fn constant_volume() -> IntensityVolume {
    IntensityVolume::new(
        [10, 10, 10],
        Vector3::new(0.5, 0.5, 0.5),
        Point3::origin(),
        Matrix3::identity(),
        vec![500.0; 1000],
    )
    .unwrap()
}

fn write_segments(dir: &Path, names: &[&str]) -> Vec<Segment> {
    names
        .iter()
        .map(|name| {
            let surface = dir.join(format!("{name}.stl"));
            write_stl(&cube_surface(10.0), &surface).unwrap();
            Segment {
                name: name.to_string(),
                surface,
            }
        })
        .collect()
}

// 600 mm² · 1.62 quantizes to 1000 points, which lands on the target
const REMESH_SCALE: f64 = 1.37 * 31.622776601683793;

#[test]
fn generates_every_file_for_every_segment() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let segments = write_segments(input.path(), &["L1", "L2"]);

    let remesher = FakeRemesher { scale: REMESH_SCALE };
    let mesher = FakeMesher { calls: Cell::new(0) };
    let engines = Engines {
        remesher: &remesher,
        mesher: &mesher,
    };
    let volume = constant_volume();
    let mut progress: Vec<f64> = Vec::new();

    let outcome = pipeline::run(
        &segments,
        output.path(),
        &Config::default(),
        engines,
        Some(&volume),
        &mut |p, _| progress.push(p),
        &AtomicBool::new(false),
    )
    .unwrap();

    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.segments.len(), 2);
    assert_eq!(mesher.calls.get(), 2);
    assert_eq!(outcome.summary.total_meshes, 2);
    assert_eq!(outcome.summary.total_elements, 2 * 162);
    assert_relative_eq!(outcome.summary.average_edge_length.unwrap(), 1.37, epsilon = 1e-9);

    for name in ["L1", "L2"] {
        let dir = output.path().join(name);
        for suffix in [
            "_surface_mesh.stl",
            "_volume_mesh.vtk",
            "_volume_mesh.inp",
            "_surface_mesh.msh",
            "_element_properties.csv",
            "_statistics.csv",
            "_mesh.summit",
        ] {
            assert!(dir.join(format!("{name}{suffix}")).is_file(), "{name}{suffix} missing");
        }

        let mesh = read_vtk(&dir.join(format!("{name}_volume_mesh.vtk"))).unwrap();
        assert_eq!(mesh.count(ElementKind::Tetrahedron), 162);
        assert_eq!(mesh.count(ElementKind::Triangle), 0);
        assert!(mesh.blocks[0].attributes.contains_key("BMD"));
        assert!(mesh.blocks[0].attributes.contains_key("aspect_ratio"));

        let table = std::fs::read_to_string(dir.join(format!("{name}_element_properties.csv"))).unwrap();
        assert_eq!(table.lines().count(), 163);
        // 0.7 · 500 + 5.1
        assert!(table.lines().nth(1).unwrap().ends_with(",355.1000,0.5192"));

        let native = std::fs::read_to_string(dir.join(format!("{name}_surface_mesh.msh"))).unwrap();
        let echoed = calimesh::mesher::parse_msh(&native).unwrap();
        assert_eq!(echoed.count(ElementKind::Triangle), 12);
    }

    let first = &outcome.segments[0];
    assert!(first.calibration.surface.within_tolerance);
    assert_eq!(first.calibration.surface.quantized_points, 1000);
    assert_eq!(first.statistics.quantized_points, 1000);
    assert_relative_eq!(first.statistics.surface_area, 600.0, epsilon = 1e-9);
    assert_relative_eq!(first.statistics.enclosed_volume, 1000.0, epsilon = 1e-9);
    assert_eq!(first.properties.as_ref().unwrap().len(), 162);

    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last().copied(), Some(100.0));

    let summary = outcome.write_summary(output.path()).unwrap();
    let json = json::parse(&std::fs::read_to_string(summary).unwrap()).unwrap();
    assert_eq!(json["totalMeshes"].as_usize(), Some(2));
    assert_eq!(json["segments"].len(), 2);
}

#[test]
fn a_broken_segment_does_not_stop_the_run() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let mut segments = write_segments(input.path(), &["L4"]);
    let broken = input.path().join("L5.stl");
    std::fs::write(&broken, b"broken").unwrap();
    segments.insert(
        0,
        Segment {
            name: "L5".to_owned(),
            surface: broken,
        },
    );

    let remesher = FakeRemesher { scale: REMESH_SCALE };
    let mesher = FakeMesher { calls: Cell::new(0) };
    let engines = Engines {
        remesher: &remesher,
        mesher: &mesher,
    };

    let outcome = pipeline::run(
        &segments,
        output.path(),
        &Config::default(),
        engines,
        None,
        &mut |_, _| {},
        &AtomicBool::new(false),
    )
    .unwrap();

    assert_eq!(outcome.segments.len(), 1);
    assert_eq!(outcome.segments[0].name, "L4");
    assert!(outcome.segments[0].properties.is_none());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].segment, "L5");
    assert_eq!(outcome.failures[0].stage, Stage::Read);

    let l4 = output.path().join("L4");
    assert!(!l4.join("L4_element_properties.csv").exists());
    assert!(l4.join("L4_volume_mesh.inp").is_file());
}

#[test]
fn format_selection_limits_the_files() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let segments = write_segments(input.path(), &["C2"]);

    let remesher = FakeRemesher { scale: REMESH_SCALE };
    let mesher = FakeMesher { calls: Cell::new(0) };
    let mut config = Config::default();
    config.formats = OutputFormat::parse_many(&["vtk"]).unwrap();

    pipeline::run(
        &segments,
        output.path(),
        &config,
        Engines {
            remesher: &remesher,
            mesher: &mesher,
        },
        Some(&constant_volume()),
        &mut |_, _| {},
        &AtomicBool::new(false),
    )
    .unwrap();

    let mut files: Vec<String> = std::fs::read_dir(output.path().join("C2"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(
        files,
        vec![
            "C2_element_properties.csv",
            "C2_statistics.csv",
            "C2_volume_mesh.vtk"
        ]
    );
}

#[test]
fn cancelled_run_processes_nothing() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let segments = write_segments(input.path(), &["L1"]);

    let remesher = FakeRemesher { scale: REMESH_SCALE };
    let mesher = FakeMesher { calls: Cell::new(0) };

    let outcome = pipeline::run(
        &segments,
        output.path(),
        &Config::default(),
        Engines {
            remesher: &remesher,
            mesher: &mesher,
        },
        None,
        &mut |_, _| {},
        &AtomicBool::new(true),
    )
    .unwrap();

    assert!(outcome.cancelled);
    assert!(outcome.segments.is_empty());
    assert_eq!(mesher.calls.get(), 0);
}

#[test]
fn materials_can_be_remapped_afterwards() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let segments = write_segments(input.path(), &["T12"]);

    let remesher = FakeRemesher { scale: REMESH_SCALE };
    let mesher = FakeMesher { calls: Cell::new(0) };
    let config = Config::default();

    pipeline::run(
        &segments,
        output.path(),
        &config,
        Engines {
            remesher: &remesher,
            mesher: &mesher,
        },
        None,
        &mut |_, _| {},
        &AtomicBool::new(false),
    )
    .unwrap();
    let table = output.path().join("T12").join("T12_element_properties.csv");
    assert!(!table.exists());

    let (remapped, failures) = pipeline::remap_materials(
        output.path(),
        &constant_volume(),
        &config.material,
        &mut |_, _| {},
        &AtomicBool::new(false),
    )
    .unwrap();

    assert!(failures.is_empty());
    assert_eq!(remapped.len(), 1);
    assert_eq!(remapped[0].segment, "T12");
    assert_eq!(remapped[0].elements, 162);
    assert_eq!(remapped[0].properties_path, table);
    assert_eq!(std::fs::read_to_string(&table).unwrap().lines().count(), 163);
}

#[test]
fn remapping_an_empty_directory_is_an_error() {
    let output = tempfile::tempdir().unwrap();
    let result = pipeline::remap_materials(
        output.path(),
        &constant_volume(),
        &Config::default().material,
        &mut |_, _| {},
        &AtomicBool::new(false),
    );
    assert!(matches!(result, Err(CalimeshError::Pipeline(_))));
}
