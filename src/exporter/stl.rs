use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use nalgebra::Point3;
use tracing::debug;

use crate::{
    datatypes::{ElementKind, Mesh},
    error::{CalimeshError, Result},
};

/// Loads a binary or ASCII STL file. Coincident vertices are merged.
pub fn read_stl(path: &Path) -> Result<Mesh> {
    let file = File::open(path).map_err(|err| CalimeshError::io(path, err))?;
    let mut reader = BufReader::new(file);

    let stl = stl_io::read_stl(&mut reader).map_err(|err| {
        CalimeshError::Input(format!("Failed to parse STL {}: {err}", path.display()))
    })?;

    let points: Vec<Point3<f64>> = stl
        .vertices
        .iter()
        .map(|v| Point3::new(v[0] as f64, v[1] as f64, v[2] as f64))
        .collect();
    let triangles: Vec<[usize; 3]> = stl.faces.iter().map(|f| f.vertices).collect();

    debug!(
        "STL {} contains {} vertices, {} triangles",
        path.display(),
        points.len(),
        triangles.len()
    );

    Mesh::from_triangles(points, &triangles)
}

/// Saves the triangles of a mesh as binary STL
pub fn write_stl(mesh: &Mesh, path: &Path) -> Result<()> {
    if mesh.count(ElementKind::Triangle) == 0 {
        return Err(CalimeshError::Export(format!(
            "Refusing to write {} without triangles",
            path.display()
        )));
    }

    let file = File::create(path).map_err(|err| CalimeshError::io(path, err))?;
    let mut writer = BufWriter::new(file);

    let triangles: Vec<stl_io::Triangle> = mesh
        .triangles()
        .map(|[a, b, c]| {
            let (v0, v1, v2) = (&mesh.points[a], &mesh.points[b], &mesh.points[c]);
            let normal = (v1 - v0).cross(&(v2 - v0));
            let normal = if normal.norm() > 0.0 {
                normal.normalize()
            } else {
                normal
            };

            stl_io::Triangle {
                normal: stl_io::Normal::new([normal.x as f32, normal.y as f32, normal.z as f32]),
                vertices: [
                    stl_io::Vertex::new([v0.x as f32, v0.y as f32, v0.z as f32]),
                    stl_io::Vertex::new([v1.x as f32, v1.y as f32, v1.z as f32]),
                    stl_io::Vertex::new([v2.x as f32, v2.y as f32, v2.z as f32]),
                ],
            }
        })
        .collect();

    stl_io::write_stl(&mut writer, triangles.iter()).map_err(|err| CalimeshError::io(path, err))?;
    writer.flush().map_err(|err| CalimeshError::io(path, err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{self, fixtures::cube_surface};
    use approx::assert_relative_eq;

    #[test]
    fn cube_survives_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.stl");
        let cube = cube_surface(2.0);

        write_stl(&cube, &path).unwrap();
        let loaded = read_stl(&path).unwrap();

        assert_eq!(loaded.points.len(), 8);
        assert_eq!(loaded.count(ElementKind::Triangle), 12);
        assert_relative_eq!(geometry::surface_area(&loaded), 24.0, epsilon = 1e-5);
        assert_relative_eq!(geometry::enclosed_volume(&loaded), 8.0, epsilon = 1e-5);
    }

    #[test]
    fn tetrahedra_only_mesh_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mesh = crate::geometry::fixtures::regular_tetrahedron();
        assert!(write_stl(&mesh, &dir.path().join("tet.stl")).is_err());
    }
}
