//! Edge, angle, volume and Jacobian statistics over triangle and
//! tetrahedral elements.
//!
//! Degenerate elements (an edge of zero length or a non-finite coordinate)
//! never contribute to an aggregate. A collection without a single valid
//! sample yields `None` instead of NaN.

use nalgebra::{Matrix3, Point3};

use crate::{
    datatypes::{ElementKind, Mesh},
    error::{CalimeshError, Result},
};

/// Edges shorter than this are treated as collapsed
pub const DEGENERATE_EDGE_LENGTH: f64 = 1e-12;

/// The six vertex pairs forming the edges of a tetrahedron
pub const TETRAHEDRON_EDGES: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];

/// Mean, extrema and sum of a sample set
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl Summary {
    /// Summarizes the finite values of an iterator
    ///
    /// # Returns
    /// `None` when no finite value was seen
    pub fn of(values: impl IntoIterator<Item = f64>) -> Option<Summary> {
        let mut count = 0;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for v in values.into_iter().filter(|v| v.is_finite()) {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }

        if count == 0 {
            return None;
        }

        Some(Summary {
            count,
            mean: sum / count as f64,
            min,
            max,
            sum,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleMetrics {
    pub edges: [f64; 3],
    /// Interior angles in degrees
    pub angles: [f64; 3],
    /// Longest over shortest edge
    pub aspect_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TetrahedronMetrics {
    pub edges: [f64; 6],
    /// Longest over shortest edge
    pub edge_ratio: f64,
    pub volume: f64,
    /// Absolute determinant of the three edge vectors leaving vertex 0
    pub jacobian: f64,
}

fn is_degenerate(edges: &[f64]) -> bool {
    edges
        .iter()
        .any(|e| !e.is_finite() || *e <= DEGENERATE_EDGE_LENGTH)
}

fn clamped_angle(a: nalgebra::Vector3<f64>, b: nalgebra::Vector3<f64>) -> f64 {
    let cos = (a.normalize().dot(&b.normalize())).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

/// Computes the metrics of a single triangle
///
/// # Returns
/// `None` if the triangle is degenerate
pub fn triangle_metrics(p1: &Point3<f64>, p2: &Point3<f64>, p3: &Point3<f64>) -> Option<TriangleMetrics> {
    let edges = [
        (p1 - p2).norm(),
        (p2 - p3).norm(),
        (p3 - p1).norm(),
    ];
    if is_degenerate(&edges) {
        return None;
    }

    let v1 = p2 - p1;
    let v2 = p3 - p1;
    let v3 = p3 - p2;

    let angles = [
        clamped_angle(v1, v2),
        clamped_angle(-v1, v3),
        clamped_angle(-v2, -v3),
    ];

    let longest = edges.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let shortest = edges.iter().copied().fold(f64::INFINITY, f64::min);

    Some(TriangleMetrics {
        edges,
        angles,
        aspect_ratio: longest / shortest,
    })
}

/// Computes the metrics of a single tetrahedron
///
/// # Returns
/// `None` if the tetrahedron has a collapsed edge
pub fn tetrahedron_metrics(vertices: [&Point3<f64>; 4]) -> Option<TetrahedronMetrics> {
    let edges = TETRAHEDRON_EDGES.map(|(a, b)| (vertices[a] - vertices[b]).norm());
    if is_degenerate(&edges) {
        return None;
    }

    let v1 = vertices[1] - vertices[0];
    let v2 = vertices[2] - vertices[0];
    let v3 = vertices[3] - vertices[0];

    let volume = v1.cross(&v2).dot(&v3).abs() / 6.0;
    let jacobian = Matrix3::from_columns(&[v1, v2, v3]).determinant().abs();

    let longest = edges.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let shortest = edges.iter().copied().fold(f64::INFINITY, f64::min);

    Some(TetrahedronMetrics {
        edges,
        edge_ratio: longest / shortest,
        volume,
        jacobian,
    })
}

fn tetrahedron_vertices(mesh: &Mesh, tet: [usize; 4]) -> [&Point3<f64>; 4] {
    tet.map(|i| &mesh.points[i])
}

/// Metrics of every triangle in block order, `None` for degenerate ones
pub fn triangle_metrics_of(mesh: &Mesh) -> Vec<Option<TriangleMetrics>> {
    mesh.triangles()
        .map(|[a, b, c]| triangle_metrics(&mesh.points[a], &mesh.points[b], &mesh.points[c]))
        .collect()
}

/// Metrics of every tetrahedron in block order, `None` for degenerate ones
pub fn tetrahedron_metrics_of(mesh: &Mesh) -> Vec<Option<TetrahedronMetrics>> {
    mesh.tetrahedra()
        .map(|tet| tetrahedron_metrics(tetrahedron_vertices(mesh, tet)))
        .collect()
}

/// Mean edge length over the valid elements of one kind
pub fn mean_edge_length(mesh: &Mesh, kind: ElementKind) -> Option<f64> {
    let summary = match kind {
        ElementKind::Triangle => Summary::of(
            triangle_metrics_of(mesh)
                .into_iter()
                .flatten()
                .flat_map(|m| m.edges),
        ),
        ElementKind::Tetrahedron => Summary::of(
            tetrahedron_metrics_of(mesh)
                .into_iter()
                .flatten()
                .flat_map(|m| m.edges),
        ),
    };
    summary.map(|s| s.mean)
}

/// Mean edge length used by the calibration loops. Unlike
/// [`mean_edge_length`] a single degenerate element fails the measurement,
/// so a collapsed probe mesh never passes for a good one.
pub fn measure_edge_length(mesh: &Mesh, kind: ElementKind) -> Result<f64> {
    if mesh.count(kind) == 0 {
        return Err(CalimeshError::Calibration(format!(
            "Mesh has no {:?} elements to measure",
            kind
        )));
    }

    let mut lengths: Vec<f64> = Vec::new();
    match kind {
        ElementKind::Triangle => {
            for (i, metrics) in triangle_metrics_of(mesh).into_iter().enumerate() {
                match metrics {
                    Some(m) => lengths.extend(m.edges),
                    None => {
                        return Err(CalimeshError::Calibration(format!(
                            "Triangle {i} is degenerate"
                        )))
                    }
                }
            }
        }
        ElementKind::Tetrahedron => {
            for (i, metrics) in tetrahedron_metrics_of(mesh).into_iter().enumerate() {
                match metrics {
                    Some(m) => lengths.extend(m.edges),
                    None => {
                        return Err(CalimeshError::Calibration(format!(
                            "Tetrahedron {i} is degenerate"
                        )))
                    }
                }
            }
        }
    }

    Summary::of(lengths)
        .map(|s| s.mean)
        .ok_or_else(|| CalimeshError::Calibration("No valid edges measured".to_owned()))
}

/// Total area of the triangles of a mesh
pub fn surface_area(mesh: &Mesh) -> f64 {
    mesh.triangles()
        .map(|[a, b, c]| {
            let p = &mesh.points;
            0.5 * (p[b] - p[a]).cross(&(p[c] - p[a])).norm()
        })
        .sum()
}

/// Volume enclosed by a closed, consistently oriented triangle surface
pub fn enclosed_volume(mesh: &Mesh) -> f64 {
    let signed: f64 = mesh
        .triangles()
        .map(|[a, b, c]| {
            let p = &mesh.points;
            p[a].coords.dot(&p[b].coords.cross(&p[c].coords)) / 6.0
        })
        .sum();
    signed.abs()
}

/// Aggregated triangle statistics
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceStatistics {
    pub triangle_count: usize,
    pub mean_edge_length: Option<f64>,
    pub min_angle: Option<f64>,
    pub max_angle: Option<f64>,
    pub mean_aspect_ratio: Option<f64>,
}

/// Aggregated tetrahedron statistics
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeStatistics {
    pub tetrahedron_count: usize,
    pub mean_edge_length: Option<f64>,
    pub mean_edge_ratio: Option<f64>,
    pub mean_volume: Option<f64>,
    pub min_volume: Option<f64>,
    pub total_volume: Option<f64>,
    pub mean_jacobian: Option<f64>,
    pub min_jacobian: Option<f64>,
}

pub fn surface_statistics(mesh: &Mesh) -> SurfaceStatistics {
    let metrics: Vec<TriangleMetrics> = triangle_metrics_of(mesh).into_iter().flatten().collect();

    let edges = Summary::of(metrics.iter().flat_map(|m| m.edges));
    let angles = Summary::of(metrics.iter().flat_map(|m| m.angles));
    let aspect = Summary::of(metrics.iter().map(|m| m.aspect_ratio));

    SurfaceStatistics {
        triangle_count: mesh.count(ElementKind::Triangle),
        mean_edge_length: edges.map(|s| s.mean),
        min_angle: angles.map(|s| s.min),
        max_angle: angles.map(|s| s.max),
        mean_aspect_ratio: aspect.map(|s| s.mean),
    }
}

pub fn volume_statistics(mesh: &Mesh) -> VolumeStatistics {
    let metrics: Vec<TetrahedronMetrics> =
        tetrahedron_metrics_of(mesh).into_iter().flatten().collect();

    let edges = Summary::of(metrics.iter().flat_map(|m| m.edges));
    let ratios = Summary::of(metrics.iter().map(|m| m.edge_ratio));
    let volumes = Summary::of(metrics.iter().map(|m| m.volume));
    let jacobians = Summary::of(metrics.iter().map(|m| m.jacobian));

    VolumeStatistics {
        tetrahedron_count: mesh.count(ElementKind::Tetrahedron),
        mean_edge_length: edges.map(|s| s.mean),
        mean_edge_ratio: ratios.map(|s| s.mean),
        mean_volume: volumes.map(|s| s.mean),
        min_volume: volumes.map(|s| s.min),
        total_volume: volumes.map(|s| s.sum),
        mean_jacobian: jacobians.map(|s| s.mean),
        min_jacobian: jacobians.map(|s| s.min),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cube_mean_edge_uses_three_samples_per_triangle() {
        let cube = cube_surface(2.0);

        // each face: two sides of length 2 per triangle plus a diagonal
        let samples: Vec<f64> = triangle_metrics_of(&cube)
            .into_iter()
            .flatten()
            .flat_map(|m| m.edges)
            .collect();
        assert_eq!(samples.len(), 3 * cube.count(ElementKind::Triangle));

        let expected = (2.0 + 2.0 + 2.0 * 2.0_f64.sqrt()) / 3.0;
        assert_relative_eq!(
            mean_edge_length(&cube, ElementKind::Triangle).unwrap(),
            expected,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            measure_edge_length(&cube, ElementKind::Triangle).unwrap(),
            expected,
            epsilon = 1e-12
        );
    }

    #[test]
    fn right_triangle_angles_and_aspect() {
        let m = triangle_metrics(
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        )
        .unwrap();

        assert_relative_eq!(m.angles[0], 90.0, epsilon = 1e-9);
        assert_relative_eq!(m.angles[1], 45.0, epsilon = 1e-9);
        assert_relative_eq!(m.angles[2], 45.0, epsilon = 1e-9);
        assert_relative_eq!(m.aspect_ratio, 2.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn degenerate_triangle_fails_measurement_but_not_statistics() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let mesh = Mesh::from_triangles(points, &[[0, 1, 2], [0, 0, 1]]).unwrap();

        assert!(measure_edge_length(&mesh, ElementKind::Triangle).is_err());

        let stats = surface_statistics(&mesh);
        assert_eq!(stats.triangle_count, 2);
        let mean = stats.mean_edge_length.unwrap();
        assert!(mean.is_finite());
        assert_relative_eq!(mean, (2.0 + 2.0_f64.sqrt()) / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn no_valid_elements_yields_none() {
        let points = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let mesh = Mesh::from_triangles(points, &[[0, 0, 1]]).unwrap();

        assert_eq!(mean_edge_length(&mesh, ElementKind::Triangle), None);
        let stats = surface_statistics(&mesh);
        assert_eq!(stats.min_angle, None);
        assert_eq!(stats.mean_aspect_ratio, None);

        let stats = volume_statistics(&mesh);
        assert_eq!(stats.tetrahedron_count, 0);
        assert_eq!(stats.total_volume, None);
    }

    #[test]
    fn cube_tetrahedra_fill_the_cube() {
        let mesh = cube_tetrahedra(3.0);
        let stats = volume_statistics(&mesh);

        assert_eq!(stats.tetrahedron_count, 5);
        assert_relative_eq!(stats.total_volume.unwrap(), 27.0, epsilon = 1e-9);
        // the central tetrahedron holds a third of the cube
        assert_relative_eq!(stats.mean_jacobian.unwrap(), 6.0 * 27.0 / 5.0, epsilon = 1e-9);
        assert_relative_eq!(stats.min_volume.unwrap(), 4.5, epsilon = 1e-9);
    }

    #[test]
    fn regular_tetrahedron_edges() {
        let mesh = regular_tetrahedron();
        let m = tetrahedron_metrics_of(&mesh)[0].unwrap();

        for e in m.edges {
            assert_relative_eq!(e, 1.0, epsilon = 1e-12);
        }
        assert_relative_eq!(m.edge_ratio, 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.volume, 1.0 / (6.0 * 2.0_f64.sqrt()), epsilon = 1e-12);
        assert_relative_eq!(m.jacobian, 6.0 * m.volume, epsilon = 1e-12);
    }

    #[test]
    fn cube_area_and_volume() {
        let cube = cube_surface(2.0);
        assert_relative_eq!(surface_area(&cube), 24.0, epsilon = 1e-12);
        assert_relative_eq!(enclosed_volume(&cube), 8.0, epsilon = 1e-12);
    }
}
