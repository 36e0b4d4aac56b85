use nalgebra::Point3;
use tracing::info;

use crate::{
    datatypes::Mesh,
    geometry::{self, TETRAHEDRON_EDGES},
};

/// Elements above this aspect ratio are flagged as poor
pub const POOR_ASPECT_RATIO: f64 = 5.0;

/// Value reported for tetrahedra with no volume
pub const DEGENERATE_ASPECT_RATIO: f64 = 1.0e30;

/// Aspect ratio summary of a tetrahedral mesh
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QualityReport {
    pub element_count: usize,
    pub poor_count: usize,
    pub poor_percent: f64,
    pub mean_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
}

/// Per-element measures that can be attached to a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityMetric {
    EdgeLength,
    EdgeRatio,
    Volume,
    AspectRatio,
    Jacobian,
}

impl QualityMetric {
    pub const ALL: [QualityMetric; 5] = [
        QualityMetric::EdgeLength,
        QualityMetric::EdgeRatio,
        QualityMetric::Volume,
        QualityMetric::AspectRatio,
        QualityMetric::Jacobian,
    ];

    /// Attribute name used when the metric is stored on a mesh
    pub fn attribute_name(&self) -> &'static str {
        match self {
            QualityMetric::EdgeLength => "edge_length",
            QualityMetric::EdgeRatio => "edge_ratio",
            QualityMetric::Volume => "tetrahedral_volume",
            QualityMetric::AspectRatio => "aspect_ratio",
            QualityMetric::Jacobian => "jacobian",
        }
    }
}

/// Standard tetrahedral aspect ratio: the longest edge over `2·√6` times
/// the inradius. Exactly 1 for a regular tetrahedron.
///
/// # Arguments
/// * `vertices` - The four corner positions
///
/// # Returns
/// The aspect ratio, or [`DEGENERATE_ASPECT_RATIO`] for a flat element
pub fn tetrahedron_aspect_ratio(vertices: [&Point3<f64>; 4]) -> f64 {
    let longest = TETRAHEDRON_EDGES
        .iter()
        .map(|(a, b)| (vertices[*a] - vertices[*b]).norm())
        .fold(0.0, f64::max);

    let v1 = vertices[1] - vertices[0];
    let v2 = vertices[2] - vertices[0];
    let v3 = vertices[3] - vertices[0];
    let volume = v1.cross(&v2).dot(&v3).abs() / 6.0;

    let faces = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    let area: f64 = faces
        .iter()
        .map(|[a, b, c]| {
            0.5 * (vertices[*b] - vertices[*a])
                .cross(&(vertices[*c] - vertices[*a]))
                .norm()
        })
        .sum();

    let denominator = 6.0 * 6.0_f64.sqrt() * volume;
    if !(denominator > f64::MIN_POSITIVE) || !longest.is_finite() {
        return DEGENERATE_ASPECT_RATIO;
    }

    (longest * area / denominator).min(DEGENERATE_ASPECT_RATIO)
}

/// Computes one metric for every tetrahedron in block order
pub fn element_metric(mesh: &Mesh, metric: QualityMetric) -> Vec<f64> {
    mesh.tetrahedra()
        .map(|tet| {
            let vertices = tet.map(|i| &mesh.points[i]);

            match (metric, geometry::tetrahedron_metrics(vertices)) {
                (QualityMetric::AspectRatio, _) => tetrahedron_aspect_ratio(vertices),
                (_, None) => 0.0,
                (QualityMetric::EdgeLength, Some(m)) => m.edges.iter().sum::<f64>() / 6.0,
                (QualityMetric::EdgeRatio, Some(m)) => m.edge_ratio,
                (QualityMetric::Volume, Some(m)) => m.volume,
                (QualityMetric::Jacobian, Some(m)) => m.jacobian,
            }
        })
        .collect()
}

/// Stores every [`QualityMetric`] as a cell attribute on the tetrahedra
pub fn attach_metrics(mesh: &mut Mesh) -> crate::error::Result<()> {
    for metric in QualityMetric::ALL {
        let values = element_metric(mesh, metric);
        mesh.set_tetrahedron_scalar(metric.attribute_name(), &values)?;
    }
    Ok(())
}

/// Computes the aspect ratio quality report of a tetrahedral mesh
///
/// # Arguments
/// * `mesh` - The mesh to analyze. Non-tetrahedral blocks are ignored.
/// * `poor_threshold` - Aspect ratio above which an element is poor
///
/// # Returns
/// The report; a zeroed one when the mesh has no tetrahedra
pub fn analyze(mesh: &Mesh, poor_threshold: f64) -> QualityReport {
    let ratios = element_metric(mesh, QualityMetric::AspectRatio);

    if ratios.is_empty() {
        return QualityReport::default();
    }

    let element_count = ratios.len();
    let poor_count = ratios.iter().filter(|r| **r > poor_threshold).count();
    let mean_aspect_ratio = ratios.iter().sum::<f64>() / element_count as f64;
    let max_aspect_ratio = ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let report = QualityReport {
        element_count,
        poor_count,
        poor_percent: poor_count as f64 / element_count as f64 * 100.0,
        mean_aspect_ratio,
        max_aspect_ratio,
    };

    info!(
        "quality: {} elements, mean aspect ratio {:.3}, max {:.3}, {} poor ({:.2}%)",
        report.element_count,
        report.mean_aspect_ratio,
        report.max_aspect_ratio,
        report.poor_count,
        report.poor_percent
    );

    report
}
