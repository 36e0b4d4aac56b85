use std::path::Path;

use tracing::debug;

use crate::{
    datatypes::ElementProperty,
    error::Result,
    geometry::{SurfaceStatistics, VolumeStatistics},
};

pub const ELEMENT_PROPERTIES_HEADER: &str = "New_Element_ID,Original_Element_ID,BMD,BV/TV";

pub const STATISTICS_HEADERS: [&str; 19] = [
    "Sample ID",
    "Surface Area (mm2)",
    "Volume (mm3)",
    "Surface Number of Points (Exact)",
    "Surface Number of Points (Rounded)",
    "Surface Number of Triangles",
    "Number of Elements in Volume Mesh",
    "Point Surface Ratio",
    "Surface Mean Edge Length",
    "Surface Min Angle",
    "Surface Max Angle",
    "Surface Mean Aspect Ratio",
    "Volume Mean Edge Length",
    "Tet Edge Ratio",
    "Tet Mean Volume",
    "Tet Min Volume",
    "Tet Total Volume",
    "Tet Mean Jacobian",
    "Tet Min Jacobian",
];

/// One row of the per-segment statistics report
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentStatistics {
    pub sample_id: String,
    /// Area of the input surface
    pub surface_area: f64,
    /// Volume enclosed by the input surface
    pub enclosed_volume: f64,
    /// Points requested from the remesher before quantization
    pub requested_points: f64,
    pub quantized_points: usize,
    pub point_surface_ratio: f64,
    pub surface: SurfaceStatistics,
    pub volume: VolumeStatistics,
}

/// Quotes a field if it holds a separator, quote or newline
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn format_element_properties(properties: &[ElementProperty]) -> String {
    let mut out = String::new();
    out.push_str(&format!("{ELEMENT_PROPERTIES_HEADER}\n"));
    for p in properties {
        out.push_str(&format!(
            "{},{},{:.4},{:.4}\n",
            p.new_id, p.element_id, p.density, p.volume_fraction
        ));
    }
    out
}

/// Writes the element property table as CSV
pub fn write_element_properties(properties: &[ElementProperty], path: &Path) -> Result<()> {
    super::write_text(path, &format_element_properties(properties))?;
    debug!("wrote {} element properties to {}", properties.len(), path.display());
    Ok(())
}

/// Renders the header and the single data row of a statistics report.
/// Missing aggregates are left empty.
pub fn format_statistics(stats: &SegmentStatistics) -> String {
    let row = [
        csv_field(&stats.sample_id),
        stats.surface_area.to_string(),
        stats.enclosed_volume.to_string(),
        stats.requested_points.to_string(),
        stats.quantized_points.to_string(),
        stats.surface.triangle_count.to_string(),
        stats.volume.tetrahedron_count.to_string(),
        stats.point_surface_ratio.to_string(),
        optional(stats.surface.mean_edge_length),
        optional(stats.surface.min_angle),
        optional(stats.surface.max_angle),
        optional(stats.surface.mean_aspect_ratio),
        optional(stats.volume.mean_edge_length),
        optional(stats.volume.mean_edge_ratio),
        optional(stats.volume.mean_volume),
        optional(stats.volume.min_volume),
        optional(stats.volume.total_volume),
        optional(stats.volume.mean_jacobian),
        optional(stats.volume.min_jacobian),
    ];

    let header: Vec<String> = STATISTICS_HEADERS.iter().map(|h| csv_field(h)).collect();
    format!("{}\n{}\n", header.join(","), row.join(","))
}

pub fn write_statistics(stats: &SegmentStatistics, path: &Path) -> Result<()> {
    super::write_text(path, &format_statistics(stats))?;
    debug!("wrote statistics to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{self, fixtures::*};

    #[test]
    fn properties_use_four_decimals() {
        let table = format_element_properties(&[ElementProperty {
            new_id: 0,
            element_id: 7,
            density: 145.123456,
            volume_fraction: 0.2121688,
        }]);
        assert_eq!(
            table,
            "New_Element_ID,Original_Element_ID,BMD,BV/TV\n0,7,145.1235,0.2122\n"
        );
    }

    #[test]
    fn statistics_row_has_nineteen_columns() {
        let stats = SegmentStatistics {
            sample_id: "L1".to_owned(),
            surface_area: 24.0,
            enclosed_volume: 8.0,
            requested_points: 38.88,
            quantized_points: 0,
            point_surface_ratio: 1.62,
            surface: geometry::surface_statistics(&cube_surface(2.0)),
            volume: geometry::volume_statistics(&cube_surface(2.0)),
        };
        let text = format_statistics(&stats);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Sample ID,Surface Area (mm2),"));
        let row: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(row.len(), 19);
        assert_eq!(row[0], "L1");
        assert_eq!(row[5], "12");
        assert_eq!(row[6], "0");
        // no tetrahedra, so every volume aggregate is empty
        assert!(row[12..].iter().all(|c| c.is_empty()));
    }
}
