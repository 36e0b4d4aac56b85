use indicatif::ProgressBar;
use nalgebra::Point3;
use tracing::{info, warn};

use crate::{
    datatypes::{ElementKind, ElementProperty, Mesh},
    error::{CalimeshError, Result},
    geometry::Summary,
    intensity::IntensityVolume,
};

/// Calibration of the intensity to density map
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialSettings {
    pub enabled: bool,
    pub slope: f64,
    pub intercept: f64,
    /// Half width of the sampled voxel cube
    pub neighborhood_radius: usize,
    /// Applied to the volume grid before sampling
    pub resolution_factor: f64,
    pub density_per_volume_fraction: f64,
    pub min_volume_fraction: f64,
}

impl Default for MaterialSettings {
    fn default() -> Self {
        MaterialSettings {
            enabled: true,
            slope: 0.7,
            intercept: 5.1,
            neighborhood_radius: 2,
            resolution_factor: 1.0,
            density_per_volume_fraction: 684.0,
            min_volume_fraction: 0.001,
        }
    }
}

impl MaterialSettings {
    /// Density and volume fraction of a sampled mean intensity
    pub fn convert(&self, mean_intensity: f64) -> (f64, f64) {
        let density = if mean_intensity > 0.0 {
            self.slope * mean_intensity + self.intercept
        } else {
            0.0
        };
        let volume_fraction = (density / self.density_per_volume_fraction).max(self.min_volume_fraction);
        (density, volume_fraction)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.density_per_volume_fraction > 0.0) {
            return Err(CalimeshError::Material(format!(
                "Density per volume fraction must be positive, got {}",
                self.density_per_volume_fraction
            )));
        }
        if !(self.min_volume_fraction > 0.0) {
            return Err(CalimeshError::Material(format!(
                "Minimum volume fraction must be positive, got {}",
                self.min_volume_fraction
            )));
        }
        if !(self.resolution_factor > 0.0) || !self.resolution_factor.is_finite() {
            return Err(CalimeshError::Material(format!(
                "Resolution factor must be positive, got {}",
                self.resolution_factor
            )));
        }
        Ok(())
    }
}

fn centroid(mesh: &Mesh, tetrahedron: &[usize]) -> Point3<f64> {
    let sum = tetrahedron
        .iter()
        .fold(nalgebra::Vector3::zeros(), |acc, i| acc + mesh.points[*i].coords);
    Point3::from(sum / tetrahedron.len() as f64)
}

/// Samples the intensity volume at every tetrahedron centroid and turns
/// the samples into density and volume fraction proxies
///
/// # Arguments
/// * `mesh` - The volume mesh; element ids count every element of every
///   block, so a mesh that still carries triangles keeps the original ids
/// * `volume` - The CT volume, already resampled
/// * `settings` - The density map
///
/// # Returns
/// One row per tetrahedron, in block order
pub fn map_properties(
    mesh: &Mesh,
    volume: &IntensityVolume,
    settings: &MaterialSettings,
) -> Result<Vec<ElementProperty>> {
    settings.validate()?;

    let tetrahedra = mesh.count(ElementKind::Tetrahedron);
    if tetrahedra == 0 {
        return Err(CalimeshError::Material(
            "Mesh has no tetrahedra to map".to_owned(),
        ));
    }

    let mut properties: Vec<ElementProperty> = Vec::with_capacity(tetrahedra);
    let mut samples: Vec<f64> = Vec::with_capacity(tetrahedra);
    let mut outside = 0usize;
    let mut element_id = 0usize;

    let bar = ProgressBar::new(tetrahedra as u64);
    for block in &mesh.blocks {
        if block.kind != ElementKind::Tetrahedron {
            element_id += block.len();
            continue;
        }

        for tetrahedron in block.elements() {
            let (density, volume_fraction) =
                match volume.physical_to_index(&centroid(mesh, tetrahedron)) {
                    Some(index) => {
                        let mean = volume.neighborhood_mean(index, settings.neighborhood_radius);
                        samples.push(mean);
                        settings.convert(mean)
                    }
                    None => {
                        outside += 1;
                        (settings.min_volume_fraction, settings.min_volume_fraction)
                    }
                };

            properties.push(ElementProperty {
                new_id: properties.len(),
                element_id,
                density,
                volume_fraction,
            });
            element_id += 1;
            bar.inc(1);
        }
    }
    bar.finish_and_clear();

    match Summary::of(samples.iter().copied()) {
        Some(s) => info!(
            "sampled intensity over {} elements: min {:.2}, max {:.2}, mean {:.2}",
            s.count, s.min, s.max, s.mean
        ),
        None => warn!("no element centroid fell inside the intensity volume"),
    }
    if outside > 0 {
        warn!("{outside} of {tetrahedra} element centroids lie outside the volume");
    }

    Ok(properties)
}

/// Densities of a property table, in element order
pub fn densities(properties: &[ElementProperty]) -> Vec<f64> {
    properties.iter().map(|p| p.density).collect()
}

/// Volume fractions of a property table, in element order
pub fn volume_fractions(properties: &[ElementProperty]) -> Vec<f64> {
    properties.iter().map(|p| p.volume_fraction).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datatypes::ElementBlock, intensity::fixtures::ramp_volume};
    use approx::assert_relative_eq;

    fn small_tet(offset: [f64; 3]) -> Vec<Point3<f64>> {
        let [x, y, z] = offset;
        vec![
            Point3::new(x - 0.1, y - 0.1, z - 0.1),
            Point3::new(x + 0.3, y - 0.1, z - 0.1),
            Point3::new(x - 0.1, y + 0.3, z - 0.1),
            Point3::new(x - 0.1, y - 0.1, z + 0.3),
        ]
    }

    #[test]
    fn corner_voxel_samples_clipped_neighborhood() {
        let volume = ramp_volume([5, 5, 5], 1.0, Point3::origin());
        let mesh = Mesh::from_tetrahedra(small_tet([0.0, 0.0, 0.0]), &[[0, 1, 2, 3]]).unwrap();

        let properties = map_properties(&mesh, &volume, &MaterialSettings::default()).unwrap();

        assert_eq!(properties.len(), 1);
        let density = 0.7 * 111.0 + 5.1;
        assert_relative_eq!(properties[0].density, density, epsilon = 1e-9);
        assert_relative_eq!(properties[0].volume_fraction, density / 684.0, epsilon = 1e-12);
        assert!(properties[0].volume_fraction > 0.001);
    }

    #[test]
    fn outside_centroid_gets_the_floor() {
        let volume = ramp_volume([5, 5, 5], 1.0, Point3::origin());
        let mesh = Mesh::from_tetrahedra(small_tet([40.0, 0.0, 0.0]), &[[0, 1, 2, 3]]).unwrap();

        let properties = map_properties(&mesh, &volume, &MaterialSettings::default()).unwrap();

        assert_eq!(properties[0].density, 0.001);
        assert_eq!(properties[0].volume_fraction, 0.001);
    }

    #[test]
    fn non_positive_intensity_maps_to_zero_density() {
        let settings = MaterialSettings::default();
        assert_eq!(settings.convert(-300.0), (0.0, 0.001));
        assert_eq!(settings.convert(0.0), (0.0, 0.001));
        let (density, fraction) = settings.convert(1000.0);
        assert_relative_eq!(density, 705.1);
        assert_relative_eq!(fraction, 705.1 / 684.0);
    }

    #[test]
    fn ids_skip_over_triangle_blocks() {
        let volume = ramp_volume([5, 5, 5], 1.0, Point3::origin());
        let mut points = small_tet([1.0, 1.0, 1.0]);
        points.extend(small_tet([2.0, 2.0, 2.0]));
        let mesh = Mesh::new(
            points,
            vec![
                ElementBlock::new(ElementKind::Triangle, vec![0, 1, 2, 4, 5, 6]),
                ElementBlock::new(ElementKind::Tetrahedron, vec![0, 1, 2, 3, 4, 5, 6, 7]),
            ],
        )
        .unwrap();

        let properties = map_properties(&mesh, &volume, &MaterialSettings::default()).unwrap();

        assert_eq!(properties.len(), 2);
        assert_eq!((properties[0].new_id, properties[0].element_id), (0, 2));
        assert_eq!((properties[1].new_id, properties[1].element_id), (1, 3));
        assert!(properties[1].density > properties[0].density);
    }

    #[test]
    fn surface_only_mesh_is_rejected() {
        let volume = ramp_volume([2, 2, 2], 1.0, Point3::origin());
        let mesh = crate::geometry::fixtures::cube_surface(1.0);
        assert!(matches!(
            map_properties(&mesh, &volume, &MaterialSettings::default()),
            Err(CalimeshError::Material(_))
        ));
    }
}
