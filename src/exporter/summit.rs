use std::path::Path;

use tracing::info;

use crate::{
    datatypes::{ElementProperty, Mesh},
    error::{CalimeshError, Result},
};

/// Bone material law written into Summit files. Every scaled channel is
/// `constant · BVTV^power_law_exponent`.
#[derive(Debug, Clone, PartialEq)]
pub struct SummitMaterial {
    pub young_modulus_a: f64,
    pub young_modulus_b1: f64,
    pub young_modulus_b2: f64,
    pub viscosity_b1: f64,
    pub viscosity_b2: f64,
    pub plasticity_stress: f64,
    pub power_law_exponent: f64,
    pub plasticity_exponent: f64,
    pub poisson_ratio: f64,
    pub density: f64,
    /// Floor applied to every BV/TV value
    pub bvtv_min: f64,
    /// Mesh units to metres
    pub coordinate_scale: f64,
}

impl Default for SummitMaterial {
    fn default() -> Self {
        SummitMaterial {
            young_modulus_a: 4e9,
            young_modulus_b1: 1.09e9,
            young_modulus_b2: 5.8e9,
            viscosity_b1: 3.26e5,
            viscosity_b2: 5.6e2,
            plasticity_stress: 1.4e8,
            power_law_exponent: 1.5,
            plasticity_exponent: 18.24,
            poisson_ratio: 0.3,
            density: 1800.0,
            bvtv_min: 1e-3,
            coordinate_scale: 1e-3,
        }
    }
}

/// Renders a Summit mesh file with ten per-element material channels
///
/// # Arguments
/// * `mesh` - The volume mesh. Only tetrahedra are written.
/// * `properties` - Optional per-element table; without it every element
///   gets the BV/TV floor
/// * `material` - Constants of the material law
pub fn format_summit(
    mesh: &Mesh,
    properties: Option<&[ElementProperty]>,
    material: &SummitMaterial,
) -> Result<String> {
    let tetrahedra: Vec<[usize; 4]> = mesh.tetrahedra().collect();
    if tetrahedra.is_empty() {
        return Err(CalimeshError::Export(
            "Cannot write a Summit file without tetrahedra".to_owned(),
        ));
    }

    let bvtv: Vec<f64> = match properties {
        Some(props) => {
            super::check_table_length(props.len(), tetrahedra.len(), "Summit")?;
            props
                .iter()
                .map(|p| p.volume_fraction.max(material.bvtv_min))
                .collect()
        }
        None => vec![material.bvtv_min; tetrahedra.len()],
    };

    let mut out = String::new();
    out.push_str("3\n");
    out.push_str(&format!("{} {} 1 1\n", mesh.points.len(), tetrahedra.len()));

    let s = material.coordinate_scale;
    for p in &mesh.points {
        out.push_str(&format!(
            "{} {} {}\n",
            super::float(p.x * s),
            super::float(p.y * s),
            super::float(p.z * s)
        ));
    }
    for tet in &tetrahedra {
        out.push_str(&format!(
            "4 {} {} {} {} 1 Tet1CG\n",
            tet[0] + 1,
            tet[1] + 1,
            tet[2] + 1,
            tet[3] + 1
        ));
    }

    out.push_str("10\n");

    out.push_str("BVTV\n");
    for v in &bvtv {
        out.push_str(&format!("{v:.3}\n"));
    }

    let scaled = [
        ("Young modulus A", material.young_modulus_a),
        ("Young modulus B1", material.young_modulus_b1),
        ("Young modulus B2", material.young_modulus_b2),
        ("Viscosity B1", material.viscosity_b1),
        ("Viscosity B2", material.viscosity_b2),
        ("Plasticity stress", material.plasticity_stress),
    ];
    for (name, constant) in scaled {
        out.push_str(&format!("{name}\n"));
        for v in &bvtv {
            let value = constant * v.powf(material.power_law_exponent);
            out.push_str(&format!("{}\n", super::sci(value, 5)));
        }
    }

    // density goes out without a fraction, as an integer constant
    let uniform = [
        ("Plasticity exponent", super::float(material.plasticity_exponent)),
        ("Poisson ratio", super::float(material.poisson_ratio)),
        ("density", material.density.to_string()),
    ];
    for (name, value) in uniform {
        out.push_str(&format!("{name}\n"));
        for _ in &bvtv {
            out.push_str(&format!("{value}\n"));
        }
    }

    Ok(out)
}

/// Writes a Summit mesh file, see [`format_summit`]
pub fn write_summit(
    mesh: &Mesh,
    properties: Option<&[ElementProperty]>,
    material: &SummitMaterial,
    path: &Path,
) -> Result<()> {
    let contents = format_summit(mesh, properties, material)?;
    super::write_text(path, &contents)?;
    info!("wrote Summit file to {}", path.display());
    Ok(())
}
