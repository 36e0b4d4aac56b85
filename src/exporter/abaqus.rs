use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};

use tracing::info;

use crate::{
    datatypes::{ElementKind, ElementProperty, Mesh},
    error::{CalimeshError, Result},
};

/// Loading and material settings of the generated deck
#[derive(Debug, Clone, PartialEq)]
pub struct AbaqusSettings {
    /// Concentrated load on the reference point, applied along -Z
    pub load: f64,
    /// Distance from the extreme Z within which surface nodes are constrained
    pub surface_tolerance: f64,
    pub poisson_ratio: f64,
    /// Factor turning an element's density into its Young's modulus
    pub modulus_scale: f64,
    /// Young's modulus of elements without a property row
    pub default_modulus: f64,
}

impl Default for AbaqusSettings {
    fn default() -> Self {
        AbaqusSettings {
            load: 1000.0,
            surface_tolerance: 1.0,
            poisson_ratio: 0.3,
            modulus_scale: 1e9,
            default_modulus: 1e9,
        }
    }
}

const NODES_PER_LINE: usize = 8;

/// Nodes lying on faces that belong to exactly one tetrahedron, ascending
pub fn outer_surface_nodes(tetrahedra: &[[usize; 4]]) -> Vec<usize> {
    let mut face_count: HashMap<[usize; 3], usize> = HashMap::new();
    for tet in tetrahedra {
        for face in [
            [tet[0], tet[1], tet[2]],
            [tet[0], tet[1], tet[3]],
            [tet[0], tet[2], tet[3]],
            [tet[1], tet[2], tet[3]],
        ] {
            let mut key = face;
            key.sort_unstable();
            *face_count.entry(key).or_insert(0) += 1;
        }
    }

    face_count
        .into_iter()
        .filter(|(_, count)| *count == 1)
        .flat_map(|(face, _)| face)
        .collect::<BTreeSet<usize>>()
        .into_iter()
        .collect()
}

fn write_node_set(out: &mut String, ids: &[usize]) {
    for (i, id) in ids.iter().enumerate() {
        out.push_str(&format!("{id}, "));
        if (i + 1) % NODES_PER_LINE == 0 {
            out.push('\n');
        }
    }
    if ids.len() % NODES_PER_LINE != 0 {
        out.push('\n');
    }
}

/// Renders an Abaqus input deck: one C3D4 part with a material per element,
/// the lower surface encastred and the upper surface tied to a loaded
/// reference point
///
/// # Arguments
/// * `mesh` - The volume mesh. Only tetrahedra are written.
/// * `properties` - Optional per-element table, one row per tetrahedron
/// * `settings` - Load and material settings
///
/// # Returns
/// The deck text, or an `Export` error when the table length is off
pub fn format_abaqus(
    mesh: &Mesh,
    properties: Option<&[ElementProperty]>,
    settings: &AbaqusSettings,
) -> Result<String> {
    let tetrahedra: Vec<[usize; 4]> = mesh.tetrahedra().collect();
    if tetrahedra.is_empty() {
        return Err(CalimeshError::Export(
            "Cannot write an Abaqus deck without tetrahedra".to_owned(),
        ));
    }
    if let Some(props) = properties {
        super::check_table_length(props.len(), tetrahedra.len(), "Abaqus")?;
    }

    let surface_nodes = outer_surface_nodes(&tetrahedra);
    let z_of = |i: &usize| mesh.points[*i].z;
    let zmin = surface_nodes.iter().map(z_of).fold(f64::INFINITY, f64::min);
    let zmax = surface_nodes.iter().map(z_of).fold(f64::NEG_INFINITY, f64::max);
    let tol = settings.surface_tolerance;

    let lower: Vec<usize> = surface_nodes
        .iter()
        .filter(|i| z_of(i) <= zmin + tol)
        .map(|i| i + 1)
        .collect();
    let upper: Vec<usize> = surface_nodes
        .iter()
        .filter(|i| z_of(i) >= zmax - tol)
        .map(|i| i + 1)
        .collect();

    let n = mesh.points.len() as f64;
    let center_x = mesh.points.iter().map(|p| p.x).sum::<f64>() / n;
    let center_y = mesh.points.iter().map(|p| p.y).sum::<f64>() / n;

    let mut out = String::new();

    out.push_str("*Heading\n");
    out.push_str("** Generated by calimesh\n");
    out.push_str("*Preprint, echo=NO, model=NO, history=NO, contact=NO\n");

    out.push_str("*Part, name=Part-1\n");
    out.push_str("*Node\n");
    for (i, p) in mesh.points.iter().enumerate() {
        out.push_str(&format!(
            "      {}, {}, {}, {}\n",
            i + 1,
            super::float(p.x),
            super::float(p.y),
            super::float(p.z)
        ));
    }

    out.push_str("*Element, type=C3D4\n");
    for (i, tet) in tetrahedra.iter().enumerate() {
        out.push_str(&format!(
            "      {}, {}, {}, {}, {}\n",
            i + 1,
            tet[0] + 1,
            tet[1] + 1,
            tet[2] + 1,
            tet[3] + 1
        ));
    }

    for i in 1..=tetrahedra.len() {
        out.push_str(&format!("*Elset, elset=ElemSet-{i}\n"));
        out.push_str(&format!("{i},\n"));
        out.push_str(&format!("** Section: Section-Elem-{i}\n"));
        out.push_str(&format!("*Solid Section, elset=ElemSet-{i}, material=MatElem-{i}\n"));
        out.push_str(",\n");
    }

    out.push_str("*End Part\n**\n");
    out.push_str("*Assembly, name=Assembly\n");
    out.push_str("*Instance, name=Part-1-1, part=Part-1\n");
    out.push_str("*End Instance\n**\n");

    out.push_str("*Node\n");
    out.push_str(&format!(
        "      1, {}, {}, {}\n",
        super::float(center_x),
        super::float(center_y),
        super::float(zmax)
    ));
    out.push_str("*Nset, nset=RPSet\n1,\n");

    out.push_str("*Nset, nset=nodes-lower-surface, instance=Part-1-1\n");
    write_node_set(&mut out, &lower);
    out.push_str("*Nset, nset=nodes-upper-surface, instance=Part-1-1\n");
    write_node_set(&mut out, &upper);

    out.push_str("** Constraint: Constraint-1\n");
    out.push_str("*Rigid Body, ref node=RPSet, tie nset=NODES-UPPER-SURFACE\n");
    out.push_str("*End Assembly\n**\n");

    out.push_str("** MATERIALS\n");
    for i in 0..tetrahedra.len() {
        let modulus = match properties {
            Some(props) => props[i].density * settings.modulus_scale,
            None => settings.default_modulus,
        };
        out.push_str(&format!("*Material, name=MatElem-{}\n", i + 1));
        out.push_str("*Elastic\n");
        out.push_str(&format!(
            "{}, {}\n",
            super::sci(modulus, 3),
            super::float(settings.poisson_ratio)
        ));
    }

    out.push_str("** BOUNDARY CONDITIONS\n");
    out.push_str("*Boundary\n");
    out.push_str("NODES-LOWER-SURFACE, ENCASTRE\n");
    out.push_str("** STEP\n");
    out.push_str("*Step, name=Step-1, nlgeom=NO\n");
    out.push_str("*Static\n1., 1., 1e-05, 1.\n");
    out.push_str("** LOADS\n");
    out.push_str("*Cload\n");
    out.push_str(&format!("RPSet, 3, -{}\n", super::float(settings.load)));

    out.push_str("** OUTPUT REQUESTS\n");
    out.push_str("*Output, field, variable=PRESELECT\n");
    out.push_str("*Output, history, variable=PRESELECT\n");
    out.push_str("*End Step\n");

    Ok(out)
}

/// Writes an Abaqus input deck, see [`format_abaqus`]
pub fn write_abaqus(
    mesh: &Mesh,
    properties: Option<&[ElementProperty]>,
    settings: &AbaqusSettings,
    path: &Path,
) -> Result<()> {
    let deck = format_abaqus(mesh, properties, settings)?;
    super::write_text(path, &deck)?;
    info!(
        "wrote Abaqus deck with {} elements to {}",
        mesh.count(ElementKind::Tetrahedron),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::fixtures::cube_tetrahedra;

    fn property(i: usize, density: f64) -> ElementProperty {
        ElementProperty {
            new_id: i,
            element_id: i,
            density,
            volume_fraction: density / 684.0,
        }
    }

    #[test]
    fn every_cube_node_is_on_the_surface() {
        let mesh = cube_tetrahedra(1.0);
        let tets: Vec<[usize; 4]> = mesh.tetrahedra().collect();
        assert_eq!(outer_surface_nodes(&tets), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn deck_has_one_material_per_element() {
        let mesh = cube_tetrahedra(10.0);
        let props: Vec<ElementProperty> = (0..5).map(|i| property(i, 0.5 + i as f64)).collect();
        let deck = format_abaqus(&mesh, Some(&props), &AbaqusSettings::default()).unwrap();

        assert_eq!(deck.matches("*Material, name=MatElem-").count(), 5);
        assert!(deck.contains("*Element, type=C3D4\n      1, 1, 2, 4, 5\n"));
        assert!(deck.contains("*Node\n      1, 0.0, 0.0, 0.0\n      2, 10.0, 0.0, 0.0\n"));
        assert!(deck.contains("5.000e+08, 0.3\n"));
        assert!(deck.contains("4.500e+09, 0.3\n"));
        assert!(deck.contains("      1, 5.0, 5.0, 10.0\n"));
        assert!(deck.contains("*Nset, nset=nodes-lower-surface, instance=Part-1-1\n1, 2, 3, 4, \n"));
        assert!(deck.contains("*Nset, nset=nodes-upper-surface, instance=Part-1-1\n5, 6, 7, 8, \n"));
        assert!(deck.contains("RPSet, 3, -1000.0\n"));
        assert!(deck.ends_with("*End Step\n"));
    }

    #[test]
    fn default_modulus_without_properties() {
        let mesh = cube_tetrahedra(1.0);
        let deck = format_abaqus(&mesh, None, &AbaqusSettings::default()).unwrap();
        assert_eq!(deck.matches("1.000e+09, 0.3\n").count(), 5);
    }

    #[test]
    fn mismatched_table_is_rejected() {
        let mesh = cube_tetrahedra(1.0);
        let props = vec![property(0, 1.0)];
        assert!(matches!(
            format_abaqus(&mesh, Some(&props), &AbaqusSettings::default()),
            Err(CalimeshError::Export(_))
        ));
    }
}
