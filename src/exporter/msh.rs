use std::path::Path;

use tracing::debug;

use crate::{datatypes::Mesh, error::Result};

/// Renders a mesh as an ASCII gmsh 4.1 file. Each block becomes one element
/// entity block; node and element tags are 1-based and sequential.
pub fn format_msh(mesh: &Mesh) -> String {
    let mut out = String::new();
    let num_nodes = mesh.points.len();
    let num_elements: usize = mesh.blocks.iter().map(|b| b.len()).sum();

    out.push_str("$MeshFormat\n4.1 0 8\n$EndMeshFormat\n");

    out.push_str("$Nodes\n");
    if num_nodes == 0 {
        out.push_str("0 0 0 0\n");
    } else {
        out.push_str(&format!("1 {num_nodes} 1 {num_nodes}\n"));
        out.push_str(&format!("3 1 0 {num_nodes}\n"));
        for tag in 1..=num_nodes {
            out.push_str(&format!("{tag}\n"));
        }
        for p in &mesh.points {
            out.push_str(&format!("{} {} {}\n", p.x, p.y, p.z));
        }
    }
    out.push_str("$EndNodes\n");

    out.push_str("$Elements\n");
    out.push_str(&format!(
        "{} {num_elements} {} {num_elements}\n",
        mesh.blocks.len(),
        if num_elements == 0 { 0 } else { 1 }
    ));
    let mut tag = 1;
    for (entity, block) in mesh.blocks.iter().enumerate() {
        out.push_str(&format!(
            "{} {} {} {}\n",
            block.kind.dimension(),
            entity + 1,
            block.kind.gmsh_element_type(),
            block.len()
        ));
        for element in block.elements() {
            let nodes: Vec<String> = element.iter().map(|n| (n + 1).to_string()).collect();
            out.push_str(&format!("{tag} {}\n", nodes.join(" ")));
            tag += 1;
        }
    }
    out.push_str("$EndElements\n");

    out
}

/// Writes a mesh as an ASCII gmsh 4.1 file
pub fn write_msh(mesh: &Mesh, path: &Path) -> Result<()> {
    super::write_text(path, &format_msh(mesh))?;
    debug!("wrote {}", path.display());
    Ok(())
}

/// Copies a mesher's native output verbatim
pub fn write_native(native: &str, path: &Path) -> Result<()> {
    super::write_text(path, native)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datatypes::ElementKind, geometry::fixtures::cube_tetrahedra, mesher::parse_msh};

    #[test]
    fn output_is_readable_by_the_mesher_parser() {
        let mesh = cube_tetrahedra(1.0);
        let parsed = parse_msh(&format_msh(&mesh)).unwrap();

        assert_eq!(parsed.points, mesh.points);
        assert_eq!(parsed.count(ElementKind::Tetrahedron), 5);
        assert_eq!(
            parsed.tetrahedra().collect::<Vec<_>>(),
            mesh.tetrahedra().collect::<Vec<_>>()
        );
    }

    #[test]
    fn native_output_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("L1_surface_mesh.msh");
        write_native("$MeshFormat\n4.1 0 8\n$EndMeshFormat\n", &path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "$MeshFormat\n4.1 0 8\n$EndMeshFormat\n"
        );
    }
}
