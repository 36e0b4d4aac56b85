use std::{collections::BTreeMap, iter::Peekable, path::Path, str::SplitWhitespace};

use nalgebra::Point3;
use tracing::{debug, warn};

use crate::{
    datatypes::{Attribute, ElementBlock, ElementKind, Mesh},
    error::{CalimeshError, Result},
};

/// Keywords that start a new section of a legacy VTK body
const SECTION_KEYWORDS: [&str; 14] = [
    "DATASET",
    "POINTS",
    "CELLS",
    "CELL_TYPES",
    "CELL_DATA",
    "POINT_DATA",
    "SCALARS",
    "VECTORS",
    "NORMALS",
    "FIELD",
    "DIMENSIONS",
    "SPACING",
    "ORIGIN",
    "ASPECT_RATIO",
];

/// Whitespace tokenizer over the body of a legacy VTK file
pub(crate) struct Tokens<'a> {
    inner: Peekable<SplitWhitespace<'a>>,
}

impl<'a> Tokens<'a> {
    pub(crate) fn new(body: &'a str) -> Tokens<'a> {
        Tokens {
            inner: body.split_whitespace().peekable(),
        }
    }

    pub(crate) fn peek(&mut self) -> Option<&'a str> {
        self.inner.peek().copied()
    }

    pub(crate) fn next_token(&mut self) -> Option<&'a str> {
        self.inner.next()
    }

    pub(crate) fn next_str(&mut self, what: &str) -> Result<&'a str> {
        self.inner
            .next()
            .ok_or_else(|| CalimeshError::Input(format!("Unexpected end of VTK data reading {what}")))
    }

    pub(crate) fn next_num<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next_str(what)?;
        token
            .parse()
            .map_err(|_| CalimeshError::Input(format!("Bad value '{token}' for {what}")))
    }

    pub(crate) fn numbers<T: std::str::FromStr>(&mut self, count: usize, what: &str) -> Result<Vec<T>> {
        (0..count).map(|_| self.next_num(what)).collect()
    }

    /// Consumes an optional `LOOKUP_TABLE <name>` pair
    pub(crate) fn skip_lookup_table(&mut self) {
        if self.peek().map(|t| t.eq_ignore_ascii_case("LOOKUP_TABLE")) == Some(true) {
            self.inner.next();
            self.inner.next();
        }
    }

    /// Skips tokens up to the next section keyword
    fn skip_to_section(&mut self) {
        while let Some(token) = self.peek() {
            if SECTION_KEYWORDS.contains(&token.to_uppercase().as_str()) {
                break;
            }
            self.inner.next();
        }
    }
}

/// Splits a legacy VTK file into its version string and body. Only ASCII
/// files are accepted.
pub(crate) fn split_header(contents: &str) -> Result<(String, &str)> {
    let mut parts = contents.splitn(4, '\n');
    let signature = parts.next().unwrap_or_default().trim();
    let _title = parts.next();
    let encoding = parts.next().unwrap_or_default().trim();
    let body = parts.next().unwrap_or_default();

    let Some(version) = signature.strip_prefix("# vtk DataFile Version") else {
        return Err(CalimeshError::Input(format!(
            "Not a legacy VTK file (signature '{signature}')"
        )));
    };
    if !encoding.eq_ignore_ascii_case("ASCII") {
        return Err(CalimeshError::Input(format!(
            "Unsupported VTK encoding '{encoding}', only ASCII is read"
        )));
    }

    Ok((version.trim().to_owned(), body))
}

fn write_attribute(out: &mut String, name: &str, attribute: &Attribute) {
    out.push_str(&format!("SCALARS {name} double {}\n", attribute.components.max(1)));
    out.push_str("LOOKUP_TABLE default\n");
    for tuple in attribute.values.chunks(attribute.components.max(1)) {
        let line: Vec<String> = tuple.iter().map(|v| v.to_string()).collect();
        out.push_str(&format!("{}\n", line.join(" ")));
    }
}

/// Renders a mesh as a legacy ASCII unstructured grid (version 4.2)
///
/// Cell attributes are written when every block carries them; point
/// attributes are always written.
pub fn format_vtk(mesh: &Mesh, title: &str) -> String {
    let mut out = String::new();
    let num_cells: usize = mesh.blocks.iter().map(|b| b.len()).sum();
    let cells_size: usize = mesh
        .blocks
        .iter()
        .map(|b| b.len() * (b.kind.nodes_per_element() + 1))
        .sum();

    out.push_str("# vtk DataFile Version 4.2\n");
    out.push_str(&format!("{title}\n"));
    out.push_str("ASCII\n");
    out.push_str("DATASET UNSTRUCTURED_GRID\n");

    out.push_str(&format!("POINTS {} double\n", mesh.points.len()));
    for p in &mesh.points {
        out.push_str(&format!("{} {} {}\n", p.x, p.y, p.z));
    }

    out.push_str(&format!("CELLS {num_cells} {cells_size}\n"));
    for block in &mesh.blocks {
        for element in block.elements() {
            let nodes: Vec<String> = element.iter().map(|n| n.to_string()).collect();
            out.push_str(&format!("{} {}\n", element.len(), nodes.join(" ")));
        }
    }

    out.push_str(&format!("CELL_TYPES {num_cells}\n"));
    for block in &mesh.blocks {
        for _ in 0..block.len() {
            out.push_str(&format!("{}\n", block.kind.vtk_cell_type()));
        }
    }

    let shared: Vec<&String> = match mesh.blocks.first() {
        Some(first) => first
            .attributes
            .keys()
            .filter(|name| mesh.blocks.iter().all(|b| b.attributes.contains_key(*name)))
            .collect(),
        None => Vec::new(),
    };
    for block in &mesh.blocks {
        for name in block.attributes.keys().filter(|n| !shared.contains(n)) {
            warn!("cell attribute '{name}' is missing on some blocks and is not written");
        }
    }

    if !shared.is_empty() && num_cells > 0 {
        out.push_str(&format!("CELL_DATA {num_cells}\n"));
        for name in shared {
            let components = mesh.blocks[0].attributes[name].components;
            let values: Vec<f64> = mesh
                .blocks
                .iter()
                .flat_map(|b| b.attributes[name].values.iter().copied())
                .collect();
            write_attribute(&mut out, name, &Attribute { components, values });
        }
    }

    if !mesh.point_data.is_empty() {
        out.push_str(&format!("POINT_DATA {}\n", mesh.points.len()));
        for (name, attribute) in &mesh.point_data {
            write_attribute(&mut out, name, attribute);
        }
    }

    out
}

/// Writes a mesh as a legacy ASCII VTK unstructured grid
pub fn write_vtk(mesh: &Mesh, path: &Path) -> Result<()> {
    let contents = format_vtk(mesh, "calimesh volume mesh");
    super::write_text(path, &contents)?;
    debug!("wrote {}", path.display());
    Ok(())
}

pub fn read_vtk(path: &Path) -> Result<Mesh> {
    let contents = std::fs::read_to_string(path).map_err(|err| CalimeshError::io(path, err))?;
    parse_vtk(&contents)
}

#[derive(Clone, Copy, PartialEq)]
enum DataSection {
    Cell(usize),
    Point(usize),
}

/// Parses a legacy ASCII unstructured grid. Both the 4.2 `CELLS` layout and
/// the 5.1 `OFFSETS`/`CONNECTIVITY` layout are understood. Cells other than
/// triangles and tetrahedra are dropped together with their cell data.
pub fn parse_vtk(contents: &str) -> Result<Mesh> {
    let (version, body) = split_header(contents)?;
    let mut tokens = Tokens::new(body);

    let mut points: Vec<Point3<f64>> = Vec::new();
    let mut cells: Vec<Vec<usize>> = Vec::new();
    let mut cell_types: Vec<u8> = Vec::new();
    let mut cell_attributes: Vec<(String, Attribute)> = Vec::new();
    let mut point_attributes: BTreeMap<String, Attribute> = BTreeMap::new();
    let mut section: Option<DataSection> = None;

    while let Some(keyword) = tokens.next_token() {
        match keyword.to_uppercase().as_str() {
            "DATASET" => {
                let kind = tokens.next_str("DATASET")?;
                if !kind.eq_ignore_ascii_case("UNSTRUCTURED_GRID") {
                    return Err(CalimeshError::Input(format!(
                        "Expected an unstructured grid, found {kind}"
                    )));
                }
            }
            "POINTS" => {
                let n: usize = tokens.next_num("POINTS count")?;
                let _dtype = tokens.next_str("POINTS type")?;
                let coords: Vec<f64> = tokens.numbers(3 * n, "point coordinates")?;
                points = coords
                    .chunks_exact(3)
                    .map(|c| Point3::new(c[0], c[1], c[2]))
                    .collect();
            }
            "CELLS" => {
                let first: usize = tokens.next_num("CELLS count")?;
                let second: usize = tokens.next_num("CELLS size")?;

                if tokens.peek().map(|t| t.eq_ignore_ascii_case("OFFSETS")) == Some(true) {
                    tokens.next_token();
                    let _dtype = tokens.next_str("OFFSETS type")?;
                    let offsets: Vec<usize> = tokens.numbers(first, "cell offsets")?;
                    let marker = tokens.next_str("CONNECTIVITY")?;
                    if !marker.eq_ignore_ascii_case("CONNECTIVITY") {
                        return Err(CalimeshError::Input(format!(
                            "Expected CONNECTIVITY after OFFSETS, found {marker}"
                        )));
                    }
                    let _dtype = tokens.next_str("CONNECTIVITY type")?;
                    let connectivity: Vec<usize> = tokens.numbers(second, "cell connectivity")?;

                    cells = offsets
                        .windows(2)
                        .map(|w| {
                            connectivity
                                .get(w[0]..w[1])
                                .map(|s| s.to_vec())
                                .ok_or_else(|| CalimeshError::Input("Cell offset out of range".to_owned()))
                        })
                        .collect::<Result<Vec<_>>>()?;
                } else {
                    cells = Vec::with_capacity(first);
                    for _ in 0..first {
                        let n: usize = tokens.next_num("cell size")?;
                        cells.push(tokens.numbers(n, "cell nodes")?);
                    }
                }
            }
            "CELL_TYPES" => {
                let n: usize = tokens.next_num("CELL_TYPES count")?;
                cell_types = tokens.numbers(n, "cell types")?;
            }
            "CELL_DATA" => section = Some(DataSection::Cell(tokens.next_num("CELL_DATA count")?)),
            "POINT_DATA" => section = Some(DataSection::Point(tokens.next_num("POINT_DATA count")?)),
            "SCALARS" | "VECTORS" | "NORMALS" => {
                let name = tokens.next_str("attribute name")?.to_owned();
                let _dtype = tokens.next_str("attribute type")?;
                let components = if keyword.eq_ignore_ascii_case("SCALARS") {
                    match tokens.peek().and_then(|t| t.parse::<usize>().ok()) {
                        Some(c) => {
                            tokens.next_token();
                            c
                        }
                        None => 1,
                    }
                } else {
                    3
                };
                tokens.skip_lookup_table();
                read_attribute(&mut tokens, section, name, components, &mut cell_attributes, &mut point_attributes)?;
            }
            "FIELD" => {
                let _field_name = tokens.next_str("FIELD name")?;
                let arrays: usize = tokens.next_num("FIELD array count")?;
                for _ in 0..arrays {
                    let name = tokens.next_str("array name")?.to_owned();
                    let components: usize = tokens.next_num("array components")?;
                    let _tuples: usize = tokens.next_num("array tuples")?;
                    let _dtype = tokens.next_str("array type")?;
                    read_attribute(&mut tokens, section, name, components, &mut cell_attributes, &mut point_attributes)?;
                }
            }
            "METADATA" => tokens.skip_to_section(),
            other => {
                return Err(CalimeshError::Input(format!(
                    "Unsupported VTK keyword '{other}'"
                )))
            }
        }
    }

    if cell_types.len() != cells.len() {
        return Err(CalimeshError::Input(format!(
            "VTK file lists {} cells but {} cell types",
            cells.len(),
            cell_types.len()
        )));
    }

    let mut blocks: Vec<ElementBlock> = Vec::new();
    let mut cell_block: Vec<Option<usize>> = Vec::with_capacity(cells.len());
    for (nodes, cell_type) in cells.iter().zip(&cell_types) {
        let kind = ElementKind::from_vtk_cell_type(*cell_type)
            .filter(|k| k.nodes_per_element() == nodes.len());
        let Some(kind) = kind else {
            cell_block.push(None);
            continue;
        };

        let index = match blocks.iter().position(|b| b.kind == kind) {
            Some(i) => i,
            None => {
                blocks.push(ElementBlock::new(kind, Vec::new()));
                blocks.len() - 1
            }
        };
        blocks[index].connectivity.extend_from_slice(nodes);
        cell_block.push(Some(index));
    }

    for (name, attribute) in cell_attributes {
        if attribute.len() != cells.len() {
            return Err(CalimeshError::Input(format!(
                "Cell attribute '{name}' has {} tuples for {} cells",
                attribute.len(),
                cells.len()
            )));
        }
        let c = attribute.components;
        for block in blocks.iter_mut() {
            block.attributes.insert(
                name.clone(),
                Attribute {
                    components: c,
                    values: Vec::new(),
                },
            );
        }
        for (cell, owner) in cell_block.iter().enumerate() {
            if let Some(b) = owner {
                if let Some(target) = blocks[*b].attributes.get_mut(&name) {
                    target
                        .values
                        .extend_from_slice(&attribute.values[cell * c..(cell + 1) * c]);
                }
            }
        }
    }

    let mut mesh = Mesh::new(points, blocks)?;
    mesh.point_data = point_attributes;
    mesh.validate()?;

    debug!(
        "parsed VTK {version}: {} points, {} tetrahedra",
        mesh.points.len(),
        mesh.count(ElementKind::Tetrahedron)
    );

    Ok(mesh)
}

fn read_attribute(
    tokens: &mut Tokens<'_>,
    section: Option<DataSection>,
    name: String,
    components: usize,
    cell_attributes: &mut Vec<(String, Attribute)>,
    point_attributes: &mut BTreeMap<String, Attribute>,
) -> Result<()> {
    let Some(section) = section else {
        return Err(CalimeshError::Input(format!(
            "Attribute '{name}' appears before CELL_DATA or POINT_DATA"
        )));
    };
    let count = match section {
        DataSection::Cell(n) | DataSection::Point(n) => n,
    };

    let values: Vec<f64> = tokens.numbers(count * components, &name)?;
    let attribute = Attribute { components, values };
    match section {
        DataSection::Cell(_) => cell_attributes.push((name, attribute)),
        DataSection::Point(_) => {
            point_attributes.insert(name, attribute);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{self, fixtures::cube_tetrahedra};
    use approx::assert_relative_eq;

    fn volumes(mesh: &Mesh) -> Vec<f64> {
        geometry::tetrahedron_metrics_of(mesh)
            .into_iter()
            .map(|m| m.map(|m| m.volume).unwrap_or_default())
            .collect()
    }

    #[test]
    fn round_trip_preserves_tetrahedra() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube_volume_mesh.vtk");
        let mut mesh = cube_tetrahedra(3.0);
        mesh.set_tetrahedron_scalar("BMD", &[1.0, 2.0, 3.0, 4.0, 5.5])
            .unwrap();

        write_vtk(&mesh, &path).unwrap();
        let loaded = read_vtk(&path).unwrap();

        assert_eq!(loaded.points.len(), mesh.points.len());
        assert_eq!(loaded.count(ElementKind::Tetrahedron), 5);
        for (a, b) in volumes(&mesh).iter().zip(volumes(&loaded)) {
            assert_relative_eq!(*a, b, epsilon = 1e-12);
        }
        assert_eq!(
            loaded.blocks[0].attributes["BMD"].values,
            vec![1.0, 2.0, 3.0, 4.0, 5.5]
        );
    }

    #[test]
    fn reads_offsets_layout() {
        let contents = "# vtk DataFile Version 5.1
vtk output
ASCII
DATASET UNSTRUCTURED_GRID
POINTS 5 float
0 0 0 1 0 0 0 1 0
0 0 1 1 1 1
CELLS 3 7
OFFSETS vtktypeint64
0 3 7
CONNECTIVITY vtktypeint64
0 1 2 0 1 2 3
CELL_TYPES 2
5
10
CELL_DATA 2
FIELD FieldData 1
quality 1 2 double
0.5 1.5
";
        let mesh = parse_vtk(contents).unwrap();
        assert_eq!(mesh.points.len(), 5);
        assert_eq!(mesh.count(ElementKind::Triangle), 1);
        assert_eq!(mesh.count(ElementKind::Tetrahedron), 1);

        let tet_block = mesh
            .blocks
            .iter()
            .find(|b| b.kind == ElementKind::Tetrahedron)
            .unwrap();
        assert_eq!(tet_block.attributes["quality"].values, vec![1.5]);
    }

    #[test]
    fn rejects_binary_files() {
        let contents = "# vtk DataFile Version 4.2\nmesh\nBINARY\nDATASET UNSTRUCTURED_GRID\n";
        assert!(matches!(parse_vtk(contents), Err(CalimeshError::Input(_))));
    }

    #[test]
    fn unknown_cell_types_are_dropped() {
        let contents = "# vtk DataFile Version 4.2
mesh
ASCII
DATASET UNSTRUCTURED_GRID
POINTS 4 double
0 0 0
1 0 0
0 1 0
0 0 1
CELLS 2 8
2 0 1
4 0 1 2 3
CELL_TYPES 2
3
10
";
        let mesh = parse_vtk(contents).unwrap();
        assert_eq!(mesh.blocks.len(), 1);
        assert_eq!(mesh.count(ElementKind::Tetrahedron), 1);
    }
}
