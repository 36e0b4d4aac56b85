use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Command,
};

use nalgebra::Point3;
use tracing::{debug, info};

use crate::{
    datatypes::{ElementBlock, ElementKind, Mesh},
    error::{CalimeshError, Result},
    exporter::stl,
};

/// Variables removed from the mesher's environment so that the child
/// process does not pick up the host runtime's interpreter or libraries
pub const STRIPPED_ENV_VARS: [&str; 3] = ["PYTHONHOME", "PYTHONPATH", "LD_LIBRARY_PATH"];

const PROBE_SURFACE_FILE: &str = "remesh_output.stl";
const PROBE_MESH_FILE: &str = "volume_mesh.msh";

/// What a volume mesher returns for one run
#[derive(Debug, Clone)]
pub struct VolumeMeshOutput {
    /// The parsed mesh, boundary triangles included
    pub mesh: Mesh,
    /// The mesher's file exactly as written
    pub native: String,
}

/// A tetrahedral mesher driven by a single element size parameter
pub trait VolumeMeshEngine {
    fn name(&self) -> &str;

    /// Meshes the volume enclosed by `surface`
    ///
    /// # Arguments
    /// * `surface` - A closed triangle surface
    /// * `element_size` - The target element size handed to the mesher
    fn generate(&self, surface: &Mesh, element_size: f64) -> Result<VolumeMeshOutput>;
}

/// Builds a command whose environment is stripped of [`STRIPPED_ENV_VARS`]
pub fn sanitized_command(program: &Path) -> Command {
    let mut command = Command::new(program);
    for var in STRIPPED_ENV_VARS {
        command.env_remove(var);
    }
    command
}

/// Creates the isolated working directory of one probe. It is removed when
/// the returned handle drops, whatever the outcome of the probe.
fn probe_workdir() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("calimesh-probe-")
        .tempdir()
        .map_err(|err| CalimeshError::Mesher(format!("Failed to create probe directory: {err}")))
}

/// Runs a prepared mesher command and loads its output
fn run_mesher(mut command: Command, label: &str, output_path: &Path) -> Result<VolumeMeshOutput> {
    debug!("running {label}: {:?}", command);

    let output = match command.output() {
        Ok(out) => out,
        Err(err) => {
            return Err(CalimeshError::Mesher(format!("Failed to launch {label}: {err}")));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        return Err(CalimeshError::Mesher(format!(
            "{label} exited with {}: {}",
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        )));
    }

    load_mesher_output(output_path)
}

/// Verifies that the mesher wrote a non-empty file and parses it
pub fn load_mesher_output(path: &Path) -> Result<VolumeMeshOutput> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => {
            return Err(CalimeshError::Mesher(format!(
                "Mesher did not create {}",
                path.display()
            )))
        }
    };
    if metadata.len() == 0 {
        return Err(CalimeshError::Mesher(format!(
            "Mesher wrote an empty file at {}",
            path.display()
        )));
    }

    let native = std::fs::read_to_string(path).map_err(|err| CalimeshError::io(path, err))?;
    let mesh = parse_msh(&native)?;

    Ok(VolumeMeshOutput { mesh, native })
}

/// Runs an external program as `program [args] <surface.stl> <output.msh> <size>`
#[derive(Debug, Clone)]
pub struct ScriptMesher {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl VolumeMeshEngine for ScriptMesher {
    fn name(&self) -> &str {
        "script"
    }

    fn generate(&self, surface: &Mesh, element_size: f64) -> Result<VolumeMeshOutput> {
        let workdir = probe_workdir()?;
        let surface_path = workdir.path().join(PROBE_SURFACE_FILE);
        let mesh_path = workdir.path().join(PROBE_MESH_FILE);

        stl::write_stl(surface, &surface_path)?;

        let mut command = sanitized_command(&self.program);
        command
            .args(&self.args)
            .arg(&surface_path)
            .arg(&mesh_path)
            .arg(format!("{element_size}"))
            .current_dir(workdir.path());

        run_mesher(command, &self.program.display().to_string(), &mesh_path)
    }
}

/// Drives the gmsh command line through a generated `.geo` script
#[derive(Debug, Clone)]
pub struct GmshMesher {
    pub program: PathBuf,
}

impl Default for GmshMesher {
    fn default() -> Self {
        GmshMesher {
            program: PathBuf::from("gmsh"),
        }
    }
}

/// Writes the script that closes the merged STL into a volume and meshes it
/// at a uniform size
///
/// # Arguments
/// * `surface_file` - File name of the STL, relative to the script
/// * `output_file` - The output .geo file
/// * `element_size` - Used as both the minimum and maximum mesh size
fn build_geo(surface_file: &str, output_file: &Path, element_size: f64) -> Result<()> {
    let contents = format!(
        "// Close the imported surface into a volume\n\
        Merge \"{surface_file}\";\n\
        Surface Loop(1) = {{ 1 }};\n\
        Volume(1) = {{ 1 }};\n\
        \n\
        // Define Mesh Settings\n\
        Mesh.ElementOrder = 1;\n\
        Mesh.MeshSizeMin = {element_size};\n\
        Mesh.MeshSizeMax = {element_size};\n"
    );

    std::fs::write(output_file, contents).map_err(|err| CalimeshError::io(output_file, err))
}

impl VolumeMeshEngine for GmshMesher {
    fn name(&self) -> &str {
        "gmsh"
    }

    fn generate(&self, surface: &Mesh, element_size: f64) -> Result<VolumeMeshOutput> {
        let workdir = probe_workdir()?;
        let surface_path = workdir.path().join(PROBE_SURFACE_FILE);
        let geo_path = workdir.path().join("volume.geo");
        let mesh_path = workdir.path().join(PROBE_MESH_FILE);

        stl::write_stl(surface, &surface_path)?;
        build_geo(PROBE_SURFACE_FILE, &geo_path, element_size)?;

        info!("running gmsh with element size {:.4}", element_size);
        let mut command = sanitized_command(&self.program);
        command
            .arg(&geo_path)
            .arg("-3")
            .arg("-format")
            .arg("msh41")
            .arg("-o")
            .arg(&mesh_path)
            .current_dir(workdir.path());

        run_mesher(command, "gmsh", &mesh_path)
    }
}

enum MeshParseState {
    Format,
    Nodes,
    Elements,
    Skipped,
    Limbo,
}

fn parse_numbers<T: std::str::FromStr>(line: &str) -> Result<Vec<T>> {
    line.split_whitespace()
        .map(|token| {
            token.parse().map_err(|_| {
                CalimeshError::Mesher(format!("Unexpected token '{token}' in mesh data"))
            })
        })
        .collect()
}

fn next_line<'a>(lines: &mut impl Iterator<Item = &'a str>, section: &str) -> Result<&'a str> {
    lines
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .ok_or_else(|| CalimeshError::Mesher(format!("Unexpected end of file in {section}")))
}

/// Collects elements into one block per kind, in order of first appearance
#[derive(Default)]
struct BlockCollector {
    blocks: Vec<ElementBlock>,
}

impl BlockCollector {
    fn push(&mut self, kind: ElementKind, nodes: &[usize]) {
        match self.blocks.iter_mut().find(|b| b.kind == kind) {
            Some(block) => block.connectivity.extend_from_slice(nodes),
            None => self.blocks.push(ElementBlock::new(kind, nodes.to_vec())),
        }
    }
}

fn resolve_node(node_indexes: &HashMap<usize, usize>, tag: usize) -> Result<usize> {
    node_indexes
        .get(&tag)
        .copied()
        .ok_or_else(|| CalimeshError::Mesher(format!("Element references unknown node {tag}")))
}

/// Parses an ASCII gmsh mesh (format 4.1 or 2.2) into a [`Mesh`]
///
/// Node tags are renumbered to contiguous indices in order of appearance.
/// Elements other than triangles and tetrahedra are skipped.
///
/// # Arguments
/// * `contents` - The text of the .msh file
///
/// # Returns
/// The parsed mesh
pub fn parse_msh(contents: &str) -> Result<Mesh> {
    let mut parser_state = MeshParseState::Limbo;
    let mut lines = contents.lines();

    let mut version: Option<f64> = None;
    let mut points: Vec<Point3<f64>> = Vec::new();
    let mut node_indexes: HashMap<usize, usize> = HashMap::new();
    let mut collector = BlockCollector::default();
    let mut skipped_elements: usize = 0;

    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("$End") {
            parser_state = MeshParseState::Limbo;
            continue;
        }

        match parser_state {
            MeshParseState::Limbo => {
                parser_state = match line {
                    "$MeshFormat" => MeshParseState::Format,
                    "$Nodes" => MeshParseState::Nodes,
                    "$Elements" => MeshParseState::Elements,
                    _ => MeshParseState::Skipped,
                };
            }
            MeshParseState::Format => {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 2 {
                    return Err(CalimeshError::Mesher(format!("Bad $MeshFormat line '{line}'")));
                }
                let v: f64 = fields[0].parse().map_err(|_| {
                    CalimeshError::Mesher(format!("Bad mesh format version '{}'", fields[0]))
                })?;
                if fields[1] != "0" {
                    return Err(CalimeshError::Mesher(
                        "Binary .msh files are not supported".to_owned(),
                    ));
                }
                if !(2.0..3.0).contains(&v) && !(4.0..5.0).contains(&v) {
                    return Err(CalimeshError::Mesher(format!(
                        "Unsupported .msh version {v}"
                    )));
                }
                version = Some(v);
            }
            MeshParseState::Nodes => {
                if version.unwrap_or(4.1) >= 4.0 {
                    parse_nodes_v4(line, &mut lines, &mut points, &mut node_indexes)?;
                } else {
                    parse_nodes_v2(line, &mut lines, &mut points, &mut node_indexes)?;
                }
            }
            MeshParseState::Elements => {
                skipped_elements += if version.unwrap_or(4.1) >= 4.0 {
                    parse_elements_v4(line, &mut lines, &node_indexes, &mut collector)?
                } else {
                    parse_elements_v2(line, &mut lines, &node_indexes, &mut collector)?
                };
            }
            MeshParseState::Skipped => continue,
        }
    }

    if version.is_none() {
        return Err(CalimeshError::Mesher(
            "Mesh file has no $MeshFormat section".to_owned(),
        ));
    }

    let mesh = Mesh::new(points, collector.blocks)?;

    debug!(
        "loaded {} nodes, {} triangles and {} tetrahedra ({} other elements skipped)",
        mesh.points.len(),
        mesh.count(ElementKind::Triangle),
        mesh.count(ElementKind::Tetrahedron),
        skipped_elements
    );

    Ok(mesh)
}

fn push_node(
    coords: &[f64],
    tag: usize,
    points: &mut Vec<Point3<f64>>,
    node_indexes: &mut HashMap<usize, usize>,
) -> Result<()> {
    if coords.len() < 3 {
        return Err(CalimeshError::Mesher(format!("Node {tag} has fewer than 3 coordinates")));
    }
    node_indexes.insert(tag, points.len());
    points.push(Point3::new(coords[0], coords[1], coords[2]));
    Ok(())
}

/// Parses the body of a 4.x `$Nodes` section. `header` is the section's
/// first line.
fn parse_nodes_v4<'a>(
    header: &str,
    lines: &mut impl Iterator<Item = &'a str>,
    points: &mut Vec<Point3<f64>>,
    node_indexes: &mut HashMap<usize, usize>,
) -> Result<()> {
    let header: Vec<usize> = parse_numbers(header)?;
    let num_blocks = *header
        .first()
        .ok_or_else(|| CalimeshError::Mesher("Empty $Nodes header".to_owned()))?;

    for _ in 0..num_blocks {
        let block: Vec<usize> = parse_numbers(next_line(lines, "$Nodes")?)?;
        if block.len() < 4 {
            return Err(CalimeshError::Mesher("Bad node block header".to_owned()));
        }
        let num_nodes_local = block[3];

        let mut node_tags: Vec<usize> = Vec::with_capacity(num_nodes_local);
        for _ in 0..num_nodes_local {
            let tag: Vec<usize> = parse_numbers(next_line(lines, "$Nodes")?)?;
            node_tags.push(*tag.first().ok_or_else(|| {
                CalimeshError::Mesher("Missing node tag".to_owned())
            })?);
        }

        for tag in node_tags {
            let coords: Vec<f64> = parse_numbers(next_line(lines, "$Nodes")?)?;
            push_node(&coords, tag, points, node_indexes)?;
        }
    }

    Ok(())
}

fn parse_nodes_v2<'a>(
    header: &str,
    lines: &mut impl Iterator<Item = &'a str>,
    points: &mut Vec<Point3<f64>>,
    node_indexes: &mut HashMap<usize, usize>,
) -> Result<()> {
    let count: Vec<usize> = parse_numbers(header)?;
    let count = *count
        .first()
        .ok_or_else(|| CalimeshError::Mesher("Empty $Nodes header".to_owned()))?;

    for _ in 0..count {
        let fields: Vec<f64> = parse_numbers(next_line(lines, "$Nodes")?)?;
        if fields.len() < 4 {
            return Err(CalimeshError::Mesher("Node line has fewer than 4 fields".to_owned()));
        }
        push_node(&fields[1..], fields[0] as usize, points, node_indexes)?;
    }

    Ok(())
}

/// Returns the number of elements of unsupported kinds that were skipped
fn parse_elements_v4<'a>(
    header: &str,
    lines: &mut impl Iterator<Item = &'a str>,
    node_indexes: &HashMap<usize, usize>,
    collector: &mut BlockCollector,
) -> Result<usize> {
    let header: Vec<usize> = parse_numbers(header)?;
    let num_blocks = *header
        .first()
        .ok_or_else(|| CalimeshError::Mesher("Empty $Elements header".to_owned()))?;
    let mut skipped = 0;

    for _ in 0..num_blocks {
        let block: Vec<usize> = parse_numbers(next_line(lines, "$Elements")?)?;
        if block.len() < 4 {
            return Err(CalimeshError::Mesher("Bad element block header".to_owned()));
        }
        let kind = ElementKind::from_gmsh_element_type(block[2]);
        let num_elements = block[3];

        for _ in 0..num_elements {
            let line = next_line(lines, "$Elements")?;
            let Some(kind) = kind else {
                skipped += 1;
                continue;
            };

            let metadata: Vec<usize> = parse_numbers(line)?;
            let n = kind.nodes_per_element();
            if metadata.len() < n + 1 {
                return Err(CalimeshError::Mesher(format!(
                    "Element {} lists too few nodes",
                    metadata.first().copied().unwrap_or_default()
                )));
            }

            let nodes = metadata[1..=n]
                .iter()
                .map(|tag| resolve_node(node_indexes, *tag))
                .collect::<Result<Vec<usize>>>()?;
            collector.push(kind, &nodes);
        }
    }

    Ok(skipped)
}

fn parse_elements_v2<'a>(
    header: &str,
    lines: &mut impl Iterator<Item = &'a str>,
    node_indexes: &HashMap<usize, usize>,
    collector: &mut BlockCollector,
) -> Result<usize> {
    let count: Vec<usize> = parse_numbers(header)?;
    let count = *count
        .first()
        .ok_or_else(|| CalimeshError::Mesher("Empty $Elements header".to_owned()))?;
    let mut skipped = 0;

    for _ in 0..count {
        let fields: Vec<usize> = parse_numbers(next_line(lines, "$Elements")?)?;
        if fields.len() < 3 {
            return Err(CalimeshError::Mesher("Element line has fewer than 3 fields".to_owned()));
        }

        let Some(kind) = ElementKind::from_gmsh_element_type(fields[1]) else {
            skipped += 1;
            continue;
        };

        let first_node = 3 + fields[2];
        let n = kind.nodes_per_element();
        if fields.len() < first_node + n {
            return Err(CalimeshError::Mesher(format!(
                "Element {} lists too few nodes",
                fields[0]
            )));
        }

        let nodes = fields[first_node..first_node + n]
            .iter()
            .map(|tag| resolve_node(node_indexes, *tag))
            .collect::<Result<Vec<usize>>>()?;
        collector.push(kind, &nodes);
    }

    Ok(skipped)
}
