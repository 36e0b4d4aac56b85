use std::collections::BTreeMap;

use nalgebra::Point3;

use crate::error::{CalimeshError, Result};

/// The element families a mesh block can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Triangle,
    Tetrahedron,
}

impl ElementKind {
    /// Number of nodes referenced by one element of this kind
    pub fn nodes_per_element(&self) -> usize {
        match self {
            ElementKind::Triangle => 3,
            ElementKind::Tetrahedron => 4,
        }
    }

    /// Legacy VTK cell type id
    pub fn vtk_cell_type(&self) -> u8 {
        match self {
            ElementKind::Triangle => 5,
            ElementKind::Tetrahedron => 10,
        }
    }

    pub fn from_vtk_cell_type(cell_type: u8) -> Option<ElementKind> {
        match cell_type {
            5 => Some(ElementKind::Triangle),
            10 => Some(ElementKind::Tetrahedron),
            _ => None,
        }
    }

    /// Gmsh element type id
    pub fn gmsh_element_type(&self) -> usize {
        match self {
            ElementKind::Triangle => 2,
            ElementKind::Tetrahedron => 4,
        }
    }

    pub fn from_gmsh_element_type(element_type: usize) -> Option<ElementKind> {
        match element_type {
            2 => Some(ElementKind::Triangle),
            4 => Some(ElementKind::Tetrahedron),
            _ => None,
        }
    }

    /// Topological dimension
    pub fn dimension(&self) -> usize {
        match self {
            ElementKind::Triangle => 2,
            ElementKind::Tetrahedron => 3,
        }
    }
}

/// A named scalar or vector field. `values.len()` is always a multiple of
/// `components`.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub components: usize,
    pub values: Vec<f64>,
}

impl Attribute {
    pub fn scalar(values: Vec<f64>) -> Attribute {
        Attribute {
            components: 1,
            values,
        }
    }

    /// Number of tuples stored
    pub fn len(&self) -> usize {
        if self.components == 0 {
            return 0;
        }
        self.values.len() / self.components
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A homogeneous run of elements sharing one kind
#[derive(Debug, Clone, PartialEq)]
pub struct ElementBlock {
    pub kind: ElementKind,
    /// Flat connectivity, `kind.nodes_per_element()` indices per element
    pub connectivity: Vec<usize>,
    pub attributes: BTreeMap<String, Attribute>,
}

impl ElementBlock {
    pub fn new(kind: ElementKind, connectivity: Vec<usize>) -> ElementBlock {
        ElementBlock {
            kind,
            connectivity,
            attributes: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connectivity.len() / self.kind.nodes_per_element()
    }

    pub fn is_empty(&self) -> bool {
        self.connectivity.is_empty()
    }

    /// Iterates over the node index tuples of every element
    pub fn elements(&self) -> std::slice::ChunksExact<'_, usize> {
        self.connectivity.chunks_exact(self.kind.nodes_per_element())
    }
}

/// Points plus element blocks. Every index in every block is smaller than
/// the number of points.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mesh {
    pub points: Vec<Point3<f64>>,
    pub blocks: Vec<ElementBlock>,
    pub point_data: BTreeMap<String, Attribute>,
}

impl Mesh {
    /// Builds a mesh, validating the connectivity and attribute lengths
    ///
    /// # Arguments
    /// * `points` - The node positions
    /// * `blocks` - The element blocks referencing `points`
    ///
    /// # Returns
    /// The validated mesh
    pub fn new(points: Vec<Point3<f64>>, blocks: Vec<ElementBlock>) -> Result<Mesh> {
        let mesh = Mesh {
            points,
            blocks,
            point_data: BTreeMap::new(),
        };
        mesh.validate()?;
        Ok(mesh)
    }

    /// Builds a single-block triangle mesh
    pub fn from_triangles(points: Vec<Point3<f64>>, triangles: &[[usize; 3]]) -> Result<Mesh> {
        let connectivity = triangles.iter().flatten().copied().collect();
        Mesh::new(
            points,
            vec![ElementBlock::new(ElementKind::Triangle, connectivity)],
        )
    }

    /// Builds a single-block tetrahedral mesh
    pub fn from_tetrahedra(points: Vec<Point3<f64>>, tetrahedra: &[[usize; 4]]) -> Result<Mesh> {
        let connectivity = tetrahedra.iter().flatten().copied().collect();
        Mesh::new(
            points,
            vec![ElementBlock::new(ElementKind::Tetrahedron, connectivity)],
        )
    }

    /// Checks the index and attribute invariants
    pub fn validate(&self) -> Result<()> {
        let num_points = self.points.len();

        for (i, block) in self.blocks.iter().enumerate() {
            if block.connectivity.len() % block.kind.nodes_per_element() != 0 {
                return Err(CalimeshError::Input(format!(
                    "Block {i} has a connectivity length that is not a multiple of {}",
                    block.kind.nodes_per_element()
                )));
            }
            if let Some(bad) = block.connectivity.iter().find(|idx| **idx >= num_points) {
                return Err(CalimeshError::Input(format!(
                    "Block {i} references node {bad} but the mesh only has {num_points} points"
                )));
            }
            for (name, attribute) in &block.attributes {
                if attribute.len() != block.len() {
                    return Err(CalimeshError::Input(format!(
                        "Attribute '{name}' on block {i} has {} values for {} elements",
                        attribute.len(),
                        block.len()
                    )));
                }
            }
        }

        for (name, attribute) in &self.point_data {
            if attribute.len() != num_points {
                return Err(CalimeshError::Input(format!(
                    "Point attribute '{name}' has {} values for {num_points} points",
                    attribute.len()
                )));
            }
        }

        Ok(())
    }

    /// Number of elements of the given kind across all blocks
    pub fn count(&self, kind: ElementKind) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| b.len())
            .sum()
    }

    /// Iterates over every triangle in block order
    pub fn triangles(&self) -> impl Iterator<Item = [usize; 3]> + '_ {
        self.blocks
            .iter()
            .filter(|b| b.kind == ElementKind::Triangle)
            .flat_map(|b| b.elements())
            .map(|e| [e[0], e[1], e[2]])
    }

    /// Iterates over every tetrahedron in block order
    pub fn tetrahedra(&self) -> impl Iterator<Item = [usize; 4]> + '_ {
        self.blocks
            .iter()
            .filter(|b| b.kind == ElementKind::Tetrahedron)
            .flat_map(|b| b.elements())
            .map(|e| [e[0], e[1], e[2], e[3]])
    }

    /// Returns a copy of the mesh holding only the tetrahedral blocks.
    /// Volume meshers echo boundary faces next to the tetrahedra; those
    /// must be gone before measuring or exporting.
    pub fn strip_triangles(&self) -> Mesh {
        Mesh {
            points: self.points.clone(),
            blocks: self
                .blocks
                .iter()
                .filter(|b| b.kind != ElementKind::Triangle)
                .cloned()
                .collect(),
            point_data: self.point_data.clone(),
        }
    }

    /// Attaches a per-element scalar to the tetrahedra. The values run over
    /// every tetrahedral block in order.
    pub fn set_tetrahedron_scalar(&mut self, name: &str, values: &[f64]) -> Result<()> {
        let expected = self.count(ElementKind::Tetrahedron);
        if values.len() != expected {
            return Err(CalimeshError::Input(format!(
                "Cell attribute '{name}' has {} values for {expected} tetrahedra",
                values.len()
            )));
        }

        let mut cursor = 0;
        for block in self
            .blocks
            .iter_mut()
            .filter(|b| b.kind == ElementKind::Tetrahedron)
        {
            let n = block.len();
            block.attributes.insert(
                name.to_owned(),
                Attribute::scalar(values[cursor..cursor + n].to_vec()),
            );
            cursor += n;
        }

        Ok(())
    }
}

/// Material proxy values for one tetrahedron
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementProperty {
    /// Sequential id after triangle stripping
    pub new_id: usize,
    /// Index of the element in the mapped mesh
    pub element_id: usize,
    /// BMD-like linear map of the sampled intensity
    pub density: f64,
    /// BV/TV-like fraction derived from the density
    pub volume_fraction: f64,
}
