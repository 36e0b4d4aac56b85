use std::path::PathBuf;

use tracing::debug;

use crate::{
    datatypes::{ElementKind, Mesh},
    error::{CalimeshError, Result},
    exporter::stl,
    mesher::sanitized_command,
};

/// Rounds a requested point count to the remesher's granularity of 100
/// points
pub fn quantize_points(points: f64) -> usize {
    if !points.is_finite() || points <= 0.0 {
        return 0;
    }
    ((points / 100.0).round() * 100.0) as usize
}

/// A surface remesher that resamples a closed triangle surface to a
/// requested number of points
pub trait RemeshEngine {
    fn name(&self) -> &str;

    /// Point count the engine will actually use for a request
    fn quantize(&self, points: f64) -> usize {
        quantize_points(points)
    }

    /// Remeshes `surface` to roughly `points` vertices
    fn remesh(&self, surface: &Mesh, points: usize) -> Result<Mesh>;
}

/// Runs an external program as `program [args] <input.stl> <output.stl> <points>`
#[derive(Debug, Clone)]
pub struct CommandRemesher {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RemeshEngine for CommandRemesher {
    fn name(&self) -> &str {
        "command"
    }

    fn remesh(&self, surface: &Mesh, points: usize) -> Result<Mesh> {
        if points == 0 {
            return Err(CalimeshError::Mesher(
                "Remesher asked for zero points".to_owned(),
            ));
        }

        let workdir = tempfile::Builder::new()
            .prefix("calimesh-remesh-")
            .tempdir()
            .map_err(|err| CalimeshError::Mesher(format!("Failed to create remesh directory: {err}")))?;
        let input_path = workdir.path().join("remesh_input.stl");
        let output_path = workdir.path().join("remesh_output.stl");

        stl::write_stl(surface, &input_path)?;

        let mut command = sanitized_command(&self.program);
        command
            .args(&self.args)
            .arg(&input_path)
            .arg(&output_path)
            .arg(points.to_string())
            .current_dir(workdir.path());
        debug!("running remesher: {:?}", command);

        let output = command.output().map_err(|err| {
            CalimeshError::Mesher(format!(
                "Failed to launch remesher {}: {err}",
                self.program.display()
            ))
        })?;
        if !output.status.success() {
            return Err(CalimeshError::Mesher(format!(
                "Remesher exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !output_path.exists() {
            return Err(CalimeshError::Mesher(
                "Remesher did not write an output surface".to_owned(),
            ));
        }

        let remeshed = stl::read_stl(&output_path)?;
        if remeshed.count(ElementKind::Triangle) == 0 {
            return Err(CalimeshError::Mesher(
                "Remesher returned an empty surface".to_owned(),
            ));
        }

        Ok(remeshed)
    }
}
