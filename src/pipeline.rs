use std::{
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use json::JsonValue;
use tracing::{error, info, warn};

use crate::{
    calibration::CalibrationResult,
    config::Config,
    datatypes::{ElementKind, ElementProperty, Mesh},
    error::{CalimeshError, Result},
    exporter::{abaqus, msh, stl, summit, tables, tables::SegmentStatistics, vtk, OutputFormat},
    geometry,
    intensity::IntensityVolume,
    material::{self, MaterialSettings},
    mesher::VolumeMeshEngine,
    quality::{self, QualityReport},
    remesher::RemeshEngine,
    surface_calibrator::calibrate_surface,
    volume_calibrator::calibrate_volume,
};

const VOLUME_MESH_SUFFIX: &str = "_volume_mesh.vtk";
const SUMMARY_FILE: &str = "summary.json";

/// A named closed surface to mesh
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub name: String,
    pub surface: PathBuf,
}

/// Finds the segments to process. A file is a single segment named after
/// its stem; a directory contributes every `.stl` inside it, sorted by name.
pub fn discover_segments(input: &Path) -> Result<Vec<Segment>> {
    let is_stl = |path: &Path| {
        path.extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("stl"))
    };
    let segment = |path: PathBuf| Segment {
        name: path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "segment".to_owned()),
        surface: path,
    };

    if input.is_file() {
        return Ok(vec![segment(input.to_path_buf())]);
    }

    let entries = std::fs::read_dir(input).map_err(|err| CalimeshError::io(input, err))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| CalimeshError::io(input, err))?.path();
        if path.is_file() && is_stl(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    Ok(paths.into_iter().map(segment).collect())
}

/// The two external engines a run drives
#[derive(Clone, Copy)]
pub struct Engines<'a> {
    pub remesher: &'a dyn RemeshEngine,
    pub mesher: &'a dyn VolumeMeshEngine,
}

/// Step of the per-segment pipeline, used to report failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    SurfaceCalibration,
    VolumeCalibration,
    Quality,
    Material,
    Export,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Read => "read",
            Stage::SurfaceCalibration => "surface calibration",
            Stage::VolumeCalibration => "volume calibration",
            Stage::Quality => "quality",
            Stage::Material => "material mapping",
            Stage::Export => "export",
        };
        write!(f, "{name}")
    }
}

/// A segment that did not make it through the pipeline
#[derive(Debug)]
pub struct SegmentFailure {
    pub segment: String,
    pub stage: Stage,
    pub error: CalimeshError,
}

/// Everything produced for one segment
#[derive(Debug)]
pub struct SegmentOutput {
    pub name: String,
    pub directory: PathBuf,
    pub calibration: CalibrationResult,
    /// Volume mesh with quality metrics and material channels attached
    pub mesh: Mesh,
    pub statistics: SegmentStatistics,
    pub quality: QualityReport,
    pub properties: Option<Vec<ElementProperty>>,
    pub files: Vec<PathBuf>,
}

/// Totals over every segment that finished
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSummary {
    pub total_meshes: usize,
    pub total_elements: usize,
    /// Mean of the per-segment mean tetrahedral edge lengths
    pub average_edge_length: Option<f64>,
}

impl RunSummary {
    pub fn of(segments: &[SegmentOutput]) -> RunSummary {
        RunSummary {
            total_meshes: segments.len(),
            total_elements: segments
                .iter()
                .map(|s| s.mesh.count(ElementKind::Tetrahedron))
                .sum(),
            average_edge_length: geometry::Summary::of(
                segments.iter().map(|s| s.calibration.volume.edge_length),
            )
            .map(|s| s.mean),
        }
    }
}

/// Result of a run. Segments that failed are listed in `failures` and absent
/// from `segments`.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub segments: Vec<SegmentOutput>,
    pub failures: Vec<SegmentFailure>,
    pub summary: RunSummary,
    pub cancelled: bool,
}

impl PipelineOutcome {
    /// Serializes the summary, the per-segment results and the failures
    pub fn to_json(&self) -> JsonValue {
        let mut root = JsonValue::new_object();
        root["totalMeshes"] = self.summary.total_meshes.into();
        root["totalElements"] = self.summary.total_elements.into();
        root["averageEdgeLength"] = self.summary.average_edge_length.into();
        root["cancelled"] = self.cancelled.into();

        let mut segments = Vec::new();
        for s in &self.segments {
            let mut entry = JsonValue::new_object();
            entry["name"] = s.name.as_str().into();
            entry["surfaceRatio"] = s.calibration.surface.ratio.into();
            entry["surfaceEdgeLength"] = s.calibration.surface.edge_length.into();
            entry["surfaceWithinTolerance"] = s.calibration.surface.within_tolerance.into();
            entry["elementSize"] = s.calibration.volume.element_size.into();
            entry["volumeEdgeLength"] = s.calibration.volume.edge_length.into();
            entry["volumeWithinTolerance"] = s.calibration.volume.within_tolerance.into();
            entry["fallback"] = s.calibration.volume.fallback.into();
            entry["evaluations"] = s.calibration.evaluation_count().into();
            entry["elements"] = s.quality.element_count.into();
            entry["poorElements"] = s.quality.poor_count.into();
            entry["poorPercent"] = s.quality.poor_percent.into();
            entry["meanAspectRatio"] = s.quality.mean_aspect_ratio.into();
            entry["maxAspectRatio"] = s.quality.max_aspect_ratio.into();
            segments.push(entry);
        }
        root["segments"] = JsonValue::Array(segments);

        let mut failures = Vec::new();
        for f in &self.failures {
            let mut entry = JsonValue::new_object();
            entry["segment"] = f.segment.as_str().into();
            entry["stage"] = f.stage.to_string().into();
            entry["error"] = f.error.to_string().into();
            failures.push(entry);
        }
        root["failures"] = JsonValue::Array(failures);

        root
    }

    pub fn write_summary(&self, output: &Path) -> Result<PathBuf> {
        let path = output.join(SUMMARY_FILE);
        std::fs::write(&path, self.to_json().pretty(4)).map_err(|err| CalimeshError::io(&path, err))?;
        Ok(path)
    }
}

/// Maps a segment-local percentage into the overall run
struct SegmentProgress<'p> {
    callback: &'p mut dyn FnMut(f64, &str),
    index: usize,
    total: usize,
}

impl SegmentProgress<'_> {
    fn report(&mut self, percent: f64, message: &str) {
        let step = 100.0 / self.total as f64;
        (self.callback)(self.index as f64 * step + percent * step / 100.0, message);
    }
}

fn stage<T>(stage: Stage, result: Result<T>) -> std::result::Result<T, (Stage, CalimeshError)> {
    result.map_err(|err| (stage, err))
}

/// Writes the files selected by `formats` into `directory`
#[allow(clippy::too_many_arguments)]
fn export_segment(
    name: &str,
    directory: &Path,
    config: &Config,
    surface: &Mesh,
    native: &str,
    mesh: &Mesh,
    properties: Option<&[ElementProperty]>,
    statistics: &SegmentStatistics,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(directory).map_err(|err| CalimeshError::io(directory, err))?;
    let file = |suffix: &str| directory.join(format!("{name}{suffix}"));
    let mut files = Vec::new();

    for format in &config.formats {
        let path = match format {
            OutputFormat::Stl => {
                let path = file("_surface_mesh.stl");
                stl::write_stl(surface, &path)?;
                path
            }
            OutputFormat::Vtk => {
                let path = file(VOLUME_MESH_SUFFIX);
                vtk::write_vtk(mesh, &path)?;
                path
            }
            OutputFormat::Abaqus => {
                let path = file("_volume_mesh.inp");
                abaqus::write_abaqus(mesh, properties, &config.abaqus, &path)?;
                path
            }
            OutputFormat::Msh => {
                let path = file("_surface_mesh.msh");
                msh::write_native(native, &path)?;
                path
            }
            OutputFormat::Summit => {
                let path = file("_mesh.summit");
                summit::write_summit(mesh, properties, &config.summit, &path)?;
                path
            }
        };
        files.push(path);
    }

    if let Some(properties) = properties {
        let path = file("_element_properties.csv");
        tables::write_element_properties(properties, &path)?;
        files.push(path);
    }

    let path = file("_statistics.csv");
    tables::write_statistics(statistics, &path)?;
    files.push(path);

    Ok(files)
}

fn process_segment(
    segment: &Segment,
    output: &Path,
    config: &Config,
    engines: Engines<'_>,
    volume: Option<&IntensityVolume>,
    progress: &mut SegmentProgress<'_>,
    cancel: &AtomicBool,
) -> std::result::Result<SegmentOutput, (Stage, CalimeshError)> {
    progress.report(5.0, &format!("Preparing {} for processing", segment.name));
    let surface = stage(Stage::Read, stl::read_stl(&segment.surface))?;
    if surface.count(ElementKind::Triangle) == 0 {
        return Err((
            Stage::Read,
            CalimeshError::Input(format!("{} holds no triangles", segment.surface.display())),
        ));
    }

    progress.report(10.0, "Calculating segment statistics");
    let area = geometry::surface_area(&surface);
    let enclosed_volume = geometry::enclosed_volume(&surface);
    info!(
        "{}: surface area {:.2}, enclosed volume {:.2}",
        segment.name, area, enclosed_volume
    );

    progress.report(30.0, "Optimizing surface mesh density");
    let surface_calibration = stage(
        Stage::SurfaceCalibration,
        calibrate_surface(engines.remesher, &surface, area, &config.calibration, cancel),
    )?;

    progress.report(50.0, "Generating volume mesh");
    let volume_calibration = stage(
        Stage::VolumeCalibration,
        calibrate_volume(engines.mesher, &surface_calibration.mesh, &config.calibration, cancel),
    )?;

    progress.report(70.0, "Analyzing mesh quality");
    let mut mesh = volume_calibration.mesh.clone();
    stage(Stage::Quality, quality::attach_metrics(&mut mesh))?;
    let quality = quality::analyze(&mesh, config.poor_threshold);

    let properties = match volume {
        Some(volume) if config.material.enabled => {
            progress.report(80.0, "Mapping material properties");
            let properties = stage(
                Stage::Material,
                material::map_properties(&mesh, volume, &config.material),
            )?;
            stage(
                Stage::Material,
                mesh.set_tetrahedron_scalar("BMD", &material::densities(&properties)),
            )?;
            stage(
                Stage::Material,
                mesh.set_tetrahedron_scalar("BVTV", &material::volume_fractions(&properties)),
            )?;
            Some(properties)
        }
        _ => None,
    };

    let statistics = SegmentStatistics {
        sample_id: segment.name.clone(),
        surface_area: area,
        enclosed_volume,
        requested_points: surface_calibration.requested_points,
        quantized_points: surface_calibration.quantized_points,
        point_surface_ratio: surface_calibration.ratio,
        surface: geometry::surface_statistics(&surface_calibration.mesh),
        volume: geometry::volume_statistics(&mesh),
    };

    progress.report(90.0, "Writing output files");
    let directory = output.join(&segment.name);
    let files = stage(
        Stage::Export,
        export_segment(
            &segment.name,
            &directory,
            config,
            &surface_calibration.mesh,
            &volume_calibration.native,
            &mesh,
            properties.as_deref(),
            &statistics,
        ),
    )?;

    Ok(SegmentOutput {
        name: segment.name.clone(),
        directory,
        calibration: CalibrationResult {
            surface: surface_calibration,
            volume: volume_calibration,
        },
        mesh,
        statistics,
        quality,
        properties,
        files,
    })
}

/// Runs every segment through calibration, quality analysis, optional
/// material mapping and export
///
/// # Arguments
/// * `segments` - Processed in order, each into `<output>/<name>/`
/// * `output` - The output directory, created when missing
/// * `config` - Calibration, material and export settings
/// * `engines` - Surface remesher and volume mesher
/// * `volume` - CT volume for material mapping; resampled once up front
/// * `progress` - Called with the overall percentage at each milestone
/// * `cancel` - Checked between segments and before every probe
///
/// # Returns
/// The outcome; only problems that stop the whole run are an `Err`
pub fn run(
    segments: &[Segment],
    output: &Path,
    config: &Config,
    engines: Engines<'_>,
    volume: Option<&IntensityVolume>,
    progress: &mut dyn FnMut(f64, &str),
    cancel: &AtomicBool,
) -> Result<PipelineOutcome> {
    if segments.is_empty() {
        return Err(CalimeshError::Pipeline("No segments to process".to_owned()));
    }
    std::fs::create_dir_all(output).map_err(|err| CalimeshError::io(output, err))?;

    let resampled = match volume {
        Some(volume) if config.material.enabled => {
            Some(volume.resample(config.material.resolution_factor)?)
        }
        Some(_) => {
            info!("material mapping disabled, ignoring the intensity volume");
            None
        }
        None => None,
    };

    info!(
        "processing {} segments with target edge length {:.3}",
        segments.len(),
        config.calibration.target_edge_length
    );

    let mut outputs: Vec<SegmentOutput> = Vec::new();
    let mut failures: Vec<SegmentFailure> = Vec::new();
    let mut cancelled = false;

    for (index, segment) in segments.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            warn!(
                "run cancelled, {} segments left unprocessed",
                segments.len() - index
            );
            cancelled = true;
            break;
        }

        let mut segment_progress = SegmentProgress {
            callback: &mut *progress,
            index,
            total: segments.len(),
        };

        match process_segment(
            segment,
            output,
            config,
            engines,
            resampled.as_ref(),
            &mut segment_progress,
            cancel,
        ) {
            Ok(out) => {
                info!(
                    "{}: {} tetrahedra written to {}",
                    out.name,
                    out.mesh.count(ElementKind::Tetrahedron),
                    out.directory.display()
                );
                outputs.push(out);
                segment_progress.report(
                    100.0,
                    &format!("Completed segment {} of {}", index + 1, segments.len()),
                );
            }
            Err((stage, err)) => {
                error!("{}: {stage} failed: {err}", segment.name);
                segment_progress.report(100.0, &format!("Error: {err}"));
                failures.push(SegmentFailure {
                    segment: segment.name.clone(),
                    stage,
                    error: err,
                });
            }
        }
    }

    let summary = RunSummary::of(&outputs);
    info!(
        "finished: {} meshes, {} elements, {} failed",
        summary.total_meshes,
        summary.total_elements,
        failures.len()
    );

    Ok(PipelineOutcome {
        segments: outputs,
        failures,
        summary,
        cancelled,
    })
}

/// A volume mesh whose material table was rewritten
#[derive(Debug, Clone, PartialEq)]
pub struct RemappedMesh {
    pub segment: String,
    pub properties_path: PathBuf,
    pub elements: usize,
}

/// Recursively collects every `*_volume_mesh.vtk` under `directory`
fn find_volume_meshes(directory: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(directory).map_err(|err| CalimeshError::io(directory, err))?;
    for entry in entries {
        let path = entry.map_err(|err| CalimeshError::io(directory, err))?.path();
        if path.is_dir() {
            find_volume_meshes(&path, found)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.ends_with(VOLUME_MESH_SUFFIX))
        {
            found.push(path);
        }
    }
    Ok(())
}

/// Recomputes the element property table of every volume mesh in an output
/// directory, writing `<segment>_element_properties.csv` next to each mesh
///
/// # Arguments
/// * `output` - A directory previously filled by [`run`]
/// * `volume` - The CT volume, not yet resampled
/// * `settings` - The density map
/// * `progress` - Called after every mesh
/// * `cancel` - Checked between meshes
///
/// # Returns
/// The meshes that were remapped and the ones that failed
pub fn remap_materials(
    output: &Path,
    volume: &IntensityVolume,
    settings: &MaterialSettings,
    progress: &mut dyn FnMut(f64, &str),
    cancel: &AtomicBool,
) -> Result<(Vec<RemappedMesh>, Vec<SegmentFailure>)> {
    let mut meshes = Vec::new();
    find_volume_meshes(output, &mut meshes)?;
    meshes.sort();
    if meshes.is_empty() {
        return Err(CalimeshError::Pipeline(format!(
            "No *{VOLUME_MESH_SUFFIX} files found under {}",
            output.display()
        )));
    }

    let volume = volume.resample(settings.resolution_factor)?;
    let mut remapped = Vec::new();
    let mut failures = Vec::new();

    for (i, path) in meshes.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            warn!("material mapping cancelled after {i} meshes");
            break;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let segment = file_name.trim_end_matches(VOLUME_MESH_SUFFIX).to_owned();
        let properties_path = path.with_file_name(format!("{segment}_element_properties.csv"));
        progress(
            i as f64 / meshes.len() as f64 * 100.0,
            &format!("Processing {segment} ({}/{})", i + 1, meshes.len()),
        );

        let result = vtk::read_vtk(path)
            .map_err(|err| (Stage::Read, err))
            .and_then(|mesh| {
                stage(Stage::Material, material::map_properties(&mesh, &volume, settings))
            })
            .and_then(|properties| {
                stage(
                    Stage::Export,
                    tables::write_element_properties(&properties, &properties_path),
                )?;
                Ok(properties.len())
            });

        match result {
            Ok(elements) => {
                info!("{segment}: {elements} element properties written");
                remapped.push(RemappedMesh {
                    segment,
                    properties_path,
                    elements,
                });
            }
            Err((stage, err)) => {
                error!("{segment}: {stage} failed: {err}");
                failures.push(SegmentFailure {
                    segment,
                    stage,
                    error: err,
                });
            }
        }
    }
    progress(100.0, "Material property calculation complete");

    Ok((remapped, failures))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_contribute_sorted_stl_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["L2.stl", "L1.STL", "notes.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }

        let segments = discover_segments(dir.path()).unwrap();
        let names: Vec<&str> = segments.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["L1", "L2"]);

        let single = discover_segments(&dir.path().join("L2.stl")).unwrap();
        assert_eq!(single[0].name, "L2");
    }

    #[test]
    fn progress_is_scaled_per_segment() {
        let mut seen = Vec::new();
        let mut callback = |p: f64, _: &str| seen.push(p);
        let mut progress = SegmentProgress {
            callback: &mut callback,
            index: 1,
            total: 4,
        };
        progress.report(0.0, "");
        progress.report(50.0, "");
        progress.report(100.0, "");

        assert_eq!(seen, vec![25.0, 37.5, 50.0]);
    }

    #[test]
    fn empty_segment_list_is_a_global_failure() {
        struct Never;
        impl RemeshEngine for Never {
            fn name(&self) -> &str {
                "never"
            }
            fn remesh(&self, _: &Mesh, _: usize) -> Result<Mesh> {
                unreachable!()
            }
        }
        impl VolumeMeshEngine for Never {
            fn name(&self) -> &str {
                "never"
            }
            fn generate(&self, _: &Mesh, _: f64) -> Result<crate::mesher::VolumeMeshOutput> {
                unreachable!()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let engines = Engines {
            remesher: &Never,
            mesher: &Never,
        };
        let result = run(
            &[],
            dir.path(),
            &Config::default(),
            engines,
            None,
            &mut |_, _| {},
            &AtomicBool::new(false),
        );
        assert!(matches!(result, Err(CalimeshError::Pipeline(_))));
    }

    #[test]
    fn summary_json_lists_failures() {
        let outcome = PipelineOutcome {
            segments: Vec::new(),
            failures: vec![SegmentFailure {
                segment: "L3".to_owned(),
                stage: Stage::VolumeCalibration,
                error: CalimeshError::Calibration("no tetrahedra".to_owned()),
            }],
            summary: RunSummary::default(),
            cancelled: false,
        };

        let value = outcome.to_json();
        assert_eq!(value["totalMeshes"].as_usize(), Some(0));
        assert!(value["averageEdgeLength"].is_null());
        assert_eq!(value["failures"][0]["segment"].as_str(), Some("L3"));
        assert_eq!(value["failures"][0]["stage"].as_str(), Some("volume calibration"));
    }
}
