use std::{
    cell::RefCell,
    sync::atomic::{AtomicBool, Ordering},
};

use tracing::{info, warn};

use crate::{
    calibration::{
        probe_and_record, search_bracket, CalibrationEvaluation, CalibrationSettings,
        CalibrationState, Probe, VolumeCalibration,
    },
    datatypes::{ElementKind, Mesh},
    error::{CalimeshError, Result},
    geometry,
    mesher::VolumeMeshEngine,
};

const MIN_ELEMENT_SIZE: f64 = 0.1;
const MAX_ELEMENT_SIZE: f64 = 20.0;

/// Tetrahedra of a probe plus the file the mesher wrote
struct VolumeArtifact {
    mesh: Mesh,
    native: String,
}

/// Interval searched after the seed size. An overshooting seed means the
/// elements are too large.
fn size_bracket(seed: f64, seed_residual: f64) -> (f64, f64) {
    let lower = MIN_ELEMENT_SIZE.max(0.5 * seed);
    let upper = MAX_ELEMENT_SIZE.min(2.0 * seed);

    if seed_residual.is_infinite() {
        (lower, upper)
    } else if seed_residual > 0.0 {
        (lower, seed)
    } else {
        (seed, upper)
    }
}

/// Meshes the surface once and measures the tetrahedra. Triangles echoed by
/// the mesher are stripped first; a result without tetrahedra is a failure.
fn generate_and_measure(
    engine: &dyn VolumeMeshEngine,
    surface: &Mesh,
    element_size: f64,
) -> Probe<VolumeArtifact> {
    let output = match engine.generate(surface, element_size) {
        Ok(out) => out,
        Err(err) => {
            return Probe {
                count: 0,
                measured: Err(err),
            }
        }
    };

    let mesh = output.mesh.strip_triangles();
    let count = mesh.count(ElementKind::Tetrahedron);
    if count == 0 {
        return Probe {
            count,
            measured: Err(CalimeshError::Mesher(format!(
                "{} produced no tetrahedra at size {element_size:.4}",
                engine.name()
            ))),
        };
    }

    let measured = geometry::measure_edge_length(&mesh, ElementKind::Tetrahedron).map(|edge| {
        (
            edge,
            VolumeArtifact {
                mesh,
                native: output.native,
            },
        )
    });
    Probe { count, measured }
}

/// Finds the mesher element size that makes the tetrahedra reach the
/// target mean edge length
///
/// # Arguments
/// * `engine` - The volume mesher
/// * `surface` - The calibrated closed surface
/// * `settings` - Target, tolerance, budgets and minimum element count
/// * `cancel` - Checked before every probe
///
/// # Returns
/// The best volume mesh. If every probe failed, a single run at the target
/// size is used instead and flagged as outside tolerance.
pub fn calibrate_volume(
    engine: &dyn VolumeMeshEngine,
    surface: &Mesh,
    settings: &CalibrationSettings,
    cancel: &AtomicBool,
) -> Result<VolumeCalibration> {
    settings.validate()?;

    let probe = |size: f64| generate_and_measure(engine, surface, size);
    let state = RefCell::new(CalibrationState::new("volume calibration", settings));
    let seed = settings.target_edge_length;

    info!(
        "volume calibration: target {:.4}, seed size {:.4} ({} engine)",
        settings.target_edge_length,
        seed,
        engine.name()
    );
    let seed_residual = probe_and_record(&state, seed, cancel, &probe);

    if state.borrow().within_tolerance() {
        info!("volume calibration: seed size already within tolerance");
    } else {
        let bracket = size_bracket(seed, seed_residual);
        search_bracket(&state, bracket, settings, cancel, &probe);
    }

    let state = state.into_inner();
    let within_tolerance = state.within_tolerance();
    let (mut evaluations, best) = state.finish();

    let (element_size, edge_length, artifact, within_tolerance, fallback) = match best {
        Some((best, artifact)) => (
            best.parameter,
            best.edge_length.unwrap_or_default(),
            artifact,
            within_tolerance,
            false,
        ),
        None => {
            warn!(
                "volume calibration: all {} probes failed, meshing once at the target size",
                evaluations.len()
            );
            if cancel.load(Ordering::Relaxed) {
                return Err(CalimeshError::Calibration(
                    "Volume calibration cancelled".to_owned(),
                ));
            }

            let size = settings.target_edge_length;
            let Probe { count, measured } = generate_and_measure(engine, surface, size);
            let (edge, artifact) = measured.map_err(|err| {
                CalimeshError::Calibration(format!("Fallback volume mesh failed: {err}"))
            })?;
            evaluations.push(CalibrationEvaluation {
                parameter: size,
                edge_length: Some(edge),
                difference: (edge - settings.target_edge_length).abs(),
                count,
            });
            (size, edge, artifact, false, true)
        }
    };

    let tetrahedra = artifact.mesh.count(ElementKind::Tetrahedron);
    if tetrahedra < settings.min_tetrahedra {
        return Err(CalimeshError::Calibration(format!(
            "Volume mesh has {tetrahedra} tetrahedra, at least {} are required",
            settings.min_tetrahedra
        )));
    }

    info!(
        "volume calibration: size {:.4} gives edge length {:.4} with {} tetrahedra after {} probes{}",
        element_size,
        edge_length,
        tetrahedra,
        evaluations.len(),
        if within_tolerance { "" } else { " (outside tolerance)" }
    );

    Ok(VolumeCalibration {
        element_size,
        edge_length,
        within_tolerance,
        fallback,
        mesh: artifact.mesh,
        native: artifact.native,
        evaluations,
    })
}
