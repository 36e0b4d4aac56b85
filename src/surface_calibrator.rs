use std::{cell::RefCell, sync::atomic::AtomicBool};

use tracing::info;

use crate::{
    calibration::{
        probe_and_record, search_bracket, CalibrationSettings, CalibrationState, Probe,
        SurfaceCalibration,
    },
    datatypes::{ElementKind, Mesh},
    error::{CalimeshError, Result},
    geometry,
    remesher::RemeshEngine,
};

const MIN_RATIO: f64 = 0.1;
const MAX_RATIO: f64 = 20.0;

/// Interval searched after the seed ratio. A coarse surface needs more
/// points, a fine one fewer; after a failed seed both sides are searched.
fn ratio_bracket(seed: f64, seed_residual: f64) -> (f64, f64) {
    let lower = MIN_RATIO.max(0.25 * seed);
    let upper = MAX_RATIO.min(4.0 * seed);

    if seed_residual.is_infinite() {
        (lower, upper)
    } else if seed_residual > 0.0 {
        (seed, upper)
    } else {
        (lower, seed)
    }
}

/// Finds the point-density ratio that makes the remeshed surface reach the
/// target mean edge length
///
/// # Arguments
/// * `engine` - The surface remesher
/// * `surface` - The closed input surface
/// * `area` - Area of `surface`
/// * `settings` - Target, tolerance and budgets
/// * `cancel` - Checked before every probe
///
/// # Returns
/// The best surface found, or a `Calibration` error when no probe produced
/// a usable mesh
pub fn calibrate_surface(
    engine: &dyn RemeshEngine,
    surface: &Mesh,
    area: f64,
    settings: &CalibrationSettings,
    cancel: &AtomicBool,
) -> Result<SurfaceCalibration> {
    settings.validate()?;
    if !(area > 0.0) || !area.is_finite() {
        return Err(CalimeshError::Calibration(format!(
            "Surface area must be positive, got {area}"
        )));
    }

    let probe = |ratio: f64| -> Probe<Mesh> {
        let requested = area * ratio;
        let points = engine.quantize(requested);

        let measured = engine.remesh(surface, points).and_then(|mesh| {
            let edge = geometry::measure_edge_length(&mesh, ElementKind::Triangle)?;
            Ok((edge, mesh))
        });
        Probe {
            count: points,
            measured,
        }
    };

    let state = RefCell::new(CalibrationState::new("surface calibration", settings));
    let seed = settings.initial_ratio;

    info!(
        "surface calibration: target {:.4}, seed ratio {:.4} ({} engine)",
        settings.target_edge_length,
        seed,
        engine.name()
    );
    let seed_residual = probe_and_record(&state, seed, cancel, &probe);

    if state.borrow().within_tolerance() {
        info!("surface calibration: seed ratio already within tolerance");
    } else {
        let bracket = ratio_bracket(seed, seed_residual);
        search_bracket(&state, bracket, settings, cancel, &probe);
    }

    let state = state.into_inner();
    let within_tolerance = state.within_tolerance();
    let (evaluations, best) = state.finish();

    let Some((best, mesh)) = best else {
        return Err(CalimeshError::Calibration(format!(
            "All {} surface remesh probes failed",
            evaluations.len()
        )));
    };

    let edge_length = best.edge_length.unwrap_or_default();
    info!(
        "surface calibration: ratio {:.4} gives edge length {:.4} after {} probes{}",
        best.parameter,
        edge_length,
        evaluations.len(),
        if within_tolerance { "" } else { " (outside tolerance)" }
    );

    Ok(SurfaceCalibration {
        ratio: best.parameter,
        edge_length,
        requested_points: area * best.parameter,
        quantized_points: best.count,
        within_tolerance,
        mesh,
        evaluations,
    })
}
