use std::{
    cell::RefCell,
    sync::atomic::{AtomicBool, Ordering},
};

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        CostFunction, Error, Executor, State, KV,
    },
    solver::brent::BrentRoot,
};
use tracing::{debug, info, warn};

use crate::{
    datatypes::Mesh,
    error::{CalimeshError, Result},
};

/// Targets and budgets shared by the surface and volume calibrations
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    pub target_edge_length: f64,
    /// Accepted deviation as a fraction of the target
    pub tolerance: f64,
    /// Upper bound on probes per stage
    pub max_iterations: u64,
    /// Seed of the surface point-density ratio
    pub initial_ratio: f64,
    /// Smallest tetrahedron count accepted from the volume mesher
    pub min_tetrahedra: usize,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        CalibrationSettings {
            target_edge_length: 1.37,
            tolerance: 0.05,
            max_iterations: 20,
            initial_ratio: 1.62,
            min_tetrahedra: 100,
        }
    }
}

impl CalibrationSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.target_edge_length > 0.0) || !self.target_edge_length.is_finite() {
            return Err(CalimeshError::Input(format!(
                "Target edge length must be positive, got {}",
                self.target_edge_length
            )));
        }
        if !(self.tolerance > 0.0) || self.tolerance >= 1.0 {
            return Err(CalimeshError::Input(format!(
                "Tolerance must lie in (0, 1), got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(CalimeshError::Input(
                "At least one calibration iteration is required".to_owned(),
            ));
        }
        if !(self.initial_ratio > 0.0) {
            return Err(CalimeshError::Input(format!(
                "Initial ratio must be positive, got {}",
                self.initial_ratio
            )));
        }
        Ok(())
    }

    /// Absolute edge length deviation accepted as converged
    pub fn tolerance_abs(&self) -> f64 {
        self.tolerance * self.target_edge_length
    }

    /// Parameter tolerance handed to the root finder
    pub fn root_tolerance(&self) -> f64 {
        self.tolerance_abs() / 10.0
    }

    /// Iteration budget of the root finder, leaving room for the seed and
    /// the two bracket evaluations
    pub fn root_iterations(&self) -> u64 {
        (self.max_iterations / 2).max(1)
    }
}

/// One probe of a calibration loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationEvaluation {
    /// The candidate ratio or element size
    pub parameter: f64,
    /// Measured mean edge length; `None` for a failed probe
    pub edge_length: Option<f64>,
    /// `|edge_length - target|`, infinite for a failed probe
    pub difference: f64,
    /// Points requested from the remesher, or tetrahedra produced
    pub count: usize,
}

impl CalibrationEvaluation {
    pub fn failed(&self) -> bool {
        self.edge_length.is_none()
    }
}

/// What a probe hands back to the calibration state
pub(crate) struct Probe<A> {
    pub count: usize,
    /// Mean edge length and the artifact that produced it
    pub measured: Result<(f64, A)>,
}

/// Evaluations of one calibration plus the best artifact so far. Artifacts
/// that lose the comparison are dropped on the spot.
pub(crate) struct CalibrationState<A> {
    label: &'static str,
    target: f64,
    tolerance_abs: f64,
    evaluations: Vec<CalibrationEvaluation>,
    best: Option<(usize, A)>,
}

impl<A> CalibrationState<A> {
    pub fn new(label: &'static str, settings: &CalibrationSettings) -> CalibrationState<A> {
        CalibrationState {
            label,
            target: settings.target_edge_length,
            tolerance_abs: settings.tolerance_abs(),
            evaluations: Vec::new(),
            best: None,
        }
    }

    /// Records a probe and returns the signed residual seen by the root
    /// finder: zero inside the tolerance band, infinite for a failure
    pub fn record(&mut self, parameter: f64, probe: Probe<A>) -> f64 {
        match probe.measured {
            Ok((edge_length, artifact)) => {
                let difference = (edge_length - self.target).abs();
                let improves = match &self.best {
                    Some((i, _)) => difference < self.evaluations[*i].difference,
                    None => true,
                };

                self.evaluations.push(CalibrationEvaluation {
                    parameter,
                    edge_length: Some(edge_length),
                    difference,
                    count: probe.count,
                });
                if improves {
                    self.best = Some((self.evaluations.len() - 1, artifact));
                }

                debug!(
                    "{}: parameter {:.4} gave edge length {:.4} (diff {:.4}, count {})",
                    self.label, parameter, edge_length, difference, probe.count
                );

                self.residual(edge_length)
            }
            Err(err) => {
                warn!("{}: probe at {:.4} failed: {err}", self.label, parameter);
                self.evaluations.push(CalibrationEvaluation {
                    parameter,
                    edge_length: None,
                    difference: f64::INFINITY,
                    count: probe.count,
                });
                f64::INFINITY
            }
        }
    }

    fn residual(&self, edge_length: f64) -> f64 {
        let residual = edge_length - self.target;
        if residual.abs() <= self.tolerance_abs {
            0.0
        } else {
            residual
        }
    }

    /// Residual of an already probed parameter
    pub fn recorded(&self, parameter: f64) -> Option<f64> {
        self.evaluations
            .iter()
            .find(|e| e.parameter == parameter)
            .map(|e| match e.edge_length {
                Some(edge) => self.residual(edge),
                None => f64::INFINITY,
            })
    }

    pub fn best_evaluation(&self) -> Option<&CalibrationEvaluation> {
        self.best.as_ref().map(|(i, _)| &self.evaluations[*i])
    }

    pub fn within_tolerance(&self) -> bool {
        self.best_evaluation()
            .map_or(false, |e| e.difference <= self.tolerance_abs)
    }

    pub fn evaluation_count(&self) -> usize {
        self.evaluations.len()
    }

    /// Gives up the evaluations and the best evaluation with its artifact
    pub fn finish(self) -> (Vec<CalibrationEvaluation>, Option<(CalibrationEvaluation, A)>) {
        let best = self
            .best
            .map(|(i, artifact)| (self.evaluations[i], artifact));
        (self.evaluations, best)
    }
}

/// Runs a probe unless the run was cancelled, recording the outcome
pub(crate) fn probe_and_record<A>(
    state: &RefCell<CalibrationState<A>>,
    parameter: f64,
    cancel: &AtomicBool,
    probe: &dyn Fn(f64) -> Probe<A>,
) -> f64 {
    let outcome = if cancel.load(Ordering::Relaxed) {
        Probe {
            count: 0,
            measured: Err(CalimeshError::Pipeline("Run cancelled".to_owned())),
        }
    } else {
        probe(parameter)
    };
    state.borrow_mut().record(parameter, outcome)
}

/// Cost function handed to the root finder. Every call probes the engine
/// unless the parameter was seen before or the target is already met.
struct ProbeCost<'a, A> {
    state: &'a RefCell<CalibrationState<A>>,
    probe: &'a dyn Fn(f64) -> Probe<A>,
    bounds: (f64, f64),
    cancel: &'a AtomicBool,
}

impl<'a, A> CostFunction for ProbeCost<'a, A> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, parameter: &Self::Param) -> std::result::Result<Self::Output, Error> {
        let parameter = *parameter;
        if !parameter.is_finite() || parameter < self.bounds.0 || parameter > self.bounds.1 {
            return Ok(f64::INFINITY);
        }

        if let Some(residual) = self.state.borrow().recorded(parameter) {
            return Ok(residual);
        }
        if self.state.borrow().within_tolerance() {
            return Ok(0.0);
        }

        Ok(probe_and_record(self.state, parameter, self.cancel, self.probe))
    }
}

/// Logs the root finder's iterations
struct CalibrationObserver {
    label: &'static str,
}

impl<I> Observe<I> for CalibrationObserver
where
    I: State<Param = f64, Float = f64>,
{
    fn observe_init(&mut self, name: &str, _state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        debug!("{}: starting {name}", self.label);
        Ok(())
    }

    fn observe_iter(&mut self, state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        debug!(
            "{}: iteration {} at {:?}, residual {:.4}",
            self.label,
            state.get_iter(),
            state.get_param(),
            state.get_cost()
        );
        Ok(())
    }

    fn observe_final(&mut self, state: &I) -> std::result::Result<(), Error> {
        debug!(
            "{}: root finder finished after {} iterations ({:?})",
            self.label,
            state.get_iter(),
            state.get_termination_status()
        );
        Ok(())
    }
}

/// Searches `bracket` for a parameter whose probe meets the target. A
/// bracket without a sign change or a solver failure is not an error: the
/// caller falls back on the best evaluation recorded so far.
pub(crate) fn search_bracket<A>(
    state: &RefCell<CalibrationState<A>>,
    bracket: (f64, f64),
    settings: &CalibrationSettings,
    cancel: &AtomicBool,
    probe: &dyn Fn(f64) -> Probe<A>,
) {
    let label = state.borrow().label;
    let (lower, upper) = bracket;
    if !(lower < upper) {
        info!("{label}: empty bracket [{lower:.4}, {upper:.4}], keeping best evaluation");
        return;
    }

    info!("{label}: searching [{lower:.4}, {upper:.4}]");
    let cost = ProbeCost {
        state,
        probe,
        bounds: bracket,
        cancel,
    };
    let solver = BrentRoot::new(lower, upper, settings.root_tolerance());

    let res = Executor::new(cost, solver)
        .configure(|state| state.max_iters(settings.root_iterations()))
        .add_observer(CalibrationObserver { label }, ObserverMode::Always)
        .run();

    match res {
        Ok(res) => debug!(
            "{label}: root finder stopped after {} iterations",
            res.state().get_iter()
        ),
        Err(err) => info!("{label}: root finder gave up ({err}), keeping best evaluation"),
    }
}

/// Calibrated surface mesh and the search that found it
#[derive(Debug, Clone)]
pub struct SurfaceCalibration {
    pub ratio: f64,
    pub edge_length: f64,
    /// `area · ratio` before quantization
    pub requested_points: f64,
    pub quantized_points: usize,
    pub within_tolerance: bool,
    pub mesh: Mesh,
    pub evaluations: Vec<CalibrationEvaluation>,
}

/// Calibrated volume mesh and the search that found it
#[derive(Debug, Clone)]
pub struct VolumeCalibration {
    pub element_size: f64,
    pub edge_length: f64,
    pub within_tolerance: bool,
    /// Set when every probe failed and the mesh came from the fallback run
    pub fallback: bool,
    /// Tetrahedra only
    pub mesh: Mesh,
    /// The mesher's file, boundary triangles included
    pub native: String,
    pub evaluations: Vec<CalibrationEvaluation>,
}

/// Outcome of both calibration stages for one segment
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub surface: SurfaceCalibration,
    pub volume: VolumeCalibration,
}

impl CalibrationResult {
    pub fn evaluation_count(&self) -> usize {
        self.surface.evaluations.len() + self.volume.evaluations.len()
    }
}
