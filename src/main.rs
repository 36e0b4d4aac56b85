use std::{
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{bail, Context, Result};
use calimesh::{
    config::{self, Config, MesherConfig},
    datatypes::{ElementKind, Mesh},
    exporter::{vtk, OutputFormat},
    intensity,
    mesher::{self, GmshMesher, ScriptMesher},
    pipeline::{self, Engines},
    quality,
    remesher::CommandRemesher,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// calimesh - calibrated tetrahedral meshes from segmented CT surfaces
#[derive(Parser)]
#[command(name = "calimesh")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate, mesh and export every segment surface
    Generate {
        /// A segment STL, or a directory of them
        input: PathBuf,

        /// Output directory, one subdirectory per segment
        #[arg(short, long)]
        output: PathBuf,

        /// JSON input file with calibration, engine and export settings
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// CT volume (.mha, .mhd or .vtk) for material mapping
        #[arg(long)]
        volume: Option<PathBuf>,

        /// Target mean edge length in mm
        #[arg(long)]
        target_edge_length: Option<f64>,

        /// Accepted deviation as a fraction of the target
        #[arg(long)]
        tolerance: Option<f64>,

        /// Probe budget of each calibration stage
        #[arg(long)]
        max_iterations: Option<u64>,

        /// Surface remesher program, called as `<program> <in.stl> <out.stl> <points>`
        #[arg(long)]
        remesher: Option<PathBuf>,

        /// Volume mesher script, called as `<program> <in.stl> <out.msh> <size>`
        #[arg(long, conflicts_with = "gmsh")]
        mesher: Option<PathBuf>,

        /// Path to the gmsh executable
        #[arg(long)]
        gmsh: Option<PathBuf>,

        /// Output formats: all, vtk, stl, inp, msh, summit
        #[arg(long, value_delimiter = ',')]
        format: Vec<String>,

        /// Skip material mapping even when a volume is given
        #[arg(long)]
        no_material: bool,
    },

    /// Recompute element properties for every volume mesh in an output directory
    Materials {
        /// Directory previously written by `generate`
        output: PathBuf,

        /// CT volume (.mha, .mhd or .vtk)
        #[arg(long)]
        volume: PathBuf,

        /// JSON input file; only the material section is used
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Slope of the intensity to density map
        #[arg(long)]
        slope: Option<f64>,

        /// Intercept of the intensity to density map
        #[arg(long)]
        intercept: Option<f64>,
    },

    /// Report aspect ratio quality of a tetrahedral mesh
    Quality {
        /// Volume mesh (.vtk or .msh)
        mesh: PathBuf,

        /// Aspect ratio above which an element is poor
        #[arg(long, default_value_t = quality::POOR_ASPECT_RATIO)]
        threshold: f64,

        /// Write the mesh with per-element metrics attached as VTK
        #[arg(long)]
        metrics_output: Option<PathBuf>,
    },
}

/// Initializes the tracing subscriber. RUST_LOG wins over the -v flags.
fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "calimesh=info",
            1 => "calimesh=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos:>3}% {msg}") {
        bar.set_style(style);
    }
    bar
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Ok(config::load_config(path)?),
        None => Ok(Config::default()),
    }
}

#[allow(clippy::too_many_arguments)]
fn generate(
    input: &Path,
    output: &Path,
    config_path: Option<&Path>,
    volume_path: Option<&Path>,
    target_edge_length: Option<f64>,
    tolerance: Option<f64>,
    max_iterations: Option<u64>,
    remesher: Option<PathBuf>,
    mesher: Option<PathBuf>,
    gmsh: Option<PathBuf>,
    formats: &[String],
    no_material: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;

    if let Some(target) = target_edge_length {
        config.calibration.target_edge_length = target;
    }
    if let Some(tolerance) = tolerance {
        config.calibration.tolerance = tolerance;
    }
    if let Some(max_iterations) = max_iterations {
        config.calibration.max_iterations = max_iterations;
    }
    config.calibration.validate()?;

    if let Some(program) = remesher {
        config.remesher = Some(CommandRemesher {
            program,
            args: Vec::new(),
        });
    }
    if let Some(program) = mesher {
        config.mesher = MesherConfig::Script(ScriptMesher {
            program,
            args: Vec::new(),
        });
    }
    if let Some(program) = gmsh {
        config.mesher = MesherConfig::Gmsh(GmshMesher { program });
    }
    if !formats.is_empty() {
        config.formats = OutputFormat::parse_many(formats)?;
    }
    if no_material {
        config.material.enabled = false;
    }

    let Some(remesher) = config.remesher.clone() else {
        bail!("No surface remesher configured, pass --remesher or set remesher.program");
    };

    let volume = match volume_path {
        Some(path) if config.material.enabled => Some(
            intensity::load_volume(path)
                .with_context(|| format!("Failed to load volume {}", path.display()))?,
        ),
        Some(_) => None,
        None => {
            if config.material.enabled {
                warn!("no intensity volume given, material mapping is skipped");
            }
            None
        }
    };

    let segments = pipeline::discover_segments(input)?;
    info!("found {} segments in {}", segments.len(), input.display());

    let engines = Engines {
        remesher: &remesher,
        mesher: config.mesher.engine(),
    };
    let cancel = AtomicBool::new(false);
    let bar = progress_bar();
    let mut on_progress = |percent: f64, message: &str| {
        bar.set_position(percent.clamp(0.0, 100.0) as u64);
        bar.set_message(message.to_owned());
    };

    let outcome = pipeline::run(
        &segments,
        output,
        &config,
        engines,
        volume.as_ref(),
        &mut on_progress,
        &cancel,
    )?;
    bar.finish_and_clear();

    let summary_path = outcome.write_summary(output)?;

    println!("Mesh generation complete");
    println!("Total meshes: {}", outcome.summary.total_meshes);
    println!("Total elements: {}", outcome.summary.total_elements);
    if let Some(edge) = outcome.summary.average_edge_length {
        println!("Average edge length: {edge:.2}mm");
    }
    for segment in &outcome.segments {
        println!(
            "  {:<12} {:>8} elements  {:.2}mm  {:.1}% poor",
            segment.name,
            segment.quality.element_count,
            segment.calibration.volume.edge_length,
            segment.quality.poor_percent
        );
    }
    println!("Summary written to {}", summary_path.display());

    if !outcome.failures.is_empty() {
        for failure in &outcome.failures {
            eprintln!("{}: {} failed: {}", failure.segment, failure.stage, failure.error);
        }
        bail!("{} of {} segments failed", outcome.failures.len(), segments.len());
    }

    Ok(())
}

fn materials(
    output: &Path,
    volume_path: &Path,
    config_path: Option<&Path>,
    slope: Option<f64>,
    intercept: Option<f64>,
) -> Result<()> {
    let mut settings = load_config(config_path)?.material;
    if let Some(slope) = slope {
        settings.slope = slope;
    }
    if let Some(intercept) = intercept {
        settings.intercept = intercept;
    }

    let volume = intensity::load_volume(volume_path)
        .with_context(|| format!("Failed to load volume {}", volume_path.display()))?;

    let cancel = AtomicBool::new(false);
    let bar = progress_bar();
    let mut on_progress = |percent: f64, message: &str| {
        bar.set_position(percent.clamp(0.0, 100.0) as u64);
        bar.set_message(message.to_owned());
    };

    let (remapped, failures) =
        pipeline::remap_materials(output, &volume, &settings, &mut on_progress, &cancel)?;
    bar.finish_and_clear();

    for mesh in &remapped {
        println!(
            "{}: {} elements -> {}",
            mesh.segment,
            mesh.elements,
            mesh.properties_path.display()
        );
    }
    if !failures.is_empty() {
        for failure in &failures {
            eprintln!("{}: {} failed: {}", failure.segment, failure.stage, failure.error);
        }
        bail!("{} meshes failed", failures.len());
    }

    Ok(())
}

fn read_volume_mesh(path: &Path) -> Result<Mesh> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let mesh = match extension.as_str() {
        "vtk" => vtk::read_vtk(path)?,
        "msh" => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Unable to read {}", path.display()))?;
            mesher::parse_msh(&contents)?
        }
        other => bail!("Unsupported mesh format '.{other}'"),
    };

    Ok(mesh.strip_triangles())
}

fn quality_report(path: &Path, threshold: f64, metrics_output: Option<&Path>) -> Result<()> {
    let mut mesh = read_volume_mesh(path)?;
    if mesh.count(ElementKind::Tetrahedron) == 0 {
        bail!("{} has no tetrahedra", path.display());
    }

    let report = quality::analyze(&mesh, threshold);
    println!("Elements: {}", report.element_count);
    println!("Mean aspect ratio: {:.4}", report.mean_aspect_ratio);
    println!("Max aspect ratio: {:.4}", report.max_aspect_ratio);
    println!(
        "Poor elements (> {threshold}): {} ({:.2}%)",
        report.poor_count, report.poor_percent
    );

    if let Some(out) = metrics_output {
        quality::attach_metrics(&mut mesh)?;
        vtk::write_vtk(&mesh, out)?;
        println!("Metrics written to {}", out.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Generate {
            input,
            output,
            config,
            volume,
            target_edge_length,
            tolerance,
            max_iterations,
            remesher,
            mesher,
            gmsh,
            format,
            no_material,
        } => generate(
            &input,
            &output,
            config.as_deref(),
            volume.as_deref(),
            target_edge_length,
            tolerance,
            max_iterations,
            remesher,
            mesher,
            gmsh,
            &format,
            no_material,
        ),
        Commands::Materials {
            output,
            volume,
            config,
            slope,
            intercept,
        } => materials(&output, &volume, config.as_deref(), slope, intercept),
        Commands::Quality {
            mesh,
            threshold,
            metrics_output,
        } => quality_report(&mesh, threshold, metrics_output.as_deref()),
    }
}
