use std::{collections::BTreeSet, path::{Path, PathBuf}};

use json::JsonValue;
use tracing::warn;

use crate::{
    calibration::CalibrationSettings,
    error::{CalimeshError, Result},
    exporter::{abaqus::AbaqusSettings, summit::SummitMaterial, OutputFormat},
    material::MaterialSettings,
    mesher::{GmshMesher, ScriptMesher, VolumeMeshEngine},
    quality::POOR_ASPECT_RATIO,
    remesher::CommandRemesher,
};

const SECTIONS: [&str; 6] = ["mesh", "remesher", "mesher", "material", "export", "quality"];

/// Which volume mesher adapter to drive
#[derive(Debug, Clone)]
pub enum MesherConfig {
    Script(ScriptMesher),
    Gmsh(GmshMesher),
}

impl Default for MesherConfig {
    fn default() -> Self {
        MesherConfig::Gmsh(GmshMesher::default())
    }
}

impl MesherConfig {
    pub fn engine(&self) -> &dyn VolumeMeshEngine {
        match self {
            MesherConfig::Script(script) => script,
            MesherConfig::Gmsh(gmsh) => gmsh,
        }
    }
}

/// Everything a run needs besides the input paths
#[derive(Debug, Clone)]
pub struct Config {
    pub calibration: CalibrationSettings,
    /// No default exists; `generate` needs one from the file or the CLI
    pub remesher: Option<CommandRemesher>,
    pub mesher: MesherConfig,
    pub material: MaterialSettings,
    pub formats: BTreeSet<OutputFormat>,
    pub abaqus: AbaqusSettings,
    pub summit: SummitMaterial,
    pub poor_threshold: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            calibration: CalibrationSettings::default(),
            remesher: None,
            mesher: MesherConfig::default(),
            material: MaterialSettings::default(),
            formats: OutputFormat::ALL.into_iter().collect(),
            abaqus: AbaqusSettings::default(),
            summit: SummitMaterial::default(),
            poor_threshold: POOR_ASPECT_RATIO,
        }
    }
}

/// Loads the input file as json
///
/// # Arguments
/// * `input_file` - The path to the input file
///
/// # Returns
/// A JsonValue object
pub fn load_input_file(input_file: &Path) -> Result<JsonValue> {
    let file_string = match std::fs::read_to_string(input_file) {
        Ok(f) => f,
        Err(_err) => {
            return Err(CalimeshError::Input(format!(
                "Unable to open input file {}",
                input_file.display()
            )))
        }
    };

    let input_file_json = match json::parse(&file_string) {
        Ok(f) => f,
        Err(err) => {
            return Err(CalimeshError::Input(format!(
                "Error in input file json: {err}"
            )))
        }
    };

    if !input_file_json.is_object() {
        return Err(CalimeshError::Input(
            "Input json must be an object of sections".to_string(),
        ));
    }
    for (name, section) in input_file_json.entries() {
        if !SECTIONS.contains(&name) {
            warn!("ignoring unknown input section '{name}'");
        } else if !section.is_object() {
            return Err(CalimeshError::Input(format!(
                "Input json section {name} must be an object"
            )));
        }
    }

    Ok(input_file_json)
}

/// Reads and parses a configuration file
pub fn load_config(input_file: &Path) -> Result<Config> {
    let input_json = load_input_file(input_file)?;
    parse_config(&input_json)
}

/// Builds a configuration from parsed json; absent sections and fields keep
/// their defaults
pub fn parse_config(input_json: &JsonValue) -> Result<Config> {
    let (abaqus, summit, formats) = parse_export(input_json)?;

    Ok(Config {
        calibration: parse_mesh_settings(input_json)?,
        remesher: parse_remesher(input_json)?,
        mesher: parse_mesher(input_json)?,
        material: parse_material(input_json)?,
        formats,
        abaqus,
        summit,
        poor_threshold: parse_quality(input_json)?,
    })
}

fn number(input_json: &JsonValue, section: &str, field: &str, default: f64) -> Result<f64> {
    if !input_json[section].has_key(field) {
        return Ok(default);
    }
    match input_json[section][field].as_f64() {
        Some(value) if value.is_finite() => Ok(value),
        _ => Err(CalimeshError::Input(format!(
            "Input json field {section}.{field} must be a number"
        ))),
    }
}

fn count(input_json: &JsonValue, section: &str, field: &str, default: usize) -> Result<usize> {
    if !input_json[section].has_key(field) {
        return Ok(default);
    }
    match input_json[section][field].as_usize() {
        Some(value) => Ok(value),
        None => Err(CalimeshError::Input(format!(
            "Input json field {section}.{field} must be a non-negative integer"
        ))),
    }
}

fn text<'a>(input_json: &'a JsonValue, section: &str, field: &str) -> Result<Option<&'a str>> {
    if !input_json[section].has_key(field) {
        return Ok(None);
    }
    match input_json[section][field].as_str() {
        Some(value) => Ok(Some(value)),
        None => Err(CalimeshError::Input(format!(
            "Input json field {section}.{field} must be a string"
        ))),
    }
}

fn strings(input_json: &JsonValue, section: &str, field: &str) -> Result<Vec<String>> {
    let value = &input_json[section][field];
    if value.is_null() {
        return Ok(Vec::new());
    }
    if !value.is_array() {
        return Err(CalimeshError::Input(format!(
            "Input json field {section}.{field} must be a list of strings"
        )));
    }

    let mut out = Vec::new();
    for member in value.members() {
        match member.as_str() {
            Some(s) => out.push(s.to_owned()),
            None => {
                return Err(CalimeshError::Input(format!(
                    "Input json field {section}.{field} must be a list of strings"
                )))
            }
        }
    }
    Ok(out)
}

/// Parses the calibration targets from the `mesh` section
///
/// # Arguments
/// * `input_json` - The input file as a JsonValue object
///
/// # Returns
/// Validated calibration settings
pub fn parse_mesh_settings(input_json: &JsonValue) -> Result<CalibrationSettings> {
    let defaults = CalibrationSettings::default();

    let settings = CalibrationSettings {
        target_edge_length: number(input_json, "mesh", "target_edge_length", defaults.target_edge_length)?,
        tolerance: number(input_json, "mesh", "tolerance", defaults.tolerance)?,
        max_iterations: count(input_json, "mesh", "max_iterations", defaults.max_iterations as usize)? as u64,
        initial_ratio: number(input_json, "mesh", "initial_ratio", defaults.initial_ratio)?,
        min_tetrahedra: count(input_json, "mesh", "min_tetrahedra", defaults.min_tetrahedra)?,
    };
    settings.validate()?;

    Ok(settings)
}

/// Parses the external surface remesher, if one is configured
pub fn parse_remesher(input_json: &JsonValue) -> Result<Option<CommandRemesher>> {
    let Some(program) = text(input_json, "remesher", "program")? else {
        if input_json["remesher"].has_key("args") {
            return Err(CalimeshError::Input(
                "Input json remesher section has args but no program".to_string(),
            ));
        }
        return Ok(None);
    };

    Ok(Some(CommandRemesher {
        program: PathBuf::from(program),
        args: strings(input_json, "remesher", "args")?,
    }))
}

/// Parses the volume mesher adapter. `kind` is `gmsh` (default) or
/// `script`; a script needs a program.
pub fn parse_mesher(input_json: &JsonValue) -> Result<MesherConfig> {
    let kind = text(input_json, "mesher", "kind")?.unwrap_or("gmsh");
    let program = text(input_json, "mesher", "program")?;

    match kind {
        "gmsh" => Ok(MesherConfig::Gmsh(GmshMesher {
            program: program.map_or_else(|| GmshMesher::default().program, PathBuf::from),
        })),
        "script" => {
            let Some(program) = program else {
                return Err(CalimeshError::Input(
                    "Input json mesher of kind script is missing program".to_string(),
                ));
            };
            Ok(MesherConfig::Script(ScriptMesher {
                program: PathBuf::from(program),
                args: strings(input_json, "mesher", "args")?,
            }))
        }
        other => Err(CalimeshError::Input(format!(
            "Unknown mesher kind '{other}', expected gmsh or script"
        ))),
    }
}

/// Parses the intensity to density map from the `material` section
pub fn parse_material(input_json: &JsonValue) -> Result<MaterialSettings> {
    let defaults = MaterialSettings::default();

    let enabled = if input_json["material"].has_key("enabled") {
        match input_json["material"]["enabled"].as_bool() {
            Some(b) => b,
            None => {
                return Err(CalimeshError::Input(
                    "Input json field material.enabled must be true or false".to_string(),
                ))
            }
        }
    } else {
        defaults.enabled
    };

    let settings = MaterialSettings {
        enabled,
        slope: number(input_json, "material", "slope", defaults.slope)?,
        intercept: number(input_json, "material", "intercept", defaults.intercept)?,
        neighborhood_radius: count(input_json, "material", "neighborhood_radius", defaults.neighborhood_radius)?,
        resolution_factor: number(input_json, "material", "resolution_factor", defaults.resolution_factor)?,
        density_per_volume_fraction: number(
            input_json,
            "material",
            "density_per_volume_fraction",
            defaults.density_per_volume_fraction,
        )?,
        min_volume_fraction: number(input_json, "material", "min_volume_fraction", defaults.min_volume_fraction)?,
    };
    settings.validate().map_err(|err| CalimeshError::Input(err.to_string()))?;

    Ok(settings)
}

/// Parses the format selection and the exporter settings
///
/// # Returns
/// The Abaqus settings, the Summit material and the selected formats
pub fn parse_export(
    input_json: &JsonValue,
) -> Result<(AbaqusSettings, SummitMaterial, BTreeSet<OutputFormat>)> {
    let formats = match strings(input_json, "export", "formats")? {
        names if names.is_empty() => OutputFormat::ALL.into_iter().collect(),
        names => OutputFormat::parse_many(&names)?,
    };

    let abaqus_defaults = AbaqusSettings::default();
    let abaqus = AbaqusSettings {
        load: number(input_json, "export", "abaqus_load", abaqus_defaults.load)?,
        surface_tolerance: number(input_json, "export", "abaqus_surface_tolerance", abaqus_defaults.surface_tolerance)?,
        poisson_ratio: number(input_json, "export", "abaqus_poisson_ratio", abaqus_defaults.poisson_ratio)?,
        modulus_scale: number(input_json, "export", "abaqus_modulus_scale", abaqus_defaults.modulus_scale)?,
        default_modulus: number(input_json, "export", "abaqus_default_modulus", abaqus_defaults.default_modulus)?,
    };

    let summit = SummitMaterial {
        power_law_exponent: number(
            input_json,
            "export",
            "summit_exponent",
            SummitMaterial::default().power_law_exponent,
        )?,
        ..SummitMaterial::default()
    };

    Ok((abaqus, summit, formats))
}

/// Parses the poor element threshold from the `quality` section
pub fn parse_quality(input_json: &JsonValue) -> Result<f64> {
    let threshold = number(input_json, "quality", "poor_threshold", POOR_ASPECT_RATIO)?;
    if !(threshold >= 1.0) {
        return Err(CalimeshError::Input(format!(
            "Poor aspect ratio threshold must be at least 1, got {threshold}"
        )));
    }
    Ok(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config> {
        parse_config(&json::parse(text).unwrap())
    }

    #[test]
    fn empty_object_gives_defaults() {
        let config = parse("{}").unwrap();

        assert_eq!(config.calibration, CalibrationSettings::default());
        assert_eq!(config.material, MaterialSettings::default());
        assert!(config.remesher.is_none());
        assert!(matches!(config.mesher, MesherConfig::Gmsh(_)));
        assert_eq!(config.formats.len(), OutputFormat::ALL.len());
        assert_eq!(config.poor_threshold, 5.0);
    }

    #[test]
    fn fields_override_defaults() {
        let config = parse(
            r#"{
                "mesh": { "target_edge_length": 0.9, "max_iterations": 12 },
                "remesher": { "program": "/opt/remesh", "args": ["--isotropic"] },
                "mesher": { "kind": "script", "program": "tetgen.sh", "args": ["-q"] },
                "material": { "enabled": false, "slope": 0.65, "neighborhood_radius": 1 },
                "export": { "formats": ["vtk", "inp"], "abaqus_load": 250.0, "summit_exponent": 1.49 },
                "quality": { "poor_threshold": 4.0 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.calibration.target_edge_length, 0.9);
        assert_eq!(config.calibration.max_iterations, 12);
        assert_eq!(config.calibration.initial_ratio, 1.62);
        let remesher = config.remesher.unwrap();
        assert_eq!(remesher.program, PathBuf::from("/opt/remesh"));
        assert_eq!(remesher.args, vec!["--isotropic".to_owned()]);
        match config.mesher {
            MesherConfig::Script(script) => assert_eq!(script.args, vec!["-q".to_owned()]),
            other => panic!("expected a script mesher, got {other:?}"),
        }
        assert!(!config.material.enabled);
        assert_eq!(config.material.neighborhood_radius, 1);
        assert_eq!(config.material.intercept, 5.1);
        assert_eq!(
            config.formats,
            BTreeSet::from([OutputFormat::Vtk, OutputFormat::Abaqus])
        );
        assert_eq!(config.abaqus.load, 250.0);
        assert_eq!(config.summit.power_law_exponent, 1.49);
        assert_eq!(config.poor_threshold, 4.0);
    }

    #[test]
    fn bad_values_are_input_errors() {
        let cases = [
            r#"{ "mesh": { "tolerance": "small" } }"#,
            r#"{ "mesh": { "tolerance": 1.5 } }"#,
            r#"{ "mesh": { "max_iterations": -3 } }"#,
            r#"{ "mesher": { "kind": "netgen" } }"#,
            r#"{ "mesher": { "kind": "script" } }"#,
            r#"{ "export": { "formats": ["obj"] } }"#,
            r#"{ "material": { "resolution_factor": 0.0 } }"#,
            r#"{ "quality": { "poor_threshold": 0.5 } }"#,
        ];

        for case in cases {
            assert!(
                matches!(parse(case), Err(CalimeshError::Input(_))),
                "{case} should be rejected"
            );
        }
    }

    #[test]
    fn load_input_file_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, "{ \"mesh\": ").unwrap();

        assert!(matches!(load_input_file(&path), Err(CalimeshError::Input(_))));
        assert!(matches!(
            load_input_file(&dir.path().join("missing.json")),
            Err(CalimeshError::Input(_))
        ));

        std::fs::write(&path, "{ \"mesh\": 3 }").unwrap();
        assert!(load_input_file(&path).is_err());

        std::fs::write(&path, "{ \"mesh\": { \"tolerance\": 0.1 }, \"notes\": \"x\" }").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.calibration.tolerance, 0.1);
    }
}
