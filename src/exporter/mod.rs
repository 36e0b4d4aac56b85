//! Readers and writers for the mesh file formats the pipeline produces.

pub mod abaqus;
pub mod msh;
pub mod stl;
pub mod summit;
pub mod tables;
pub mod vtk;

use std::{collections::BTreeSet, path::Path};

use crate::error::{CalimeshError, Result};

/// File families selectable for export
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputFormat {
    Vtk,
    Stl,
    Abaqus,
    Msh,
    Summit,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Vtk,
        OutputFormat::Stl,
        OutputFormat::Abaqus,
        OutputFormat::Msh,
        OutputFormat::Summit,
    ];

    /// Resolves a format selector. `all` expands to every format.
    pub fn parse_selection(name: &str) -> Result<Vec<OutputFormat>> {
        match name.trim().to_lowercase().as_str() {
            "all" => Ok(OutputFormat::ALL.to_vec()),
            "vtk" => Ok(vec![OutputFormat::Vtk]),
            "stl" => Ok(vec![OutputFormat::Stl]),
            "inp" | "abaqus" => Ok(vec![OutputFormat::Abaqus]),
            "msh" | "gmsh" => Ok(vec![OutputFormat::Msh]),
            "summit" => Ok(vec![OutputFormat::Summit]),
            other => Err(CalimeshError::Input(format!(
                "Unrecognized output format '{other}'"
            ))),
        }
    }

    /// Resolves several selectors into a set
    pub fn parse_many<S: AsRef<str>>(names: &[S]) -> Result<BTreeSet<OutputFormat>> {
        let mut formats = BTreeSet::new();
        for name in names {
            formats.extend(OutputFormat::parse_selection(name.as_ref())?);
        }
        Ok(formats)
    }
}

/// Formats a number the way C's `%.Ne` does: `4.00000e+09`
pub(crate) fn sci(value: f64, precision: usize) -> String {
    signed_exponent(format!("{:.*e}", precision, value))
}

/// Shortest round-trip form that always shows a fraction or an exponent:
/// `1.0`, `0.001`, `1e-07`, `1.5e+16`
pub(crate) fn float(value: f64) -> String {
    signed_exponent(format!("{value:?}"))
}

/// Rewrites a Rust exponent (`e9`, `e-7`) as a signed two-digit one
fn signed_exponent(formatted: String) -> String {
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => match exponent.parse::<i32>() {
            Ok(exp) => format!(
                "{mantissa}e{}{:02}",
                if exp < 0 { '-' } else { '+' },
                exp.abs()
            ),
            Err(_) => formatted,
        },
        None => formatted,
    }
}

/// Writes a text file, mapping failures to an I/O error on `path`
pub(crate) fn write_text(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|err| CalimeshError::io(path, err))
}

/// Checks that a property table lines up with the tetrahedra it describes
pub(crate) fn check_table_length(rows: usize, tetrahedra: usize, target: &str) -> Result<()> {
    if rows != tetrahedra {
        return Err(CalimeshError::Export(format!(
            "{target}: element property table has {rows} rows but the mesh has {tetrahedra} tetrahedra"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sci_matches_printf() {
        assert_eq!(sci(4e9, 5), "4.00000e+09");
        assert_eq!(sci(0.00123, 3), "1.230e-03");
        assert_eq!(sci(0.0, 2), "0.00e+00");
        assert_eq!(sci(1.5e120, 1), "1.5e+120");
    }

    #[test]
    fn float_keeps_a_fraction() {
        assert_eq!(float(1.0), "1.0");
        assert_eq!(float(-1000.0), "-1000.0");
        assert_eq!(float(0.001), "0.001");
        assert_eq!(float(0.3), "0.3");
        assert_eq!(float(1e-7), "1e-07");
        assert_eq!(float(1.5e16), "1.5e+16");
    }

    #[test]
    fn format_selection() {
        assert_eq!(OutputFormat::parse_selection("all").unwrap().len(), 5);
        let set = OutputFormat::parse_many(&["vtk", "INP", "vtk"]).unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec![OutputFormat::Vtk, OutputFormat::Abaqus]
        );
        assert!(OutputFormat::parse_selection("obj").is_err());
    }
}
