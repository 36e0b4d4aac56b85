use std::{
    borrow::Cow,
    collections::HashMap,
    path::{Path, PathBuf},
};

use nalgebra::{Matrix3, Point3, Vector3};
use tracing::{debug, info};

use crate::{
    error::{CalimeshError, Result},
    exporter::vtk::{split_header, Tokens},
};

/// A scalar CT volume on a regular grid. Voxel `(i, j, k)` sits at
/// `origin + direction · (i·sx, j·sy, k·sz)`; `data` runs fastest along i.
#[derive(Debug, Clone, PartialEq)]
pub struct IntensityVolume {
    pub size: [usize; 3],
    pub spacing: Vector3<f64>,
    pub origin: Point3<f64>,
    /// Columns are the axis directions
    pub direction: Matrix3<f64>,
    inverse_direction: Matrix3<f64>,
    pub data: Vec<f64>,
}

/// Number of voxels in a grid, or an error when it overflows `usize`
fn voxel_count(size: [usize; 3]) -> Result<usize> {
    size[0]
        .checked_mul(size[1])
        .and_then(|n| n.checked_mul(size[2]))
        .ok_or_else(|| CalimeshError::Input(format!("Volume of size {:?} is too large", size)))
}

impl IntensityVolume {
    /// Builds a volume, checking the data length, spacing and direction
    pub fn new(
        size: [usize; 3],
        spacing: Vector3<f64>,
        origin: Point3<f64>,
        direction: Matrix3<f64>,
        data: Vec<f64>,
    ) -> Result<IntensityVolume> {
        let expected = voxel_count(size)?;
        if data.len() != expected {
            return Err(CalimeshError::Input(format!(
                "Volume of size {:?} needs {expected} voxels, got {}",
                size,
                data.len()
            )));
        }
        if spacing.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return Err(CalimeshError::Input(format!(
                "Voxel spacing must be positive, got {:?}",
                spacing.as_slice()
            )));
        }
        let Some(inverse_direction) = direction.try_inverse() else {
            return Err(CalimeshError::Input(
                "Volume direction matrix is singular".to_owned(),
            ));
        };

        Ok(IntensityVolume {
            size,
            spacing,
            origin,
            direction,
            inverse_direction,
            data,
        })
    }

    fn offset(&self, index: [usize; 3]) -> usize {
        index[0] + self.size[0] * (index[1] + self.size[1] * index[2])
    }

    pub fn value(&self, index: [usize; 3]) -> f64 {
        self.data[self.offset(index)]
    }

    /// Continuous voxel coordinates of a physical point
    pub fn continuous_index(&self, point: &Point3<f64>) -> Vector3<f64> {
        (self.inverse_direction * (point - self.origin)).component_div(&self.spacing)
    }

    /// Nearest voxel of a physical point, `None` outside the grid
    pub fn physical_to_index(&self, point: &Point3<f64>) -> Option<[usize; 3]> {
        let continuous = self.continuous_index(point);
        let mut index = [0usize; 3];
        for axis in 0..3 {
            let rounded = continuous[axis].round();
            if !(rounded >= 0.0) || rounded >= self.size[axis] as f64 {
                return None;
            }
            index[axis] = rounded as usize;
        }
        Some(index)
    }

    pub fn index_to_physical(&self, index: [usize; 3]) -> Point3<f64> {
        let scaled = Vector3::new(
            index[0] as f64 * self.spacing.x,
            index[1] as f64 * self.spacing.y,
            index[2] as f64 * self.spacing.z,
        );
        self.origin + self.direction * scaled
    }

    /// Mean of the voxels within `radius` of `center` along every axis,
    /// clipped to the grid
    pub fn neighborhood_mean(&self, center: [usize; 3], radius: usize) -> f64 {
        let range = |axis: usize| {
            center[axis].saturating_sub(radius)..(center[axis] + radius + 1).min(self.size[axis])
        };

        let mut sum = 0.0;
        let mut count = 0usize;
        for z in range(2) {
            for y in range(1) {
                for x in range(0) {
                    sum += self.value([x, y, z]);
                    count += 1;
                }
            }
        }
        if count == 0 {
            return 0.0;
        }
        sum / count as f64
    }

    /// Trilinear sample at continuous voxel coordinates, `outside` beyond
    /// half a voxel past the grid
    pub fn interpolate(&self, continuous: &Vector3<f64>, outside: f64) -> f64 {
        let mut lower = [0usize; 3];
        let mut upper = [0usize; 3];
        let mut weight = [0.0f64; 3];

        for axis in 0..3 {
            let c = continuous[axis];
            let n = self.size[axis];
            if n == 0 || !(c >= -0.5) || c >= n as f64 - 0.5 {
                return outside;
            }
            let clamped = c.clamp(0.0, (n - 1) as f64);
            let floor = clamped.floor();
            lower[axis] = floor as usize;
            upper[axis] = (lower[axis] + 1).min(n - 1);
            weight[axis] = clamped - floor;
        }

        let mut value = 0.0;
        for corner in 0..8 {
            let mut index = [0usize; 3];
            let mut w = 1.0;
            for axis in 0..3 {
                if (corner >> axis) & 1 == 1 {
                    index[axis] = upper[axis];
                    w *= weight[axis];
                } else {
                    index[axis] = lower[axis];
                    w *= 1.0 - weight[axis];
                }
            }
            if w > 0.0 {
                value += w * self.value(index);
            }
        }
        value
    }

    /// Resamples onto a grid `factor` times finer (or coarser): spacing
    /// divided by `factor`, size multiplied and truncated, same origin and
    /// direction
    pub fn resample(&self, factor: f64) -> Result<IntensityVolume> {
        if !(factor > 0.0) || !factor.is_finite() {
            return Err(CalimeshError::Material(format!(
                "Resolution factor must be positive, got {factor}"
            )));
        }
        if factor == 1.0 {
            return Ok(self.clone());
        }

        let size = self.size.map(|n| (n as f64 * factor) as usize);
        if size.iter().any(|n| *n == 0) {
            return Err(CalimeshError::Material(format!(
                "Resolution factor {factor} leaves an empty volume"
            )));
        }

        let mut data = Vec::with_capacity(voxel_count(size)?);
        for k in 0..size[2] {
            for j in 0..size[1] {
                for i in 0..size[0] {
                    let source = Vector3::new(i as f64, j as f64, k as f64) / factor;
                    data.push(self.interpolate(&source, 0.0));
                }
            }
        }

        info!(
            "resampled volume from {:?} to {:?} voxels",
            self.size, size
        );
        IntensityVolume::new(size, self.spacing / factor, self.origin, self.direction, data)
    }
}

/// Loads a volume, picking the reader from the file extension
/// (`.mha`/`.mhd` MetaImage or `.vtk` structured points)
pub fn load_volume(path: &Path) -> Result<IntensityVolume> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let volume = match extension.as_str() {
        "mha" | "mhd" => read_metaimage(path)?,
        "vtk" => read_structured_points(path)?,
        other => {
            return Err(CalimeshError::Input(format!(
                "Unsupported volume format '.{other}' for {}",
                path.display()
            )))
        }
    };

    info!(
        "loaded volume {} with {:?} voxels, spacing {:?}",
        path.display(),
        volume.size,
        volume.spacing.as_slice()
    );
    Ok(volume)
}

#[derive(Debug, Clone, Copy)]
enum ElementType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ElementType {
    fn from_meta(name: &str) -> Result<ElementType> {
        match name {
            "MET_UCHAR" => Ok(ElementType::U8),
            "MET_CHAR" => Ok(ElementType::I8),
            "MET_USHORT" => Ok(ElementType::U16),
            "MET_SHORT" => Ok(ElementType::I16),
            "MET_UINT" => Ok(ElementType::U32),
            "MET_INT" => Ok(ElementType::I32),
            "MET_FLOAT" => Ok(ElementType::F32),
            "MET_DOUBLE" => Ok(ElementType::F64),
            other => Err(CalimeshError::Input(format!(
                "Unsupported MetaImage element type {other}"
            ))),
        }
    }

    fn width(&self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

fn bytes<const N: usize>(chunk: &[u8], big_endian: bool) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(chunk);
    if big_endian {
        array.reverse();
    }
    array
}

/// Decodes raw voxel bytes into values
fn decode(raw: &[u8], element: ElementType, big_endian: bool) -> Vec<f64> {
    raw.chunks_exact(element.width())
        .map(|c| match element {
            ElementType::U8 => c[0] as f64,
            ElementType::I8 => c[0] as i8 as f64,
            ElementType::U16 => u16::from_le_bytes(bytes(c, big_endian)) as f64,
            ElementType::I16 => i16::from_le_bytes(bytes(c, big_endian)) as f64,
            ElementType::U32 => u32::from_le_bytes(bytes(c, big_endian)) as f64,
            ElementType::I32 => i32::from_le_bytes(bytes(c, big_endian)) as f64,
            ElementType::F32 => f32::from_le_bytes(bytes(c, big_endian)) as f64,
            ElementType::F64 => f64::from_le_bytes(bytes(c, big_endian)),
        })
        .collect()
}

fn meta_numbers(header: &HashMap<String, String>, keys: &[&str], count: usize) -> Result<Option<Vec<f64>>> {
    let Some(value) = keys.iter().find_map(|k| header.get(*k)) else {
        return Ok(None);
    };
    let numbers = value
        .split_whitespace()
        .map(|t| t.parse::<f64>())
        .collect::<std::result::Result<Vec<f64>, _>>()
        .map_err(|_| CalimeshError::Input(format!("Bad MetaImage field '{}' = '{value}'", keys[0])))?;
    if numbers.len() != count {
        return Err(CalimeshError::Input(format!(
            "MetaImage field '{}' needs {count} values, got {}",
            keys[0],
            numbers.len()
        )));
    }
    Ok(Some(numbers))
}

fn is_true(header: &HashMap<String, String>, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|k| header.get(*k))
        .map_or(false, |v| v.eq_ignore_ascii_case("true"))
}

/// Reads an uncompressed 3D MetaImage, with the data inline (`.mha`) or in
/// a separate raw file (`.mhd`)
pub fn read_metaimage(path: &Path) -> Result<IntensityVolume> {
    let contents = std::fs::read(path).map_err(|err| CalimeshError::io(path, err))?;

    let mut header: HashMap<String, String> = HashMap::new();
    let mut data_file: Option<String> = None;
    let mut cursor = 0;
    while cursor < contents.len() {
        let end = contents[cursor..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(contents.len(), |p| cursor + p + 1);
        let line = String::from_utf8_lossy(&contents[cursor..end]);
        cursor = end;

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim().to_owned(), value.trim().to_owned());
        if key == "ElementDataFile" {
            data_file = Some(value);
            break;
        }
        header.insert(key, value);
    }

    let Some(data_file) = data_file else {
        return Err(CalimeshError::Input(format!(
            "{} has no ElementDataFile entry",
            path.display()
        )));
    };

    if header.get("NDims").map(|v| v.trim()) != Some("3") {
        return Err(CalimeshError::Input(format!(
            "Only 3D MetaImages are supported ({})",
            path.display()
        )));
    }
    if is_true(&header, &["CompressedData"]) {
        return Err(CalimeshError::Input(
            "Compressed MetaImage data is not supported".to_owned(),
        ));
    }
    if let Some(channels) = header.get("ElementNumberOfChannels") {
        if channels.trim() != "1" {
            return Err(CalimeshError::Input(format!(
                "Only single channel MetaImages are supported, got {channels}"
            )));
        }
    }

    let size = meta_numbers(&header, &["DimSize"], 3)?
        .ok_or_else(|| CalimeshError::Input("MetaImage is missing DimSize".to_owned()))?;
    let size = [size[0] as usize, size[1] as usize, size[2] as usize];
    let spacing = meta_numbers(&header, &["ElementSpacing", "ElementSize"], 3)?
        .unwrap_or_else(|| vec![1.0; 3]);
    let origin = meta_numbers(&header, &["Offset", "Origin", "Position"], 3)?
        .unwrap_or_else(|| vec![0.0; 3]);
    let direction = match meta_numbers(&header, &["TransformMatrix", "Rotation", "Orientation"], 9)? {
        // each row of the matrix is one axis direction
        Some(m) => Matrix3::new(m[0], m[3], m[6], m[1], m[4], m[7], m[2], m[5], m[8]),
        None => Matrix3::identity(),
    };

    let element = ElementType::from_meta(
        header
            .get("ElementType")
            .map(|s| s.as_str())
            .unwrap_or_default(),
    )?;
    let big_endian = is_true(&header, &["BinaryDataByteOrderMSB", "ElementByteOrderMSB"]);

    let raw: Cow<[u8]> = if data_file.eq_ignore_ascii_case("LOCAL") {
        Cow::Borrowed(&contents[cursor..])
    } else {
        let raw_path: PathBuf = path
            .parent()
            .map(|p| p.join(&data_file))
            .unwrap_or_else(|| PathBuf::from(&data_file));
        Cow::Owned(std::fs::read(&raw_path).map_err(|err| CalimeshError::io(&raw_path, err))?)
    };

    let expected = voxel_count(size)?
        .checked_mul(element.width())
        .ok_or_else(|| CalimeshError::Input(format!("Volume of size {:?} is too large", size)))?;
    let header_size: i64 = header
        .get("HeaderSize")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let start = if header_size < 0 {
        raw.len().saturating_sub(expected)
    } else {
        header_size as usize
    };
    let Some(end) = start.checked_add(expected) else {
        return Err(CalimeshError::Input(format!(
            "{} has an out of range HeaderSize {header_size}",
            path.display()
        )));
    };
    let Some(voxels) = raw.get(start..end) else {
        return Err(CalimeshError::Input(format!(
            "{} holds {} data bytes, {expected} expected",
            path.display(),
            raw.len().saturating_sub(start)
        )));
    };

    debug!("MetaImage {:?} {:?} big endian: {big_endian}", size, element);

    IntensityVolume::new(
        size,
        Vector3::new(spacing[0], spacing[1], spacing[2]),
        Point3::new(origin[0], origin[1], origin[2]),
        direction,
        decode(voxels, element, big_endian),
    )
}

/// Reads a legacy ASCII VTK `STRUCTURED_POINTS` dataset with one scalar
/// field
pub fn read_structured_points(path: &Path) -> Result<IntensityVolume> {
    let contents = std::fs::read_to_string(path).map_err(|err| CalimeshError::io(path, err))?;
    parse_structured_points(&contents)
}

pub fn parse_structured_points(contents: &str) -> Result<IntensityVolume> {
    let (_version, body) = split_header(contents)?;
    let mut tokens = Tokens::new(body);

    let mut size: Option<[usize; 3]> = None;
    let mut spacing = Vector3::new(1.0, 1.0, 1.0);
    let mut origin = Point3::origin();
    let mut point_count: Option<usize> = None;
    let mut data: Option<Vec<f64>> = None;

    while let Some(keyword) = tokens.next_token() {
        match keyword.to_uppercase().as_str() {
            "DATASET" => {
                let kind = tokens.next_str("DATASET")?;
                if !kind.eq_ignore_ascii_case("STRUCTURED_POINTS") {
                    return Err(CalimeshError::Input(format!(
                        "Expected structured points, found {kind}"
                    )));
                }
            }
            "DIMENSIONS" => {
                let dims: Vec<usize> = tokens.numbers(3, "DIMENSIONS")?;
                size = Some([dims[0], dims[1], dims[2]]);
            }
            "SPACING" | "ASPECT_RATIO" => {
                let s: Vec<f64> = tokens.numbers(3, "SPACING")?;
                spacing = Vector3::new(s[0], s[1], s[2]);
            }
            "ORIGIN" => {
                let o: Vec<f64> = tokens.numbers(3, "ORIGIN")?;
                origin = Point3::new(o[0], o[1], o[2]);
            }
            "POINT_DATA" => point_count = Some(tokens.next_num("POINT_DATA count")?),
            "SCALARS" => {
                let _name = tokens.next_str("SCALARS name")?;
                let _dtype = tokens.next_str("SCALARS type")?;
                if let Some(c) = tokens.peek().and_then(|t| t.parse::<usize>().ok()) {
                    tokens.next_token();
                    if c != 1 {
                        return Err(CalimeshError::Input(format!(
                            "Only single component scalars are supported, got {c}"
                        )));
                    }
                }
                tokens.skip_lookup_table();
                let n = point_count.ok_or_else(|| {
                    CalimeshError::Input("SCALARS appears before POINT_DATA".to_owned())
                })?;
                data = Some(tokens.numbers(n, "scalar values")?);
                break;
            }
            other => {
                return Err(CalimeshError::Input(format!(
                    "Unsupported structured points keyword '{other}'"
                )))
            }
        }
    }

    let size = size.ok_or_else(|| CalimeshError::Input("Missing DIMENSIONS".to_owned()))?;
    let data = data.ok_or_else(|| CalimeshError::Input("Missing scalar data".to_owned()))?;
    IntensityVolume::new(size, spacing, origin, Matrix3::identity(), data)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Volume whose voxel value is `x + 10·y + 100·z`
    pub fn ramp_volume(size: [usize; 3], spacing: f64, origin: Point3<f64>) -> IntensityVolume {
        let mut data = Vec::new();
        for z in 0..size[2] {
            for y in 0..size[1] {
                for x in 0..size[0] {
                    data.push(x as f64 + 10.0 * y as f64 + 100.0 * z as f64);
                }
            }
        }
        IntensityVolume::new(
            size,
            Vector3::new(spacing, spacing, spacing),
            origin,
            Matrix3::identity(),
            data,
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::ramp_volume;
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn physical_points_round_to_voxels() {
        let volume = ramp_volume([4, 4, 4], 2.0, Point3::new(-1.0, 0.0, 0.0));

        assert_eq!(volume.physical_to_index(&Point3::new(-1.0, 0.0, 0.0)), Some([0, 0, 0]));
        assert_eq!(volume.physical_to_index(&Point3::new(2.2, 4.9, 0.4)), Some([2, 2, 0]));
        assert_eq!(volume.physical_to_index(&Point3::new(-3.0, 0.0, 0.0)), None);
        assert_eq!(volume.physical_to_index(&Point3::new(0.0, 7.1, 0.0)), None);
        assert_eq!(volume.index_to_physical([1, 2, 3]), Point3::new(1.0, 4.0, 6.0));
    }

    #[test]
    fn rotated_direction_is_inverted() {
        // axis i runs along -y, axis j along +x
        let direction = Matrix3::new(0.0, 1.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let volume = IntensityVolume::new(
            [3, 3, 1],
            Vector3::new(1.0, 1.0, 1.0),
            Point3::origin(),
            direction,
            vec![0.0; 9],
        )
        .unwrap();

        let p = volume.index_to_physical([2, 1, 0]);
        assert_relative_eq!(p, Point3::new(1.0, -2.0, 0.0), epsilon = 1e-12);
        assert_eq!(volume.physical_to_index(&p), Some([2, 1, 0]));
    }

    #[test]
    fn neighborhood_is_clipped_at_the_corner() {
        let volume = ramp_volume([5, 5, 5], 1.0, Point3::origin());
        // x, y, z in 0..=2 around the corner
        let mean = volume.neighborhood_mean([0, 0, 0], 2);
        assert_relative_eq!(mean, 1.0 + 10.0 + 100.0, epsilon = 1e-12);
    }

    #[test]
    fn resample_doubles_the_grid() {
        let volume = ramp_volume([3, 3, 3], 1.0, Point3::origin());
        let fine = volume.resample(2.0).unwrap();

        assert_eq!(fine.size, [6, 6, 6]);
        assert_relative_eq!(fine.spacing.x, 0.5);
        assert_eq!(fine.origin, volume.origin);
        assert_relative_eq!(fine.value([1, 0, 0]), 0.5, epsilon = 1e-12);
        assert_relative_eq!(fine.value([2, 3, 4]), 1.0 + 15.0 + 200.0, epsilon = 1e-12);
        // half a voxel beyond the last sample is outside
        assert_eq!(fine.value([5, 0, 0]), 0.0);
    }

    #[test]
    fn resample_rejects_bad_factor() {
        let volume = ramp_volume([2, 2, 2], 1.0, Point3::origin());
        assert!(volume.resample(0.0).is_err());
        assert!(volume.resample(0.1).is_err());
    }

    #[test]
    fn reads_inline_metaimage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.mha");

        let mut contents = b"ObjectType = Image\nNDims = 3\nBinaryData = True\n\
BinaryDataByteOrderMSB = False\nCompressedData = False\n\
TransformMatrix = 1 0 0 0 1 0 0 0 1\nOffset = 10 20 30\n\
ElementSpacing = 0.5 0.5 2\nDimSize = 2 2 1\nElementType = MET_SHORT\n\
ElementDataFile = LOCAL\n"
            .to_vec();
        for v in [-1000i16, 0, 250, 1200] {
            contents.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, contents).unwrap();

        let volume = load_volume(&path).unwrap();
        assert_eq!(volume.size, [2, 2, 1]);
        assert_eq!(volume.data, vec![-1000.0, 0.0, 250.0, 1200.0]);
        assert_eq!(volume.origin, Point3::new(10.0, 20.0, 30.0));
        assert_eq!(volume.physical_to_index(&Point3::new(10.5, 20.5, 30.0)), Some([1, 1, 0]));
    }

    #[test]
    fn reads_separate_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ct.mhd"),
            "NDims = 3\nDimSize = 2 1 1\nElementType = MET_FLOAT\nElementDataFile = ct.raw\n",
        )
        .unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(&1.5f32.to_le_bytes());
        raw.extend_from_slice(&(-2.0f32).to_le_bytes());
        std::fs::write(dir.path().join("ct.raw"), raw).unwrap();

        let volume = load_volume(&dir.path().join("ct.mhd")).unwrap();
        assert_eq!(volume.data, vec![1.5, -2.0]);
        assert_eq!(volume.spacing, Vector3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn truncated_metaimage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.mha");
        std::fs::write(
            &path,
            "NDims = 3\nDimSize = 4 4 4\nElementType = MET_UCHAR\nElementDataFile = LOCAL\nabc",
        )
        .unwrap();
        assert!(matches!(load_volume(&path), Err(CalimeshError::Input(_))));
    }

    #[test]
    fn oversized_headers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.mha");

        std::fs::write(
            &path,
            "NDims = 3\nDimSize = 4294967296 4294967296 4294967296\n\
ElementType = MET_UCHAR\nElementDataFile = LOCAL\nabcd",
        )
        .unwrap();
        assert!(matches!(load_volume(&path), Err(CalimeshError::Input(_))));

        std::fs::write(
            &path,
            "NDims = 3\nDimSize = 4294967296 4294967295 1\nHeaderSize = 9223372036854775807\n\
ElementType = MET_UCHAR\nElementDataFile = LOCAL\nab",
        )
        .unwrap();
        assert!(matches!(load_volume(&path), Err(CalimeshError::Input(_))));

        let huge = IntensityVolume::new(
            [usize::MAX, 2, 1],
            Vector3::new(1.0, 1.0, 1.0),
            Point3::origin(),
            Matrix3::identity(),
            Vec::new(),
        );
        assert!(matches!(huge, Err(CalimeshError::Input(_))));
    }

    #[test]
    fn reads_structured_points() {
        let contents = "# vtk DataFile Version 3.0
ct
ASCII
DATASET STRUCTURED_POINTS
DIMENSIONS 2 2 2
SPACING 1 1 1.5
ORIGIN 0 0 -3
POINT_DATA 8
SCALARS ImageScalars short 1
LOOKUP_TABLE default
0 1 2 3
4 5 6 7
";
        let volume = parse_structured_points(contents).unwrap();
        assert_eq!(volume.size, [2, 2, 2]);
        assert_eq!(volume.value([1, 1, 1]), 7.0);
        assert_eq!(volume.physical_to_index(&Point3::new(0.0, 1.0, -1.6)), Some([0, 1, 1]));
    }
}
