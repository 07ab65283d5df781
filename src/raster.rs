// 🏗️ Raster Readers - GeoTIFF + ESRI ASCII grid
// One reader per format behind a common trait, picked by file extension.

use crate::error::{ChangeError, Result};
use crate::grid::{Epoch, GridGeometry, HeightGrid};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;

// ============================================================================
// CORE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RasterFormat {
    GeoTiff,
    AsciiGrid,
}

impl RasterFormat {
    pub fn name(&self) -> &str {
        match self {
            RasterFormat::GeoTiff => "GeoTIFF",
            RasterFormat::AsciiGrid => "ESRI ASCII grid",
        }
    }
}

/// RasterReader - decode one single-band height raster into a HeightGrid
pub trait RasterReader: Send + Sync {
    fn read(&self, path: &Path, epoch: Epoch) -> Result<HeightGrid>;

    fn format(&self) -> RasterFormat;
}

// ============================================================================
// FACTORY FUNCTIONS
// ============================================================================

/// Detect raster format from the file extension
pub fn detect_format(path: &Path) -> Option<RasterFormat> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "tif" | "tiff" => Some(RasterFormat::GeoTiff),
        "asc" => Some(RasterFormat::AsciiGrid),
        _ => None,
    }
}

pub fn get_reader(format: RasterFormat) -> Box<dyn RasterReader> {
    match format {
        RasterFormat::GeoTiff => Box::new(GeoTiffReader),
        RasterFormat::AsciiGrid => Box::new(AsciiGridReader),
    }
}

/// Read any supported raster, choosing the reader from the extension
pub fn read_raster(path: &Path, epoch: Epoch) -> Result<HeightGrid> {
    let format = detect_format(path)
        .ok_or_else(|| raster_error(path, "unsupported raster extension"))?;
    get_reader(format).read(path, epoch)
}

fn raster_error(path: &Path, detail: impl ToString) -> ChangeError {
    ChangeError::Raster {
        path: path.display().to_string(),
        detail: detail.to_string(),
    }
}

fn is_no_data(value: f64, sentinel: Option<f64>) -> bool {
    if value.is_nan() {
        return true;
    }
    match sentinel {
        Some(s) => value == s,
        None => false,
    }
}

fn to_cells(values: impl Iterator<Item = f64>, sentinel: Option<f64>) -> Vec<Option<f64>> {
    values
        .map(|v| if is_no_data(v, sentinel) { None } else { Some(v) })
        .collect()
}

// ============================================================================
// GEOTIFF
// ============================================================================

/// Single-band GeoTIFF reader.
///
/// Georeference comes from ModelPixelScale + ModelTiepoint, the sentinel from
/// the GDAL_NODATA tag and the EPSG code from the GeoKey directory.
pub struct GeoTiffReader;

impl RasterReader for GeoTiffReader {
    fn read(&self, path: &Path, epoch: Epoch) -> Result<HeightGrid> {
        let file = File::open(path).map_err(|e| raster_error(path, e))?;
        let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| raster_error(path, e))?;

        match decoder.colortype().map_err(|e| raster_error(path, e))? {
            ColorType::Gray(_) => {}
            other => {
                return Err(raster_error(
                    path,
                    format!("expected a single height band, got {:?}", other),
                ))
            }
        }

        let (width, height) = decoder.dimensions().map_err(|e| raster_error(path, e))?;

        let scale = decoder
            .find_tag(Tag::ModelPixelScaleTag)
            .and_then(|v| v.map(|v| v.into_f64_vec()).transpose())
            .map_err(|e| raster_error(path, e))?
            .ok_or_else(|| raster_error(path, "missing ModelPixelScale tag"))?;

        let tiepoint = decoder
            .find_tag(Tag::ModelTiepointTag)
            .and_then(|v| v.map(|v| v.into_f64_vec()).transpose())
            .map_err(|e| raster_error(path, e))?
            .ok_or_else(|| raster_error(path, "missing ModelTiepoint tag"))?;

        let sentinel = decoder
            .find_tag(Tag::GdalNodata)
            .and_then(|v| v.map(|v| v.into_string()).transpose())
            .map_err(|e| raster_error(path, e))?
            .map(|s| parse_gdal_nodata(&s))
            .transpose()
            .map_err(|e| raster_error(path, e))?;

        let crs = decoder
            .find_tag(Tag::GeoKeyDirectoryTag)
            .and_then(|v| v.map(|v| v.into_u16_vec()).transpose())
            .map_err(|e| raster_error(path, e))?
            .and_then(|keys| epsg_from_geokeys(&keys));

        let (origin_x, origin_y, cell_size) =
            georeference(&scale, &tiepoint).map_err(|e| raster_error(path, e))?;

        let values: Vec<f64> = match decoder.read_image().map_err(|e| raster_error(path, e))? {
            DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
            DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
            DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::F64(v) => v,
            #[allow(unreachable_patterns)]
            _ => return Err(raster_error(path, "unsupported sample type")),
        };

        let geometry = GridGeometry {
            origin_x,
            origin_y,
            cell_size,
            width: width as usize,
            height: height as usize,
            crs,
        };

        HeightGrid::new(geometry, to_cells(values.into_iter(), sentinel), epoch)
    }

    fn format(&self) -> RasterFormat {
        RasterFormat::GeoTiff
    }
}

/// `(origin_x, origin_y, cell_size)` from pixel scale `[sx, sy, sz]` and the
/// first tiepoint `[i, j, k, x, y, z]`.
fn georeference(scale: &[f64], tiepoint: &[f64]) -> std::result::Result<(f64, f64, f64), String> {
    if scale.len() < 2 {
        return Err(format!("ModelPixelScale needs 2+ values, got {}", scale.len()));
    }
    if tiepoint.len() < 6 {
        return Err(format!("ModelTiepoint needs 6 values, got {}", tiepoint.len()));
    }

    let (sx, sy) = (scale[0], scale[1]);
    if (sx - sy).abs() > 1e-9 * sx.abs().max(1.0) {
        return Err(format!("non-square cells are not supported ({} x {})", sx, sy));
    }

    let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
    Ok((x - i * sx, y + j * sy, sx))
}

/// GDAL writes the sentinel as NUL-terminated ASCII
fn parse_gdal_nodata(raw: &str) -> std::result::Result<f64, String> {
    let trimmed = raw.trim_matches(char::from(0)).trim();
    match trimmed.to_lowercase().as_str() {
        "nan" | "-nan" => Ok(f64::NAN),
        _ => trimmed
            .parse::<f64>()
            .map_err(|_| format!("invalid GDAL_NODATA value {:?}", trimmed)),
    }
}

/// EPSG code from a GeoKey directory (ProjectedCSType, else GeographicType)
fn epsg_from_geokeys(keys: &[u16]) -> Option<u32> {
    const PROJECTED_CS_TYPE: u16 = 3072;
    const GEOGRAPHIC_TYPE: u16 = 2048;
    const USER_DEFINED: u16 = 32767;

    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;

    let lookup = |wanted: u16| {
        keys[4..]
            .chunks_exact(4)
            .take(count)
            // inline value: tag location 0, count 1
            .find(|entry| entry[0] == wanted && entry[1] == 0)
            .map(|entry| entry[3])
            .filter(|code| *code != 0 && *code != USER_DEFINED)
            .map(u32::from)
    };

    lookup(PROJECTED_CS_TYPE).or_else(|| lookup(GEOGRAPHIC_TYPE))
}

// ============================================================================
// ESRI ASCII GRID
// ============================================================================

/// ESRI ASCII grid reader (`.asc`).
///
/// Header keys are case-insensitive; both `xllcorner`/`yllcorner` and the
/// `xllcenter`/`yllcenter` variants are accepted. Rows run north to south.
pub struct AsciiGridReader;

impl AsciiGridReader {
    pub fn parse(&self, content: &str, path: &Path, epoch: Epoch) -> Result<HeightGrid> {
        let mut ncols: Option<usize> = None;
        let mut nrows: Option<usize> = None;
        let mut xll: Option<(f64, bool)> = None;
        let mut yll: Option<(f64, bool)> = None;
        let mut cell_size: Option<f64> = None;
        let mut sentinel: Option<f64> = None;

        let mut tokens = content.split_whitespace().peekable();

        // Header: key/value pairs until the first numeric token
        while let Some(key) = tokens.peek() {
            if key.parse::<f64>().is_ok() {
                break;
            }
            let key = key.to_lowercase();
            tokens.next();
            let value = tokens
                .next()
                .ok_or_else(|| raster_error(path, format!("header key {} has no value", key)))?;
            let number = value
                .parse::<f64>()
                .map_err(|_| raster_error(path, format!("header {} is not numeric: {}", key, value)))?;

            match key.as_str() {
                "ncols" => ncols = Some(dimension(path, &key, number)?),
                "nrows" => nrows = Some(dimension(path, &key, number)?),
                "xllcorner" => xll = Some((number, false)),
                "xllcenter" => xll = Some((number, true)),
                "yllcorner" => yll = Some((number, false)),
                "yllcenter" => yll = Some((number, true)),
                "cellsize" => cell_size = Some(number),
                "nodata_value" => sentinel = Some(number),
                _ => return Err(raster_error(path, format!("unknown header key {}", key))),
            }
        }

        let missing = |name: &str| raster_error(path, format!("header is missing {}", name));
        let ncols = ncols.ok_or_else(|| missing("ncols"))?;
        let nrows = nrows.ok_or_else(|| missing("nrows"))?;
        let cell_size = cell_size.ok_or_else(|| missing("cellsize"))?;
        let (x, x_centre) = xll.ok_or_else(|| missing("xllcorner"))?;
        let (y, y_centre) = yll.ok_or_else(|| missing("yllcorner"))?;

        let origin_x = if x_centre { x - cell_size / 2.0 } else { x };
        let bottom = if y_centre { y - cell_size / 2.0 } else { y };
        let origin_y = bottom + nrows as f64 * cell_size;

        let values = tokens
            .map(|t| {
                t.parse::<f64>()
                    .map_err(|_| raster_error(path, format!("invalid cell value {}", t)))
            })
            .collect::<Result<Vec<f64>>>()?;

        let geometry = GridGeometry {
            origin_x,
            origin_y,
            cell_size,
            width: ncols,
            height: nrows,
            crs: None,
        };

        HeightGrid::new(geometry, to_cells(values.into_iter(), sentinel), epoch)
    }
}

/// Row/column count from a header value: a non-negative whole number that fits in `usize`
fn dimension(path: &Path, key: &str, number: f64) -> Result<usize> {
    if !number.is_finite() || number < 0.0 || number.fract() != 0.0 || number >= usize::MAX as f64 {
        return Err(raster_error(path, format!("header {} is not a valid count: {}", key, number)));
    }
    Ok(number as usize)
}

impl RasterReader for AsciiGridReader {
    fn read(&self, path: &Path, epoch: Epoch) -> Result<HeightGrid> {
        let content = fs::read_to_string(path).map_err(|e| raster_error(path, e))?;
        self.parse(&content, path, epoch)
    }

    fn format(&self) -> RasterFormat {
        RasterFormat::AsciiGrid
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(Path::new("a/b/1234.tif")), Some(RasterFormat::GeoTiff));
        assert_eq!(detect_format(Path::new("1234.TIFF")), Some(RasterFormat::GeoTiff));
        assert_eq!(detect_format(Path::new("1234.asc")), Some(RasterFormat::AsciiGrid));
        assert_eq!(detect_format(Path::new("1234.las")), None);
        assert_eq!(detect_format(Path::new("README")), None);
    }

    #[test]
    fn test_parse_ascii_grid() {
        let content = "ncols 3\nnrows 2\nxllcorner 100.0\nyllcorner 200.0\ncellsize 0.5\nNODATA_value -9999\n\
                       1.0 2.0 -9999\n4.0 5.0 6.0\n";
        let grid = AsciiGridReader
            .parse(content, &PathBuf::from("b.asc"), Epoch::A)
            .unwrap();

        let g = grid.geometry();
        assert_eq!((g.width, g.height), (3, 2));
        assert_eq!(g.origin_x, 100.0);
        assert_eq!(g.origin_y, 201.0);
        assert_eq!(grid.get(0, 0), Some(1.0));
        assert_eq!(grid.get(2, 0), None);
        assert_eq!(grid.get(2, 1), Some(6.0));
        assert_eq!(grid.valid_count(), 5);
    }

    #[test]
    fn test_parse_ascii_grid_centre_origin() {
        let content = "NCOLS 1\nNROWS 1\nXLLCENTER 10.5\nYLLCENTER 20.5\nCELLSIZE 1\n7.5\n";
        let grid = AsciiGridReader
            .parse(content, &PathBuf::from("c.asc"), Epoch::B)
            .unwrap();
        assert_eq!(grid.geometry().origin_x, 10.0);
        assert_eq!(grid.geometry().origin_y, 21.0);
        assert_eq!(grid.get(0, 0), Some(7.5));
    }

    #[test]
    fn test_parse_ascii_grid_wrong_cell_count() {
        let content = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n";
        let err = AsciiGridReader
            .parse(content, &PathBuf::from("d.asc"), Epoch::A)
            .unwrap_err();
        assert!(matches!(err, ChangeError::InvalidGrid(_)));
    }

    #[test]
    fn test_parse_ascii_grid_oversized_header_is_an_error() {
        // 1e19 fits in usize, but 1e19 x 2 cells does not
        let content = "ncols 1e19\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2\n";
        let err = AsciiGridReader
            .parse(content, &PathBuf::from("huge.asc"), Epoch::A)
            .unwrap_err();
        assert!(matches!(err, ChangeError::InvalidGrid(_)));

        let content = "ncols 1e30\nnrows 1\nxllcorner 0\nyllcorner 0\ncellsize 1\n1\n";
        let err = AsciiGridReader
            .parse(content, &PathBuf::from("huger.asc"), Epoch::A)
            .unwrap_err();
        assert!(matches!(err, ChangeError::Raster { .. }));
    }

    #[test]
    fn test_parse_ascii_grid_rejects_bad_counts() {
        for header in ["ncols -2\nnrows 1", "ncols 2.5\nnrows 1", "ncols 2\nnrows nan"] {
            let content = format!("{}\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2\n", header);
            let err = AsciiGridReader
                .parse(&content, &PathBuf::from("f.asc"), Epoch::A)
                .unwrap_err();
            assert!(matches!(err, ChangeError::Raster { .. }), "{}: {:?}", header, err);
        }
    }

    #[test]
    fn test_missing_file_is_a_raster_error() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["gone.asc", "gone.tif"] {
            let err = read_raster(&tmp.path().join(name), Epoch::A).unwrap_err();
            assert!(matches!(err, ChangeError::Raster { .. }));
        }
    }

    #[test]
    fn test_read_geotiff_file() {
        use tiff::encoder::{colortype, TiffEncoder};

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("NL.1.tif");
        {
            let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
            let mut image = encoder.new_image::<colortype::Gray32Float>(2, 2).unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelPixelScaleTag, &[0.5f64, 0.5, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(Tag::ModelTiepointTag, &[0.0f64, 0.0, 0.0, 100.0, 200.0, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(Tag::GeoKeyDirectoryTag, &[1u16, 1, 0, 1, 3072, 0, 1, 28992][..])
                .unwrap();
            image.encoder().write_tag(Tag::GdalNodata, "-9999").unwrap();
            image.write_data(&[1.0f32, -9999.0, 3.0, 4.0]).unwrap();
        }

        let grid = read_raster(&path, Epoch::B).unwrap();
        let g = grid.geometry();
        assert_eq!((g.origin_x, g.origin_y, g.cell_size), (100.0, 200.0, 0.5));
        assert_eq!((g.width, g.height), (2, 2));
        assert_eq!(g.crs, Some(28992));
        assert_eq!(grid.epoch(), Epoch::B);
        assert_eq!(grid.cells(), &[Some(1.0), None, Some(3.0), Some(4.0)][..]);
    }

    #[test]
    fn test_parse_ascii_grid_missing_header() {
        let content = "ncols 1\nnrows 1\nxllcorner 0\ncellsize 1\n1\n";
        let err = AsciiGridReader
            .parse(content, &PathBuf::from("e.asc"), Epoch::A)
            .unwrap_err();
        assert!(matches!(err, ChangeError::Raster { .. }));
    }

    #[test]
    fn test_georeference_from_tags() {
        let (x, y, size) = georeference(&[0.5, 0.5, 0.0], &[0.0, 0.0, 0.0, 85000.0, 447000.0, 0.0]).unwrap();
        assert_eq!((x, y, size), (85000.0, 447000.0, 0.5));

        // Tiepoint anchored at pixel (2, 4)
        let (x, y, _) = georeference(&[0.5, 0.5, 0.0], &[2.0, 4.0, 0.0, 85001.0, 446998.0, 0.0]).unwrap();
        assert_eq!((x, y), (85000.0, 447000.0));

        assert!(georeference(&[0.5, 1.0, 0.0], &[0.0; 6]).is_err());
    }

    #[test]
    fn test_gdal_nodata_parsing() {
        assert_eq!(parse_gdal_nodata("-9999\0").unwrap(), -9999.0);
        assert!(parse_gdal_nodata("nan").unwrap().is_nan());
        assert!(parse_gdal_nodata("abc").is_err());
    }

    #[test]
    fn test_epsg_from_geokeys() {
        // Header (1,1,0,2 keys), GTModelType=1, ProjectedCSType=28992
        let keys = [1, 1, 0, 2, 1024, 0, 1, 1, 3072, 0, 1, 28992];
        assert_eq!(epsg_from_geokeys(&keys), Some(28992));

        let geographic = [1, 1, 0, 1, 2048, 0, 1, 4326];
        assert_eq!(epsg_from_geokeys(&geographic), Some(4326));

        let user_defined = [1, 1, 0, 1, 3072, 0, 1, 32767];
        assert_eq!(epsg_from_geokeys(&user_defined), None);
    }

    #[test]
    fn test_sentinel_and_nan_are_no_data() {
        let cells = to_cells(vec![1.0, -9999.0, f64::NAN].into_iter(), Some(-9999.0));
        assert_eq!(cells, vec![Some(1.0), None, None]);
    }
}
