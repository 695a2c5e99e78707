//! Computation configuration: the snapshot every remote request is built from.
//!
//! A `Configuration` is captured from the UI when the user edits an option and
//! is never mutated afterwards; the session clones it into each request.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// A `[longitude, latitude]` pair in degrees.
pub type LonLat = [f64; 2];

pub const CLOUDSCORE_MIN: u8 = 1;
pub const CLOUDSCORE_MAX: u8 = 100;

/// Polygons with fewer vertices than this are rejected.
pub const MIN_REGION_VERTICES: usize = 3;

/// User-supplied input that must be fixed before anything is dispatched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("could not read coordinates from {input:?}")]
    Malformed { input: String },
    #[error("longitude {0} is outside [-180, 180]")]
    Longitude(f64),
    #[error("latitude {0} is outside [-90, 90]")]
    Latitude(f64),
    #[error("a region needs at least 3 vertices, got {0}")]
    TooFewVertices(usize),
    #[error("start year {start} is after end year {end}")]
    YearRange { start: i32, end: i32 },
    #[error("{0} needs a point")]
    MissingPoint(&'static str),
    #[error("{0} needs a region")]
    MissingRegion(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub region: Option<Vec<LonLat>>,
    pub point: Option<LonLat>,
    pub start: i32,
    pub end: i32,
    pub source: String,
    pub regression: String,
    #[serde(deserialize_with = "deserialize_cloudscore")]
    cloudscore: u8,
    pub filename: String,
}

impl Configuration {
    pub fn new(
        start: i32,
        end: i32,
        source: impl Into<String>,
        regression: impl Into<String>,
    ) -> Self {
        Self {
            region: None,
            point: None,
            start,
            end,
            source: source.into(),
            regression: regression.into(),
            cloudscore: CLOUDSCORE_MIN,
            filename: String::new(),
        }
    }

    pub fn with_point(mut self, point: LonLat) -> Self {
        self.point = Some(point);
        self
    }

    pub fn with_region(mut self, region: Vec<LonLat>) -> Self {
        self.region = Some(region);
        self
    }

    /// Out-of-range thresholds are clamped into `[1, 100]`.
    pub fn with_cloudscore(mut self, value: i64) -> Self {
        self.cloudscore = clamp_cloudscore(value);
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn cloudscore(&self) -> u8 {
        self.cloudscore
    }

    /// Check the geometry and the year range.  Called before any dispatch.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.start > self.end {
            return Err(ValidationError::YearRange {
                start: self.start,
                end: self.end,
            });
        }
        if let Some(point) = &self.point {
            check_lon_lat(point)?;
        }
        if let Some(region) = &self.region {
            check_region(region)?;
        }
        Ok(())
    }

    pub fn require_point(&self, operation: &'static str) -> Result<LonLat, ValidationError> {
        self.point.ok_or(ValidationError::MissingPoint(operation))
    }

    pub fn require_region(&self, operation: &'static str) -> Result<&[LonLat], ValidationError> {
        self.region
            .as_deref()
            .ok_or(ValidationError::MissingRegion(operation))
    }

    /// Key/value pairs for the remote compute endpoint.  Geometry is sent as
    /// JSON, with `null` standing in for an absent point or region.
    pub fn to_form(&self, client_id: &str) -> serde_json::Result<Vec<(&'static str, String)>> {
        Ok(vec![
            ("region", serde_json::to_string(&self.region)?),
            ("point", serde_json::to_string(&self.point)?),
            ("start", self.start.to_string()),
            ("end", self.end.to_string()),
            ("source", self.source.clone()),
            ("regression", self.regression.clone()),
            ("cloudscore", self.cloudscore.to_string()),
            ("filename", self.filename.clone()),
            ("client_id", client_id.to_string()),
        ])
    }
}

pub fn clamp_cloudscore(value: i64) -> u8 {
    value.clamp(CLOUDSCORE_MIN as i64, CLOUDSCORE_MAX as i64) as u8
}

fn deserialize_cloudscore<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(clamp_cloudscore(raw))
}

fn check_lon_lat(&[lon, lat]: &LonLat) -> Result<(), ValidationError> {
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(ValidationError::Longitude(lon));
    }
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(ValidationError::Latitude(lat));
    }
    Ok(())
}

fn check_region(region: &[LonLat]) -> Result<(), ValidationError> {
    if region.len() < MIN_REGION_VERTICES {
        return Err(ValidationError::TooFewVertices(region.len()));
    }
    region.iter().try_for_each(check_lon_lat)
}

/// Parse a marker position typed by the user: `"10.5, 50"`, `"10.5 50"` or
/// `"[10.5, 50]"`.
pub fn parse_point(input: &str) -> Result<LonLat, ValidationError> {
    let malformed = || ValidationError::Malformed {
        input: input.to_string(),
    };
    let trimmed = input.trim().trim_start_matches('[').trim_end_matches(']');
    let parts: Vec<f64> = trimmed
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().map_err(|_| malformed()))
        .collect::<Result<_, _>>()?;
    let point = match parts.as_slice() {
        [lon, lat] => [*lon, *lat],
        _ => return Err(malformed()),
    };
    check_lon_lat(&point)?;
    Ok(point)
}

/// Parse a polygon given as a JSON array of `[lon, lat]` pairs.
pub fn parse_region(input: &str) -> Result<Vec<LonLat>, ValidationError> {
    let region: Vec<LonLat> =
        serde_json::from_str(input).map_err(|_| ValidationError::Malformed {
            input: input.to_string(),
        })?;
    check_region(&region)?;
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Configuration {
        Configuration::new(2010, 2012, "land5", "linear").with_cloudscore(20)
    }

    #[test]
    fn test_cloudscore_is_clamped() {
        assert_eq!(base().with_cloudscore(0).cloudscore(), 1);
        assert_eq!(base().with_cloudscore(-40).cloudscore(), 1);
        assert_eq!(base().with_cloudscore(250).cloudscore(), 100);
        assert_eq!(base().with_cloudscore(55).cloudscore(), 55);
    }

    #[test]
    fn test_deserialize_clamps_cloudscore() {
        let json = r#"{"region":null,"point":[10.0,50.0],"start":2010,"end":2012,
            "source":"land5","regression":"linear","cloudscore":500,"filename":"x"}"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        assert_eq!(config.cloudscore(), 100);
        assert_eq!(config.point, Some([10.0, 50.0]));
    }

    #[test]
    fn test_parse_point_accepts_common_spellings() {
        assert_eq!(parse_point("10.5, 50").unwrap(), [10.5, 50.0]);
        assert_eq!(parse_point(" 10.5 50 ").unwrap(), [10.5, 50.0]);
        assert_eq!(parse_point("[-3,  41.2]").unwrap(), [-3.0, 41.2]);
    }

    #[test]
    fn test_parse_point_rejects_garbage() {
        assert!(matches!(
            parse_point("ten, fifty"),
            Err(ValidationError::Malformed { .. })
        ));
        assert!(matches!(
            parse_point("1, 2, 3"),
            Err(ValidationError::Malformed { .. })
        ));
        assert_eq!(parse_point("10, 95"), Err(ValidationError::Latitude(95.0)));
        assert_eq!(parse_point("181, 0"), Err(ValidationError::Longitude(181.0)));
        assert!(matches!(
            parse_point("NaN, 0"),
            Err(ValidationError::Longitude(_))
        ));
    }

    #[test]
    fn test_parse_region() {
        let region = parse_region("[[10,50],[11,50],[11,51]]").unwrap();
        assert_eq!(region.len(), 3);
        assert_eq!(
            parse_region("[[10,50],[11,50]]"),
            Err(ValidationError::TooFewVertices(2))
        );
        assert!(matches!(
            parse_region("[[10,50],"),
            Err(ValidationError::Malformed { .. })
        ));
    }

    #[test]
    fn test_validate_year_range_and_geometry() {
        assert!(base().with_point([10.0, 50.0]).validate().is_ok());

        let mut reversed = base();
        reversed.start = 2015;
        assert_eq!(
            reversed.validate(),
            Err(ValidationError::YearRange {
                start: 2015,
                end: 2012
            })
        );

        let bad_region = base().with_region(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 91.0]]);
        assert_eq!(bad_region.validate(), Err(ValidationError::Latitude(91.0)));
    }

    #[test]
    fn test_require_geometry() {
        let config = base();
        assert_eq!(
            config.require_point("chart"),
            Err(ValidationError::MissingPoint("chart"))
        );
        assert_eq!(
            config.require_region("export").unwrap_err().to_string(),
            "export needs a region"
        );
    }

    #[test]
    fn test_form_encodes_absent_geometry_as_null() {
        let form = base()
            .with_point([10.0, 50.0])
            .with_filename("trend")
            .to_form("1700000000ABC123")
            .unwrap();
        let get = |key: &str| {
            form.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("region"), "null");
        assert_eq!(get("point"), "[10.0,50.0]");
        assert_eq!(get("cloudscore"), "20");
        assert_eq!(get("filename"), "trend");
        assert_eq!(get("client_id"), "1700000000ABC123");
    }
}
