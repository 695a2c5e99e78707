//! Canonical cache key for a `Configuration`.
//!
//! Every field is written in a fixed order with its name, strings are
//! quoted with escaping, and floats use the shortest round-trip form, so two
//! configurations share a fingerprint exactly when their fields are equal.
//! No semantic canonicalization happens: `10.0` and `10.00001` are different
//! points, and so are regions that list the same vertices from a different
//! starting corner.

use std::fmt::{self, Write};

use ndvi_proto::configuration::{Configuration, LonLat};

/// Bumped whenever the layout below changes.
const FINGERPRINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Key for operations that act on a named target rather than a
    /// configuration, such as cancelling an export task.
    pub fn for_target(target: &str) -> Self {
        let mut out = format!("v{}|target=", FINGERPRINT_VERSION);
        write_quoted(&mut out, target);
        Fingerprint(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn fingerprint(config: &Configuration) -> Fingerprint {
    let mut out = format!("v{}", FINGERPRINT_VERSION);

    out.push_str("|region=");
    match &config.region {
        Some(region) => {
            out.push('[');
            for (i, vertex) in region.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_lon_lat(&mut out, vertex);
            }
            out.push(']');
        }
        None => out.push_str("null"),
    }

    out.push_str("|point=");
    match &config.point {
        Some(point) => write_lon_lat(&mut out, point),
        None => out.push_str("null"),
    }

    // Writing into a String cannot fail.
    let _ = write!(out, "|start={}|end={}", config.start, config.end);
    out.push_str("|source=");
    write_quoted(&mut out, &config.source);
    out.push_str("|regression=");
    write_quoted(&mut out, &config.regression);
    let _ = write!(out, "|cloudscore={}", config.cloudscore());
    out.push_str("|filename=");
    write_quoted(&mut out, &config.filename);

    Fingerprint(out)
}

fn write_lon_lat(out: &mut String, &[lon, lat]: &LonLat) {
    // `{:?}` keeps the sign of zero and spells out NaN/inf, unlike JSON.
    let _ = write!(out, "[{:?},{:?}]", lon, lat);
}

fn write_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('"');
}
