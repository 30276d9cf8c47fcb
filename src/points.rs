//! Point model and per-point binary codec.
//!
//! The queue treats point payloads as opaque: a block is an 8-byte shard ID
//! followed by newline-terminated point encodings. This module owns the
//! per-point encoding. A point that cannot be encoded (it would collide with
//! the newline framing byte) is dropped by the framing layer without error.

use crate::{Error, Result};

/// A single time-series point: a series key, a field set, and a nanosecond
/// timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Point {
    series: String,
    fields: String,
    timestamp: i64,
}

impl Point {
    /// Create a new point. Validation happens at encode time, so a point
    /// carrying characters the codec cannot represent is constructible but
    /// will be dropped when marshalled.
    pub fn new(
        series: impl Into<String>,
        fields: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            series: series.into(),
            fields: fields.into(),
            timestamp,
        }
    }

    /// The series key (measurement plus tag set).
    pub fn series(&self) -> &str {
        &self.series
    }

    /// The encoded field set.
    pub fn fields(&self) -> &str {
        &self.fields
    }

    /// Nanoseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Encode the point as `series fields timestamp`.
    ///
    /// Fails when the series key contains a space or newline, or the field
    /// set contains a newline: both would corrupt the block framing.
    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        if self.series.is_empty() {
            return Err(Error::Decode("point has an empty series key".into()));
        }
        if self.series.contains([' ', '\n']) {
            return Err(Error::Decode(format!(
                "series key {:?} contains a reserved character",
                self.series
            )));
        }
        if self.fields.is_empty() {
            return Err(Error::Decode("point has no fields".into()));
        }
        if self.fields.contains('\n') {
            return Err(Error::Decode(
                "field set contains the record terminator".into(),
            ));
        }
        Ok(format!("{} {} {}", self.series, self.fields, self.timestamp).into_bytes())
    }

    /// Decode one point previously produced by [`Point::marshal_binary`].
    pub fn unmarshal_binary(b: &[u8]) -> Result<Self> {
        let s = std::str::from_utf8(b)
            .map_err(|e| Error::Decode(format!("point is not valid UTF-8: {e}")))?;
        let (series, rest) = s
            .split_once(' ')
            .ok_or_else(|| Error::Decode(format!("point {s:?} is missing fields")))?;
        let (fields, timestamp) = rest
            .rsplit_once(' ')
            .ok_or_else(|| Error::Decode(format!("point {s:?} is missing a timestamp")))?;
        if series.is_empty() || fields.is_empty() {
            return Err(Error::Decode(format!("point {s:?} is malformed")));
        }
        let timestamp = timestamp
            .parse::<i64>()
            .map_err(|e| Error::Decode(format!("bad timestamp in point {s:?}: {e}")))?;
        Ok(Self {
            series: series.to_string(),
            fields: fields.to_string(),
            timestamp,
        })
    }
}

/// Parse a run of newline-terminated point encodings.
pub fn parse_points(b: &[u8]) -> Result<Vec<Point>> {
    let mut points = Vec::new();
    for line in b.split(|&c| c == b'\n') {
        if line.is_empty() {
            continue;
        }
        points.push(Point::unmarshal_binary(line)?);
    }
    Ok(points)
}
