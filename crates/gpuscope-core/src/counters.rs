//! Counter model and counters-file parsing
//!
//! A counter pairs a device-library field with its exposition shape. Counters
//! are loaded from a line-oriented CSV file (`fieldName,promType,help`) and
//! are immutable after config load.

use crate::error::{Error, Result};
use crate::fields;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Exposition type of a counter.
///
/// `Label` counters never emit time series; they are consumed by the
/// collector as per-entity label sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromType {
    Gauge,
    Counter,
    Label,
    Histogram,
}

impl FromStr for PromType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gauge" => Ok(PromType::Gauge),
            "counter" => Ok(PromType::Counter),
            "label" => Ok(PromType::Label),
            "histogram" => Ok(PromType::Histogram),
            other => Err(Error::config(format!("unknown prometheus type '{}'", other))),
        }
    }
}

impl std::fmt::Display for PromType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PromType::Gauge => "gauge",
            PromType::Counter => "counter",
            PromType::Label => "label",
            PromType::Histogram => "histogram",
        };
        f.write_str(s)
    }
}

/// Identity of a measurable field: stable numeric id, exposition name,
/// type, and help text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Counter {
    pub field_id: u16,
    pub field_name: String,
    pub prom_type: PromType,
    pub help: String,
}

impl Counter {
    pub fn is_label(&self) -> bool {
        self.prom_type == PromType::Label
    }
}

/// The set of counters loaded from the counters file.
#[derive(Debug, Clone, Default)]
pub struct CounterSet {
    /// Counters watched through the device library
    pub counters: Vec<Counter>,
    /// Label-type counters, kept separately so label sources survive
    /// watch-list construction
    pub label_counters: Vec<Counter>,
}

/// Parse the counters-file text into counters.
///
/// Lines are `fieldName,promType,help`; blank lines and lines starting with
/// `#` are skipped. Unknown field names and prometheus types are errors.
pub fn parse_counters(text: &str) -> Result<Vec<Counter>> {
    let mut counters = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.splitn(3, ',');
        let field_name = parts.next().unwrap_or("").trim();
        let prom_type = parts.next().map(str::trim).ok_or_else(|| {
            Error::config(format!("line {}: expected 'fieldName,promType,help'", lineno + 1))
        })?;
        let help = parts.next().map(str::trim).unwrap_or("").to_string();

        let meta = fields::by_name(field_name).ok_or_else(|| {
            Error::config(format!("line {}: unknown field '{}'", lineno + 1, field_name))
        })?;

        counters.push(Counter {
            field_id: meta.id,
            field_name: field_name.to_string(),
            prom_type: prom_type.parse()?,
            help,
        });
    }

    Ok(counters)
}

/// Load and split the counters file into a [`CounterSet`].
pub fn load_counter_set(path: &Path) -> Result<CounterSet> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("cannot read counters file {}: {}", path.display(), e))
    })?;
    let counters = parse_counters(&text)?;

    // Label counters are copied to the side list; the collector reads them
    // alongside the value counters for the same entity.
    let label_counters = counters.iter().filter(|c| c.is_label()).cloned().collect();

    Ok(CounterSet { counters, label_counters })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counters() {
        let text = "\
# utilization
DCGM_FI_DEV_GPU_UTIL,gauge,GPU utilization (in %).
DCGM_FI_DEV_XID_ERRORS,counter,Value of the last XID error encountered.

DCGM_FI_DEV_UUID,label,GPU UUID
";
        let counters = parse_counters(text).unwrap();
        assert_eq!(counters.len(), 3);
        assert_eq!(counters[0].field_id, fields::DCGM_FI_DEV_GPU_UTIL);
        assert_eq!(counters[0].prom_type, PromType::Gauge);
        assert_eq!(counters[0].help, "GPU utilization (in %).");
        assert_eq!(counters[1].prom_type, PromType::Counter);
        assert!(counters[2].is_label());
    }

    #[test]
    fn test_help_text_may_contain_commas() {
        let text = "DCGM_FI_DEV_GPU_TEMP,gauge,GPU temperature, in degrees C.";
        let counters = parse_counters(text).unwrap();
        assert_eq!(counters[0].help, "GPU temperature, in degrees C.");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = parse_counters("DCGM_FI_DEV_BOGUS,gauge,nope").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_unknown_prom_type_is_rejected() {
        let err = parse_counters("DCGM_FI_DEV_GPU_UTIL,summary,nope").unwrap_err();
        assert!(err.to_string().contains("unknown prometheus type"));
    }

    #[test]
    fn test_load_counter_set_splits_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.csv");
        std::fs::write(
            &path,
            "DCGM_FI_DEV_GPU_UTIL,gauge,util\nDCGM_FI_DEV_UUID,label,uuid\n",
        )
        .unwrap();

        let cs = load_counter_set(&path).unwrap();
        assert_eq!(cs.counters.len(), 2);
        assert_eq!(cs.label_counters.len(), 1);
        assert_eq!(cs.label_counters[0].field_name, "DCGM_FI_DEV_UUID");
    }
}
