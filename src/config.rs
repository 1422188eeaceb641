use serde::Deserialize;
use std::path::Path;

use crate::error::Result;

// Property names for the input layers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub key: String,
    pub downstream: String,
    pub high_flow_threshold: String,
    pub f100year: String,
    pub stream_order: String,
    pub gages: String,
    pub river: String,
    pub reach: String,
    pub station: String,
    pub thalweg: String,
    pub elevation_points: String,
    pub junction_name: String,
}

impl ColumnConfig {
    pub fn new() -> Self {
        ColumnConfig {
            key: "ID".to_string(),
            downstream: "to_id".to_string(),
            high_flow_threshold: "high_flow_threshold".to_string(),
            f100year: "f100year".to_string(),
            stream_order: "order_".to_string(),
            gages: "gages".to_string(),
            river: "river".to_string(),
            reach: "reach".to_string(),
            station: "river_station".to_string(),
            thalweg: "thalweg".to_string(),
            elevation_points: "station_elevation_points".to_string(),
            junction_name: "junction_name".to_string(),
        }
    }
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Thresholds used while matching the source model to the reference network.
///
/// The values are empirical; none of them carries meaning beyond "worked on
/// the models we have seen".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConflationConfig {
    /// Spacing of the sample points taken along each reference reach.
    pub sample_spacing: f64,
    /// Mean sample-to-centerline distance above which a reach is discarded.
    pub max_centerline_offset: f64,
    /// Nearest-feature searches beyond this distance are rejected.
    pub max_association_distance: f64,
    /// Padding around the source model extent when picking candidate reaches.
    pub candidate_buffer: f64,
    pub probable_coverage: f64,
    pub possible_coverage: f64,
}

impl Default for ConflationConfig {
    fn default() -> Self {
        ConflationConfig {
            sample_spacing: 100.0,
            max_centerline_offset: 500.0,
            max_association_distance: 10_000.0,
            candidate_buffer: 1_000.0,
            probable_coverage: 0.95,
            possible_coverage: 0.25,
        }
    }
}

/// What to do when a rating curve has fewer than two distinct depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DegeneratePolicy {
    #[default]
    Reject,
    Replicate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub high_flow_factor: f64,
    pub min_flow_cfs: f64,
    pub initial_discharge_count: usize,
    pub depth_increment: f64,
    pub degenerate_policy: DegeneratePolicy,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            high_flow_factor: 1.2,
            min_flow_cfs: 100.0,
            initial_discharge_count: 10,
            depth_increment: 0.5,
            degenerate_policy: DegeneratePolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub columns: ColumnConfig,
    pub conflation: ConflationConfig,
    pub flows: FlowConfig,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Loads `path` when given, otherwise the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"conflation": {"sample_spacing": 25.0}}"#).unwrap();
        assert_eq!(settings.conflation.sample_spacing, 25.0);
        assert_eq!(settings.conflation.max_association_distance, 10_000.0);
        assert_eq!(settings.columns.key, "ID");
        assert_eq!(settings.flows.degenerate_policy, DegeneratePolicy::Reject);
    }

    #[test]
    fn policy_parses_snake_case() {
        let flows: FlowConfig =
            serde_json::from_str(r#"{"degenerate_policy": "replicate"}"#).unwrap();
        assert_eq!(flows.degenerate_policy, DegeneratePolicy::Replicate);
        assert_eq!(flows.depth_increment, 0.5);
    }
}
