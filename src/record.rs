//! Conflation output records.
//!
//! In memory a reach is either [`ConflationRecord::Eclipsed`] or
//! [`ConflationRecord::Scored`]. On disk both flatten into the same JSON
//! shape other tooling reads, where an eclipsed reach is marked by the
//! sentinel upstream cross-section id `"-9999"` and `"eclipsed": true`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConflateError;
use crate::geometry::ReachId;
use crate::scoring::Classification;

pub const ECLIPSED_XS_ID: &str = "-9999";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XsRef {
    pub river: String,
    pub reach: String,
    pub xs_id: String,
    pub min_elevation: f64,
    pub max_elevation: f64,
}

impl XsRef {
    pub fn key(&self) -> String {
        format!("{} {} {}", self.river, self.reach, self.xs_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowBounds {
    pub low_flow_cfs: f64,
    pub high_flow_cfs: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReachMetrics {
    pub centerline_offset_mean: Option<f64>,
    pub centerline_offset_max: Option<f64>,
    pub xs_hits: usize,
    pub reference_length: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub river: String,
    pub reach: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredReach {
    pub us_xs: XsRef,
    pub ds_xs: XsRef,
    pub flows: FlowBounds,
    pub conflation_score: f64,
    pub classification: Classification,
    pub source: SourceRef,
    pub network_to_id: Option<ReachId>,
    pub gage: Option<String>,
    pub metrics: ReachMetrics,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EclipsedReach {
    pub reason: String,
    pub flows: FlowBounds,
    pub source: Option<SourceRef>,
    pub network_to_id: Option<ReachId>,
    pub gage: Option<String>,
    pub metrics: ReachMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RecordRepr", try_from = "RecordRepr")]
pub enum ConflationRecord {
    Eclipsed(EclipsedReach),
    Scored(ScoredReach),
}

impl ConflationRecord {
    pub fn is_eclipsed(&self) -> bool {
        matches!(self, ConflationRecord::Eclipsed(_))
    }

    pub fn scored(&self) -> Option<&ScoredReach> {
        match self {
            ConflationRecord::Scored(s) => Some(s),
            ConflationRecord::Eclipsed(_) => None,
        }
    }

    pub fn flows(&self) -> FlowBounds {
        match self {
            ConflationRecord::Scored(s) => s.flows,
            ConflationRecord::Eclipsed(e) => e.flows,
        }
    }

    pub fn network_to_id(&self) -> Option<ReachId> {
        match self {
            ConflationRecord::Scored(s) => s.network_to_id,
            ConflationRecord::Eclipsed(e) => e.network_to_id,
        }
    }

    /// Upstream cross-section id as written on disk.
    pub fn us_xs_id(&self) -> &str {
        match self {
            ConflationRecord::Scored(s) => &s.us_xs.xs_id,
            ConflationRecord::Eclipsed(_) => ECLIPSED_XS_ID,
        }
    }

    pub fn manual_check_required(&self) -> bool {
        match self {
            ConflationRecord::Scored(s) => s.classification.manual_check_required(),
            ConflationRecord::Eclipsed(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct XsRepr {
    #[serde(default)]
    river: String,
    #[serde(default)]
    reach: String,
    xs_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_elevation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_elevation: Option<f64>,
}

impl XsRepr {
    fn sentinel() -> Self {
        XsRepr {
            river: String::new(),
            reach: String::new(),
            xs_id: ECLIPSED_XS_ID.to_string(),
            min_elevation: None,
            max_elevation: None,
        }
    }

    fn into_ref(self) -> Result<XsRef, ConflateError> {
        match (self.min_elevation, self.max_elevation) {
            (Some(min_elevation), Some(max_elevation)) => Ok(XsRef {
                river: self.river,
                reach: self.reach,
                xs_id: self.xs_id,
                min_elevation,
                max_elevation,
            }),
            _ => Err(ConflateError::MissingProperty {
                layer: "conflation".to_string(),
                property: format!("elevation of xs {}", self.xs_id),
            }),
        }
    }
}

impl From<XsRef> for XsRepr {
    fn from(xs: XsRef) -> Self {
        XsRepr {
            river: xs.river,
            reach: xs.reach,
            xs_id: xs.xs_id,
            min_elevation: Some(xs.min_elevation),
            max_elevation: Some(xs.max_elevation),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordRepr {
    us_xs: XsRepr,
    ds_xs: XsRepr,
    low_flow_cfs: f64,
    high_flow_cfs: f64,
    eclipsed: bool,
    conflation_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    classification: Option<Classification>,
    notes: String,
    manual_check_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_river: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_reach: Option<String>,
    #[serde(default)]
    network_to_id: Option<ReachId>,
    #[serde(default)]
    gage: Option<String>,
    #[serde(default)]
    metrics: ReachMetrics,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    diagnostics: Vec<String>,
}

impl From<ConflationRecord> for RecordRepr {
    fn from(record: ConflationRecord) -> Self {
        match record {
            ConflationRecord::Scored(s) => RecordRepr {
                us_xs: s.us_xs.into(),
                ds_xs: s.ds_xs.into(),
                low_flow_cfs: s.flows.low_flow_cfs,
                high_flow_cfs: s.flows.high_flow_cfs,
                eclipsed: false,
                conflation_score: s.conflation_score,
                classification: Some(s.classification),
                notes: s.classification.notes().to_string(),
                manual_check_required: s.classification.manual_check_required(),
                source_river: Some(s.source.river),
                source_reach: Some(s.source.reach),
                network_to_id: s.network_to_id,
                gage: s.gage,
                metrics: s.metrics,
                diagnostics: s.diagnostics,
            },
            ConflationRecord::Eclipsed(e) => {
                let (source_river, source_reach) = match e.source {
                    Some(s) => (Some(s.river), Some(s.reach)),
                    None => (None, None),
                };
                RecordRepr {
                    us_xs: XsRepr::sentinel(),
                    ds_xs: XsRepr::sentinel(),
                    low_flow_cfs: e.flows.low_flow_cfs,
                    high_flow_cfs: e.flows.high_flow_cfs,
                    eclipsed: true,
                    conflation_score: 0.0,
                    classification: None,
                    notes: e.reason,
                    manual_check_required: false,
                    source_river,
                    source_reach,
                    network_to_id: e.network_to_id,
                    gage: e.gage,
                    metrics: e.metrics,
                    diagnostics: Vec::new(),
                }
            }
        }
    }
}

impl TryFrom<RecordRepr> for ConflationRecord {
    type Error = ConflateError;

    fn try_from(repr: RecordRepr) -> Result<Self, Self::Error> {
        let flows = FlowBounds {
            low_flow_cfs: repr.low_flow_cfs,
            high_flow_cfs: repr.high_flow_cfs,
        };
        let source = match (repr.source_river, repr.source_reach) {
            (Some(river), Some(reach)) => Some(SourceRef { river, reach }),
            _ => None,
        };

        // The sentinel wins over the flag: older files only carry the id.
        if repr.eclipsed || repr.us_xs.xs_id == ECLIPSED_XS_ID {
            return Ok(ConflationRecord::Eclipsed(EclipsedReach {
                reason: repr.notes,
                flows,
                source,
                network_to_id: repr.network_to_id,
                gage: repr.gage,
                metrics: repr.metrics,
            }));
        }

        let classification = match repr.classification {
            Some(c) => c,
            None => Classification::from_notes(&repr.notes).ok_or_else(|| {
                ConflateError::MissingProperty {
                    layer: "conflation".to_string(),
                    property: "classification".to_string(),
                }
            })?,
        };
        // Files following the bare contract name the source reach only
        // through the upstream cross-section.
        let source = match source {
            Some(source) => source,
            None if !repr.us_xs.river.is_empty() && !repr.us_xs.reach.is_empty() => SourceRef {
                river: repr.us_xs.river.clone(),
                reach: repr.us_xs.reach.clone(),
            },
            None => {
                return Err(ConflateError::MissingProperty {
                    layer: "conflation".to_string(),
                    property: "source_river".to_string(),
                });
            }
        };
        Ok(ConflationRecord::Scored(ScoredReach {
            us_xs: repr.us_xs.into_ref()?,
            ds_xs: repr.ds_xs.into_ref()?,
            flows,
            conflation_score: repr.conflation_score,
            classification,
            source,
            network_to_id: repr.network_to_id,
            gage: repr.gage,
            metrics: repr.metrics,
            diagnostics: repr.diagnostics,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflationMetadata {
    pub source_network: String,
    pub source_model: String,
    pub crs: Option<String>,
    pub conflate_version: String,
    pub created_at: DateTime<Utc>,
}

/// A source (river, reach) group that produced no records at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReachFailure {
    pub river: String,
    pub reach: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflationFile {
    pub metadata: ConflationMetadata,
    pub reaches: BTreeMap<ReachId, ConflationRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SourceReachFailure>,
}

impl ConflationFile {
    pub fn eclipsed(&self) -> impl Iterator<Item = ReachId> + '_ {
        self.reaches
            .iter()
            .filter(|(_, r)| r.is_eclipsed())
            .map(|(id, _)| *id)
    }
}
