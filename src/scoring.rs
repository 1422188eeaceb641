//! Positional agreement between a walked reference path and the
//! cross-sections of one source reach.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConflationConfig;
use crate::geometry::{
    CenterlineIndex, CrossSection, ReachId, ReferenceReach, intersecting_cross_sections,
    sample_points,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Every cross-section hit exactly once.
    Probable,
    PartialCoverage,
    Possible,
    Disconnected,
    /// More hits than cross-sections: overlapping candidates counted some twice.
    Divergent,
}

impl Classification {
    pub fn from_coverage(hits: usize, total: usize, config: &ConflationConfig) -> Self {
        if total == 0 {
            return Classification::Disconnected;
        }
        if hits == total {
            return Classification::Probable;
        }
        if hits > total {
            return Classification::Divergent;
        }
        let ratio = hits as f64 / total as f64;
        if ratio >= config.probable_coverage {
            Classification::PartialCoverage
        } else if ratio >= config.possible_coverage {
            Classification::Possible
        } else {
            Classification::Disconnected
        }
    }

    pub fn notes(&self) -> &'static str {
        match self {
            Classification::Probable => "Probable Conflation, no dangling xs",
            Classification::PartialCoverage => {
                "Probable Conflation, partial coverage, manual check not required"
            }
            Classification::Possible => "Possible Conflation, manual check required",
            Classification::Disconnected => {
                "Unable to conflate, potential disconnection, manual check required"
            }
            Classification::Divergent => {
                "Unable to conflate, potential divergence, manual check required"
            }
        }
    }

    pub fn from_notes(notes: &str) -> Option<Self> {
        [
            Classification::Probable,
            Classification::PartialCoverage,
            Classification::Possible,
            Classification::Disconnected,
            Classification::Divergent,
        ]
        .into_iter()
        .find(|c| c.notes() == notes)
    }

    pub fn manual_check_required(&self) -> bool {
        !matches!(
            self,
            Classification::Probable | Classification::PartialCoverage
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReachScore {
    pub reach_id: ReachId,
    pub mean_offset: f64,
    pub max_offset: f64,
    /// Indices into the source reach's cross-sections.
    pub hits: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscardedReach {
    pub reach_id: ReachId,
    /// `None` when the source model has no centerline points to compare with.
    pub mean_offset: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreReport {
    pub retained: Vec<ReachScore>,
    pub discarded: Vec<DiscardedReach>,
    pub total_hits: usize,
    pub total_cross_sections: usize,
    pub coverage_ratio: f64,
    pub classification: Classification,
    /// Cross-sections no retained reach crosses, kept for manual review.
    pub dangling: Vec<usize>,
}

impl ScoreReport {
    pub fn manual_check_required(&self) -> bool {
        self.classification.manual_check_required()
    }
}

/// Scores every reach of `path` against `cross_sections`.
///
/// Never fails: a poor match shows up in the classification.
pub fn score(
    path: &[&ReferenceReach],
    cross_sections: &[CrossSection],
    centerline: &CenterlineIndex,
    config: &ConflationConfig,
) -> ScoreReport {
    let mut retained = Vec::new();
    let mut discarded = Vec::new();

    for reach in path {
        let samples = sample_points(&reach.geometry, config.sample_spacing);
        match centerline.offsets(&samples) {
            Some((mean, max)) if mean <= config.max_centerline_offset => {
                let hits = intersecting_cross_sections(&reach.geometry, cross_sections);
                debug!(
                    reach_id = reach.id,
                    mean_offset = mean,
                    hits = hits.len(),
                    "reach retained"
                );
                retained.push(ReachScore {
                    reach_id: reach.id,
                    mean_offset: mean,
                    max_offset: max,
                    hits,
                });
            }
            offsets => {
                debug!(
                    reach_id = reach.id,
                    mean_offset = ?offsets.map(|(mean, _)| mean),
                    "reach too far from source centerline"
                );
                discarded.push(DiscardedReach {
                    reach_id: reach.id,
                    mean_offset: offsets.map(|(mean, _)| mean),
                });
            }
        }
    }

    let total_hits: usize = retained.iter().map(|r| r.hits.len()).sum();
    let total_cross_sections = cross_sections.len();
    let coverage_ratio = if total_cross_sections == 0 {
        0.0
    } else {
        total_hits as f64 / total_cross_sections as f64
    };
    let classification = Classification::from_coverage(total_hits, total_cross_sections, config);
    if classification == Classification::Divergent {
        warn!(
            total_hits,
            total_cross_sections, "cross-sections counted by more than one reach"
        );
    }

    let mut hit = vec![false; total_cross_sections];
    for index in retained.iter().flat_map(|r| r.hits.iter()) {
        hit[*index] = true;
    }
    let dangling = hit
        .iter()
        .enumerate()
        .filter(|(_, h)| !**h)
        .map(|(i, _)| i)
        .collect();

    ScoreReport {
        retained,
        discarded,
        total_hits,
        total_cross_sections,
        coverage_ratio,
        classification,
        dangling,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::fixtures::*;

    fn index(source: &crate::geometry::SourceReach) -> CenterlineIndex {
        CenterlineIndex::new([&source.centerline], 10.0)
    }

    #[test]
    fn full_coverage_is_probable() {
        let config = ConflationConfig::default();
        let source = straight_source(0.0, 1000.0);
        let a = reference(1, None, &[(0.0, 5.0), (1000.0, 5.0)]);
        let report = score(&[&a], &source.cross_sections, &index(&source), &config);
        assert_eq!(report.coverage_ratio, 1.0);
        assert_eq!(report.classification, Classification::Probable);
        assert_eq!(report.classification.notes(), "Probable Conflation, no dangling xs");
        assert!(!report.manual_check_required());
        assert!(report.dangling.is_empty());
    }

    #[test]
    fn far_reach_is_discarded() {
        let config = ConflationConfig::default();
        let source = straight_source(0.0, 1000.0);
        let near = reference(1, Some(2), &[(0.0, 5.0), (1000.0, 5.0)]);
        let far = reference(2, None, &[(0.0, 5_000.0), (1000.0, 5_000.0)]);
        let report = score(&[&near, &far], &source.cross_sections, &index(&source), &config);
        assert_eq!(report.retained.len(), 1);
        assert_eq!(report.discarded[0].reach_id, 2);
        assert!(report.discarded[0].mean_offset.unwrap() > 4_000.0);
    }

    #[test]
    fn partial_coverage_keeps_dangling() {
        let config = ConflationConfig::default();
        let source = straight_source(0.0, 1000.0);
        let a = reference(1, None, &[(0.0, 5.0), (420.0, 5.0)]);
        let report = score(&[&a], &source.cross_sections, &index(&source), &config);
        assert_eq!(report.total_hits, 4);
        assert_eq!(report.classification, Classification::Possible);
        assert!(report.manual_check_required());
        assert_eq!(report.dangling.len(), 6);
    }

    #[test]
    fn overlapping_candidates_diverge() {
        let config = ConflationConfig::default();
        let source = straight_source(0.0, 1000.0);
        let a = reference(1, Some(2), &[(0.0, 5.0), (1000.0, 5.0)]);
        let b = reference(2, None, &[(0.0, -5.0), (1000.0, -5.0)]);
        let report = score(&[&a, &b], &source.cross_sections, &index(&source), &config);
        assert!(report.coverage_ratio > 1.0);
        assert_eq!(report.classification, Classification::Divergent);
        assert!(report.manual_check_required());
    }

    #[test]
    fn classification_bands() {
        let config = ConflationConfig::default();
        let class = |hits| Classification::from_coverage(hits, 100, &config);
        assert_eq!(class(100), Classification::Probable);
        assert_eq!(class(95), Classification::PartialCoverage);
        assert_eq!(class(94), Classification::Possible);
        assert_eq!(class(25), Classification::Possible);
        assert_eq!(class(24), Classification::Disconnected);
        assert_eq!(class(101), Classification::Divergent);
        assert!(!Classification::PartialCoverage.manual_check_required());
        assert_eq!(
            Classification::from_notes(Classification::Possible.notes()),
            Some(Classification::Possible)
        );
    }
}
