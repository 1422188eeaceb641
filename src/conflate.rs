use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{ConflateError, Result};
use crate::geometry::{
    CenterlineIndex, GeometryAdapter, ReachId, ReferenceReach, SourceReach, nearest_feature,
};
use crate::metadata::{self, ReachMetadata, flow_bounds};
use crate::network::{ReferenceNetwork, WalkEnd};
use crate::record::{
    ConflationFile, ConflationMetadata, ConflationRecord, EclipsedReach, ReachMetrics,
    ScoredReach, SourceRef, SourceReachFailure,
};
use crate::scoring::{self, ScoreReport};

/// Records produced from one source reach.
#[derive(Debug, Clone)]
pub struct SourceConflation {
    pub source: SourceRef,
    pub records: Vec<(ReachId, ConflationRecord)>,
    pub report: ScoreReport,
}

/// Start and stop reference reaches for a source reach.
pub fn endpoints(
    adapter: &GeometryAdapter,
    source: &SourceReach,
    settings: &Settings,
) -> Result<(ReachId, ReachId)> {
    let config = &settings.conflation;
    let candidates = adapter.candidates_for(source, config.candidate_buffer);
    let (Some(start), Some(end)) = (source.start_point(), source.end_point()) else {
        return Err(ConflateError::InvalidGeometry {
            layer: "River".to_string(),
            reason: format!("{} has an empty centerline", source.label()),
        });
    };
    let start_id = nearest_feature(&start, &candidates, config.max_association_distance)?;
    let stop_id = nearest_feature(&end, &candidates, config.max_association_distance)?;
    Ok((start_id, stop_id))
}

pub fn conflate_source_reach(
    adapter: &GeometryAdapter,
    network: &ReferenceNetwork,
    by_id: &HashMap<ReachId, &ReferenceReach>,
    source: &SourceReach,
    settings: &Settings,
) -> Result<SourceConflation> {
    let (start_id, stop_id) = endpoints(adapter, source, settings)?;
    let walk = network.walk(start_id, stop_id)?;
    let path: Vec<&ReferenceReach> = walk
        .path
        .iter()
        .filter_map(|id| by_id.get(id).copied())
        .collect();

    let centerline = CenterlineIndex::new([&source.centerline], settings.conflation.sample_spacing / 10.0);
    let report = scoring::score(&path, &source.cross_sections, &centerline, &settings.conflation);

    let source_ref = SourceRef {
        river: source.river.clone(),
        reach: source.reach.clone(),
    };
    let walk_note = match &walk.end {
        WalkEnd::ReachedStop => None,
        WalkEnd::Outlet => Some(format!("walk reached an outlet before reach {stop_id}")),
        WalkEnd::DanglingLink(to) => Some(format!("walk cut short at link to {to}")),
    };

    let mut records = Vec::new();
    for discarded in &report.discarded {
        let reach = by_id[&discarded.reach_id];
        records.push((
            reach.id,
            ConflationRecord::Eclipsed(EclipsedReach {
                reason: "reach too far from source centerline".to_string(),
                flows: flow_bounds(reach, &settings.flows),
                source: Some(source_ref.clone()),
                network_to_id: reach.to_id,
                gage: reach.gage.clone(),
                metrics: ReachMetrics {
                    centerline_offset_mean: discarded.mean_offset,
                    centerline_offset_max: None,
                    xs_hits: 0,
                    reference_length: reach.length(),
                },
            }),
        ));
    }

    for scored in &report.retained {
        let reach = by_id[&scored.reach_id];
        let metrics = ReachMetrics {
            centerline_offset_mean: Some(scored.mean_offset),
            centerline_offset_max: Some(scored.max_offset),
            xs_hits: scored.hits.len(),
            reference_length: reach.length(),
        };
        let record = match metadata::build(reach, source, &scored.hits, &settings.flows) {
            ReachMetadata::Eclipsed { flows } => ConflationRecord::Eclipsed(EclipsedReach {
                reason: "no usable cross-sections intersect the reach".to_string(),
                flows,
                source: Some(source_ref.clone()),
                network_to_id: reach.to_id,
                gage: reach.gage.clone(),
                metrics,
            }),
            ReachMetadata::Bounded {
                us_xs,
                ds_xs,
                flows,
                gage,
                downstream,
            } => {
                let mut diagnostics = Vec::new();
                if let metadata::DownstreamChoice::Fallback { reason, .. } = downstream {
                    diagnostics.push(format!("downstream xs not extended: {reason:?}"));
                }
                let ds_point = source.cross_sections[downstream.index()]
                    .geometry
                    .points()
                    .next();
                if let Some(junction) = ds_point.and_then(|p| {
                    adapter
                        .model
                        .junction_near(&p, settings.conflation.sample_spacing)
                }) {
                    diagnostics.push(format!("downstream xs near junction {}", junction.name));
                }
                if network.nodes.get(&reach.id).is_some_and(|n| n.is_confluence()) {
                    diagnostics.push("reach starts at a confluence".to_string());
                }
                if !report.dangling.is_empty() {
                    diagnostics.push(format!(
                        "{} dangling xs in source reach",
                        report.dangling.len()
                    ));
                }
                diagnostics.extend(walk_note.clone());
                ConflationRecord::Scored(ScoredReach {
                    us_xs,
                    ds_xs,
                    flows,
                    conflation_score: report.coverage_ratio,
                    classification: report.classification,
                    source: source_ref.clone(),
                    network_to_id: reach.to_id,
                    gage,
                    metrics,
                    diagnostics,
                })
            }
        };
        records.push((reach.id, record));
    }

    info!(
        source = %source.label(),
        reaches = records.len(),
        coverage = report.coverage_ratio,
        classification = ?report.classification,
        "conflated source reach"
    );
    Ok(SourceConflation {
        source: source_ref,
        records,
        report,
    })
}

/// Conflates every source reach of the adapter's model. Source reaches are
/// independent and run in parallel; one failing does not stop the others.
pub fn conflate_model(
    adapter: &GeometryAdapter,
    network: &ReferenceNetwork,
    settings: &Settings,
    source_network: &str,
) -> ConflationFile {
    let by_id: HashMap<ReachId, &ReferenceReach> =
        adapter.reference.iter().map(|r| (r.id, r)).collect();

    let outcomes: Vec<(&SourceReach, Result<SourceConflation>)> = adapter
        .model
        .reaches
        .par_iter()
        .map(|source| {
            (
                source,
                conflate_source_reach(adapter, network, &by_id, source, settings),
            )
        })
        .collect();

    let mut reaches = BTreeMap::new();
    let mut failures = Vec::new();
    for (source, outcome) in outcomes {
        match outcome {
            Ok(conflation) => {
                for (id, record) in conflation.records {
                    merge_record(&mut reaches, id, record);
                }
            }
            Err(e) => {
                warn!(source = %source.label(), error = %e, "unable to conflate source reach");
                failures.push(SourceReachFailure {
                    river: source.river.clone(),
                    reach: source.reach.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    ConflationFile {
        metadata: ConflationMetadata {
            source_network: source_network.to_string(),
            source_model: adapter.model.name.clone(),
            crs: adapter.crs.clone(),
            conflate_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
        },
        reaches,
        failures,
    }
}

// A reference reach can be walked from more than one source reach; a scored
// record beats an eclipsed one, otherwise the better coverage wins.
fn merge_record(
    reaches: &mut BTreeMap<ReachId, ConflationRecord>,
    id: ReachId,
    record: ConflationRecord,
) {
    let replace = match (reaches.get(&id), &record) {
        (None, _) => true,
        (Some(ConflationRecord::Eclipsed(_)), ConflationRecord::Scored(_)) => true,
        (Some(ConflationRecord::Scored(old)), ConflationRecord::Scored(new)) => {
            (new.conflation_score - 1.0).abs() < (old.conflation_score - 1.0).abs()
        }
        _ => false,
    };
    if replace {
        reaches.insert(id, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::fixtures::*;
    use crate::geometry::{ReferenceLayer, SourceModel};
    use crate::record::ECLIPSED_XS_ID;
    use crate::scoring::Classification;

    fn adapter(reaches: Vec<ReferenceReach>, model: SourceModel) -> GeometryAdapter {
        GeometryAdapter::new(
            ReferenceLayer {
                crs: Some("EPSG:5070".into()),
                reaches,
            },
            model,
        )
        .unwrap()
    }

    // A -> B -> C along the source reach, D a tributary well off to the side
    fn three_reaches() -> Vec<ReferenceReach> {
        vec![
            reference(1, Some(2), &[(-20.0, 4.0), (330.0, 4.0)]),
            reference(2, Some(3), &[(330.0, 4.0), (660.0, 4.0)]),
            reference(3, None, &[(660.0, 4.0), (1020.0, 4.0)]),
            reference(4, Some(3), &[(660.0, 3_000.0), (660.0, 4.0)]),
        ]
    }

    #[test]
    fn conflates_walked_path() {
        let adapter = adapter(three_reaches(), model(vec![straight_source(0.0, 1000.0)]));
        let network = ReferenceNetwork::from_reaches(&adapter.reference).unwrap();
        let settings = Settings::default();

        let (start, stop) = endpoints(&adapter, &adapter.model.reaches[0], &settings).unwrap();
        assert_eq!((start, stop), (1, 3));

        let file = conflate_model(&adapter, &network, &settings, "reaches.geojson");
        assert!(file.failures.is_empty());
        assert_eq!(file.reaches.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

        let a = file.reaches[&1].scored().unwrap();
        assert_eq!(a.conflation_score, 1.0);
        assert_eq!(a.classification, Classification::Probable);
        assert_eq!(a.us_xs.xs_id, "950");
        // nearest hit to the end is 750, extended one section to 650
        assert_eq!(a.ds_xs.xs_id, "650");
        assert_eq!(a.network_to_id, Some(2));

        let c = file.reaches[&3].scored().unwrap();
        assert_eq!(c.us_xs.xs_id, "250");
        assert_eq!(c.ds_xs.xs_id, "50");
    }

    #[test]
    fn reach_without_sections_is_eclipsed() {
        let mut reaches = three_reaches();
        // B now detours north, away from every cross-section, but stays close
        // enough to the centerline on average to be retained
        reaches[1] = reference(2, Some(3), &[(330.0, 4.0), (330.0, 60.0), (660.0, 60.0), (660.0, 4.0)]);
        let adapter = adapter(reaches, model(vec![straight_source(0.0, 1000.0)]));
        let network = ReferenceNetwork::from_reaches(&adapter.reference).unwrap();
        let file = conflate_model(&adapter, &network, &Settings::default(), "reaches.geojson");
        let b = &file.reaches[&2];
        assert!(b.is_eclipsed());
        assert_eq!(b.us_xs_id(), ECLIPSED_XS_ID);
        assert_eq!(file.eclipsed().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn unmatched_source_reach_is_a_failure_not_an_abort() {
        let mut far = straight_source(0.0, 1000.0);
        far.river = "Far Creek".into();
        far.centerline = line(&[(500_000.0, 0.0), (501_000.0, 0.0)]);
        far.cross_sections.clear();
        let adapter = adapter(
            three_reaches(),
            model(vec![straight_source(0.0, 1000.0), far]),
        );
        let network = ReferenceNetwork::from_reaches(&adapter.reference).unwrap();
        let file = conflate_model(&adapter, &network, &Settings::default(), "reaches.geojson");
        assert_eq!(file.failures.len(), 1);
        assert_eq!(file.failures[0].river, "Far Creek");
        assert_eq!(file.reaches.len(), 3);
    }
}
