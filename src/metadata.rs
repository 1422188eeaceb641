//! Per-reach parameters handed to the simulation pipeline: which source
//! cross-sections bound the reach and what flow range to simulate.

use geo::Point;
use tracing::warn;

use crate::config::FlowConfig;
use crate::geometry::{CrossSection, ReferenceReach, SourceReach, nearest_line};
use crate::record::{FlowBounds, XsRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The chosen cross-section is already the most downstream one.
    NoFurtherSection,
    NoElevationData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamChoice {
    Extended(usize),
    Fallback { index: usize, reason: FallbackReason },
}

impl DownstreamChoice {
    pub fn index(&self) -> usize {
        match self {
            DownstreamChoice::Extended(index) => *index,
            DownstreamChoice::Fallback { index, .. } => *index,
        }
    }
}

/// Steps the downstream cross-section one station further downstream so the
/// reach does not end exactly on a junction section. Keeps `index` when the
/// next section is missing or has no elevation data.
///
/// `sections` must be ordered upstream to downstream.
pub fn extend_downstream(sections: &[CrossSection], index: usize) -> DownstreamChoice {
    match sections.get(index + 1) {
        None => DownstreamChoice::Fallback {
            index,
            reason: FallbackReason::NoFurtherSection,
        },
        Some(next) if !next.has_elevation() => DownstreamChoice::Fallback {
            index,
            reason: FallbackReason::NoElevationData,
        },
        Some(_) => DownstreamChoice::Extended(index + 1),
    }
}

/// Low and high simulation flows from the reference flow statistics.
///
/// The high flow is kept at least `high_flow_factor` above the low flow so
/// the simulated range never collapses to a single discharge.
pub fn flow_bounds(reach: &ReferenceReach, config: &FlowConfig) -> FlowBounds {
    let low = reach
        .flows
        .high_flow_threshold
        .unwrap_or(config.min_flow_cfs)
        .max(config.min_flow_cfs);
    let widened = low * config.high_flow_factor.max(1.0);
    let high = reach
        .flows
        .f100year
        .map(|f| f * config.high_flow_factor)
        .unwrap_or(widened)
        .max(widened);
    FlowBounds {
        low_flow_cfs: low,
        high_flow_cfs: high,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReachMetadata {
    /// Nothing in the source model crosses this reach.
    Eclipsed { flows: FlowBounds },
    Bounded {
        us_xs: XsRef,
        ds_xs: XsRef,
        flows: FlowBounds,
        gage: Option<String>,
        downstream: DownstreamChoice,
    },
}

fn xs_ref(xs: &CrossSection) -> Option<XsRef> {
    Some(XsRef {
        river: xs.river.clone(),
        reach: xs.reach.clone(),
        xs_id: xs.xs_id.clone(),
        min_elevation: xs.min_elevation()?,
        max_elevation: xs.max_elevation()?,
    })
}

fn nearest_hit(point: Option<Point<f64>>, sections: &[CrossSection], hits: &[usize]) -> Option<usize> {
    let point = point?;
    nearest_line(&point, hits.iter().map(|i| &sections[*i].geometry)).map(|(i, _)| hits[i])
}

/// Bounds `reach` by the hit cross-sections nearest its two ends.
///
/// `hits` are indices into `source.cross_sections` of the sections that
/// intersect the reach; the search never looks beyond them.
pub fn build(
    reach: &ReferenceReach,
    source: &SourceReach,
    hits: &[usize],
    config: &FlowConfig,
) -> ReachMetadata {
    let flows = flow_bounds(reach, config);
    let sections = &source.cross_sections;

    let (Some(us), Some(ds)) = (
        nearest_hit(reach.start_point(), sections, hits),
        nearest_hit(reach.end_point(), sections, hits),
    ) else {
        return ReachMetadata::Eclipsed { flows };
    };

    let downstream = extend_downstream(sections, ds);
    if let DownstreamChoice::Fallback { index, reason } = downstream {
        warn!(
            reach_id = reach.id,
            xs_id = %sections[index].xs_id,
            ?reason,
            "kept downstream cross-section without extending"
        );
    }

    // Hits without elevation data cannot bound a simulation either.
    let (Some(us_xs), Some(ds_xs)) = (
        xs_ref(&sections[us]),
        xs_ref(&sections[downstream.index()]),
    ) else {
        warn!(reach_id = reach.id, "bounding cross-sections carry no elevation data");
        return ReachMetadata::Eclipsed { flows };
    };

    ReachMetadata::Bounded {
        us_xs,
        ds_xs,
        flows,
        gage: reach.gage.clone(),
        downstream,
    }
}
