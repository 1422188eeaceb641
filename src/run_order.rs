//! Processing order for conflated reaches.
//!
//! Stations grow upstream, so sorting by the numeric upstream station puts
//! downstream reaches first. Station ids are stored as strings and must be
//! parsed: "1000" sorts before "900" as text. The comparison is only
//! meaningful between reaches conflated against one consistently numbered
//! source reach.

use std::collections::BTreeMap;

use crate::error::{ConflateError, Result};
use crate::geometry::ReachId;
use crate::record::ConflationRecord;

pub fn parse_station(reach_id: ReachId, xs_id: &str) -> Result<f64> {
    xs_id
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite())
        .ok_or_else(|| ConflateError::MalformedStation {
            reach_id: reach_id.to_string(),
            xs_id: xs_id.to_string(),
        })
}

/// Non-eclipsed reaches ordered by ascending upstream station, ties by id.
pub fn order(records: &BTreeMap<ReachId, ConflationRecord>) -> Result<Vec<ReachId>> {
    let mut keyed = Vec::with_capacity(records.len());
    for (id, record) in records {
        let Some(scored) = record.scored() else {
            continue;
        };
        keyed.push((parse_station(*id, &scored.us_xs.xs_id)?, *id));
    }
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    Ok(keyed.into_iter().map(|(_, id)| id).collect())
}
