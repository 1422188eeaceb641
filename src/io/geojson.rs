use geo::{Coord, LineString, Point};
use geojson::{Feature, FeatureCollection, GeoJson, Value};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::config::ColumnConfig;
use crate::error::{ConflateError, Result};
use crate::geometry::{
    CrossSection, FlowStats, Junction, ReachId, ReferenceLayer, ReferenceReach, SourceModel,
    SourceReach,
};

pub const RIVER_LAYER: &str = "river.geojson";
pub const XS_LAYER: &str = "xs.geojson";
pub const JUNCTION_LAYER: &str = "junction.geojson";

fn read_collection(path: &Path) -> Result<FeatureCollection> {
    if !path.exists() {
        return Err(ConflateError::MissingLayer(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    match content.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(fc) => Ok(fc),
        _ => Err(ConflateError::InvalidGeometry {
            layer: path.display().to_string(),
            reason: "expected a FeatureCollection".to_string(),
        }),
    }
}

// Legacy `"crs": {"properties": {"name": ...}}` member
fn collection_crs(fc: &FeatureCollection) -> Option<String> {
    fc.foreign_members
        .as_ref()?
        .get("crs")?
        .get("properties")?
        .get("name")?
        .as_str()
        .map(str::to_string)
}

fn to_coords(positions: &[Vec<f64>], layer: &str) -> Result<Vec<Coord<f64>>> {
    positions
        .iter()
        .map(|p| match p.as_slice() {
            [x, y, ..] => Ok(Coord { x: *x, y: *y }),
            _ => Err(ConflateError::InvalidGeometry {
                layer: layer.to_string(),
                reason: "position with fewer than two ordinates".to_string(),
            }),
        })
        .collect()
}

fn line_geometry(feature: &Feature, layer: &str) -> Result<LineString<f64>> {
    let geometry = feature
        .geometry
        .as_ref()
        .ok_or_else(|| ConflateError::InvalidGeometry {
            layer: layer.to_string(),
            reason: "feature without geometry".to_string(),
        })?;
    let coords = match &geometry.value {
        Value::LineString(positions) => to_coords(positions, layer)?,
        Value::MultiLineString(parts) => {
            let mut coords = Vec::new();
            for part in parts {
                for c in to_coords(part, layer)? {
                    if coords.last() != Some(&c) {
                        coords.push(c);
                    }
                }
            }
            coords
        }
        _ => {
            return Err(ConflateError::InvalidGeometry {
                layer: layer.to_string(),
                reason: "expected LineString or MultiLineString".to_string(),
            });
        }
    };
    if coords.len() < 2 {
        return Err(ConflateError::InvalidGeometry {
            layer: layer.to_string(),
            reason: "line with fewer than two vertices".to_string(),
        });
    }
    Ok(LineString::new(coords))
}

fn point_geometry(feature: &Feature, layer: &str) -> Result<Point<f64>> {
    match feature.geometry.as_ref().map(|g| &g.value) {
        Some(Value::Point(p)) if p.len() >= 2 => Ok(Point::new(p[0], p[1])),
        _ => Err(ConflateError::InvalidGeometry {
            layer: layer.to_string(),
            reason: "expected Point".to_string(),
        }),
    }
}

fn text_property(feature: &Feature, name: &str) -> Option<String> {
    match feature.property(name)? {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_text(feature: &Feature, name: &str, layer: &str) -> Result<String> {
    text_property(feature, name).ok_or_else(|| ConflateError::MissingProperty {
        layer: layer.to_string(),
        property: name.to_string(),
    })
}

fn number_property(feature: &Feature, name: &str) -> Option<f64> {
    match feature.property(name)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn id_property(feature: &Feature, name: &str) -> Option<ReachId> {
    match feature.property(name)? {
        JsonValue::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as ReachId)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// Accepts [[station, elevation], ...], [elevation, ...] or the same as a JSON string
fn elevation_profile(value: Option<&JsonValue>) -> Vec<f64> {
    let parsed;
    let value = match value {
        Some(JsonValue::String(s)) => match serde_json::from_str::<JsonValue>(s) {
            Ok(v) => {
                parsed = v;
                &parsed
            }
            Err(_) => return Vec::new(),
        },
        Some(v) => v,
        None => return Vec::new(),
    };
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            JsonValue::Array(pair) => pair.get(1).and_then(JsonValue::as_f64),
            other => other.as_f64(),
        })
        .collect()
}

pub fn load_reference_layer(path: &Path, columns: &ColumnConfig) -> Result<ReferenceLayer> {
    let layer = path.display().to_string();
    let fc = read_collection(path)?;
    let crs = collection_crs(&fc);

    let mut reaches = Vec::with_capacity(fc.features.len());
    for feature in &fc.features {
        let id = id_property(feature, &columns.key).ok_or_else(|| {
            ConflateError::MissingProperty {
                layer: layer.clone(),
                property: columns.key.clone(),
            }
        })?;
        // NWM marks outlets with to_id = 0
        let to_id = id_property(feature, &columns.downstream).filter(|&to| to != 0);
        reaches.push(ReferenceReach {
            id,
            geometry: line_geometry(feature, &layer)?,
            to_id,
            flows: FlowStats {
                high_flow_threshold: number_property(feature, &columns.high_flow_threshold),
                f100year: number_property(feature, &columns.f100year),
            },
            stream_order: number_property(feature, &columns.stream_order).map(|o| o as u32),
            gage: text_property(feature, &columns.gages).filter(|g| !g.is_empty()),
        });
    }

    info!(reaches = reaches.len(), crs = ?crs, "loaded reference network");
    Ok(ReferenceLayer { crs, reaches })
}

pub fn load_source_model(dir: &Path, columns: &ColumnConfig) -> Result<SourceModel> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string());

    let rivers = read_collection(&dir.join(RIVER_LAYER))?;
    let sections = read_collection(&dir.join(XS_LAYER))?;
    let crs = collection_crs(&rivers).or_else(|| collection_crs(&sections));

    let mut grouped: BTreeMap<(String, String), Vec<CrossSection>> = BTreeMap::new();
    for feature in &sections.features {
        let river = required_text(feature, &columns.river, XS_LAYER)?;
        let reach = required_text(feature, &columns.reach, XS_LAYER)?;
        let xs_id = required_text(feature, &columns.station, XS_LAYER)?;
        let station = xs_id
            .parse::<f64>()
            .map_err(|_| ConflateError::MalformedStation {
                reach_id: format!("{river} {reach}"),
                xs_id: xs_id.clone(),
            })?;
        grouped
            .entry((river.clone(), reach.clone()))
            .or_default()
            .push(CrossSection {
                river,
                reach,
                xs_id,
                station,
                geometry: line_geometry(feature, XS_LAYER)?,
                elevations: elevation_profile(feature.property(&columns.elevation_points)),
                thalweg: number_property(feature, &columns.thalweg),
            });
    }

    let mut reaches = Vec::with_capacity(rivers.features.len());
    for feature in &rivers.features {
        let river = required_text(feature, &columns.river, RIVER_LAYER)?;
        let reach = required_text(feature, &columns.reach, RIVER_LAYER)?;
        let centerline = line_geometry(feature, RIVER_LAYER)?;
        let xs = grouped
            .remove(&(river.clone(), reach.clone()))
            .unwrap_or_default();
        debug!(%river, %reach, cross_sections = xs.len(), "loaded source reach");
        reaches.push(SourceReach::new(river, reach, centerline, xs)?);
    }
    for (river, reach) in grouped.keys() {
        debug!(%river, %reach, "cross-sections without a centerline ignored");
    }

    let junction_path = dir.join(JUNCTION_LAYER);
    let junctions = if junction_path.exists() {
        read_collection(&junction_path)?
            .features
            .iter()
            .map(|f| {
                Ok(Junction {
                    name: text_property(f, &columns.junction_name).unwrap_or_default(),
                    location: point_geometry(f, JUNCTION_LAYER)?,
                })
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    info!(
        model = %name,
        reaches = reaches.len(),
        junctions = junctions.len(),
        "loaded source model"
    );
    Ok(SourceModel {
        name,
        crs,
        reaches,
        junctions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: JsonValue) {
        std::fs::write(dir.join(name), value.to_string()).unwrap();
    }

    fn crs() -> JsonValue {
        json!({"type": "name", "properties": {"name": "EPSG:5070"}})
    }

    #[test]
    fn loads_reference_reaches() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "reaches.geojson",
            json!({
                "type": "FeatureCollection",
                "crs": crs(),
                "features": [
                    {"type": "Feature",
                     "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [10.0, 0.0]]},
                     "properties": {"ID": 11, "to_id": 12, "high_flow_threshold": 300.0,
                                    "f100year": 4000.0, "order_": 2, "gages": "01234567"}},
                    {"type": "Feature",
                     "geometry": {"type": "MultiLineString",
                                  "coordinates": [[[10.0, 0.0], [20.0, 0.0]], [[20.0, 0.0], [30.0, 0.0]]]},
                     "properties": {"ID": "12", "to_id": 0, "gages": ""}}
                ]
            }),
        );
        let layer =
            load_reference_layer(&dir.path().join("reaches.geojson"), &ColumnConfig::new()).unwrap();
        assert_eq!(layer.crs.as_deref(), Some("EPSG:5070"));
        assert_eq!(layer.reaches[0].to_id, Some(12));
        assert_eq!(layer.reaches[0].gage.as_deref(), Some("01234567"));
        assert_eq!(layer.reaches[0].flows.high_flow_threshold, Some(300.0));
        assert_eq!(layer.reaches[1].to_id, None);
        assert_eq!(layer.reaches[1].gage, None);
        assert_eq!(layer.reaches[1].geometry.0.len(), 3);
    }

    #[test]
    fn loads_source_model_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            RIVER_LAYER,
            json!({
                "type": "FeatureCollection",
                "features": [
                    {"type": "Feature",
                     "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [100.0, 0.0]]},
                     "properties": {"river": "Mill Creek", "reach": "Main"}}
                ]
            }),
        );
        write(
            dir.path(),
            XS_LAYER,
            json!({
                "type": "FeatureCollection",
                "features": [
                    {"type": "Feature",
                     "geometry": {"type": "LineString", "coordinates": [[80.0, -5.0], [80.0, 5.0]]},
                     "properties": {"river": "Mill Creek", "reach": "Main", "river_station": 20,
                                    "thalweg": 98.5,
                                    "station_elevation_points": "[[0, 105.0], [5, 98.5], [10, 106.0]]"}},
                    {"type": "Feature",
                     "geometry": {"type": "LineString", "coordinates": [[20.0, -5.0], [20.0, 5.0]]},
                     "properties": {"river": "Mill Creek", "reach": "Main", "river_station": "80.5"}}
                ]
            }),
        );
        let model = load_source_model(dir.path(), &ColumnConfig::new()).unwrap();
        assert_eq!(model.crs, None);
        assert!(model.junctions.is_empty());
        let reach = &model.reaches[0];
        assert_eq!(reach.cross_sections[0].xs_id, "80.5");
        assert!(!reach.cross_sections[0].has_elevation());
        assert_eq!(reach.cross_sections[1].max_elevation(), Some(106.0));
        assert_eq!(reach.cross_sections[1].min_elevation(), Some(98.5));
    }

    #[test]
    fn malformed_station_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            RIVER_LAYER,
            json!({"type": "FeatureCollection", "features": []}),
        );
        write(
            dir.path(),
            XS_LAYER,
            json!({
                "type": "FeatureCollection",
                "features": [
                    {"type": "Feature",
                     "geometry": {"type": "LineString", "coordinates": [[0.0, -5.0], [0.0, 5.0]]},
                     "properties": {"river": "r", "reach": "a", "river_station": "1200.*"}}
                ]
            }),
        );
        assert!(matches!(
            load_source_model(dir.path(), &ColumnConfig::new()),
            Err(ConflateError::MalformedStation { .. })
        ));
    }

    #[test]
    fn missing_layer_is_named() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_source_model(dir.path(), &ColumnConfig::new()),
            Err(ConflateError::MissingLayer(_))
        ));
    }
}
