//! Reference-network and source-model features in a shared coordinate system,
//! plus the handful of spatial queries conflation needs.

use geo::line_measures::{Distance, Length};
use geo::{
    BoundingRect, Closest, ClosestPoint, Coord, Euclidean, Intersects, LineInterpolatePoint,
    LineString, MultiLineString, Point, Rect,
};
use rstar::RTree;
use std::path::Path;
use tracing::warn;

use crate::config::ColumnConfig;
use crate::error::{ConflateError, Result};
use crate::io::geojson::{load_reference_layer, load_source_model};

pub type ReachId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowStats {
    pub high_flow_threshold: Option<f64>,
    pub f100year: Option<f64>,
}

// Reach from the reference hydrofabric
#[derive(Debug, Clone)]
pub struct ReferenceReach {
    pub id: ReachId,
    pub geometry: LineString<f64>,
    pub to_id: Option<ReachId>,
    pub flows: FlowStats,
    pub stream_order: Option<u32>,
    pub gage: Option<String>,
}

impl ReferenceReach {
    pub fn start_point(&self) -> Option<Point<f64>> {
        self.geometry.points().next()
    }

    pub fn end_point(&self) -> Option<Point<f64>> {
        self.geometry.points().last()
    }

    pub fn length(&self) -> f64 {
        line_length(&self.geometry)
    }
}

#[derive(Debug, Clone)]
pub struct CrossSection {
    pub river: String,
    pub reach: String,
    /// Station label as written in the source model.
    pub xs_id: String,
    pub station: f64,
    pub geometry: LineString<f64>,
    pub elevations: Vec<f64>,
    pub thalweg: Option<f64>,
}

impl CrossSection {
    pub fn has_elevation(&self) -> bool {
        !self.elevations.is_empty() || self.thalweg.is_some()
    }

    pub fn min_elevation(&self) -> Option<f64> {
        self.thalweg.or_else(|| self.elevations.iter().copied().reduce(f64::min))
    }

    pub fn max_elevation(&self) -> Option<f64> {
        self.elevations.iter().copied().reduce(f64::max).or(self.thalweg)
    }

    /// The "river reach station" key the solver uses for its output rows.
    pub fn key(&self) -> String {
        format!("{} {} {}", self.river, self.reach, self.xs_id)
    }
}

/// One named (river, reach) centerline of the source model and its
/// cross-sections, ordered upstream to downstream.
#[derive(Debug, Clone)]
pub struct SourceReach {
    pub river: String,
    pub reach: String,
    pub centerline: LineString<f64>,
    pub cross_sections: Vec<CrossSection>,
}

impl SourceReach {
    /// Orders the cross-sections by descending station and rejects
    /// duplicate stations.
    pub fn new(
        river: String,
        reach: String,
        centerline: LineString<f64>,
        mut cross_sections: Vec<CrossSection>,
    ) -> Result<Self> {
        cross_sections.sort_by(|a, b| b.station.total_cmp(&a.station));
        if let Some(pair) = cross_sections.windows(2).find(|w| w[0].station == w[1].station) {
            return Err(ConflateError::InvalidGeometry {
                layer: "XS".to_string(),
                reason: format!(
                    "duplicate station {} on {} {}",
                    pair[0].xs_id, river, reach
                ),
            });
        }
        Ok(SourceReach {
            river,
            reach,
            centerline,
            cross_sections,
        })
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.river, self.reach)
    }

    pub fn start_point(&self) -> Option<Point<f64>> {
        self.centerline.points().next()
    }

    pub fn end_point(&self) -> Option<Point<f64>> {
        self.centerline.points().last()
    }
}

#[derive(Debug, Clone)]
pub struct Junction {
    pub name: String,
    pub location: Point<f64>,
}

#[derive(Debug, Clone)]
pub struct SourceModel {
    pub name: String,
    pub crs: Option<String>,
    pub reaches: Vec<SourceReach>,
    pub junctions: Vec<Junction>,
}

impl SourceModel {
    pub fn junction_near(&self, point: &Point<f64>, radius: f64) -> Option<&Junction> {
        self.junctions
            .iter()
            .find(|j| Euclidean.distance(j.location, *point) <= radius)
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceLayer {
    pub crs: Option<String>,
    pub reaches: Vec<ReferenceReach>,
}

/// Read-only snapshot of both networks. Loading is eager; once built the
/// adapter only answers queries.
#[derive(Debug, Clone)]
pub struct GeometryAdapter {
    pub crs: Option<String>,
    pub reference: Vec<ReferenceReach>,
    pub model: SourceModel,
}

impl GeometryAdapter {
    pub fn new(reference: ReferenceLayer, model: SourceModel) -> Result<Self> {
        match (&reference.crs, &model.crs) {
            (Some(reference_crs), Some(source_crs)) if reference_crs != source_crs => {
                return Err(ConflateError::CrsMismatch {
                    reference_crs: reference_crs.clone(),
                    source_crs: source_crs.clone(),
                });
            }
            (Some(reference_crs), None) => {
                warn!(
                    model = %model.name,
                    crs = %reference_crs,
                    "source model carries no CRS tag, assuming the reference CRS"
                );
            }
            _ => {}
        }
        Ok(GeometryAdapter {
            crs: reference.crs,
            reference: reference.reaches,
            model,
        })
    }

    pub fn load(network_path: &Path, model_dir: &Path, columns: &ColumnConfig) -> Result<Self> {
        let reference = load_reference_layer(network_path, columns)?;
        let model = load_source_model(model_dir, columns)?;
        Self::new(reference, model)
    }

    /// Reference reaches whose extent overlaps the source reach extent padded
    /// by `buffer`.
    pub fn candidates_for(&self, source: &SourceReach, buffer: f64) -> Vec<&ReferenceReach> {
        let Some(extent) = source_extent(source) else {
            return Vec::new();
        };
        let search = pad(extent, buffer);
        self.reference
            .iter()
            .filter(|reach| {
                reach
                    .geometry
                    .bounding_rect()
                    .is_some_and(|rect| rect.intersects(&search))
            })
            .collect()
    }
}

/// Id of the candidate closest to `point`.
pub fn nearest_feature(
    point: &Point<f64>,
    candidates: &[&ReferenceReach],
    threshold: f64,
) -> Result<ReachId> {
    let (index, distance) = nearest_line(point, candidates.iter().map(|r| &r.geometry))
        .ok_or(ConflateError::NoCandidate)?;
    let id = candidates[index].id;
    if distance > threshold {
        return Err(ConflateError::AmbiguousAssociation {
            id,
            distance,
            threshold,
        });
    }
    Ok(id)
}

/// Index and distance of the line closest to `point`. Ties go to the first.
pub fn nearest_line<'a>(
    point: &Point<f64>,
    lines: impl IntoIterator<Item = &'a LineString<f64>>,
) -> Option<(usize, f64)> {
    lines
        .into_iter()
        .enumerate()
        .map(|(i, line)| (i, distance_to_line(point, line)))
        .filter(|(_, d)| d.is_finite())
        .fold(None, |best, (i, d)| match best {
            Some((_, best_d)) if best_d <= d => best,
            _ => Some((i, d)),
        })
}

pub fn distance_to_line(point: &Point<f64>, line: &LineString<f64>) -> f64 {
    match line.closest_point(point) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => Euclidean.distance(p, *point),
        Closest::Indeterminate => f64::INFINITY,
    }
}

/// Indices of the cross-sections that cross `line`.
pub fn intersecting_cross_sections(line: &LineString<f64>, xs: &[CrossSection]) -> Vec<usize> {
    xs.iter()
        .enumerate()
        .filter(|(_, x)| x.geometry.intersects(line))
        .map(|(i, _)| i)
        .collect()
}

pub fn line_length(line: &LineString<f64>) -> f64 {
    Euclidean.length(line)
}

/// Points every `spacing` units along `line`, always including both ends.
pub fn sample_points(line: &LineString<f64>, spacing: f64) -> Vec<Point<f64>> {
    let length = line_length(line);
    if length == 0.0 || spacing <= 0.0 || !spacing.is_finite() {
        return line.points().collect();
    }

    let steps = (length / spacing).floor() as usize;
    let mut samples: Vec<Point<f64>> = (0..=steps)
        .filter_map(|i| line.line_interpolate_point((i as f64 * spacing / length).min(1.0)))
        .collect();

    if let Some(last) = line.points().last() {
        let reached = samples
            .last()
            .is_some_and(|p| Euclidean.distance(*p, last) <= spacing * 1e-9);
        if !reached {
            samples.push(last);
        }
    }
    samples
}

/// Nearest-point index over the densified centerlines of the source model.
pub struct CenterlineIndex {
    tree: RTree<[f64; 2]>,
}

impl CenterlineIndex {
    pub fn new<'a>(centerlines: impl IntoIterator<Item = &'a LineString<f64>>, spacing: f64) -> Self {
        let points = centerlines
            .into_iter()
            .flat_map(|line| sample_points(line, spacing))
            .map(|p| [p.x(), p.y()])
            .collect();
        CenterlineIndex {
            tree: RTree::bulk_load(points),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    pub fn nearest_distance(&self, point: &Point<f64>) -> Option<f64> {
        self.tree
            .nearest_neighbor(&[point.x(), point.y()])
            .map(|p| (p[0] - point.x()).hypot(p[1] - point.y()))
    }

    /// Mean and max nearest distance over `samples`.
    pub fn offsets(&self, samples: &[Point<f64>]) -> Option<(f64, f64)> {
        let distances: Vec<f64> = samples
            .iter()
            .filter_map(|p| self.nearest_distance(p))
            .collect();
        if distances.is_empty() {
            return None;
        }
        let mean = distances.iter().sum::<f64>() / distances.len() as f64;
        let max = distances.iter().copied().fold(0.0, f64::max);
        Some((mean, max))
    }
}

fn source_extent(source: &SourceReach) -> Option<Rect<f64>> {
    let lines: Vec<LineString<f64>> = std::iter::once(&source.centerline)
        .chain(source.cross_sections.iter().map(|x| &x.geometry))
        .cloned()
        .collect();
    MultiLineString::new(lines).bounding_rect()
}

fn pad(rect: Rect<f64>, amount: f64) -> Rect<f64> {
    let margin = Coord {
        x: amount,
        y: amount,
    };
    Rect::new(rect.min() - margin, rect.max() + margin)
}
