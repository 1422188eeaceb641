//! Per-reach simulation lifecycle and the driver that walks conflated reaches
//! through the external solver in run order.

use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::FlowConfig;
use crate::error::{ConflateError, Result};
use crate::geometry::ReachId;
use crate::increment::{increment, initial_flows, kwse_axis};
use crate::io::rating_db::{BoundaryCondition, RatingCurveRow, RatingCurveStore};
use crate::io::results::StageResults;
use crate::record::{ConflationFile, ConflationRecord, ScoredReach};
use crate::run_order;
use crate::solver::{HydraulicSolver, SimulationStage, StageRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReachStage {
    NotConflated,
    Conflated,
    /// Eclipsed reaches stop here.
    Skipped,
    InitialRunComplete,
    IncrementalRunComplete,
    KwseRunComplete,
    FimLibraryBuilt,
}

impl SimulationStage {
    pub fn completes(&self) -> ReachStage {
        match self {
            SimulationStage::InitialNormalDepth => ReachStage::InitialRunComplete,
            SimulationStage::IncrementalNormalDepth => ReachStage::IncrementalRunComplete,
            SimulationStage::KnownWse => ReachStage::KwseRunComplete,
            SimulationStage::FimLibrary => ReachStage::FimLibraryBuilt,
        }
    }

    pub fn boundary_condition(&self) -> BoundaryCondition {
        match self {
            SimulationStage::KnownWse => BoundaryCondition::KnownWse,
            _ => BoundaryCondition::NormalDepth,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReachLifecycle {
    pub reach_id: ReachId,
    pub stage: ReachStage,
    pub eclipsed: bool,
    /// Conflated, non-eclipsed reach this one takes its known WSE from.
    pub downstream: Option<ReachId>,
}

impl ReachLifecycle {
    pub fn new(reach_id: ReachId) -> Self {
        ReachLifecycle {
            reach_id,
            stage: ReachStage::NotConflated,
            eclipsed: false,
            downstream: None,
        }
    }

    pub fn conflate(&mut self, record: &ConflationRecord, downstream: Option<ReachId>) -> Result<()> {
        self.eclipsed = record.is_eclipsed();
        self.downstream = if self.eclipsed { None } else { downstream };
        self.advance(ReachStage::Conflated)
    }

    pub fn has_downstream_kwse(&self) -> bool {
        self.downstream.is_some()
    }

    pub fn can_advance(&self, to: ReachStage) -> bool {
        use ReachStage::*;
        match (self.stage, to) {
            (NotConflated, Conflated) => true,
            (Conflated, Skipped) => self.eclipsed,
            (Conflated, InitialRunComplete) => !self.eclipsed,
            (InitialRunComplete, IncrementalRunComplete) => true,
            (IncrementalRunComplete, KwseRunComplete) => self.has_downstream_kwse(),
            (IncrementalRunComplete, FimLibraryBuilt) => !self.has_downstream_kwse(),
            (KwseRunComplete, FimLibraryBuilt) => true,
            _ => false,
        }
    }

    pub fn advance(&mut self, to: ReachStage) -> Result<()> {
        if !self.can_advance(to) {
            return Err(ConflateError::IllegalTransition {
                reach_id: self.reach_id,
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        Ok(())
    }

    /// Whether the rating curve upstream neighbours read is final.
    pub fn has_published(&self) -> bool {
        match self.stage {
            ReachStage::KwseRunComplete | ReachStage::FimLibraryBuilt => true,
            ReachStage::IncrementalRunComplete => !self.has_downstream_kwse(),
            _ => false,
        }
    }

    pub fn published_condition(&self) -> BoundaryCondition {
        if self.has_downstream_kwse() {
            BoundaryCondition::KnownWse
        } else {
            BoundaryCondition::NormalDepth
        }
    }

    /// The stage a reach must be in before `stage` may run.
    fn required_for(&self, stage: SimulationStage) -> ReachStage {
        match stage {
            SimulationStage::InitialNormalDepth => ReachStage::Conflated,
            SimulationStage::IncrementalNormalDepth => ReachStage::InitialRunComplete,
            SimulationStage::KnownWse => ReachStage::IncrementalRunComplete,
            SimulationStage::FimLibrary if self.has_downstream_kwse() => ReachStage::KwseRunComplete,
            SimulationStage::FimLibrary => ReachStage::IncrementalRunComplete,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReachFailure {
    pub reach_id: ReachId,
    pub stage: SimulationStage,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub order: Vec<ReachId>,
    pub completed: Vec<ReachId>,
    pub skipped: Vec<ReachId>,
    pub failures: Vec<ReachFailure>,
}

pub struct Pipeline<'a> {
    conflation: &'a ConflationFile,
    flows: &'a FlowConfig,
    lifecycles: BTreeMap<ReachId, ReachLifecycle>,
    stage_flows: HashMap<ReachId, Vec<f64>>,
    known_wse: HashMap<ReachId, Vec<f64>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(conflation: &'a ConflationFile, flows: &'a FlowConfig) -> Result<Self> {
        let mut lifecycles = BTreeMap::new();
        for (id, record) in &conflation.reaches {
            let downstream = record.network_to_id().filter(|d| {
                conflation
                    .reaches
                    .get(d)
                    .is_some_and(|r| !r.is_eclipsed())
            });
            let mut lifecycle = ReachLifecycle::new(*id);
            lifecycle.conflate(record, downstream)?;
            lifecycles.insert(*id, lifecycle);
        }
        Ok(Pipeline {
            conflation,
            flows,
            lifecycles,
            stage_flows: HashMap::new(),
            known_wse: HashMap::new(),
        })
    }

    pub fn lifecycle(&self, reach_id: ReachId) -> Option<&ReachLifecycle> {
        self.lifecycles.get(&reach_id)
    }

    pub fn stage(&self, reach_id: ReachId) -> Option<ReachStage> {
        self.lifecycle(reach_id).map(|l| l.stage)
    }

    fn not_ready(reach_id: ReachId, reason: impl Into<String>) -> ConflateError {
        ConflateError::NotReady {
            reach_id,
            reason: reason.into(),
        }
    }

    fn scored(&self, reach_id: ReachId) -> Result<&'a ScoredReach> {
        let conflation = self.conflation;
        conflation
            .reaches
            .get(&reach_id)
            .and_then(ConflationRecord::scored)
            .ok_or_else(|| Self::not_ready(reach_id, "reach is eclipsed or not conflated"))
    }

    /// Errors with `NotReady` unless `stage` may run for `reach_id` now.
    pub fn check_ready(
        &self,
        reach_id: ReachId,
        stage: SimulationStage,
        store: &RatingCurveStore,
    ) -> Result<()> {
        let lifecycle = self
            .lifecycles
            .get(&reach_id)
            .ok_or_else(|| Self::not_ready(reach_id, "reach is not conflated"))?;
        if lifecycle.eclipsed {
            return Err(Self::not_ready(reach_id, "reach is eclipsed"));
        }
        let required = lifecycle.required_for(stage);
        if lifecycle.stage != required {
            return Err(Self::not_ready(
                reach_id,
                format!("stage is {:?}, {:?} needs {:?}", lifecycle.stage, stage, required),
            ));
        }

        match stage {
            SimulationStage::IncrementalNormalDepth => {
                if !store.has_curve(reach_id, BoundaryCondition::NormalDepth)? {
                    return Err(Self::not_ready(reach_id, "no initial-run rating curve"));
                }
            }
            SimulationStage::KnownWse => {
                let Some(downstream) = lifecycle.downstream else {
                    return Err(Self::not_ready(reach_id, "no downstream reach to take a known WSE from"));
                };
                let published = &self.lifecycles[&downstream];
                if !published.has_published() {
                    return Err(Self::not_ready(
                        reach_id,
                        format!("downstream reach {downstream} has not published its rating curve"),
                    ));
                }
                if store
                    .wse_range(downstream, published.published_condition())?
                    .is_none()
                {
                    return Err(Self::not_ready(
                        reach_id,
                        format!("downstream reach {downstream} has an empty rating curve"),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn stage_inputs(
        &self,
        reach_id: ReachId,
        stage: SimulationStage,
        scored: &ScoredReach,
        store: &RatingCurveStore,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let step = self.flows.depth_increment;
        match stage {
            SimulationStage::InitialNormalDepth => Ok((
                initial_flows(
                    scored.flows.low_flow_cfs,
                    scored.flows.high_flow_cfs,
                    self.flows.initial_discharge_count,
                ),
                Vec::new(),
            )),
            SimulationStage::IncrementalNormalDepth => {
                let initial = SimulationStage::InitialNormalDepth.plan_suffix();
                let (flows, depths): (Vec<f64>, Vec<f64>) = store
                    .rows(reach_id)?
                    .iter()
                    .filter(|r| r.plan_suffix == initial)
                    .map(|r| (r.us_flow, r.ds_depth))
                    .unzip();
                let mut distinct = flows.clone();
                distinct.sort_by(f64::total_cmp);
                distinct.dedup();
                if distinct.len() == 1 {
                    debug!(reach_id, flow = distinct[0], "single initial flow, rerun unchanged");
                    return Ok((distinct, Vec::new()));
                }
                let (new_flows, _) = increment(&flows, &depths, step, self.flows.degenerate_policy)?;
                Ok((new_flows, Vec::new()))
            }
            SimulationStage::KnownWse => {
                let downstream = self.lifecycles[&reach_id]
                    .downstream
                    .ok_or_else(|| Self::not_ready(reach_id, "no downstream reach"))?;
                let condition = self.lifecycles[&downstream].published_condition();
                let (min, max) = store
                    .wse_range(downstream, condition)?
                    .ok_or_else(|| Self::not_ready(reach_id, "downstream curve missing"))?;
                Ok((
                    self.stage_flows.get(&reach_id).cloned().unwrap_or_default(),
                    kwse_axis(min, max, step)?,
                ))
            }
            SimulationStage::FimLibrary => Ok((
                self.stage_flows.get(&reach_id).cloned().unwrap_or_default(),
                self.known_wse.get(&reach_id).cloned().unwrap_or_default(),
            )),
        }
    }

    /// Runs one stage for one reach and persists its rating curve.
    pub fn execute(
        &mut self,
        reach_id: ReachId,
        stage: SimulationStage,
        solver: &dyn HydraulicSolver,
        store: &mut RatingCurveStore,
    ) -> Result<()> {
        self.check_ready(reach_id, stage, store)?;
        let scored = self.scored(reach_id)?;
        let (flows, known_wse) = self.stage_inputs(reach_id, stage, scored, store)?;

        let request = StageRequest {
            reach_id,
            stage,
            us_xs: scored.us_xs.clone(),
            ds_xs: scored.ds_xs.clone(),
            flows,
            known_wse,
        };
        let samples = solver.run(&request)?;
        debug!(reach_id, ?stage, samples = samples.len(), "solver finished");

        if stage != SimulationStage::FimLibrary {
            let results = StageResults::new(samples);
            let rows = rating_rows(reach_id, stage, scored, &results);
            if rows.is_empty() {
                return Err(ConflateError::Solver(format!(
                    "no paired samples at '{}' and '{}'",
                    scored.us_xs.key(),
                    scored.ds_xs.key()
                )));
            }
            store.insert(&rows)?;
        }

        match stage {
            SimulationStage::IncrementalNormalDepth => {
                self.stage_flows.insert(reach_id, request.flows);
            }
            SimulationStage::KnownWse => {
                self.known_wse.insert(reach_id, request.known_wse);
            }
            _ => {}
        }

        if let Some(lifecycle) = self.lifecycles.get_mut(&reach_id) {
            lifecycle.advance(stage.completes())?;
        }
        Ok(())
    }

    fn run_stages(
        &mut self,
        reach_id: ReachId,
        stages: &[SimulationStage],
        solver: &dyn HydraulicSolver,
        store: &mut RatingCurveStore,
    ) -> std::result::Result<(), ReachFailure> {
        for stage in stages {
            self.execute(reach_id, *stage, solver, store)
                .map_err(|e| {
                    warn!(reach_id, ?stage, error = %e, "stage failed");
                    ReachFailure {
                        reach_id,
                        stage: *stage,
                        reason: e.to_string(),
                    }
                })?;
        }
        Ok(())
    }

    /// Drives every conflated reach to a terminal stage.
    ///
    /// Normal-depth stages run per reach in run order. Known-WSE stages run in
    /// waves: a reach joins a wave only once its downstream neighbour has
    /// published. A failed reach is reported and never blocks its siblings,
    /// though reaches that depend on it fail too.
    pub fn run(
        &mut self,
        solver: &dyn HydraulicSolver,
        store: &mut RatingCurveStore,
        pb: &ProgressBar,
    ) -> Result<PipelineReport> {
        let order = run_order::order(&self.conflation.reaches)?;
        let mut report = PipelineReport {
            order: order.clone(),
            ..Default::default()
        };

        for (id, lifecycle) in self.lifecycles.iter_mut() {
            if lifecycle.eclipsed {
                lifecycle.advance(ReachStage::Skipped)?;
                report.skipped.push(*id);
            }
        }
        pb.set_length((order.len() * 2) as u64);

        let mut failed: HashSet<ReachId> = HashSet::new();
        for id in &order {
            let stages = [
                SimulationStage::InitialNormalDepth,
                SimulationStage::IncrementalNormalDepth,
            ];
            if let Err(failure) = self.run_stages(*id, &stages, solver, store) {
                failed.insert(*id);
                report.failures.push(failure);
            }
            pb.inc(1);
        }

        let mut pending: Vec<ReachId> = order.iter().copied().filter(|id| !failed.contains(id)).collect();
        while !pending.is_empty() {
            let (ready, waiting): (Vec<ReachId>, Vec<ReachId>) = pending
                .into_iter()
                .partition(|id| self.downstream_settled(*id, &failed));

            if ready.is_empty() {
                for id in waiting {
                    report.failures.push(ReachFailure {
                        reach_id: id,
                        stage: SimulationStage::KnownWse,
                        reason: "downstream rating curve never published".to_string(),
                    });
                    pb.inc(1);
                }
                break;
            }

            for id in ready {
                let downstream = self.lifecycles[&id].downstream;
                let outcome = match downstream {
                    Some(d) if failed.contains(&d) => Err(ReachFailure {
                        reach_id: id,
                        stage: SimulationStage::KnownWse,
                        reason: format!("downstream reach {d} failed"),
                    }),
                    Some(_) => self.run_stages(
                        id,
                        &[SimulationStage::KnownWse, SimulationStage::FimLibrary],
                        solver,
                        store,
                    ),
                    None => self.run_stages(id, &[SimulationStage::FimLibrary], solver, store),
                };
                match outcome {
                    Ok(()) => report.completed.push(id),
                    Err(failure) => {
                        failed.insert(id);
                        report.failures.push(failure);
                    }
                }
                pb.inc(1);
            }
            pending = waiting;
        }

        info!(
            completed = report.completed.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "pipeline finished"
        );
        Ok(report)
    }

    fn downstream_settled(&self, reach_id: ReachId, failed: &HashSet<ReachId>) -> bool {
        match self.lifecycles[&reach_id].downstream {
            None => true,
            Some(d) => failed.contains(&d) || self.lifecycles[&d].has_published(),
        }
    }
}

fn rating_rows(
    reach_id: ReachId,
    stage: SimulationStage,
    scored: &ScoredReach,
    results: &StageResults,
) -> Vec<RatingCurveRow> {
    let us_key = scored.us_xs.key();
    let ds_key = scored.ds_xs.key();
    results
        .paired(&us_key, &ds_key)
        .into_iter()
        .map(|(us, ds)| RatingCurveRow {
            reach_id,
            us_flow: us.flow,
            us_depth: us.depth,
            us_wse: us.wse,
            ds_depth: ds.depth,
            ds_wse: ds.wse,
            boundary_condition: stage.boundary_condition(),
            plan_suffix: stage.plan_suffix().to_string(),
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::io::results::RatingCurveSample;
    use std::cell::RefCell;

    /// Solver stand-in: depth grows linearly with flow, known WSE pins the
    /// downstream water surface.
    #[derive(Default)]
    pub struct MockSolver {
        pub calls: RefCell<Vec<(ReachId, SimulationStage)>>,
        pub requests: RefCell<Vec<StageRequest>>,
        pub fail_on: Option<(ReachId, SimulationStage)>,
    }

    impl HydraulicSolver for MockSolver {
        fn run(&self, request: &StageRequest) -> Result<Vec<RatingCurveSample>> {
            self.calls.borrow_mut().push((request.reach_id, request.stage));
            self.requests.borrow_mut().push(request.clone());
            if self.fail_on == Some((request.reach_id, request.stage)) {
                return Err(ConflateError::Solver("mock failure".into()));
            }
            let mut samples = Vec::new();
            let boundaries: Vec<Option<f64>> = if request.known_wse.is_empty() {
                vec![None]
            } else {
                request.known_wse.iter().copied().map(Some).collect()
            };
            for flow in &request.flows {
                for kwse in &boundaries {
                    let profile = match kwse {
                        Some(wse) => format!("f_{flow}-z_{wse}"),
                        None => format!("f_{flow}"),
                    };
                    let us_depth = flow / 100.0;
                    let ds_depth = match kwse {
                        Some(wse) => (wse - request.ds_xs.min_elevation).max(0.9 * us_depth),
                        None => 0.9 * us_depth,
                    };
                    samples.push(RatingCurveSample {
                        xs_key: request.us_xs.key(),
                        profile: profile.clone(),
                        flow: *flow,
                        depth: us_depth,
                        wse: request.us_xs.min_elevation + us_depth,
                    });
                    samples.push(RatingCurveSample {
                        xs_key: request.ds_xs.key(),
                        profile,
                        flow: *flow,
                        depth: ds_depth,
                        wse: request.ds_xs.min_elevation + ds_depth,
                    });
                }
            }
            Ok(samples)
        }
    }
}
