use serde::Serialize;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

use crate::error::{ConflateError, Result};
use crate::geometry::ReachId;
use crate::io::csv::read_rating_curve_samples;
use crate::io::results::RatingCurveSample;
use crate::record::XsRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStage {
    InitialNormalDepth,
    IncrementalNormalDepth,
    KnownWse,
    FimLibrary,
}

impl SimulationStage {
    pub fn plan_suffix(&self) -> &'static str {
        match self {
            SimulationStage::InitialNormalDepth => "ind",
            SimulationStage::IncrementalNormalDepth => "nd",
            SimulationStage::KnownWse => "kwse",
            SimulationStage::FimLibrary => "fim",
        }
    }
}

// Everything the solver needs for one stage of one reach
#[derive(Debug, Clone, Serialize)]
pub struct StageRequest {
    pub reach_id: ReachId,
    pub stage: SimulationStage,
    pub us_xs: XsRef,
    pub ds_xs: XsRef,
    pub flows: Vec<f64>,
    pub known_wse: Vec<f64>,
}

/// The external hydraulic solver. Implementations return the rating-curve
/// samples of every profile at every cross-section they report.
pub trait HydraulicSolver {
    fn run(&self, request: &StageRequest) -> Result<Vec<RatingCurveSample>>;
}

/// Runs `program [args..] <request.json> <output.csv>` and reads the CSV.
#[derive(Debug, Clone)]
pub struct CommandSolver {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
}

impl CommandSolver {
    pub fn new(program: PathBuf, work_dir: PathBuf) -> Self {
        CommandSolver {
            program,
            args: Vec::new(),
            work_dir,
        }
    }
}

impl HydraulicSolver for CommandSolver {
    fn run(&self, request: &StageRequest) -> Result<Vec<RatingCurveSample>> {
        std::fs::create_dir_all(&self.work_dir)?;
        let stem = format!("{}_{}", request.reach_id, request.stage.plan_suffix());
        let request_path = self.work_dir.join(format!("{stem}.json"));
        let output_path = self.work_dir.join(format!("{stem}.csv"));
        std::fs::write(&request_path, serde_json::to_string_pretty(request)?)?;
        // a retried stage must never read the previous attempt's output
        match std::fs::remove_file(&output_path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        debug!(program = %self.program.display(), request = %request_path.display(), "invoking solver");
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(&request_path)
            .arg(&output_path)
            .status()?;
        if !status.success() {
            return Err(ConflateError::Solver(format!(
                "{} exited with {status} for reach {} ({})",
                self.program.display(),
                request.reach_id,
                request.stage.plan_suffix()
            )));
        }
        if !output_path.exists() {
            return Err(ConflateError::Solver(format!(
                "no output written to {}",
                output_path.display()
            )));
        }
        read_rating_curve_samples(&output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StageRequest {
        let xs = XsRef {
            river: "r".into(),
            reach: "a".into(),
            xs_id: "1".into(),
            min_elevation: 0.0,
            max_elevation: 5.0,
        };
        StageRequest {
            reach_id: 42,
            stage: SimulationStage::InitialNormalDepth,
            us_xs: xs.clone(),
            ds_xs: xs,
            flows: vec![100.0],
            known_wse: Vec::new(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_solver_reads_program_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut solver = CommandSolver::new(PathBuf::from("sh"), dir.path().to_path_buf());
        solver.args = vec![
            "-c".into(),
            "test -f \"$1\" && printf 'river_reach_station,profile,flow,depth,wse\\nr a 1,f_100,100,1.5,1.5\\n' > \"$2\""
                .into(),
            "solver".into(),
        ];
        let samples = solver.run(&request()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].xs_key, "r a 1");
        assert!(dir.path().join("42_ind.json").exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_program_is_a_solver_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut solver = CommandSolver::new(PathBuf::from("sh"), dir.path().to_path_buf());
        solver.args = vec!["-c".into(), "exit 3".into(), "solver".into()];
        assert!(matches!(solver.run(&request()), Err(ConflateError::Solver(_))));
    }

    #[cfg(unix)]
    #[test]
    fn leftover_output_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("42_ind.csv"),
            "river_reach_station,profile,flow,depth,wse\nr a 1,f_999,999,9,9\n",
        )
        .unwrap();
        let mut solver = CommandSolver::new(PathBuf::from("sh"), dir.path().to_path_buf());
        solver.args = vec!["-c".into(), "exit 0".into(), "solver".into()];
        assert!(matches!(solver.run(&request()), Err(ConflateError::Solver(_))));
        assert!(!dir.path().join("42_ind.csv").exists());
    }
}
