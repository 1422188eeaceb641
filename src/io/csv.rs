use csv::{ReaderBuilder, Writer, WriterBuilder};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

use crate::error::Result;
use crate::io::rating_db::RatingCurveRow;
use crate::io::results::RatingCurveSample;

// Solver output: river_reach_station,profile,flow,depth,wse
pub fn read_rating_curve_samples(path: &Path) -> Result<Vec<RatingCurveSample>> {
    let file = File::open(path)?;
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let samples = rdr
        .deserialize()
        .collect::<std::result::Result<Vec<RatingCurveSample>, _>>()?;
    debug!(path = %path.display(), samples = samples.len(), "read rating curve samples");
    Ok(samples)
}

/// Plain (flow, depth) pairs, for curves handed over outside the solver.
pub fn read_flow_depth(path: &Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut flows = Vec::new();
    let mut depths = Vec::new();
    for record in rdr.deserialize() {
        let (flow, depth): (f64, f64) = record?;
        flows.push(flow);
        depths.push(depth);
    }
    Ok((flows, depths))
}

pub fn write_flow_depth(path: &Path, flows: &[f64], depths: &[f64]) -> Result<()> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_path(path)?;
    wtr.write_record(["flow", "depth"])?;
    for (flow, depth) in flows.iter().zip(depths) {
        wtr.write_record(&[flow.to_string(), depth.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

// Create CSV writer with headers
pub fn create_rating_curve_writer(path: &Path) -> Result<Writer<File>> {
    let mut wtr = WriterBuilder::new().has_headers(false).from_path(path)?;
    wtr.write_record([
        "reach_id",
        "us_flow",
        "us_depth",
        "us_wse",
        "ds_depth",
        "ds_wse",
        "boundary_condition",
        "plan_suffix",
    ])?;
    Ok(wtr)
}

pub fn write_rating_curve_rows(wtr: &mut Writer<File>, rows: &[RatingCurveRow]) -> Result<()> {
    for row in rows {
        wtr.write_record(&[
            row.reach_id.to_string(),
            row.us_flow.to_string(),
            row.us_depth.to_string(),
            row.us_wse.to_string(),
            row.ds_depth.to_string(),
            row.ds_wse.to_string(),
            row.boundary_condition.as_str().to_string(),
            row.plan_suffix.clone(),
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_solver_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(
            &path,
            "river_reach_station,profile,flow,depth,wse\n\
             Mill Creek Main 950, f_100 ,100,1.5,101.5\n\
             Mill Creek Main 50,f_100,100,1.2,98.2\n",
        )
        .unwrap();
        let samples = read_rating_curve_samples(&path).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].xs_key, "Mill Creek Main 950");
        assert_eq!(samples[0].profile, "f_100");
        assert_eq!(samples[1].wse, 98.2);
    }

    #[test]
    fn reads_flow_depth_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.csv");
        std::fs::write(&path, "flow,depth\n30,3.0\n10,1.0\n").unwrap();
        let (flows, depths) = read_flow_depth(&path).unwrap();
        assert_eq!(flows, vec![30.0, 10.0]);
        assert_eq!(depths, vec![3.0, 1.0]);

        write_flow_depth(&path, &[10.0, 15.0], &[1.0, 1.5]).unwrap();
        assert_eq!(read_flow_depth(&path).unwrap(), (vec![10.0, 15.0], vec![1.0, 1.5]));
    }
}
