use rusqlite::{Connection, params};
use std::path::Path;

use crate::error::{ConflateError, Result};
use crate::geometry::ReachId;

// SQLite integers are signed
fn sql_id(reach_id: ReachId) -> Result<i64> {
    i64::try_from(reach_id).map_err(|_| ConflateError::ReachIdOutOfRange(reach_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryCondition {
    NormalDepth,
    KnownWse,
}

impl BoundaryCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryCondition::NormalDepth => "nd",
            BoundaryCondition::KnownWse => "kwse",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatingCurveRow {
    pub reach_id: ReachId,
    pub us_flow: f64,
    pub us_depth: f64,
    pub us_wse: f64,
    pub ds_depth: f64,
    pub ds_wse: f64,
    pub boundary_condition: BoundaryCondition,
    pub plan_suffix: String,
}

/// Queryable rating-curve tables, one SQLite file per source model.
pub struct RatingCurveStore {
    conn: Connection,
}

impl RatingCurveStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rating_curves (
                reach_id INTEGER NOT NULL,
                us_flow REAL NOT NULL,
                us_depth REAL NOT NULL,
                us_wse REAL NOT NULL,
                ds_depth REAL NOT NULL,
                ds_wse REAL NOT NULL,
                boundary_condition TEXT NOT NULL CHECK (boundary_condition IN ('nd', 'kwse')),
                plan_suffix TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS rating_curves_reach
                ON rating_curves (reach_id, boundary_condition);",
        )?;
        Ok(RatingCurveStore { conn })
    }

    /// Replaces any rows previously stored for the same reach, boundary
    /// condition and plan, so a retried stage does not duplicate its curve.
    pub fn insert(&mut self, rows: &[RatingCurveRow]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut clear = tx.prepare(
                "DELETE FROM rating_curves
                 WHERE reach_id = ?1 AND boundary_condition = ?2 AND plan_suffix = ?3",
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO rating_curves
                 (reach_id, us_flow, us_depth, us_wse, ds_depth, ds_wse, boundary_condition, plan_suffix)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let mut cleared = std::collections::HashSet::new();
            for row in rows {
                let key = (row.reach_id, row.boundary_condition.as_str(), row.plan_suffix.clone());
                if cleared.insert(key) {
                    clear.execute(params![
                        sql_id(row.reach_id)?,
                        row.boundary_condition.as_str(),
                        row.plan_suffix
                    ])?;
                }
                insert.execute(params![
                    sql_id(row.reach_id)?,
                    row.us_flow,
                    row.us_depth,
                    row.us_wse,
                    row.ds_depth,
                    row.ds_wse,
                    row.boundary_condition.as_str(),
                    row.plan_suffix
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn has_curve(&self, reach_id: ReachId, bc: BoundaryCondition) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM rating_curves WHERE reach_id = ?1 AND boundary_condition = ?2",
            params![sql_id(reach_id)?, bc.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Min and max upstream WSE published for a reach.
    pub fn wse_range(&self, reach_id: ReachId, bc: BoundaryCondition) -> Result<Option<(f64, f64)>> {
        let range: (Option<f64>, Option<f64>) = self.conn.query_row(
            "SELECT MIN(us_wse), MAX(us_wse) FROM rating_curves
             WHERE reach_id = ?1 AND boundary_condition = ?2",
            params![sql_id(reach_id)?, bc.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match range {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }

    pub fn rows(&self, reach_id: ReachId) -> Result<Vec<RatingCurveRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT reach_id, us_flow, us_depth, us_wse, ds_depth, ds_wse, boundary_condition, plan_suffix
             FROM rating_curves WHERE reach_id = ?1
             ORDER BY boundary_condition, plan_suffix, us_flow, ds_wse",
        )?;
        let key = sql_id(reach_id)?;
        let mapped = stmt.query_map(params![key], |row| {
            let bc: String = row.get(6)?;
            Ok(RatingCurveRow {
                reach_id,
                us_flow: row.get(1)?,
                us_depth: row.get(2)?,
                us_wse: row.get(3)?,
                ds_depth: row.get(4)?,
                ds_wse: row.get(5)?,
                boundary_condition: if bc == "kwse" {
                    BoundaryCondition::KnownWse
                } else {
                    BoundaryCondition::NormalDepth
                },
                plan_suffix: row.get(7)?,
            })
        })?;
        let rows = mapped.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
