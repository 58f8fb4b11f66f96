//! Geofenced branch resolver.
//!
//! Loads each active branch's stored fence and picks the branch serving a
//! delivery point: the closest covering branch, else the nearest branch.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DbContext, SyncError};
use crate::geo::{AlertMode, FenceCheck, FenceType, GeoPoint, Geofence};

/// A stored branch row with its parsed fence.
#[derive(Debug, Clone)]
pub struct BranchFence {
    pub branch_id: i64,
    pub branch_name: String,
    pub fence: Geofence,
}

/// One branch evaluated against a point.
#[derive(Debug, Clone)]
pub struct BranchCandidate {
    pub branch_id: i64,
    pub branch_name: String,
    pub check: FenceCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchMatch {
    pub branch_id: i64,
    pub branch_name: String,
    pub distance_km: f64,
    /// `false` when the branch was chosen only as the nearest fallback.
    pub covered: bool,
}

fn load_points(conn: &Connection, branch_id: i64) -> Result<Vec<GeoPoint>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT latitude, longitude FROM branch_fence_points
             WHERE branch_id = ?1 ORDER BY ordinal",
        )
        .db_context("prepare fence points")?;
    let rows = stmt
        .query_map(params![branch_id], |row| {
            Ok(GeoPoint::new(row.get(0)?, row.get(1)?))
        })
        .db_context("query fence points")?;
    rows.collect::<Result<Vec<_>, _>>()
        .db_context("read fence points")
}

fn build_fence(
    conn: &Connection,
    branch_id: i64,
    fence_code: &str,
    radius_km: f64,
) -> Result<Geofence, SyncError> {
    let fence_type = FenceType::from_code(fence_code);
    let points = if fence_type == FenceType::None {
        Vec::new()
    } else {
        load_points(conn, branch_id)?
    };
    Geofence::from_stored(fence_type, radius_km, &points)
        .map_err(|reason| SyncError::InvalidGeofence { branch_id, reason })
}

/// Load one branch's fence regardless of its status.
pub fn load_geofence(conn: &Connection, branch_id: i64) -> Result<BranchFence, SyncError> {
    let row: Option<(String, String, f64)> = conn
        .query_row(
            "SELECT name, fence_type, radius_km FROM branches WHERE id = ?1",
            params![branch_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .db_context("load branch")?;
    let (branch_name, fence_code, radius_km) = row.ok_or(SyncError::NotFound {
        entity: "branch",
        id: branch_id,
    })?;

    let fence = build_fence(conn, branch_id, &fence_code, radius_km)?;
    Ok(BranchFence {
        branch_id,
        branch_name,
        fence,
    })
}

/// Evaluate a branch fence against a point with an explicit alert code.
///
/// Unlike the resolver, an unusable fence is an error here.
pub fn check_alert(
    conn: &Connection,
    branch_id: i64,
    aviso: &str,
    point: GeoPoint,
) -> Result<FenceCheck, SyncError> {
    if !point.is_valid() {
        return Err(SyncError::Validation(format!(
            "coordinates out of range: {}, {}",
            point.lat, point.lng
        )));
    }
    let branch = load_geofence(conn, branch_id)?;
    Ok(branch.fence.check(point, AlertMode::from_code(aviso)))
}

/// Active branches of a company with usable fences. Branches whose stored
/// fence is broken are skipped with a warning.
pub fn active_branch_fences(
    conn: &Connection,
    company_id: i64,
) -> Result<Vec<BranchFence>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, fence_type, radius_km FROM branches
             WHERE company_id = ?1 AND status = 'S' ORDER BY id",
        )
        .db_context("prepare branches")?;
    let rows = stmt
        .query_map(params![company_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })
        .db_context("query branches")?
        .collect::<Result<Vec<_>, _>>()
        .db_context("read branches")?;

    let mut fences = Vec::with_capacity(rows.len());
    for (branch_id, branch_name, fence_code, radius_km) in rows {
        match build_fence(conn, branch_id, &fence_code, radius_km) {
            Ok(fence) => fences.push(BranchFence {
                branch_id,
                branch_name,
                fence,
            }),
            Err(e) => warn!(branch_id, company_id, "Skipping branch: {e}"),
        }
    }
    Ok(fences)
}

/// Pick the covering branch with the smallest distance, otherwise the
/// nearest branch with a defined distance.
pub fn pick_branch(candidates: &[BranchCandidate]) -> Option<BranchMatch> {
    let mut covering: Option<(&BranchCandidate, f64)> = None;
    let mut nearest: Option<(&BranchCandidate, f64)> = None;

    for candidate in candidates {
        let Some(distance) = candidate.check.distance_km else {
            continue;
        };
        if candidate.check.matched && covering.map_or(true, |(_, best)| distance < best) {
            covering = Some((candidate, distance));
        }
        if nearest.map_or(true, |(_, best)| distance < best) {
            nearest = Some((candidate, distance));
        }
    }

    let covered = covering.is_some();
    covering.or(nearest).map(|(c, distance_km)| BranchMatch {
        branch_id: c.branch_id,
        branch_name: c.branch_name.clone(),
        distance_km,
        covered,
    })
}

/// Resolve the branch of `company_id` that serves `point`.
pub fn resolve_branch(
    conn: &Connection,
    company_id: i64,
    point: GeoPoint,
) -> Result<BranchMatch, SyncError> {
    if !point.is_valid() {
        return Err(SyncError::Validation(format!(
            "coordinates out of range: {}, {}",
            point.lat, point.lng
        )));
    }

    let candidates: Vec<BranchCandidate> = active_branch_fences(conn, company_id)?
        .into_iter()
        .map(|b| BranchCandidate {
            check: b.fence.check(point, AlertMode::Enter),
            branch_id: b.branch_id,
            branch_name: b.branch_name,
        })
        .collect();

    let picked = pick_branch(&candidates).ok_or(SyncError::NoValidBranch(company_id))?;
    debug!(
        company_id,
        branch_id = picked.branch_id,
        distance_km = picked.distance_km,
        covered = picked.covered,
        "Resolved branch"
    );
    Ok(picked)
}
