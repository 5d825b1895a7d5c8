//! Scoring of a setup table against impact categories.

use tracing::{debug, info};

use crate::cancel::CallGuard;
use crate::errors::{LcaError, Result};
use crate::model::{ImpactCategory, ImpactReport, ImpactResultRow, LcaSetupTable, SetupRecord};
use crate::service::{EngineSession, ImpactEngine};

/// Scores every evaluated record of `table` under every category.
///
/// One engine session serves the whole run. It is opened with the first
/// evaluated record and re-solved in place for each following one, then
/// dropped when the run ends, successful or not. Any engine error aborts
/// the run; no score is ever replaced by zero.
pub fn compute_impacts(
    table: &LcaSetupTable,
    categories: &[ImpactCategory],
    engine: &dyn ImpactEngine,
    guard: &CallGuard,
) -> Result<ImpactReport> {
    let records: Vec<&SetupRecord> = table.scored_records().collect();
    let Some(first) = records.first() else {
        info!(reference = %table.reference_flow, "no flows to evaluate");
        return Ok(ImpactReport::default());
    };

    let mut session = open_session(first, engine, guard)?;
    let mut rows = Vec::with_capacity(records.len() * categories.len());

    for (position, record) in records.iter().enumerate() {
        let activity = record.activity.key();
        if position > 0 {
            guard.check(&record.stream_name)?;
            session
                .recompute(activity, record.amount)
                .map_err(|reason| engine_failure(record, "inventory", reason, guard))?;
        }

        for category in categories {
            guard.check(&record.stream_name)?;
            session
                .select_method(category)
                .map_err(|reason| engine_failure(record, &category.name, reason, guard))?;
            let score = session
                .compute_score()
                .map_err(|reason| engine_failure(record, &category.name, reason, guard))?;

            rows.push(ImpactResultRow {
                stream_name: record.stream_name.clone(),
                flow_type: record.role,
                activity: activity.to_string(),
                activity_unit: record.activity_unit.clone(),
                amount: record.amount,
                impact_category: category.name.clone(),
                impact_unit: score.unit,
                impact: score.value,
            });
        }
        debug!(flow = %record.stream_name, categories = categories.len(), "scored flow");
    }

    let report = ImpactReport::from_rows(rows);
    info!(
        flows = records.len(),
        categories = categories.len(),
        rows = report.rows.len(),
        "impact evaluation finished"
    );
    Ok(report)
}

fn open_session(
    record: &SetupRecord,
    engine: &dyn ImpactEngine,
    guard: &CallGuard,
) -> Result<Box<dyn EngineSession>> {
    guard.check(&record.stream_name)?;
    engine
        .new_inventory(record.activity.key(), record.amount, guard)
        .map_err(|reason| engine_failure(record, "inventory", reason, guard))
}

/// A call that failed because the guard fired is reported as the abort.
fn engine_failure(
    record: &SetupRecord,
    category: &str,
    reason: String,
    guard: &CallGuard,
) -> LcaError {
    if let Err(abort) = guard.check(&record.stream_name) {
        return abort;
    }
    LcaError::EngineFailure {
        flow: record.stream_name.clone(),
        category: category.to_string(),
        reason,
    }
}
