use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use volley_core::{
    AdmissionStats, ProgressFn, ProgressUpdate, Report, RunOutcome, ScriptConfig, StatsReport,
};

use super::OutputFormatter;

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_header(&self, _script_path: &Path, _script: &ScriptConfig) {}

    fn progress(&self) -> Option<ProgressFn> {
        Some(Arc::new(move |u: ProgressUpdate| {
            emit_json_line(&build_interval_line(&u));
        }))
    }

    fn print_summary(&self, outcome: &RunOutcome) -> anyhow::Result<()> {
        emit_json_line(&JsonReportLine {
            kind: "report",
            cancelled: outcome.cancelled,
            admission: JsonAdmission::from(&outcome.stats),
            report: &outcome.report,
        });
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JsonIntervalLine {
    pub kind: &'static str,
    pub elapsed_secs: f64,
    pub period: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub active_vusers: u64,
    pub pending_vusers: u64,
    #[serde(flatten)]
    pub stats: StatsReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JsonAdmission {
    pub accepted: u64,
    pub shed: u64,
    pub peak_active: u64,
    pub peak_pending: u64,
}

impl From<&AdmissionStats> for JsonAdmission {
    fn from(s: &AdmissionStats) -> Self {
        Self {
            accepted: s.accepted,
            shed: s.shed,
            peak_active: s.peak_active,
            peak_pending: s.peak_pending,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonReportLine<'a> {
    pub kind: &'static str,
    pub cancelled: bool,
    pub admission: JsonAdmission,
    #[serde(flatten)]
    pub report: &'a Report,
}

fn build_interval_line(u: &ProgressUpdate) -> JsonIntervalLine {
    JsonIntervalLine {
        kind: "interval",
        elapsed_secs: u.elapsed.as_secs_f64(),
        period: u.window.period,
        start_time: u.window.start,
        end_time: u.window.end,
        active_vusers: u.stats.active,
        pending_vusers: u.stats.pending,
        stats: StatsReport::from_window(&u.window),
    }
}

fn emit_json_line<T: Serialize>(line: &T) {
    let mut out = std::io::stdout().lock();
    if serde_json::to_writer(&mut out, line).is_ok() {
        let _ = writeln!(out);
    }
}
