use std::path::Path;

use volley_core::{ProgressFn, RunOutcome, ScriptConfig};

use crate::cli::OutputFormat;

mod human;
mod json;

pub(crate) trait OutputFormatter: Send + Sync {
    fn print_header(&self, script_path: &Path, script: &ScriptConfig);
    fn progress(&self) -> Option<ProgressFn>;
    fn print_summary(&self, outcome: &RunOutcome) -> anyhow::Result<()>;
}

pub(crate) fn formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::HumanReadable => Box::new(human::HumanReadableOutput),
        OutputFormat::Json => Box::new(json::JsonOutput),
    }
}
