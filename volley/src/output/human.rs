use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use volley_core::{
    PhaseConfig, ProgressFn, ProgressUpdate, RunOutcome, ScriptConfig, StatsReport, names,
};

use super::OutputFormatter;

pub(crate) struct HumanReadableOutput;

impl OutputFormatter for HumanReadableOutput {
    fn print_header(&self, script_path: &Path, script: &ScriptConfig) {
        println!("script: {}", script_path.display());
        for (i, p) in script.phases.iter().enumerate() {
            println!("phase {i}: {}", describe_phase(p));
        }
        for s in &script.scenarios {
            println!(
                "scenario: {} engine={} weight={} steps={}",
                s.name.as_deref().unwrap_or("-"),
                s.engine.as_deref().unwrap_or("-"),
                s.weight.unwrap_or(1),
                s.flow.len()
            );
        }
        println!();
    }

    fn progress(&self) -> Option<ProgressFn> {
        Some(Arc::new(move |u: ProgressUpdate| {
            print!("{}", render_interval(&u));
        }))
    }

    fn print_summary(&self, outcome: &RunOutcome) -> anyhow::Result<()> {
        print!("{}", render_summary(outcome));
        Ok(())
    }
}

fn describe_phase(p: &PhaseConfig) -> String {
    let mut out = String::new();
    if let Some(name) = &p.name {
        write!(&mut out, "{name}: ").ok();
    }
    if let Some(pause) = p.pause {
        write!(&mut out, "pause {}", format_duration(pause.0)).ok();
        return out;
    }
    let duration = p.duration.map(|d| format_duration(d.0)).unwrap_or_default();
    let _ = match (p.arrival_rate, p.ramp_to, p.arrival_count) {
        (_, _, Some(count)) => write!(&mut out, "{count} arrivals over {duration}"),
        (from, Some(to), None) => write!(
            &mut out,
            "ramp {}/s -> {to}/s over {duration}",
            from.unwrap_or(0.0)
        ),
        (Some(rate), None, None) => write!(&mut out, "{rate}/s for {duration}"),
        (None, None, None) => write!(&mut out, "idle for {duration}"),
    };
    if let Some(max) = p.max_vusers {
        write!(&mut out, " (max {max} vusers)").ok();
    }
    out
}

fn render_interval(u: &ProgressUpdate) -> String {
    let stats = StatsReport::from_window(&u.window);
    let mut out = String::new();
    write!(
        &mut out,
        "[{:>6}] created {} completed {} failed {} | active {} pending {}",
        format_duration(u.elapsed),
        stats.counter(names::VUSERS_CREATED),
        stats.counter(names::VUSERS_COMPLETED),
        stats.counter(names::VUSERS_FAILED),
        u.stats.active,
        u.stats.pending,
    )
    .ok();
    if let Some(h) = stats.histograms.get(names::VUSERS_SESSION_LENGTH) {
        write!(&mut out, " | session p95 {:.1}ms", h.p95).ok();
    }
    out.push('\n');
    out
}

fn render_summary(outcome: &RunOutcome) -> String {
    let agg = &outcome.report.aggregate;
    let mut out = String::new();

    if outcome.cancelled {
        out.push_str("\nsummary (cancelled)\n");
    } else {
        out.push_str("\nsummary\n");
    }
    writeln!(
        &mut out,
        "  intervals: {}  accepted: {}  shed: {}  peak active: {}  peak pending: {}",
        outcome.report.intervals.len(),
        outcome.stats.accepted,
        outcome.stats.shed,
        outcome.stats.peak_active,
        outcome.stats.peak_pending
    )
    .ok();

    if !agg.counters.is_empty() {
        out.push_str("counters\n");
        let width = key_width(agg.counters.keys());
        for (name, v) in &agg.counters {
            writeln!(&mut out, "  {name:<width$}  {v}").ok();
        }
    }

    if !agg.rates.is_empty() {
        out.push_str("rates\n");
        let width = key_width(agg.rates.keys());
        for (name, v) in &agg.rates {
            writeln!(&mut out, "  {name:<width$}  {v:.2}/s").ok();
        }
    }

    if !agg.histograms.is_empty() {
        out.push_str("histograms\n");
        let width = key_width(agg.histograms.keys());
        for (name, h) in &agg.histograms {
            writeln!(
                &mut out,
                "  {name:<width$}  min {:.1}  median {:.1}  p95 {:.1}  p99 {:.1}  max {:.1}  count {}",
                h.min, h.median, h.p95, h.p99, h.max, h.count
            )
            .ok();
        }
    }

    out
}

fn key_width<'a>(keys: impl Iterator<Item = &'a String>) -> usize {
    keys.map(String::len).max().unwrap_or(0)
}

/// Single rounded component in one of: ms, s, m.
fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    let secs = (ms + 500) / 1_000;
    if secs < 120 {
        return format!("{secs}s");
    }
    format!("{}m{}s", secs / 60, secs % 60)
}
