use std::time::Duration;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use volley_metrics::{INTERNAL_NAMESPACE, MetricEvent};

use crate::bus::{EventBus, Origin};

/// Publish `artillery_internal.memory` (bytes) and `artillery_internal.cpu` (percent)
/// for this process every `every` until `stop` fires.
pub(crate) async fn sample_process_health(bus: EventBus, every: Duration, stop: CancellationToken) {
    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(err) => {
            tracing::warn!(error = %err, "process health sampling unavailable");
            return;
        }
    };

    let memory = format!("{INTERNAL_NAMESPACE}.memory");
    let cpu = format!("{INTERNAL_NAMESPACE}.cpu");
    let mut system = System::new();
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => {
                system.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_cpu().with_memory(),
                );
                let Some(process) = system.process(pid) else {
                    continue;
                };
                bus.publish_metric(
                    Origin::Core,
                    MetricEvent::histogram(memory.as_str(), rss_bytes(process.memory()) as f64),
                );
                bus.publish_metric(
                    Origin::Core,
                    MetricEvent::histogram(cpu.as_str(), f64::from(process.cpu_usage())),
                );
            }
        }
    }
}

/// sysinfo reports bytes on macOS and KiB elsewhere.
fn rss_bytes(mem: u64) -> u64 {
    #[cfg(target_os = "macos")]
    {
        mem
    }

    #[cfg(not(target_os = "macos"))]
    {
        mem.saturating_mul(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publishes_internal_metrics() {
        let bus = EventBus::new(8);
        let mut tap = bus.tap_metrics();
        let stop = CancellationToken::new();
        let task = tokio::spawn(sample_process_health(
            bus.clone(),
            Duration::from_millis(10),
            stop.clone(),
        ));

        let first = tap.recv().await;
        stop.cancel();
        let _ = task.await;

        let Some(ev) = first else {
            panic!("expected a sample");
        };
        assert!(ev.is_internal());
        assert!(ev.name.ends_with(".memory"));
    }
}
