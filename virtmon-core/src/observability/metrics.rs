//! Agent self-metrics.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Poll cycle metrics
    describe_counter!("virtmon_cycles_total", "Total number of poll cycles (by outcome)");
    describe_histogram!("virtmon_cycle_duration_seconds", "Poll cycle duration");
    describe_gauge!("virtmon_domains", "Domains seen in the last cycle");
    describe_counter!("virtmon_items_collected_total", "Items produced by the normalizer");

    // Delivery metrics
    describe_counter!("virtmon_metrics_delivered_total", "Values accepted by the Zabbix server");
    describe_counter!("virtmon_metrics_failed_total", "Values rejected or lost in transit");
    describe_counter!("virtmon_sender_chunks_total", "Sender requests (by outcome)");

    // Reconciliation metrics
    describe_counter!(
        "virtmon_objects_created_total",
        "Items and triggers created on the Zabbix server (by kind)"
    );
    describe_counter!(
        "virtmon_reconcile_failures_total",
        "Failed item/trigger reconciliations (by reason)"
    );
}

pub fn record_cycle(duration_secs: f64, outcome: &str) {
    histogram!("virtmon_cycle_duration_seconds").record(duration_secs);
    counter!("virtmon_cycles_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn set_domain_count(count: usize) {
    gauge!("virtmon_domains").set(count as f64);
}

pub fn record_items_collected(count: usize) {
    counter!("virtmon_items_collected_total").increment(count as u64);
}

pub fn record_chunk(outcome: &str, processed: u64, failed: u64) {
    counter!("virtmon_sender_chunks_total", "outcome" => outcome.to_string()).increment(1);
    counter!("virtmon_metrics_delivered_total").increment(processed);
    counter!("virtmon_metrics_failed_total").increment(failed);
}

pub fn record_object_created(kind: &str) {
    counter!("virtmon_objects_created_total", "kind" => kind.to_string()).increment(1);
}

pub fn record_reconcile_failure(reason: &str) {
    counter!("virtmon_reconcile_failures_total", "reason" => reason.to_string()).increment(1);
}
