//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - plain names for gauges

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    // Plugin lifecycle
    describe_counter!(
        "hostdev_plugin_starts_total",
        "Plugin servers successfully started (by resource)"
    );
    describe_counter!(
        "hostdev_plugin_start_failures_total",
        "Plugin servers that failed to start after all retries (by resource)"
    );
    describe_counter!(
        "hostdev_registrations_total",
        "Successful registrations with kubelet (by resource)"
    );
    describe_gauge!("hostdev_tracked_plugins", "Plugins currently tracked by the manager");

    // Allocation
    describe_counter!("hostdev_allocations_total", "Successful Allocate calls (by resource)");
    describe_counter!(
        "hostdev_allocation_failures_total",
        "Failed Allocate calls (by resource)"
    );

    // Bridge attachment
    describe_counter!(
        "hostdev_assignments_attached_total",
        "Bridge assignments attached to a container (by bridge)"
    );
    describe_counter!(
        "hostdev_assignments_expired_total",
        "Bridge assignments dropped after exhausting their attempt budget (by bridge)"
    );
    describe_counter!(
        "hostdev_links_cleaned_total",
        "Host-side veth links removed after their container exited"
    );
}

pub fn record_plugin_started(resource: &str) {
    counter!("hostdev_plugin_starts_total", "resource" => resource.to_string()).increment(1);
}

pub fn record_plugin_start_failure(resource: &str) {
    counter!("hostdev_plugin_start_failures_total", "resource" => resource.to_string())
        .increment(1);
}

pub fn record_registration(resource: &str) {
    counter!("hostdev_registrations_total", "resource" => resource.to_string()).increment(1);
}

pub fn set_tracked_plugins(count: usize) {
    gauge!("hostdev_tracked_plugins").set(count as f64);
}

pub fn record_allocation(resource: &str, ok: bool) {
    if ok {
        counter!("hostdev_allocations_total", "resource" => resource.to_string()).increment(1);
    } else {
        counter!("hostdev_allocation_failures_total", "resource" => resource.to_string())
            .increment(1);
    }
}

pub fn record_assignment_attached(bridge: &str) {
    counter!("hostdev_assignments_attached_total", "bridge" => bridge.to_string()).increment(1);
}

pub fn record_assignment_expired(bridge: &str) {
    counter!("hostdev_assignments_expired_total", "bridge" => bridge.to_string()).increment(1);
}

pub fn record_link_cleaned() {
    counter!("hostdev_links_cleaned_total").increment(1);
}
