//! Process metrics, exported over Prometheus (`metrics` +
//! `metrics-exporter-prometheus`) since a real operator's metrics need
//! to be scraped, not just held in memory.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub fn install_exporter(listen_addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(listen_addr).install()
}

pub fn record_catalog_run(images_discovered: usize, images_deleted: usize) {
    metrics::counter!("sbombastic_catalog_images_discovered_total").increment(images_discovered as u64);
    metrics::counter!("sbombastic_catalog_images_deleted_total").increment(images_deleted as u64);
}

pub fn record_sbom_generated() {
    metrics::counter!("sbombastic_sbom_generated_total").increment(1);
}

pub fn record_scan_completed() {
    metrics::counter!("sbombastic_scan_completed_total").increment(1);
}

pub fn record_scan_job_terminal(outcome: &'static str) {
    metrics::counter!("sbombastic_scan_job_terminal_total", "outcome" => outcome).increment(1);
}

pub fn record_handler_duration(handler: &'static str, seconds: f64) {
    metrics::histogram!("sbombastic_handler_duration_seconds", "handler" => handler).record(seconds);
}

pub fn record_message_redelivered(subject: &'static str) {
    metrics::counter!("sbombastic_message_redelivered_total", "subject" => subject).increment(1);
}
