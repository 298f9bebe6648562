//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Ledger node health and block height
//! - Nonce, UTXO and fee cache activity
//! - Transaction lifecycle and confirmation latency

use crate::ledger::Ledger;

use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Ledger metrics
    pub static ref LEDGER_HEALTHY: GaugeVec = register_gauge_vec!(
        "tx_pipeline_ledger_healthy",
        "Ledger node status (1=reachable, 0=unreachable)",
        &["ledger"]
    ).unwrap();

    pub static ref LEDGER_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "tx_pipeline_ledger_block_height",
        "Latest block height or slot per ledger",
        &["ledger"]
    ).unwrap();

    // Cache metrics
    pub static ref NONCES_ALLOCATED: CounterVec = register_counter_vec!(
        "tx_pipeline_nonces_allocated_total",
        "Total nonces handed out",
        &["ledger"]
    ).unwrap();

    pub static ref UTXO_SELECTIONS: CounterVec = register_counter_vec!(
        "tx_pipeline_utxo_selections_total",
        "UTXO selections by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref FEE_CACHE: CounterVec = register_counter_vec!(
        "tx_pipeline_fee_cache_lookups_total",
        "Fee cache lookups by result",
        &["ledger", "result"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_BUILT: CounterVec = register_counter_vec!(
        "tx_pipeline_transactions_built_total",
        "Total unsigned transactions built",
        &["ledger"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "tx_pipeline_transactions_submitted_total",
        "Total transactions accepted by a node",
        &["ledger"]
    ).unwrap();

    pub static ref TX_SUBMIT_FAILED: CounterVec = register_counter_vec!(
        "tx_pipeline_transactions_submit_failed_total",
        "Total submissions rejected by a node",
        &["ledger"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "tx_pipeline_transactions_confirmed_total",
        "Total transactions reaching the confirmation threshold",
        &["ledger"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "tx_pipeline_transactions_failed_total",
        "Total transactions that failed or were dropped",
        &["ledger"]
    ).unwrap();

    pub static ref TX_REPLACED: CounterVec = register_counter_vec!(
        "tx_pipeline_transactions_replaced_total",
        "Total transactions superseded by a replacement or cancellation",
        &["ledger", "kind"]
    ).unwrap();

    pub static ref MONITORED: Gauge = register_gauge!(
        "tx_pipeline_monitored_transactions",
        "Live confirmation monitoring tasks"
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "tx_pipeline_confirmation_latency_seconds",
        "Time from broadcast to the confirmation threshold",
        &["ledger"],
        vec![5.0, 15.0, 30.0, 60.0, 180.0, 600.0, 1800.0, 3600.0, 7200.0]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind metrics server on {}", addr))?;
        axum::serve(listener, app)
            .await
            .context("Metrics server stopped")?;

        Ok(())
    }
}

/// Text exposition of every registered metric
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_ledger_health(ledger: Ledger, healthy: bool) {
    LEDGER_HEALTHY
        .with_label_values(&[ledger.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(ledger: Ledger, height: u64) {
    LEDGER_BLOCK_HEIGHT
        .with_label_values(&[ledger.as_str()])
        .set(height as f64);
}

pub fn record_nonce_allocated(ledger: Ledger) {
    NONCES_ALLOCATED.with_label_values(&[ledger.as_str()]).inc();
}

pub fn record_utxo_selection(outcome: &str) {
    UTXO_SELECTIONS.with_label_values(&[outcome]).inc();
}

pub fn record_fee_cache(ledger: Ledger, hit: bool) {
    FEE_CACHE
        .with_label_values(&[ledger.as_str(), if hit { "hit" } else { "miss" }])
        .inc();
}

pub fn record_tx_built(ledger: Ledger) {
    TX_BUILT.with_label_values(&[ledger.as_str()]).inc();
}

pub fn record_tx_submitted(ledger: Ledger) {
    TX_SUBMITTED.with_label_values(&[ledger.as_str()]).inc();
}

pub fn record_tx_submit_failed(ledger: Ledger) {
    TX_SUBMIT_FAILED.with_label_values(&[ledger.as_str()]).inc();
}

pub fn record_tx_confirmed(ledger: Ledger) {
    TX_CONFIRMED.with_label_values(&[ledger.as_str()]).inc();
}

pub fn record_tx_failed(ledger: Ledger) {
    TX_FAILED.with_label_values(&[ledger.as_str()]).inc();
}

pub fn record_tx_replaced(ledger: Ledger, kind: &str) {
    TX_REPLACED
        .with_label_values(&[ledger.as_str(), kind])
        .inc();
}

pub fn set_monitored_transactions(count: usize) {
    MONITORED.set(count as f64);
}

pub fn record_confirmation_latency(ledger: Ledger, latency_secs: f64) {
    CONFIRMATION_LATENCY
        .with_label_values(&[ledger.as_str()])
        .observe(latency_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_metrics() {
        record_tx_built(Ledger::Utxo);
        record_fee_cache(Ledger::Account, true);

        let text = render().unwrap();
        assert!(text.contains("tx_pipeline_transactions_built_total"));
        assert!(text.contains("ledger=\"utxo\""));
        assert!(text.contains("result=\"hit\""));
    }
}
