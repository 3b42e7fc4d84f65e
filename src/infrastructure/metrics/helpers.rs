//! Metrics exposition helpers

use prometheus::{Encoder, Registry, TextEncoder};

/// Encode all metrics in `registry` to Prometheus text format
pub fn encode_metrics(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}
