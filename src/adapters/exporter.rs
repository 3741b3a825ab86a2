//! Prometheus Counter Exporter
//!
//! Publishes [`CountersSnapshot`] values as gauges in a dedicated
//! `prometheus::Registry`, labelled by file name, operation, source and
//! kind.

use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cached_file::CountersSnapshot;
use crate::error::{Error, Result};

/// Exports cached-file counters to Prometheus.
pub struct CounterExporter {
    registry: Registry,
    operations: IntGaugeVec,
}

impl CounterExporter {
    /// Create an exporter with its own registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let operations = IntGaugeVec::new(
            Opts::new(
                "cached_block_file_operations",
                "Cached block file operation counters",
            ),
            &["file", "op", "source", "kind"],
        )
        .map_err(|e| Error::Internal(format!("failed to create gauge: {}", e)))?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(|e| Error::Internal(format!("failed to register gauge: {}", e)))?;

        Ok(Self {
            registry,
            operations,
        })
    }

    /// Publish the current counters of `file`.
    pub fn export(&self, file: &str, snapshot: &CountersSnapshot) {
        for (op, source, kind, value) in snapshot.samples() {
            self.operations
                .with_label_values(&[file, op, source, kind])
                .set(value.min(i64::MAX as u64) as i64);
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode every registered metric in the text exposition format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("invalid metrics text: {}", e)))
    }
}
