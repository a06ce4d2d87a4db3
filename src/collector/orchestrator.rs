//! Drives one collection pass over every registered collector

use crate::collector::Collector;
use crate::error::{CollectorFailure, RunError};
use crate::export::BlobExporter;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

/// Outcome of a pass, uploaded as the run summary
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    pub succeeded: Vec<String>,
    pub skipped: Vec<SkippedCollector>,
    pub failed: Vec<FailedCollector>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedCollector {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedCollector {
    pub name: String,
    pub error: String,
}

/// Owns the collector list and the exporter for a run
pub struct Orchestrator {
    collectors: Vec<Box<dyn Collector>>,
    exporter: BlobExporter,
}

impl Orchestrator {
    pub fn new(collectors: Vec<Box<dyn Collector>>, exporter: BlobExporter) -> Self {
        Self {
            collectors,
            exporter,
        }
    }

    pub fn exporter(&self) -> &BlobExporter {
        &self.exporter
    }

    /// Run every supported collector and export what succeeded.
    ///
    /// Failures never short-circuit the pass: each collector's collect or
    /// export error is recorded and returned together, alongside the report.
    pub async fn run(&mut self) -> (RunReport, Option<RunError>) {
        let mut report = RunReport::default();
        let mut failures = Vec::new();

        let mut supported: Vec<&mut Box<dyn Collector>> = Vec::new();
        for collector in self.collectors.iter_mut() {
            match collector.check_supported().await {
                Ok(()) => supported.push(collector),
                Err(e) => {
                    warn!("Skipping collector {}: {}", collector.name(), e);
                    report.skipped.push(SkippedCollector {
                        name: collector.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!("Collecting from {} collector(s)", supported.len());

        let outcomes = join_all(supported.into_iter().map(|collector| async move {
            let result = collector.collect().await;
            (collector, result)
        }))
        .await;

        for (collector, result) in outcomes {
            let name = collector.name().to_string();

            if let Err(e) = result {
                error!("Collector {} failed: {}", name, e);
                report.failed.push(FailedCollector {
                    name: name.clone(),
                    error: e.to_string(),
                });
                failures.push(CollectorFailure {
                    collector: name,
                    error: e,
                });
                continue;
            }

            if let Err(e) = self.exporter.export(&**collector).await {
                error!("Export of collector {} failed: {}", name, e);
                report.failed.push(FailedCollector {
                    name: name.clone(),
                    error: e.to_string(),
                });
                failures.push(CollectorFailure {
                    collector: name,
                    error: e,
                });
                continue;
            }

            info!("Collector {} exported", name);
            report.succeeded.push(name);
        }

        let run_error = if failures.is_empty() {
            None
        } else {
            Some(RunError { failures })
        };

        (report, run_error)
    }
}
