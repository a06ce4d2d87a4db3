//! Collector capability contract and the orchestrator that drives a pass
//!
//! Every gatherer implements [`Collector`]. A collector whose
//! `check_supported` fails is skipped; the rest are collected concurrently and
//! their outputs handed to the exporter.

pub mod gadget;
pub mod orchestrator;
pub mod systemperf;

pub use gadget::GadgetTraceCollector;
pub use orchestrator::{Orchestrator, RunReport};
pub use systemperf::SystemPerfCollector;

use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Named outputs of a collector, item name -> content
pub type DataMap = BTreeMap<String, String>;

/// Anything that can hand named items to the exporter
pub trait DataProducer {
    fn data(&self) -> Result<DataMap>;
}

#[async_trait]
pub trait Collector: DataProducer + Send + Sync {
    /// Stable identifier, used for logging and exclusion
    fn name(&self) -> &str;

    /// Fails with `UnsupportedEnvironment` when prerequisites are absent
    async fn check_supported(&self) -> Result<()>;

    /// Gather data. May block for a collection window.
    async fn collect(&mut self) -> Result<()>;
}
