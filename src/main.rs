//! nodescope - per-node Kubernetes diagnostics agent
//!
//! Runs as a DaemonSet pod on every node and, once per invocation:
//! - Traces DNS and TCP activity of the node's containers for a fixed window
//! - Collects node and container resource usage
//! - Streams traces from an Inspektor Gadget deployment when one is installed
//! - Uploads every output to Azure Blob Storage under `<run>/<node>/`

use anyhow::Result;

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    eprintln!("Error: nodescope requires Linux to trace container network namespaces");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
    use anyhow::Context;
    use chrono::{SecondsFormat, Utc};
    use clap::Parser;
    use nodescope::cli::Cli;
    use nodescope::collector::{Collector, GadgetTraceCollector, Orchestrator, SystemPerfCollector};
    use nodescope::config::{KnownFilePaths, RuntimeInfo};
    use nodescope::export::{AzureBlobStore, BlobExporter};
    use nodescope::k8s::{K8sClient, KubeContainerRuntime, PidResolver};
    use nodescope::probe::tcp_proc::DEFAULT_POLL_INTERVAL;
    use nodescope::probe::{PacketDnsProbe, ProcTcpProbe};
    use nodescope::trace::{
        shutdown_waiter, BoxedSource, ContainerRuntime, DnsTraceCollector, ProbeFactory,
        TcpTraceCollector,
    };
    use nodescope_common::{DnsEvent, TcpEvent};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{error, info};
    use tracing_subscriber::EnvFilter;

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting nodescope v{}", nodescope::VERSION);

    let runtime_info =
        Arc::new(RuntimeInfo::from_env().context("failed to read runtime configuration")?);
    let known_file_paths = KnownFilePaths::default();
    let creation_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let node_name = runtime_info.host_node_name.clone();

    let client = K8sClient::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(KubeContainerRuntime::new(
        client.clone(),
        node_name.clone(),
        PidResolver::with_root(&cli.proc_root),
    ));
    let trace_window = Duration::from_secs(cli.trace_duration);
    let waiter = shutdown_waiter(trace_window);

    let dns_probe: ProbeFactory<DnsEvent> = {
        let proc_root = cli.proc_root.clone();
        Arc::new(move || -> nodescope::Result<BoxedSource<DnsEvent>> {
            let probe: BoxedSource<DnsEvent> = Box::new(PacketDnsProbe::new(proc_root.clone()));
            Ok(probe)
        })
    };
    let tcp_probe: ProbeFactory<TcpEvent> = {
        let proc_root = cli.proc_root.clone();
        Arc::new(move || -> nodescope::Result<BoxedSource<TcpEvent>> {
            let probe: BoxedSource<TcpEvent> =
                Box::new(ProcTcpProbe::new(proc_root.clone(), DEFAULT_POLL_INTERVAL));
            Ok(probe)
        })
    };

    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(DnsTraceCollector::new(
            runtime_info.clone(),
            runtime.clone(),
            dns_probe,
            waiter.clone(),
        )),
        Box::new(TcpTraceCollector::new(
            runtime_info.clone(),
            runtime,
            tcp_probe,
            waiter,
        )),
        Box::new(SystemPerfCollector::new(runtime_info.clone(), client.clone())),
        Box::new(GadgetTraceCollector::new(
            "dns",
            runtime_info.clone(),
            client.clone(),
            trace_window,
        )),
        Box::new(GadgetTraceCollector::new(
            "tcptracer",
            runtime_info.clone(),
            client,
            trace_window,
        )),
    ];

    let store = Arc::new(AzureBlobStore::new(&runtime_info, &known_file_paths));
    let exporter = BlobExporter::new(store, &creation_time, &node_name);
    let mut orchestrator = Orchestrator::new(collectors, exporter);

    let (report, run_error) = orchestrator.run().await;
    if let Some(e) = run_error {
        error!("{}", e);
    }

    let summary = serde_json::to_vec_pretty(&report)?;
    if let Err(e) = orchestrator
        .exporter()
        .export_reader("run-summary.json", &mut summary.as_slice())
        .await
    {
        error!("Failed to upload run summary: {}", e);
    }

    info!(
        "Collection pass complete: {} succeeded, {} skipped, {} failed",
        report.succeeded.len(),
        report.skipped.len(),
        report.failed.len()
    );

    if !cli.once {
        info!("nodescope running. Press Ctrl+C to exit.");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
    }

    Ok(())
}
