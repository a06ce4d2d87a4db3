use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nodescope")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Per-node Kubernetes diagnostics agent with live DNS/TCP tracing and blob export",
    long_about = None
)]
pub struct Cli {
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 30,
        help = "Length of the DNS/TCP trace window"
    )]
    pub trace_duration: u64,

    #[arg(long, help = "Exit after one collection pass instead of waiting for Ctrl-C")]
    pub once: bool,

    #[arg(
        long,
        value_name = "DIR",
        default_value = "/proc",
        help = "procfs mount of the host PID namespace"
    )]
    pub proc_root: PathBuf,
}
