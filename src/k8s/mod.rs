pub mod client;
pub mod pid;
pub mod runtime;

pub use client::{ExecOutput, K8sClient};
pub use pid::PidResolver;
pub use runtime::KubeContainerRuntime;
