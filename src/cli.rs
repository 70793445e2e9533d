use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "infergate")]
#[command(about = "Inference gateway for LLM serving fleets")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Manage the ModelRoute / ModelServer CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the gateway data plane and control-plane reconcilers
    Serve(ServeArgs),
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Listen port for the OpenAI-compatible API
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// TLS certificate file (requires --tls-key)
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<String>,

    /// TLS private key file (requires --tls-cert)
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<String>,

    /// Gateway configuration file (scheduler plugins, rate limiter backend)
    #[arg(long)]
    pub config: Option<String>,

    /// Metrics scrape interval for backend pods, in seconds
    #[arg(long, default_value_t = 10)]
    pub metrics_interval: u64,
}
