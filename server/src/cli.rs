//! # CLI Interface
//!
//! Defines the command-line argument structure for `sqrl-server` using
//! `clap` derive. Supports two subcommands: `run` and `version`.

use clap::{Parser, Subcommand};

/// SQRL authentication server.
///
/// Serves the SQRL protocol endpoint, hands login URL bundles to browsers,
/// redeems out-of-band login codes into sessions, and exposes Prometheus
/// metrics.
#[derive(Parser, Debug)]
#[command(
    name = "sqrl-server",
    about = "SQRL authentication server",
    version,
    propagate_version = true
)]
pub struct SqrlServerCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the server binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the authentication server.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Public base URL where browsers and SQRL clients reach this server,
    /// e.g. `https://login.example.com` or `https://example.com/app`.
    ///
    /// Everything the protocol hands out (login URLs, `qry` paths, the
    /// success redirect) is derived from this value.
    #[arg(long, env = "SQRL_BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    /// Secret used to HMAC-bind follow-up nuts to response bodies.
    ///
    /// **Never pass this flag in production** — set the environment
    /// variable instead so the secret stays out of process listings.
    #[arg(long, env = "SQRL_HMAC_SECRET")]
    pub hmac_secret: String,

    /// Port for the HTTP API.
    #[arg(long, env = "SQRL_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "SQRL_METRICS_PORT", default_value_t = 8081)]
    pub metrics_port: u16,

    /// How long a nut stays redeemable after minting, in seconds.
    #[arg(long, env = "SQRL_NUT_TIMEOUT_SECS", default_value_t = 3600)]
    pub nut_timeout_secs: u64,

    /// How often the background sweeper removes stale nuts, in seconds.
    #[arg(long, env = "SQRL_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    pub sweep_interval_secs: u64,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "SQRL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}
