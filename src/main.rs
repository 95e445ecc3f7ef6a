use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use edgeping::config::{self, RunConfig};
use edgeping::output::{self, OutputFormat};
use edgeping::prober::HttpsProber;
use edgeping::progress::ProgressReporter;
use edgeping::scheduler::{self, RunState};
use edgeping::types::RankedReport;
use edgeping::{iface, rank, sampler, signal};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// edgeping — find the fastest HTTPS edge IPs inside a list of IPv4 CIDR ranges.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "edgeping",
    version,
    about = "Find the fastest HTTPS edge IPs inside a list of IPv4 CIDR ranges.",
    long_about = None
)]
struct Cli {
    /// Path to a file with one CIDR or IPv4 address per line.
    #[arg(long, default_value = "cidr.txt")]
    cidr: PathBuf,

    /// Output file path (default: stdout).
    #[arg(long)]
    output: Option<PathBuf>,

    /// How many requests for each IP, at least 5.
    #[arg(long, default_value_t = 5)]
    every: usize,

    /// Random range for picking one sample inside a CIDR.
    #[arg(long, default_value_t = sampler::DEFAULT_SAMPLE_WINDOW)]
    sample: u32,

    /// Max number of IPs in the output, 0 or negative for all.
    #[arg(long, default_value_t = config::DEFAULT_HEAD, allow_negative_numbers = true)]
    head: i64,

    /// Max candidates measured concurrently (default: CPUs x 10).
    #[arg(long)]
    workers: Option<usize>,

    /// URL requested against every candidate.
    #[arg(long, default_value = config::DEFAULT_URL)]
    url: String,

    /// Expected HTTP status code of the URL.
    #[arg(long, default_value_t = config::DEFAULT_STATUS)]
    status: u16,

    /// Per-stage timeout in milliseconds; a whole request gets twice this.
    #[arg(long = "timeout", default_value_t = config::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Bind outbound connections to this network interface.
    #[arg(long)]
    interface: Option<String>,

    /// Proxy URL: http://127.0.0.1:1081, socks5://127.0.0.1:1080 or socks5h://...
    #[arg(long)]
    proxy: Option<String>,

    /// Minimum TLS version: 0=TLS1.0, 1=TLS1.1, 2=TLS1.2, 3=TLS1.3.
    #[arg(long = "tls", default_value_t = 3)]
    tls_min: u8,

    /// Offer HTTP/2 during the TLS handshake.
    #[arg(long, default_value_t = false)]
    http2: bool,

    /// Skip TLS certificate verification.
    #[arg(long, default_value_t = false)]
    insecure: bool,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Print the delay next to each IP (same as --format delay).
    #[arg(long = "show-delay", default_value_t = false)]
    show_delay: bool,

    /// Log every dropped candidate with its cause.
    #[arg(long, default_value_t = false)]
    verbose: bool,

    /// Do not draw the progress bar.
    #[arg(long = "no-progress", default_value_t = false)]
    no_progress: bool,
}

impl From<Cli> for RunConfig {
    fn from(cli: Cli) -> Self {
        let format = match (cli.show_delay, cli.format) {
            (true, OutputFormat::Text) => OutputFormat::Delay,
            (_, f) => f,
        };
        RunConfig {
            cidr_path: cli.cidr,
            output: cli.output,
            format,
            url: cli.url,
            expected_status: cli.status,
            timeout_ms: cli.timeout_ms,
            every: cli.every,
            sample: cli.sample,
            workers: cli.workers.unwrap_or_else(config::default_workers),
            head: cli.head,
            tls_min: cli.tls_min,
            http2: cli.http2,
            insecure: cli.insecure,
            proxy: cli.proxy,
            interface: cli.interface,
            verbose: cli.verbose,
            progress: !cli.no_progress,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cfg = RunConfig::from(Cli::parse());
    init_tracing(cfg.verbose);
    cfg.validate()?;

    // Startup: everything that can fail fatally happens before any probe.
    let mut writer = output::open_destination(cfg.output.as_deref())?;
    let content = sampler::load_targets_from_path(&cfg.cidr_path)?;
    let bind = cfg
        .interface
        .as_deref()
        .map(iface::resolve_interface)
        .transpose()?;
    if let Some(b) = &bind {
        info!(interface = %b.interface, addr = %b.addr, "binding probes");
    }
    let prober = HttpsProber::new(cfg.probe_settings(bind)?).context("failed to build prober")?;

    let set = sampler::build_candidates(&content, cfg.sample, &mut rand::rng());
    for r in &set.rejected {
        warn!(line = r.line_no, text = %r.text, "skipping target: {}", r.reason);
    }
    info!(
        url = %cfg.url,
        candidates = set.candidates.len(),
        workers = cfg.workers,
        every = cfg.every,
        "candidate set ready"
    );

    let state = RunState::new();
    let listener = signal::cancel_on_signal(state.clone());
    let progress = ProgressReporter::spawn(state.clone(), cfg.progress)?;

    let outcome = scheduler::run_candidates(
        Arc::new(prober),
        set.candidates,
        cfg.schedule(),
        state.clone(),
    )
    .await;

    progress.finish().await;
    listener.abort();

    let report = RankedReport {
        generated_at: output::now_rfc3339(),
        total_candidates: outcome.progress.total,
        failed: outcome.progress.failed,
        cancelled: outcome.cancelled,
        entries: rank::rank(outcome.results, cfg.head),
    };
    output::write_report(&mut writer, cfg.format, &report).context("failed to write output")?;

    if outcome.cancelled {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: bool) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(env.as_deref(), verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// `RUST_LOG` (or `warn`), with `--verbose` always adding crate debug output.
fn log_filter(env: Option<&str>, verbose: bool) -> EnvFilter {
    let mut filter = env
        .and_then(|s| EnvFilter::try_new(s).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    if verbose {
        if let Ok(directive) = "edgeping=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}
