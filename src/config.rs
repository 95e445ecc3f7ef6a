use crate::aggregate::MIN_EVERY;
use crate::iface::BindSource;
use crate::output::OutputFormat;
use crate::prober::{ProbeSettings, TlsVersion};
use crate::proxy::ProxyConfig;
use crate::scheduler::ScheduleOptions;
use crate::sampler::DEFAULT_SAMPLE_WINDOW;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_URL: &str = "https://www.cloudflare.com/cdn-cgi/trace";
pub const DEFAULT_STATUS: u16 = 200;
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_HEAD: i64 = 16;
pub const WORKERS_PER_CPU: usize = 10;

/// Worker count used when none is given.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * WORKERS_PER_CPU
}

/// Everything one run needs, after the command line has been parsed.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cidr_path: PathBuf,
    pub output: Option<PathBuf>,
    pub format: OutputFormat,
    pub url: String,
    pub expected_status: u16,
    pub timeout_ms: u64,
    pub every: usize,
    pub sample: u32,
    pub workers: usize,
    pub head: i64,
    pub tls_min: u8,
    pub http2: bool,
    pub insecure: bool,
    pub proxy: Option<String>,
    pub interface: Option<String>,
    pub verbose: bool,
    pub progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cidr_path: PathBuf::from("cidr.txt"),
            output: None,
            format: OutputFormat::Text,
            url: DEFAULT_URL.to_string(),
            expected_status: DEFAULT_STATUS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            every: MIN_EVERY,
            sample: DEFAULT_SAMPLE_WINDOW,
            workers: default_workers(),
            head: DEFAULT_HEAD,
            tls_min: 3,
            http2: false,
            insecure: false,
            proxy: None,
            interface: None,
            verbose: false,
            progress: true,
        }
    }
}

impl RunConfig {
    /// Reject settings that would make the run meaningless. Called before
    /// any file is opened or any probe is sent.
    pub fn validate(&self) -> Result<()> {
        if self.every < MIN_EVERY {
            bail!("every must be at least {MIN_EVERY}, got {}", self.every);
        }
        if self.sample == 0 {
            bail!("sample window must be positive");
        }
        if self.workers == 0 {
            bail!("workers must be positive");
        }
        if self.timeout_ms == 0 {
            bail!("timeout must be positive");
        }
        if TlsVersion::from_index(self.tls_min).is_none() {
            bail!("tls must be 0..=3, got {}", self.tls_min);
        }
        Url::parse(&self.url).with_context(|| format!("invalid url: {}", self.url))?;
        if let Some(p) = &self.proxy {
            ProxyConfig::parse(p)?;
        }
        Ok(())
    }

    pub fn schedule(&self) -> ScheduleOptions {
        ScheduleOptions {
            workers: self.workers,
            every: self.every,
        }
    }

    /// Build prober settings; `bind` comes from interface resolution.
    pub fn probe_settings(&self, bind: Option<BindSource>) -> Result<ProbeSettings> {
        let url = Url::parse(&self.url).with_context(|| format!("invalid url: {}", self.url))?;
        let proxy = self.proxy.as_deref().map(ProxyConfig::parse).transpose()?;
        Ok(ProbeSettings {
            url,
            expected_status: self.expected_status,
            timeout: Duration::from_millis(self.timeout_ms),
            tls_min: TlsVersion::from_index(self.tls_min).unwrap_or_default(),
            http2: self.http2,
            insecure: self.insecure,
            bind,
            proxy,
        })
    }
}
