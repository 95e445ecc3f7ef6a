use crate::iface::BindSource;
use crate::proxy::{ProxyConfig, ProxyError};
use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::client::conn::{http1, http2};
use hyper::header::{CONNECTION, HOST, USER_AGENT as USER_AGENT_HEADER};
use hyper::{Method, Request, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::{self, Instant};
use url::Url;

/// Fixed client identifier sent with every probe.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/98.0.4758.102 Safari/537.36";

/// The only destination port a probe may dial.
pub const HTTPS_PORT: u16 = 443;

/// Failure of a single probe. Never retried; the aggregator drops the candidate.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("not https: refusing to dial {target}")]
    NotHttps { target: String },
    #[error("dial: {0}")]
    Dial(#[from] io::Error),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("tls: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("http: {0}")]
    Http(#[from] hyper::Error),
    #[error("bad request: {0}")]
    Request(String),
    #[error("expected status code {expected} but got {actual}")]
    UnexpectedStatus { expected: u16, actual: u16 },
    #[error("{stage} timed out after {after_ms}ms")]
    Timeout { stage: &'static str, after_ms: u64 },
}

/// One HTTPS latency measurement against a forced address.
///
/// This is the seam the aggregator and scheduler are generic over, so they
/// can be driven by scripted probes in tests.
pub trait Probe: Send + Sync + 'static {
    /// Milliseconds from request dispatch to response headers.
    fn probe(&self, ip: Ipv4Addr) -> impl Future<Output = Result<u64, ProbeError>> + Send;
}

/// Minimum TLS version, indexed `0..=3` for TLS 1.0 through 1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    #[default]
    Tls13,
}

impl TlsVersion {
    pub fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(Self::Tls10),
            1 => Some(Self::Tls11),
            2 => Some(Self::Tls12),
            3 => Some(Self::Tls13),
            _ => None,
        }
    }

    fn min_protocol(self) -> native_tls::Protocol {
        match self {
            Self::Tls10 => native_tls::Protocol::Tlsv10,
            Self::Tls11 => native_tls::Protocol::Tlsv11,
            Self::Tls12 => native_tls::Protocol::Tlsv12,
            Self::Tls13 => native_tls::Protocol::Tlsv13,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub url: Url,
    pub expected_status: u16,
    pub timeout: Duration,
    pub tls_min: TlsVersion,
    pub http2: bool,
    pub insecure: bool,
    pub bind: Option<BindSource>,
    pub proxy: Option<ProxyConfig>,
}

/// Map the connection the HTTP layer asked for onto the candidate address.
///
/// Only port 443 is ever dialled; whatever host was requested is replaced
/// by `ip`. Anything else fails before a socket is opened.
pub fn forced_destination(
    requested_host: &str,
    requested_port: u16,
    ip: Ipv4Addr,
) -> Result<SocketAddrV4, ProbeError> {
    if requested_port != HTTPS_PORT {
        return Err(ProbeError::NotHttps {
            target: format!("{requested_host}:{requested_port}"),
        });
    }
    Ok(SocketAddrV4::new(ip, HTTPS_PORT))
}

/// Real prober: fresh TCP (+TLS) connection per call, one GET, no redirects.
pub struct HttpsProber {
    settings: ProbeSettings,
    tls: tokio_native_tls::TlsConnector,
    host: String,
    port: u16,
    host_header: String,
    path: String,
    https: bool,
}

impl HttpsProber {
    pub fn new(settings: ProbeSettings) -> Result<Self> {
        let url = &settings.url;
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => bail!("unsupported url scheme: {other}"),
        };
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("url has no host: {url}"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("url has no port: {url}"))?;
        let host_header = match url.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.clone(),
        };
        let mut path = url.path().to_string();
        if let Some(q) = url.query() {
            path.push('?');
            path.push_str(q);
        }

        let mut builder = native_tls::TlsConnector::builder();
        builder
            .min_protocol_version(Some(settings.tls_min.min_protocol()))
            .max_protocol_version(None);
        if settings.insecure {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        if settings.http2 {
            builder.request_alpns(&["h2", "http/1.1"]);
        }
        let tls = tokio_native_tls::TlsConnector::from(builder.build()?);

        Ok(Self {
            settings,
            tls,
            host,
            port,
            host_header,
            path,
            https,
        })
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    async fn exchange(&self, ip: Ipv4Addr) -> Result<u64, ProbeError> {
        let limit = self.settings.timeout;
        let dest = forced_destination(&self.host, self.port, ip)?;

        let start = Instant::now();
        let tcp = within(limit, "connect", self.dial(dest)).await?;
        let status = if self.https {
            let tls = within(limit, "tls handshake", self.tls.connect(&self.host, tcp)).await?;
            let h2 = self.settings.http2
                && matches!(tls.get_ref().negotiated_alpn(), Ok(Some(p)) if p == b"h2");
            self.send(tls, h2).await?
        } else {
            self.send(tcp, false).await?
        };
        let elapsed = start.elapsed().as_millis() as u64;

        if status != self.settings.expected_status {
            return Err(ProbeError::UnexpectedStatus {
                expected: self.settings.expected_status,
                actual: status,
            });
        }
        Ok(elapsed)
    }

    async fn dial(&self, dest: SocketAddrV4) -> Result<TcpStream, ProbeError> {
        let Some(proxy) = &self.settings.proxy else {
            return Ok(self.connect_socket(SocketAddr::V4(dest)).await?);
        };
        let want_v4 = self.settings.bind.is_some();
        let proxy_addr = lookup_host((proxy.host.as_str(), proxy.port))
            .await?
            .find(|a| a.is_ipv4() || !want_v4)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("proxy host {} did not resolve", proxy.host),
                )
            })?;
        let mut stream = self.connect_socket(proxy_addr).await?;
        proxy.establish(&mut stream, dest).await?;
        Ok(stream)
    }

    async fn connect_socket(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(src) = &self.settings.bind {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            socket.bind_device(Some(src.interface.as_bytes()))?;
            socket.bind(SocketAddr::new(IpAddr::V4(src.addr), 0))?;
        }
        socket.connect(addr).await
    }

    async fn send<S>(&self, stream: S, h2: bool) -> Result<u16, ProbeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let limit = self.settings.timeout;
        let io = TokioIo::new(stream);
        let request = self.request(h2)?;
        let response = if h2 {
            let (mut sender, conn) =
                within(limit, "http/2 handshake", http2::handshake(TokioExecutor::new(), io))
                    .await?;
            tokio::spawn(drive(conn, limit));
            within(limit, "response headers", sender.send_request(request)).await?
        } else {
            let (mut sender, conn) = within(limit, "http handshake", http1::handshake(io)).await?;
            tokio::spawn(drive(conn, limit));
            within(limit, "response headers", sender.send_request(request)).await?
        };
        Ok(response.status().as_u16())
    }

    fn request(&self, h2: bool) -> Result<Request<Empty<Bytes>>, ProbeError> {
        let builder = if h2 {
            Request::builder()
                .uri(self.settings.url.as_str())
                .version(Version::HTTP_2)
        } else {
            Request::builder()
                .uri(self.path.as_str())
                .header(HOST, self.host_header.as_str())
                .header(CONNECTION, "close")
        };
        builder
            .method(Method::GET)
            .header(USER_AGENT_HEADER, USER_AGENT)
            .body(Empty::new())
            .map_err(|e| ProbeError::Request(e.to_string()))
    }
}

impl Probe for HttpsProber {
    fn probe(&self, ip: Ipv4Addr) -> impl Future<Output = Result<u64, ProbeError>> + Send {
        let overall = self.settings.timeout * 2;
        async move {
            match time::timeout(overall, self.exchange(ip)).await {
                Ok(res) => res,
                Err(_) => Err(ProbeError::Timeout {
                    stage: "request",
                    after_ms: overall.as_millis() as u64,
                }),
            }
        }
    }
}

/// Run the connection task until it finishes or goes idle for `idle`.
async fn drive<F>(conn: F, idle: Duration)
where
    F: Future,
{
    let _ = time::timeout(idle, conn).await;
}

async fn within<T, E>(
    limit: Duration,
    stage: &'static str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, ProbeError>
where
    ProbeError: From<E>,
{
    match time::timeout(limit, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ProbeError::Timeout {
            stage,
            after_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> ProbeSettings {
        ProbeSettings {
            url: Url::parse(url).unwrap(),
            expected_status: 200,
            timeout: Duration::from_millis(300),
            tls_min: TlsVersion::default(),
            http2: false,
            insecure: false,
            bind: None,
            proxy: None,
        }
    }

    #[test]
    fn only_443_is_dialled() {
        let ip = Ipv4Addr::new(104, 16, 0, 1);
        let dest = forced_destination("www.cloudflare.com", 443, ip).unwrap();
        assert_eq!(dest, SocketAddrV4::new(ip, 443));

        for port in [80, 8443, 0, 444] {
            let err = forced_destination("www.cloudflare.com", port, ip).unwrap_err();
            assert!(matches!(err, ProbeError::NotHttps { .. }), "port {port}");
        }
    }

    #[test]
    fn tls_index_maps_to_versions() {
        assert_eq!(TlsVersion::from_index(0), Some(TlsVersion::Tls10));
        assert_eq!(TlsVersion::from_index(3), Some(TlsVersion::Tls13));
        assert_eq!(TlsVersion::from_index(4), None);
    }

    #[test]
    fn request_line_keeps_path_query_and_host() {
        let prober = HttpsProber::new(settings("https://example.com:8443/cdn-cgi/trace?x=1")).unwrap();
        assert_eq!(prober.path, "/cdn-cgi/trace?x=1");
        assert_eq!(prober.host_header, "example.com:8443");

        let req = prober.request(false).unwrap();
        assert_eq!(req.uri(), "/cdn-cgi/trace?x=1");
        assert_eq!(req.headers()[HOST], "example.com:8443");
        assert_eq!(req.headers()[USER_AGENT_HEADER], USER_AGENT);
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(HttpsProber::new(settings("ftp://example.com/")).is_err());
    }

    #[tokio::test]
    async fn plain_http_target_fails_the_dial_policy() {
        let prober = HttpsProber::new(settings("http://example.com/")).unwrap();
        let err = prober.probe(Ipv4Addr::LOCALHOST).await.unwrap_err();
        assert!(matches!(err, ProbeError::NotHttps { .. }));
    }

    #[tokio::test]
    async fn non_443_https_port_fails_the_dial_policy() {
        let prober = HttpsProber::new(settings("https://example.com:8443/")).unwrap();
        let err = prober.probe(Ipv4Addr::LOCALHOST).await.unwrap_err();
        assert!(err.to_string().contains("example.com:8443"));
    }

    #[test]
    fn tls13_minimum_is_enforced() {
        assert!(matches!(
            TlsVersion::Tls13.min_protocol(),
            native_tls::Protocol::Tlsv13
        ));
        assert!(matches!(
            TlsVersion::Tls12.min_protocol(),
            native_tls::Protocol::Tlsv12
        ));
    }

    /// Local CONNECT proxy: answers `reply` to the first request, then holds
    /// the socket open without sending anything else.
    async fn connect_proxy(reply: &'static [u8]) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(reply).await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });
        addr
    }

    fn via_proxy(addr: std::net::SocketAddr, timeout: Duration) -> ProbeSettings {
        ProbeSettings {
            timeout,
            proxy: Some(ProxyConfig::parse(&format!("http://{addr}")).unwrap()),
            ..settings("https://example.com/cdn-cgi/trace")
        }
    }

    #[tokio::test]
    async fn silent_peer_hits_the_handshake_timeout() {
        let limit = Duration::from_millis(200);
        let addr = connect_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let prober = HttpsProber::new(via_proxy(addr, limit)).unwrap();

        let started = Instant::now();
        let err = prober.probe(Ipv4Addr::new(104, 16, 0, 1)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(
            matches!(err, ProbeError::Timeout { stage: "tls handshake", after_ms: 200 }),
            "got {err}"
        );
        assert!(elapsed >= limit, "returned after {elapsed:?}");
        assert!(elapsed < limit * 2, "returned after {elapsed:?}");
    }

    #[tokio::test]
    async fn refused_tunnel_is_a_failed_measurement() {
        let addr = connect_proxy(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let prober = HttpsProber::new(via_proxy(addr, Duration::from_millis(500))).unwrap();

        let err = prober.probe(Ipv4Addr::new(104, 16, 0, 1)).await.unwrap_err();
        assert!(
            matches!(err, ProbeError::Proxy(ProxyError::Refused(_))),
            "got {err}"
        );
    }
}
