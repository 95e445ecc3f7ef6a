use anyhow::{anyhow, bail, Context, Result};
use std::io;
use std::net::SocketAddrV4;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_USER_PASS: u8 = 0x02;
const SOCKS_NO_ACCEPTABLE: u8 = 0xff;
const MAX_CONNECT_REPLY: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// `http://` proxy, tunnelled with `CONNECT`.
    Http,
    /// `socks5://` or `socks5h://`. The tunnel target is always a literal
    /// address, so the two behave the same.
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy i/o: {0}")]
    Io(#[from] io::Error),
    #[error("proxy refused tunnel: {0}")]
    Refused(String),
    #[error("proxy protocol violation: {0}")]
    Protocol(String),
}

impl ProxyConfig {
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s).with_context(|| format!("invalid proxy url: {s}"))?;
        let kind = match url.scheme() {
            "http" => ProxyKind::Http,
            "socks5" | "socks5h" => ProxyKind::Socks5,
            other => bail!("unsupported proxy scheme: {other}"),
        };
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("proxy url has no host: {s}"))?
            .to_string();
        let port = match (url.port_or_known_default(), kind) {
            (Some(p), _) => p,
            (None, ProxyKind::Socks5) => 1080,
            (None, ProxyKind::Http) => 80,
        };
        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            ))
        };
        if credentials.is_some() && kind == ProxyKind::Http {
            bail!("http proxy authentication is not supported");
        }
        Ok(Self {
            kind,
            host,
            port,
            credentials,
        })
    }

    /// Turn a fresh connection to the proxy into a tunnel to `target`.
    pub async fn establish(
        &self,
        stream: &mut TcpStream,
        target: SocketAddrV4,
    ) -> Result<(), ProxyError> {
        match self.kind {
            ProxyKind::Http => http_connect(stream, target).await,
            ProxyKind::Socks5 => socks5_connect(stream, target, self.credentials.as_ref()).await,
        }
    }
}

async fn http_connect(stream: &mut TcpStream, target: SocketAddrV4) -> Result<(), ProxyError> {
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Byte-at-a-time so nothing after the header block is consumed.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_REPLY {
            return Err(ProxyError::Protocol("CONNECT reply too large".into()));
        }
        stream.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some("200") => Ok(()),
        Some(_) => Err(ProxyError::Refused(status_line.to_string())),
        None => Err(ProxyError::Protocol(format!(
            "bad CONNECT status line: {status_line}"
        ))),
    }
}

async fn socks5_connect(
    stream: &mut TcpStream,
    target: SocketAddrV4,
    credentials: Option<&(String, String)>,
) -> Result<(), ProxyError> {
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS_VERSION, 2, SOCKS_NO_AUTH, SOCKS_USER_PASS]
    } else {
        &[SOCKS_VERSION, 1, SOCKS_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!(
            "unexpected socks version {}",
            choice[0]
        )));
    }
    match (choice[1], credentials) {
        (SOCKS_NO_AUTH, _) => {}
        (SOCKS_USER_PASS, Some((user, pass))) => socks5_auth(stream, user, pass).await?,
        (SOCKS_NO_ACCEPTABLE, _) => {
            return Err(ProxyError::Refused("no acceptable auth method".into()))
        }
        (method, _) => {
            return Err(ProxyError::Protocol(format!(
                "server selected unsupported method {method}"
            )))
        }
    }

    let mut request = vec![SOCKS_VERSION, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(ProxyError::Protocol(format!(
            "unexpected socks version {}",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(ProxyError::Refused(format!("socks reply code {}", reply[1])));
    }

    // Drain BND.ADDR + BND.PORT.
    let rest = match reply[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        atyp => {
            return Err(ProxyError::Protocol(format!(
                "unknown address type {atyp}"
            )))
        }
    };
    let mut discard = vec![0u8; rest];
    stream.read_exact(&mut discard).await?;
    Ok(())
}

async fn socks5_auth(stream: &mut TcpStream, user: &str, pass: &str) -> Result<(), ProxyError> {
    let (u, p) = (user.as_bytes(), pass.as_bytes());
    if u.len() > 255 || p.len() > 255 {
        return Err(ProxyError::Protocol("socks credentials too long".into()));
    }
    let mut request = Vec::with_capacity(3 + u.len() + p.len());
    request.push(0x01);
    request.push(u.len() as u8);
    request.extend_from_slice(u);
    request.push(p.len() as u8);
    request.extend_from_slice(p);
    stream.write_all(&request).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(ProxyError::Refused("socks authentication failed".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[test]
    fn parses_supported_schemes() {
        let p = ProxyConfig::parse("socks5://127.0.0.1:1080").unwrap();
        assert_eq!(p.kind, ProxyKind::Socks5);
        assert_eq!((p.host.as_str(), p.port), ("127.0.0.1", 1080));

        let p = ProxyConfig::parse("socks5h://user:pw@proxy.local").unwrap();
        assert_eq!(p.port, 1080);
        assert_eq!(p.credentials, Some(("user".into(), "pw".into())));

        let p = ProxyConfig::parse("http://127.0.0.1:1081").unwrap();
        assert_eq!(p.kind, ProxyKind::Http);
        assert_eq!(p.port, 1081);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(ProxyConfig::parse("ftp://127.0.0.1:21").is_err());
        assert!(ProxyConfig::parse("not a url").is_err());
    }

    #[tokio::test]
    async fn http_connect_tunnel_is_accepted_on_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 512];
            let n = sock.read(&mut buf).await.unwrap();
            let req = String::from_utf8_lossy(&buf[..n]).to_string();
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            req
        });

        let proxy = ProxyConfig::parse(&format!("http://{addr}")).unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let target = SocketAddrV4::new(Ipv4Addr::new(104, 16, 0, 1), 443);
        proxy.establish(&mut stream, target).await.unwrap();

        let req = server.await.unwrap();
        assert!(req.starts_with("CONNECT 104.16.0.1:443 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn socks5_refusal_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greet = [0u8; 3];
            sock.read_exact(&mut greet).await.unwrap();
            sock.write_all(&[0x05, 0x00]).await.unwrap();
            let mut req = [0u8; 10];
            sock.read_exact(&mut req).await.unwrap();
            // 0x05: connection refused
            sock.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let proxy = ProxyConfig::parse(&format!("socks5://{addr}")).unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let target = SocketAddrV4::new(Ipv4Addr::new(104, 16, 0, 1), 443);
        let err = proxy.establish(&mut stream, target).await.unwrap_err();
        assert!(matches!(err, ProxyError::Refused(_)));
    }
}
