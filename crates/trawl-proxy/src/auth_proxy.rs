//! Local authenticating proxy.
//!
//! Listens on an ephemeral localhost port and relays to a single upstream
//! proxy (HTTP, HTTPS, SOCKS5 or SOCKS5H) with preconfigured credentials.
//! Lets clients that cannot carry proxy credentials themselves (headless
//! browsers, mostly) use authenticated upstreams.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_socks::tcp::Socks5Stream;
use tokio_util::sync::CancellationToken;
use trawl_core::{Error, Proxy};
use url::Url;

/// Splice buffer size for CONNECT tunnels.
const TUNNEL_BUF: usize = 32 * 1024;
/// Deadline for dialing the upstream proxy.
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request deadline on the HTTP forwarding path.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(60);
/// Largest request body accepted on the forwarding path.
const MAX_FORWARD_BODY: usize = 10 << 20;
/// Graceful-shutdown window before in-flight connections are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Kind of upstream the local proxy relays to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamType {
    Http,
    Socks5,
}

/// Handle to a running local proxy. Obtained from [`start_auth_proxy`].
pub struct AuthProxy {
    port: u16,
    upstream: Proxy,
    upstream_type: UpstreamType,
    /// socks5h: the upstream resolves target hostnames, no local DNS.
    remote_dns: bool,
    auth: String,
    client: reqwest::Client,
    shutdown: CancellationToken,
    serve: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Start a local proxy that authenticates against `proxy_url` with the
/// given credentials. Listens on an ephemeral localhost port.
pub async fn start_auth_proxy(
    proxy_url: &str,
    username: &str,
    password: &str,
) -> Result<Arc<AuthProxy>, Error> {
    if proxy_url.is_empty() {
        return Err(Error::InvalidProxy("proxy URL cannot be empty".into()));
    }

    if username.is_empty() || password.is_empty() {
        return Err(Error::InvalidProxy(
            "username and password are required".into(),
        ));
    }

    let mut upstream = Proxy::parse(proxy_url)?;
    upstream.username = username.to_string();
    upstream.password = password.to_string();

    let upstream_type = match upstream.scheme() {
        "http" | "https" => UpstreamType::Http,
        "socks5" | "socks5h" => UpstreamType::Socks5,
        other => {
            return Err(Error::InvalidProxy(format!(
                "unsupported proxy scheme: {other}"
            )))
        }
    };
    let remote_dns = upstream.scheme() == "socks5h";

    let client = build_upstream_client(&upstream)?;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Other(format!("failed to find free port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Other(e.to_string()))?
        .port();

    let proxy = Arc::new(AuthProxy {
        port,
        auth: BASE64.encode(format!("{username}:{password}")),
        upstream,
        upstream_type,
        remote_dns,
        client,
        shutdown: CancellationToken::new(),
        serve: Mutex::new(None),
        closed: AtomicBool::new(false),
    });

    let accept = proxy.clone();
    let handle = tokio::spawn(async move { accept.accept_loop(listener).await });
    *proxy.serve.lock().unwrap() = Some(handle);

    tracing::debug!(port, upstream = %proxy.upstream.url, "auth proxy started");
    Ok(proxy)
}

/// Client pre-wired to the upstream. reqwest injects `Proxy-Authorization`
/// for HTTP upstreams and performs the SOCKS handshake for socks URLs.
fn build_upstream_client(upstream: &Proxy) -> Result<reqwest::Client, Error> {
    let proxied = reqwest::Proxy::all(upstream.full_url())
        .map_err(|e| Error::InvalidProxy(e.to_string()))?;

    reqwest::Client::builder()
        .proxy(proxied)
        .timeout(Duration::from_secs(120))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| Error::Other(e.to_string()))
}

impl AuthProxy {
    /// Port the proxy listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn upstream_type(&self) -> UpstreamType {
        self.upstream_type
    }

    /// Client that routes every request through this local proxy.
    pub fn http_client(&self) -> Result<reqwest::Client, Error> {
        let local = reqwest::Proxy::all(format!("http://{}", self.address()))
            .map_err(|e| Error::Other(e.to_string()))?;

        reqwest::Client::builder()
            .proxy(local)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Other(e.to_string()))
    }

    /// Stop accepting connections and drain in-flight ones, aborting those
    /// still open after the grace window. Idempotent.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();

        let handle = self.serve.lock().unwrap().take();
        if let Some(mut handle) = handle {
            let deadline = SHUTDOWN_GRACE + Duration::from_secs(2);
            if tokio::time::timeout(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut connections = JoinSet::new();

        loop {
            while connections.try_join_next().is_some() {}

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer)) => {
                        let proxy = self.clone();
                        connections.spawn(async move {
                            if let Err(e) = proxy.handle_connection(stream).await {
                                tracing::debug!(error = %e, "proxy connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        drop(listener);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            connections.shutdown().await;
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), Error> {
        let mut reader = BufReader::new(stream);

        let head = match read_request_head(&mut reader).await {
            Ok(head) => head,
            Err(e) => {
                write_simple_response(reader.get_mut(), 400, "Bad Request", "malformed request")
                    .await;
                return Err(e);
            }
        };

        if head.method == "CONNECT" {
            self.handle_connect(reader, head).await
        } else {
            self.handle_forward(reader, head).await
        }
    }

    async fn handle_connect(
        &self,
        mut reader: BufReader<TcpStream>,
        head: RequestHead,
    ) -> Result<(), Error> {
        let (host, port) = match split_host_port(&head.target) {
            Some(target) => target,
            None => {
                write_simple_response(
                    reader.get_mut(),
                    400,
                    "Bad Request",
                    "missing host in CONNECT request",
                )
                .await;
                return Ok(());
            }
        };

        // socks5h resolves on the upstream; everything else is checked
        // locally before any egress.
        let skip_check = self.upstream_type == UpstreamType::Socks5 && self.remote_dns;
        if !skip_check {
            if let Err(e) = check_private_network(&host, port).await {
                write_simple_response(reader.get_mut(), 403, "Forbidden", &e.to_string()).await;
                return Ok(());
            }
        }

        match self.upstream_type {
            UpstreamType::Http => self.connect_via_http(reader, &head.target).await,
            UpstreamType::Socks5 => self.connect_via_socks5(reader, &host, port).await,
        }
    }

    async fn connect_via_http(
        &self,
        mut reader: BufReader<TcpStream>,
        target: &str,
    ) -> Result<(), Error> {
        let dial = TcpStream::connect(self.upstream.host_port());
        let upstream = match tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, dial).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "failed to connect to upstream");
                write_simple_response(reader.get_mut(), 502, "Bad Gateway", "upstream unreachable")
                    .await;
                return Ok(());
            }
            Err(_) => {
                write_simple_response(reader.get_mut(), 502, "Bad Gateway", "upstream dial timeout")
                    .await;
                return Ok(());
            }
        };
        tune_socket(&upstream);

        let mut upstream = BufReader::new(upstream);
        let connect_req = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: Basic {}\r\n\r\n",
            self.auth
        );

        if let Err(e) = upstream.get_mut().write_all(connect_req.as_bytes()).await {
            tracing::debug!(error = %e, "failed to send CONNECT to upstream");
            write_simple_response(reader.get_mut(), 502, "Bad Gateway", "upstream write failed")
                .await;
            return Ok(());
        }

        let status = match read_reply_status(&mut upstream).await {
            Ok(status) => status,
            Err(_) => {
                write_simple_response(reader.get_mut(), 502, "Bad Gateway", "bad upstream reply")
                    .await;
                return Ok(());
            }
        };

        if status != 200 {
            tracing::debug!(status, "upstream proxy rejected CONNECT");
            write_simple_response(
                reader.get_mut(),
                407,
                "Proxy Authentication Required",
                "upstream proxy rejected CONNECT",
            )
            .await;
            return Ok(());
        }

        // Bytes the upstream already pushed past its reply headers.
        let upstream_leftover = upstream.buffer().to_vec();
        let upstream = upstream.into_inner();

        self.tunnel(reader, upstream, &upstream_leftover).await
    }

    async fn connect_via_socks5(
        &self,
        mut reader: BufReader<TcpStream>,
        host: &str,
        port: u16,
    ) -> Result<(), Error> {
        let dial = TcpStream::connect(self.upstream.host_port());
        let socket = match tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, dial).await {
            Ok(Ok(conn)) => conn,
            _ => {
                write_simple_response(reader.get_mut(), 502, "Bad Gateway", "upstream unreachable")
                    .await;
                return Ok(());
            }
        };
        tune_socket(&socket);

        let upstream = match Socks5Stream::connect_with_password_and_socket(
            socket,
            (host, port),
            &self.upstream.username,
            &self.upstream.password,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(error = %e, "failed to connect through SOCKS5 proxy");
                write_simple_response(reader.get_mut(), 502, "Bad Gateway", "socks5 connect failed")
                    .await;
                return Ok(());
            }
        };

        self.tunnel(reader, upstream, &[]).await
    }

    async fn tunnel<U>(
        &self,
        mut reader: BufReader<TcpStream>,
        mut upstream: U,
        upstream_leftover: &[u8],
    ) -> Result<(), Error>
    where
        U: tokio::io::AsyncRead + AsyncWrite + Unpin,
    {
        if reader
            .get_mut()
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .is_err()
        {
            return Ok(());
        }

        // Bytes the client pipelined behind its CONNECT head.
        let client_leftover = reader.buffer().to_vec();
        let mut client = reader.into_inner();
        tune_socket(&client);

        if !client_leftover.is_empty() && upstream.write_all(&client_leftover).await.is_err() {
            return Ok(());
        }
        if !upstream_leftover.is_empty() && client.write_all(upstream_leftover).await.is_err() {
            return Ok(());
        }

        let splice = tokio::io::copy_bidirectional_with_sizes(
            &mut client,
            &mut upstream,
            TUNNEL_BUF,
            TUNNEL_BUF,
        );

        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            spliced = splice => match spliced {
                Ok(_) => {}
                Err(e) if is_expected_disconnect(&e) => {}
                Err(e) => tracing::debug!(error = %e, "tunnel error"),
            },
        }

        Ok(())
    }

    async fn handle_forward(
        &self,
        mut reader: BufReader<TcpStream>,
        head: RequestHead,
    ) -> Result<(), Error> {
        // Forward-proxy requests use the absolute form.
        let url = match Url::parse(&head.target) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
            _ => {
                write_simple_response(
                    reader.get_mut(),
                    400,
                    "Bad Request",
                    "absolute-form URL required",
                )
                .await;
                return Ok(());
            }
        };

        let transfer_encoding = head
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase());

        let body = match transfer_encoding.as_deref() {
            Some(encoding) if encoding.contains("chunked") => {
                match read_chunked_body(&mut reader, MAX_FORWARD_BODY).await {
                    Ok(body) => body,
                    Err(e) => {
                        write_simple_response(reader.get_mut(), 400, "Bad Request", &e.to_string())
                            .await;
                        return Ok(());
                    }
                }
            }
            Some(_) => {
                write_simple_response(
                    reader.get_mut(),
                    400,
                    "Bad Request",
                    "unsupported transfer encoding",
                )
                .await;
                return Ok(());
            }
            None => {
                let body_len = head
                    .header("content-length")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);

                if body_len > MAX_FORWARD_BODY {
                    write_simple_response(
                        reader.get_mut(),
                        400,
                        "Bad Request",
                        "request body too large",
                    )
                    .await;
                    return Ok(());
                }

                let mut body = vec![0u8; body_len];
                if body_len > 0 && reader.read_exact(&mut body).await.is_err() {
                    return Ok(());
                }
                body
            }
        };

        let method = match reqwest::Method::from_bytes(head.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                write_simple_response(reader.get_mut(), 400, "Bad Request", "invalid method").await;
                return Ok(());
            }
        };

        let mut request = self
            .client
            .request(method, url)
            .timeout(FORWARD_TIMEOUT);

        for (name, value) in &head.headers {
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            request = request.header(name, value);
        }

        if !body.is_empty() {
            request = request.body(body);
        }

        let mut reply = match request.send().await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(error = %e, "forward request failed");
                write_simple_response(reader.get_mut(), 502, "Bad Gateway", "upstream error").await;
                return Ok(());
            }
        };

        let writer = reader.get_mut();

        let status = reply.status();
        let mut response_head = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        );

        for (name, value) in reply.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                response_head.push_str(&format!("{name}: {value}\r\n"));
            }
        }
        response_head.push_str("Connection: close\r\n\r\n");

        if writer.write_all(response_head.as_bytes()).await.is_err() {
            return Ok(());
        }

        // reqwest hands the body back in ready chunks; relay them as they
        // arrive instead of buffering the whole payload.
        loop {
            match reply.chunk().await {
                Ok(Some(chunk)) => {
                    if writer.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "failed to relay response body");
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pool of local proxies
// ---------------------------------------------------------------------------

/// Round-robin pool of local auth proxies, one per upstream.
pub struct AuthProxyPool {
    proxies: Vec<Arc<AuthProxy>>,
    current: std::sync::atomic::AtomicUsize,
}

/// Front every upstream (given with embedded credentials) with a local
/// auth proxy.
pub async fn start_auth_proxies<S: AsRef<str>>(upstreams: &[S]) -> Result<AuthProxyPool, Error> {
    if upstreams.is_empty() {
        return Err(Error::InvalidProxy("no proxies provided".into()));
    }

    let mut proxies: Vec<Arc<AuthProxy>> = Vec::with_capacity(upstreams.len());

    for upstream in upstreams {
        let parsed = Proxy::parse(upstream.as_ref())?;
        let started = match start_auth_proxy(&parsed.url, &parsed.username, &parsed.password).await
        {
            Ok(started) => started,
            Err(e) => {
                for running in &proxies {
                    let _ = running.close().await;
                }
                return Err(e);
            }
        };
        proxies.push(started);
    }

    Ok(AuthProxyPool {
        proxies,
        current: std::sync::atomic::AtomicUsize::new(0),
    })
}

impl AuthProxyPool {
    pub fn next(&self) -> Arc<AuthProxy> {
        let index = self.current.fetch_add(1, Ordering::Relaxed);
        self.proxies[index % self.proxies.len()].clone()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub async fn close(&self) {
        for proxy in &self.proxies {
            let _ = proxy.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

struct RequestHead {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_request_head(
    reader: &mut BufReader<TcpStream>,
) -> Result<RequestHead, Error> {
    let mut request_line = String::new();
    let read = reader
        .read_line(&mut request_line)
        .await
        .map_err(|e| Error::Other(e.to_string()))?;
    if read == 0 {
        return Err(Error::Other("connection closed before request".into()));
    }

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::Other("missing method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| Error::Other("missing request target".into()))?
        .to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        if read == 0 {
            return Err(Error::Other("connection closed inside headers".into()));
        }

        let line = line.trim_end();
        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        if headers.len() > 128 {
            return Err(Error::Other("too many headers".into()));
        }
    }

    Ok(RequestHead {
        method,
        target,
        headers,
    })
}

/// Read a `Transfer-Encoding: chunked` request body into memory, capped at
/// `max` bytes. Chunk extensions and trailers are discarded.
async fn read_chunked_body(
    reader: &mut BufReader<TcpStream>,
    max: usize,
) -> Result<Vec<u8>, Error> {
    let mut body = Vec::new();

    loop {
        let mut size_line = String::new();
        let read = reader
            .read_line(&mut size_line)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        if read == 0 {
            return Err(Error::Other("connection closed inside chunked body".into()));
        }

        let size = size_line.trim_end().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size, 16)
            .map_err(|_| Error::Other(format!("bad chunk size: {size:?}")))?;

        if size == 0 {
            break;
        }

        if body.len() + size > max {
            return Err(Error::Other("request body too large".into()));
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(|e| Error::Other(e.to_string()))?;

        // Chunk data is followed by CRLF.
        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
    }

    // Trailers end with an empty line.
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        if read == 0 || line.trim_end().is_empty() {
            break;
        }
    }

    Ok(body)
}

/// Read an HTTP reply's status code and discard its headers.
async fn read_reply_status(reader: &mut BufReader<TcpStream>) -> Result<u16, Error> {
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| Error::Other(e.to_string()))?;

    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::Other(format!("bad reply line: {status_line:?}")))?;

    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        if read == 0 || line.trim_end().is_empty() {
            break;
        }
    }

    Ok(status)
}

async fn write_simple_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) {
    let payload = format!("{body}\n");
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );

    let _ = writer.write_all(head.as_bytes()).await;
    let _ = writer.write_all(payload.as_bytes()).await;
    let _ = writer.shutdown().await;
}

/// Headers that describe a single hop and must not be relayed.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn split_host_port(target: &str) -> Option<(String, u16)> {
    if target.is_empty() {
        return None;
    }

    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().ok()?;
            // IPv6 literals arrive bracketed.
            let host = host.trim_start_matches('[').trim_end_matches(']');
            Some((host.to_string(), port))
        }
        None => Some((target.to_string(), 443)),
    }
}

/// Refuse targets that resolve to loopback or private ranges. Resolution
/// failures pass through; the upstream will fail them anyway.
async fn check_private_network(host: &str, port: u16) -> Result<(), Error> {
    let Ok(addrs) = tokio::net::lookup_host((host, port)).await else {
        return Ok(());
    };

    for addr in addrs {
        if is_private_ip(addr.ip()) {
            return Err(Error::Other(
                "connection to private networks not allowed".into(),
            ));
        }
    }

    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
    let _ = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Peer-went-away errors that normal tunnel teardown produces.
fn is_expected_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected
    )
}
