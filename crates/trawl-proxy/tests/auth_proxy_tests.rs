//! Local auth proxy against mock HTTP-proxy and SOCKS5 upstreams.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use trawl_proxy::{start_auth_proxy, UpstreamType};

/// Read an HTTP request or reply head; returns the full head text.
async fn read_head(reader: &mut BufReader<TcpStream>) -> String {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            break;
        }
        if line.trim_end().is_empty() {
            break;
        }
        head.push_str(&line);
    }
    head
}

async fn echo_until_closed(stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin)) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Mock upstream HTTP proxy requiring Basic auth. CONNECT tunnels echo;
/// plain requests get a fixed body. Returns the observed request head.
fn mock_http_proxy_upstream(listener: TcpListener, expected_auth: &str) -> JoinHandle<String> {
    let expected = format!("Proxy-Authorization: Basic {expected_auth}");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let head = read_head(&mut reader).await;

        let authed = head.lines().any(|l| l == expected);
        let mut stream = reader.into_inner();

        if head.starts_with("CONNECT ") {
            if !authed {
                let _ = stream
                    .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                    .await;
                return head;
            }

            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            echo_until_closed(&mut stream).await;
        } else {
            let reply = if authed {
                "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
            } else {
                "HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n"
            };
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.shutdown().await;
        }

        head
    })
}

/// Minimal SOCKS5 upstream with username/password auth; established
/// connections echo. Returns the domain name the client asked for.
fn mock_socks5_upstream(
    listener: TcpListener,
    user: &'static str,
    pass: &'static str,
) -> JoinHandle<String> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        // Greeting: VER NMETHODS METHODS...; answer user/pass (0x02).
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting[0], 0x05);
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
        assert!(methods.contains(&0x02), "client must offer user/pass auth");
        stream.write_all(&[0x05, 0x02]).await.unwrap();

        // RFC 1929 subnegotiation.
        let mut auth_header = [0u8; 2];
        stream.read_exact(&mut auth_header).await.unwrap();
        assert_eq!(auth_header[0], 0x01);
        let mut username = vec![0u8; auth_header[1] as usize];
        stream.read_exact(&mut username).await.unwrap();
        let mut pass_len = [0u8; 1];
        stream.read_exact(&mut pass_len).await.unwrap();
        let mut password = vec![0u8; pass_len[0] as usize];
        stream.read_exact(&mut password).await.unwrap();

        let ok = username == user.as_bytes() && password == pass.as_bytes();
        stream
            .write_all(&[0x01, if ok { 0x00 } else { 0x01 }])
            .await
            .unwrap();
        assert!(ok, "unexpected credentials");

        // CONNECT request; only the domain address type is expected here.
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..3], &[0x05, 0x01, 0x00]);
        assert_eq!(request[3], 0x03, "domain address type expected");

        let mut domain_len = [0u8; 1];
        stream.read_exact(&mut domain_len).await.unwrap();
        let mut domain = vec![0u8; domain_len[0] as usize];
        stream.read_exact(&mut domain).await.unwrap();
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await.unwrap();

        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        echo_until_closed(&mut stream).await;

        String::from_utf8(domain).unwrap()
    })
}

async fn connect_through(local_port: u16, target: &str) -> (BufReader<TcpStream>, String) {
    let stream = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
    let mut reader = BufReader::new(stream);

    reader
        .get_mut()
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let reply = read_head(&mut reader).await;
    (reader, reply)
}

#[tokio::test]
async fn connect_tunnels_through_an_http_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    // base64("user:pass")
    let upstream = mock_http_proxy_upstream(listener, "dXNlcjpwYXNz");

    let proxy = start_auth_proxy(&format!("http://{upstream_addr}"), "user", "pass")
        .await
        .unwrap();
    assert_eq!(proxy.upstream_type(), UpstreamType::Http);

    // The target does not resolve, which skips the private-network check
    // and leaves the routing decision to the upstream.
    let (mut tunnel, reply) = connect_through(proxy.port(), "origin.invalid:443").await;
    assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");

    tunnel.get_mut().write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tunnel.get_mut().read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    drop(tunnel);
    let seen = upstream.await.unwrap();
    assert!(seen.starts_with("CONNECT origin.invalid:443 HTTP/1.1"), "{seen}");
    assert!(seen.contains("Proxy-Authorization: Basic dXNlcjpwYXNz"));

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn upstream_auth_rejection_surfaces_as_407() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let _upstream = mock_http_proxy_upstream(listener, "b3RoZXI6Y3JlZHM=");

    let proxy = start_auth_proxy(&format!("http://{upstream_addr}"), "user", "pass")
        .await
        .unwrap();

    let (_tunnel, reply) = connect_through(proxy.port(), "origin.invalid:443").await;
    assert!(reply.starts_with("HTTP/1.1 407"), "{reply}");

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn private_targets_are_refused_with_403() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    // The upstream must never be dialed for a refused target.
    drop(listener);

    let proxy = start_auth_proxy(&format!("http://{upstream_addr}"), "user", "pass")
        .await
        .unwrap();

    let (_tunnel, reply) = connect_through(proxy.port(), "127.0.0.1:9").await;
    assert!(reply.starts_with("HTTP/1.1 403"), "{reply}");

    let (_tunnel, reply) = connect_through(proxy.port(), "192.168.1.10:80").await;
    assert!(reply.starts_with("HTTP/1.1 403"), "{reply}");

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn connect_tunnels_through_a_socks5h_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let upstream = mock_socks5_upstream(listener, "socksuser", "sockspass");

    let proxy = start_auth_proxy(
        &format!("socks5h://{upstream_addr}"),
        "socksuser",
        "sockspass",
    )
    .await
    .unwrap();
    assert_eq!(proxy.upstream_type(), UpstreamType::Socks5);

    // socks5h: the hostname goes to the upstream unresolved, even a
    // private-looking one.
    let (mut tunnel, reply) = connect_through(proxy.port(), "internal.service:8080").await;
    assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");

    tunnel.get_mut().write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tunnel.get_mut().read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    drop(tunnel);
    assert_eq!(upstream.await.unwrap(), "internal.service");

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn socks5_without_remote_dns_still_blocks_private_targets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    drop(listener);

    let proxy = start_auth_proxy(&format!("socks5://{upstream_addr}"), "u", "p")
        .await
        .unwrap();

    let (_tunnel, reply) = connect_through(proxy.port(), "10.0.0.5:80").await;
    assert!(reply.starts_with("HTTP/1.1 403"), "{reply}");

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn plain_requests_are_forwarded_with_upstream_auth() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let upstream = mock_http_proxy_upstream(listener, "dXNlcjpwYXNz");

    let proxy = start_auth_proxy(&format!("http://{upstream_addr}"), "user", "pass")
        .await
        .unwrap();

    let client = proxy.http_client().unwrap();
    let reply = client
        .get("http://api.example.invalid/data")
        .send()
        .await
        .unwrap();

    assert_eq!(reply.status(), 200);
    assert_eq!(reply.text().await.unwrap(), "hello");

    let seen = upstream.await.unwrap();
    assert!(
        seen.starts_with("GET http://api.example.invalid/data HTTP/1.1"),
        "{seen}"
    );
    assert!(seen.contains("Proxy-Authorization: Basic dXNlcjpwYXNz"));

    proxy.close().await.unwrap();
}

/// Upstream HTTP proxy that reads a Content-Length body and echoes it back.
fn mock_http_proxy_echoing_body(listener: TcpListener) -> JoinHandle<(String, Vec<u8>)> {
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let head = read_head(&mut reader).await;

        let body_len = head
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
            .and_then(|l| l.split(':').nth(1))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            reader.read_exact(&mut body).await.unwrap();
        }

        let mut stream = reader.into_inner();
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(reply.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        let _ = stream.shutdown().await;

        (head, body)
    })
}

#[tokio::test]
async fn chunked_request_bodies_are_dechunked_before_forwarding() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let upstream = mock_http_proxy_echoing_body(listener);

    let proxy = start_auth_proxy(&format!("http://{upstream_addr}"), "user", "pass")
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
    client
        .write_all(
            b"POST http://api.example.invalid/echo HTTP/1.1\r\n\
              Host: api.example.invalid\r\n\
              Transfer-Encoding: chunked\r\n\
              \r\n\
              4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
    assert!(reply.ends_with("wikipedia"), "{reply}");

    // The upstream saw the dechunked payload with a recomputed length.
    let (head, body) = upstream.await.unwrap();
    assert!(head.starts_with("POST http://api.example.invalid/echo"), "{head}");
    assert!(!head.to_ascii_lowercase().contains("transfer-encoding"), "{head}");
    assert_eq!(body, b"wikipedia");

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn unsupported_transfer_encodings_are_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    drop(listener);

    let proxy = start_auth_proxy(&format!("http://{upstream_addr}"), "user", "pass")
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
    client
        .write_all(
            b"POST http://api.example.invalid/upload HTTP/1.1\r\n\
              Host: api.example.invalid\r\n\
              Transfer-Encoding: gzip\r\n\
              \r\n",
        )
        .await
        .unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 400"), "{reply}");

    proxy.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let proxy = start_auth_proxy("http://upstream.invalid:3128", "user", "pass")
        .await
        .unwrap();

    proxy.close().await.unwrap();
    proxy.close().await.unwrap();
}
