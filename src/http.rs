//! Small HTTP helpers shared by the rule-based collaborators.
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};

/// Response bodies are cut to this many bytes before matching.
const BODY_LIMIT: usize = 64 * 1024;

/// Client tuned for device web consoles: short timeouts, self-signed certs
/// accepted, system proxies ignored.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .danger_accept_invalid_certs(true)
        .no_proxy()
        .redirect(reqwest::redirect::Policy::limited(3))
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

pub fn base_url(ip: IpAddr, port: u16) -> String {
    let scheme = match port {
        443 | 8443 => "https",
        _ => "http",
    };
    format!("{scheme}://{}", SocketAddr::new(ip, port))
}

/// Join a base URL and an absolute or relative path.
pub fn join(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Status line, headers and (truncated) body flattened into one string.
///
/// The body is read chunk by chunk and reading stops at `BODY_LIMIT`, so
/// streaming endpoints (MJPEG and the like) cost a bounded amount of memory.
pub async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, reqwest::Error> {
    let mut resp = client.get(url).send().await?;
    let mut out = format!("{}\n", resp.status());
    for (name, value) in resp.headers() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push('\n');
    }
    out.push('\n');
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        let room = BODY_LIMIT - body.len();
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() >= BODY_LIMIT {
            break;
        }
    }
    out.push_str(&String::from_utf8_lossy(&body));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn tls_ports_use_https() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(base_url(ip, 443), "https://10.0.0.1:443");
        assert_eq!(base_url(ip, 8080), "http://10.0.0.1:8080");
    }

    #[test]
    fn join_handles_both_path_forms() {
        assert_eq!(join("http://h:1", "/a"), "http://h:1/a");
        assert_eq!(join("http://h:1", "a"), "http://h:1/a");
    }

    #[tokio::test]
    async fn endless_body_is_cut_at_limit() {
        use axum::{body::Body, routing::get, Router};

        let app = Router::new().route(
            "/stream",
            get(|| async {
                let chunks = futures::stream::repeat_with(|| {
                    Ok::<_, std::io::Error>(vec![b'x'; 16 * 1024])
                });
                Body::from_stream(chunks)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = build_client(Duration::from_secs(10)).unwrap();
        let text = fetch_text(&client, &format!("http://{addr}/stream")).await.unwrap();
        let (head, body) = text.split_once("\n\n").unwrap();
        assert!(head.starts_with("200 OK"));
        assert_eq!(body.len(), BODY_LIMIT);
        assert!(body.bytes().all(|b| b == b'x'));
    }
}
