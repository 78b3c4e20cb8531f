//! # Admin Client
//!
//! A deliberately small HTTP/1.1 client for the CLI subcommands. Pulling in
//! a full HTTP client for four fixed requests against a daemon we also ship
//! is not worth the dependency; a TCP stream and `Connection: close` do the
//! job. `--dump` prints the exchange to stderr, client lines prefixed `C:`
//! and server lines `S:`.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Low-level request plumbing shared by the typed calls below.
pub struct Agent {
    host: String,
    port: u16,
    dump: bool,
}

impl Agent {
    pub fn new(host: impl Into<String>, port: u16, dump: bool) -> Self {
        Agent {
            host: host.into(),
            port,
            dump,
        }
    }

    /// Sends one request and returns `(status, body)`.
    pub async fn interact(
        &self,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> Result<(u16, String)> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("failed to connect to {}", addr))?;

        let body = body.unwrap_or("");
        let head = format!(
            "{method} {uri} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Accept: application/json\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {length}\r\n\
             Connection: close",
            method = method,
            uri = uri,
            host = self.host,
            length = body.len(),
        );
        let request = format!("{}\r\n\r\n{}", head, body);
        if self.dump {
            for line in head.split("\r\n") {
                eprintln!("C: {}", line);
            }
            eprintln!("C:");
            if !body.is_empty() {
                eprintln!("C: {}", body);
            }
        }

        stream.write_all(request.as_bytes()).await?;
        stream.shutdown().await?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        let response = String::from_utf8_lossy(&raw);

        let (head, response_body) = response
            .split_once("\r\n\r\n")
            .unwrap_or((response.as_ref(), ""));
        if self.dump {
            for line in head.split("\r\n") {
                eprintln!("S: {}", line);
            }
            if !response_body.is_empty() {
                eprintln!("S:");
                eprintln!("S: {}", response_body);
            }
        }

        let status = parse_status_line(head)
            .with_context(|| format!("malformed response from {}", addr))?;
        Ok((status, response_body.to_string()))
    }
}

/// Pulls the status code out of `HTTP/1.1 200 OK`-style first lines.
fn parse_status_line(head: &str) -> Option<u16> {
    head.lines().next()?.split_whitespace().nth(1)?.parse().ok()
}

// ---------------------------------------------------------------------------
// Typed calls
// ---------------------------------------------------------------------------

/// The admin operations the CLI exposes.
pub struct AdminClient {
    agent: Agent,
}

impl AdminClient {
    pub fn new(host: impl Into<String>, port: u16, dump: bool) -> Self {
        AdminClient {
            agent: Agent::new(host, port, dump),
        }
    }

    /// Registers a resource; returns the daemon-minted resource id.
    pub async fn add_address(&self, resource: &str) -> Result<String> {
        let (status, body) = self.agent.interact("POST", "/resource", Some(resource)).await?;
        if status != 201 {
            bail!("daemon refused the resource (HTTP {}): {}", status, body.trim());
        }
        let parsed: serde_json::Value =
            serde_json::from_str(&body).context("daemon returned a non-JSON body")?;
        parsed
            .get("resource_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .context("daemon response is missing resource_id")
    }

    /// Sets the administrative status: "up" or "down".
    pub async fn set_status(&self, status: &str) -> Result<()> {
        let (code, body) = self.agent.interact("POST", "/status", Some(status)).await?;
        if code != 200 {
            bail!("daemon refused the status change (HTTP {}): {}", code, body.trim());
        }
        Ok(())
    }

    /// All known resources with their assignees.
    pub async fn resources(&self) -> Result<serde_json::Value> {
        let (code, body) = self.agent.interact("GET", "/resource", None).await?;
        if code != 200 {
            bail!("resource listing failed (HTTP {})", code);
        }
        serde_json::from_str(&body).context("malformed resource listing")
    }

    /// Cluster membership and connectivity.
    pub async fn info(&self) -> Result<serde_json::Value> {
        let (code, body) = self.agent.interact("GET", "/info", None).await?;
        if code != 200 {
            bail!("info request failed (HTTP {})", code);
        }
        serde_json::from_str(&body).context("malformed info response")
    }
}
