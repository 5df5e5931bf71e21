use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;

/// Well-known local API ports probed when the log never names one.
const FALLBACK_API_PORTS: [u16; 3] = [4040, 4041, 4042];

/// Supervises an external tunneling binary (ngrok-style) that exposes the
/// local relay. All of start, poll, and stop are idempotent.
pub struct TunnelSupervisor {
    config: TunnelConfig,
    /// Local port the tunnel forwards to (the relay's port).
    local_port: u16,
    child: Mutex<Option<Child>>,
    log_lines: Arc<Mutex<Vec<String>>>,
    public_url: Mutex<Option<String>>,
    client: reqwest::Client,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelConfig, local_port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            local_port,
            child: Mutex::new(None),
            log_lines: Arc::new(Mutex::new(Vec::new())),
            public_url: Mutex::new(None),
            client,
        }
    }

    /// Spawn the tunnel process and discover the public https URL.
    /// Calling start while a tunnel is up returns the same URL.
    pub async fn start(&self) -> anyhow::Result<String> {
        if let Some(url) = self.public_url.lock().await.clone() {
            return Ok(url);
        }

        {
            let mut child_slot = self.child.lock().await;
            if child_slot.is_none() {
                let mut cmd = Command::new(&self.config.binary);
                cmd.args([
                    "http",
                    &self.local_port.to_string(),
                    "--log",
                    "stdout",
                    "--log-format",
                    "json",
                ]);
                if !self.config.authtoken_env.is_empty() {
                    if let Ok(token) = std::env::var(&self.config.authtoken_env) {
                        if !token.is_empty() {
                            cmd.env("NGROK_AUTHTOKEN", token);
                        }
                    }
                }
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);
                let mut child = cmd.spawn().map_err(|e| {
                    anyhow::anyhow!(
                        "could not spawn tunnel binary '{}': {}",
                        self.config.binary,
                        e
                    )
                })?;

                // Tail the structured log into a shared buffer.
                if let Some(stdout) = child.stdout.take() {
                    let lines = self.log_lines.clone();
                    tokio::spawn(async move {
                        let mut reader = BufReader::new(stdout).lines();
                        while let Ok(Some(line)) = reader.next_line().await {
                            lines.lock().await.push(line);
                        }
                    });
                }
                *child_slot = Some(child);
                info!("tunnel: spawned {} -> localhost:{}", self.config.binary, self.local_port);
            }
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.startup_timeout_sec);
        let mut last_error = String::from("tunnel API never became reachable");

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(500)).await;
            match self.poll_public_url().await {
                Ok(Some(url)) => {
                    *self.public_url.lock().await = Some(url.clone());
                    info!("tunnel: public URL {}", url);
                    return Ok(url);
                }
                Ok(None) => {}
                Err(e) => last_error = e.to_string(),
            }
        }
        anyhow::bail!(
            "tunnel did not come up within {}s: {}",
            self.config.startup_timeout_sec,
            last_error
        )
    }

    /// Probe candidate API bases in order (log-discovered, configured,
    /// then the well-known local ports) for a tunnel matching our port.
    pub async fn poll_public_url(&self) -> anyhow::Result<Option<String>> {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(addr) = self.discovered_api_addr().await {
            candidates.push(format!("http://{}", addr));
        }
        if !self.config.api_base.is_empty() {
            candidates.push(self.config.api_base.trim_end_matches('/').to_string());
        }
        for port in FALLBACK_API_PORTS {
            candidates.push(format!("http://127.0.0.1:{}", port));
        }

        let mut last_error: Option<String> = None;
        for base in candidates {
            match self.query_api(&base).await {
                Ok(Some(url)) => return Ok(Some(url)),
                Ok(None) => {}
                Err(e) => {
                    debug!("tunnel API {} probe failed: {}", base, e);
                    last_error = Some(format!("{}: {}", base, e));
                }
            }
        }
        match last_error {
            Some(e) => Err(anyhow::anyhow!(e)),
            None => Ok(None),
        }
    }

    /// The structured log names the local web/API address on startup.
    async fn discovered_api_addr(&self) -> Option<String> {
        let lines = self.log_lines.lock().await;
        for line in lines.iter() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            let obj = value["obj"].as_str().unwrap_or("");
            let msg = value["msg"].as_str().unwrap_or("");
            if obj == "web" || msg.contains("starting web service") {
                if let Some(addr) = value["addr"].as_str() {
                    return Some(addr.to_string());
                }
            }
        }
        None
    }

    async fn query_api(&self, base: &str) -> anyhow::Result<Option<String>> {
        let url = format!("{}/api/tunnels", base);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("HTTP {}", resp.status());
        }
        let body: serde_json::Value = resp.json().await?;
        Ok(select_tunnel_url(&body, self.local_port))
    }

    /// SIGTERM first; SIGKILL after 3 seconds. A stopped supervisor stays
    /// stopped.
    pub async fn stop(&self) {
        let mut child_slot = self.child.lock().await;
        let Some(mut child) = child_slot.take() else {
            return;
        };
        *self.public_url.lock().await = None;

        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .output()
                .await;
        }
        match tokio::time::timeout(Duration::from_secs(3), child.wait()).await {
            Ok(_) => info!("tunnel: stopped"),
            Err(_) => {
                warn!("tunnel: SIGTERM ignored, killing");
                let _ = child.kill().await;
            }
        }
        self.log_lines.lock().await.clear();
    }

    pub async fn current_url(&self) -> Option<String> {
        self.public_url.lock().await.clone()
    }
}

/// Pick the https tunnel whose forwarded address matches our local port.
fn select_tunnel_url(body: &serde_json::Value, local_port: u16) -> Option<String> {
    let tunnels = body["tunnels"].as_array()?;
    let port_suffix = format!(":{}", local_port);
    let mut fallback: Option<String> = None;
    for tunnel in tunnels {
        let public_url = tunnel["public_url"].as_str().unwrap_or("");
        if public_url.is_empty() {
            continue;
        }
        let addr = tunnel["config"]["addr"].as_str().unwrap_or("");
        let matches_port = addr.ends_with(&port_suffix);
        if matches_port && public_url.starts_with("https://") {
            return Some(public_url.to_string());
        }
        if matches_port && fallback.is_none() {
            fallback = Some(public_url.to_string());
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_tunnel_prefers_https_matching_port() {
        let body = serde_json::json!({
            "tunnels": [
                {"public_url": "http://abc.ngrok.app", "config": {"addr": "http://localhost:8787"}},
                {"public_url": "https://abc.ngrok.app", "config": {"addr": "http://localhost:8787"}},
                {"public_url": "https://other.ngrok.app", "config": {"addr": "http://localhost:9999"}}
            ]
        });
        assert_eq!(
            select_tunnel_url(&body, 8787),
            Some("https://abc.ngrok.app".to_string())
        );
    }

    #[test]
    fn test_select_tunnel_http_fallback() {
        let body = serde_json::json!({
            "tunnels": [
                {"public_url": "http://abc.ngrok.app", "config": {"addr": "http://localhost:8787"}}
            ]
        });
        assert_eq!(
            select_tunnel_url(&body, 8787),
            Some("http://abc.ngrok.app".to_string())
        );
    }

    #[test]
    fn test_select_tunnel_no_match() {
        let body = serde_json::json!({"tunnels": []});
        assert_eq!(select_tunnel_url(&body, 8787), None);
        let wrong_port = serde_json::json!({
            "tunnels": [
                {"public_url": "https://x.ngrok.app", "config": {"addr": "http://localhost:1234"}}
            ]
        });
        assert_eq!(select_tunnel_url(&wrong_port, 8787), None);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let sup = TunnelSupervisor::new(TunnelConfig::default(), 8787);
        sup.stop().await;
        sup.stop().await;
        assert!(sup.current_url().await.is_none());
    }

    #[tokio::test]
    async fn test_discovered_api_addr_from_log() {
        let sup = TunnelSupervisor::new(TunnelConfig::default(), 8787);
        sup.log_lines.lock().await.push(
            r#"{"lvl":"info","msg":"starting web service","obj":"web","addr":"127.0.0.1:4041"}"#
                .to_string(),
        );
        assert_eq!(sup.discovered_api_addr().await, Some("127.0.0.1:4041".into()));
    }
}
