#![allow(dead_code)]

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, bail};
use axum::{Json, Router, extract::Path as UrlPath, routing::post};
use reqwest::{Response, header, redirect::Policy};
use serde_json::{Value, json};
use tokio::process::{Child, Command};

pub const ADMIN_USERNAME: &str = "ops";
pub const ADMIN_PASSWORD: &str = "correct horse";

/// Running dashboard binary; killed when dropped.
pub struct Dashboard {
    pub base_url: String,
    child: Child,
    _temp: tempfile::TempDir,
}

impl Dashboard {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

pub async fn spawn_dashboard(env: &[(&str, &str)]) -> Result<Dashboard> {
    let bin = env!("CARGO_BIN_EXE_livekit-dashboard");
    let temp = tempfile::tempdir()?;
    let port_file = temp.path().join("port.txt");

    let mut cmd = Command::new(bin);
    cmd.arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--port-file")
        .arg(&port_file)
        .env_clear()
        .env("ADMIN_USERNAME", ADMIN_USERNAME)
        .env("ADMIN_PASSWORD", ADMIN_PASSWORD)
        .env("RUST_LOG", "warn")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let mut child = cmd.spawn()?;

    let http = client();
    let port = wait_for_port(&http, &port_file, &mut child).await?;
    Ok(Dashboard {
        base_url: format!("http://127.0.0.1:{port}"),
        child,
        _temp: temp,
    })
}

async fn wait_for_port(http: &reqwest::Client, port_file: &Path, child: &mut Child) -> Result<u16> {
    for _ in 0..200 {
        if let Some(status) = child.try_wait()? {
            bail!("dashboard exited early with {status}");
        }
        match tokio::fs::read_to_string(port_file).await {
            Ok(raw) if raw.ends_with('\n') => {
                let port: u16 = raw.trim().parse()?;
                wait_for_health(http, port).await?;
                return Ok(port);
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(25)).await,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
    bail!("dashboard port file did not become ready in time")
}

async fn wait_for_health(http: &reqwest::Client, port: u16) -> Result<()> {
    for _ in 0..100 {
        if let Ok(response) = http
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            && response.status().is_success()
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    bail!("dashboard health check did not pass in time")
}

/// HTTP client that surfaces redirects instead of following them.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .expect("http client")
}

pub fn session_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with("lk_dashboard_session="))
        .and_then(|value| value.split(';').next())
        .map(str::to_string)
}

pub fn location(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn extract_csrf(body: &str) -> Option<String> {
    let marker = "name=\"csrf_token\" value=\"";
    let start = body.find(marker)? + marker.len();
    let end = body[start..].find('"')?;
    Some(body[start..start + end].to_string())
}

/// Minimal LiveKit Twirp endpoint; returns its `ws://` url.
pub async fn spawn_livekit() -> Result<String> {
    let app = Router::new().route(
        "/twirp/{service}/{method}",
        post(
            |UrlPath((_service, method)): UrlPath<(String, String)>, Json(body): Json<Value>| async move {
                let reply = match method.as_str() {
                    "ListRooms" => json!({"rooms": [
                        {"sid": "RM_1", "name": "standup", "num_participants": 3},
                        {"sid": "RM_2", "name": "retro", "num_participants": 0}
                    ]}),
                    "CreateRoom" => json!({"sid": "RM_9", "name": body["name"]}),
                    "ListParticipants" => json!({"participants": []}),
                    "ListEgress" => json!({"items": []}),
                    _ => json!({}),
                };
                Json(reply)
            },
        ),
    );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("ws://{addr}"))
}
