//! Shared test environment: a Kura instance on an ephemeral port.

#![allow(dead_code)]

use kura::app::App;
use kura::config::{Config, ConfigLoader};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestEnv {
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub app: App,
    pub dir: TempDir,
}

impl TestEnv {
    /// Memory backend, compactor off, no federation
    pub async fn new() -> Self {
        Self::with_yaml("").await
    }

    /// `extra` is appended to a base config whose `storage` section points
    /// into a fresh temp directory.
    pub async fn with_yaml(extra: &str) -> Self {
        let dir = TempDir::new().expect("temp dir");
        Self::in_dir(dir, "memory", extra).await
    }

    pub async fn in_dir(dir: TempDir, backend: &str, extra: &str) -> Self {
        let config = config(&dir, backend, extra);
        let mut app = App::build(config).await.expect("app should build");
        let addr = app.start().await.expect("app should start");

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("client");

        Self {
            addr,
            client,
            app,
            dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn push(&self, tenant: Option<&str>, hex_id: &str, query: &str, body: &[u8]) -> u16 {
        let mut request = self
            .client
            .post(self.url(&format!("/api/push/{}?{}", hex_id, query)))
            .body(body.to_vec());
        if let Some(tenant) = tenant {
            request = request.header("X-Scope-OrgID", tenant);
        }
        request.send().await.expect("push").status().as_u16()
    }

    pub async fn get_trace(&self, tenant: Option<&str>, hex_id: &str) -> (u16, Vec<u8>) {
        let mut request = self.client.get(self.url(&format!("/api/traces/{}", hex_id)));
        if let Some(tenant) = tenant {
            request = request.header("X-Scope-OrgID", tenant);
        }
        let response = request.send().await.expect("get trace");
        let status = response.status().as_u16();
        (status, response.bytes().await.expect("body").to_vec())
    }

    pub async fn shutdown(mut self) -> TempDir {
        self.app.shutdown().await;
        self.dir
    }
}

pub fn config(dir: &TempDir, backend: &str, extra: &str) -> Config {
    let yaml = format!(
        r#"
server:
  address: "127.0.0.1:0"
storage:
  backend: {backend}
  local:
    path: "{root}/blocks"
  wal:
    path: "{root}/wal"
compactor:
  enabled: false
{extra}
"#,
        backend = backend,
        root = dir.path().display(),
        extra = extra,
    );
    ConfigLoader::parse(&yaml).expect("valid test config")
}
