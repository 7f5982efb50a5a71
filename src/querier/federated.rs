//! Federated trace lookups
//!
//! Asks peer instances for a trace and keeps the largest body returned.
//!
//! # Example
//!
//! ```no_run
//! use kura::querier::FederatedQuerier;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let querier = FederatedQuerier::new(
//!     vec!["http://kura-eu:3200".to_string(), "http://kura-us:3200".to_string()],
//!     Duration::from_secs(10),
//!     4,
//! )?;
//! let trace = querier.find("single-tenant", "4bf92f3577b34da6a3ce929d0e0e4736").await;
//! # Ok(())
//! # }
//! ```

use super::QueryError;
use crate::metrics;
use crate::util::BoundedWaitGroup;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;

/// Tenant header sent to peers
pub const ORG_ID_HEADER: &str = "X-Scope-OrgID";

/// Marks a request as coming from a peer so it is not federated again
pub const FEDERATED_HEADER: &str = "X-Kura-Federated";

#[derive(Clone)]
pub struct FederatedQuerier {
    client: reqwest::Client,
    endpoints: Vec<String>,
    max_concurrent: usize,
}

impl FederatedQuerier {
    pub fn new(
        endpoints: Vec<String>,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueryError::Federation(e.to_string()))?;

        Ok(Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            max_concurrent,
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Largest trace body any peer returned. Peer failures are logged and
    /// counted but never fail the lookup.
    pub async fn find(&self, tenant: &str, hex_id: &str) -> Option<Bytes> {
        let wg = BoundedWaitGroup::new(self.max_concurrent);
        let mut handles = Vec::with_capacity(self.endpoints.len());

        for endpoint in &self.endpoints {
            let guard = wg.add().await;
            let client = self.client.clone();
            let url = format!("{}/api/traces/{}", endpoint, hex_id);
            let tenant = tenant.to_string();

            handles.push(tokio::spawn(async move {
                let _guard = guard;
                fetch(&client, &url, &tenant).await
            }));
        }

        let mut largest: Option<Bytes> = None;
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(Some(body)) => {
                    if largest.as_ref().map_or(true, |l| body.len() > l.len()) {
                        largest = Some(body);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Federated request task failed"),
            }
        }
        largest
    }
}

async fn fetch(client: &reqwest::Client, url: &str, tenant: &str) -> Option<Bytes> {
    let response = match client
        .get(url)
        .header(ORG_ID_HEADER, tenant)
        .header(FEDERATED_HEADER, "true")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            metrics::record_federation_request("error");
            tracing::warn!(url = %url, error = %e, "Federated request failed");
            return None;
        }
    };

    match response.status() {
        StatusCode::OK => match response.bytes().await {
            Ok(body) => {
                metrics::record_federation_request("found");
                Some(body)
            }
            Err(e) => {
                metrics::record_federation_request("error");
                tracing::warn!(url = %url, error = %e, "Failed to read federated response");
                None
            }
        },
        StatusCode::NOT_FOUND => {
            metrics::record_federation_request("not_found");
            None
        }
        status => {
            metrics::record_federation_request("error");
            tracing::warn!(url = %url, status = %status, "Federated peer returned an error");
            None
        }
    }
}
