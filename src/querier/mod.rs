//! Trace lookups
//!
//! A lookup checks the ingester's live blocks, then the backend blocks through
//! the store, and optionally federated peers. The largest result wins.

use crate::block::{combine_objects, unwrap_object, BlockError};
use crate::encoding::id::id_to_hex;
use crate::ingester::{IngestError, Ingester};
use crate::store::{Store, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

mod federated;

pub use federated::{FederatedQuerier, FEDERATED_HEADER, ORG_ID_HEADER};

/// Query errors
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Ingester error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Block error: {0}")]
    Block(#[from] BlockError),

    #[error("Federation error: {0}")]
    Federation(String),
}

pub type Result<T> = std::result::Result<T, QueryError>;

pub struct Querier {
    ingester: Arc<Ingester>,
    store: Arc<Store>,
    federation: Option<FederatedQuerier>,
}

impl Querier {
    pub fn new(
        ingester: Arc<Ingester>,
        store: Arc<Store>,
        federation: Option<FederatedQuerier>,
    ) -> Self {
        Self {
            ingester,
            store,
            federation,
        }
    }

    /// Trace payload for a padded `id`.
    ///
    /// With `federate` set and peers configured, peers are asked as well.
    #[tracing::instrument(name = "querier.find_trace", skip(self, id), fields(trace_id = %id_to_hex(id)), err)]
    pub async fn find_trace_by_id(
        &self,
        tenant: &str,
        id: &[u8],
        federate: bool,
    ) -> Result<Option<Bytes>> {
        let live = self.ingester.find(tenant, id)?;
        let stored = self.store.find(tenant, id).await?;

        let combined = match (live, stored) {
            (Some(a), Some(b)) => Some(combine_objects(&a, &b)?),
            (a, b) => a.or(b),
        };
        let local = match combined {
            Some(object) => Some(Bytes::copy_from_slice(unwrap_object(&object)?.2)),
            None => None,
        };

        let Some(federation) = self.federation.as_ref().filter(|_| federate) else {
            return Ok(local);
        };
        let remote = federation.find(tenant, &id_to_hex(id)).await;

        Ok(match (local, remote) {
            (Some(l), Some(r)) => Some(if r.len() > l.len() { r } else { l }),
            (l, r) => l.or(r),
        })
    }
}
