//! Datastore inventory.

use crate::error::{EsxiError, EsxiResult};
use crate::service::{CallOptions, EndpointRuntime};
use crate::types::*;

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

/// Properties fetched for every datastore snapshot.
pub const DATASTORE_ATTRIBUTES: &[&str] = &["summary.name", "summary.capacity", "summary.freeSpace"];

/// Datastore operations on one endpoint.
pub struct StorageManager<'a> {
    rt: &'a Arc<EndpointRuntime>,
}

impl<'a> StorageManager<'a> {
    pub(crate) fn new(rt: &'a Arc<EndpointRuntime>) -> Self {
        Self { rt }
    }

    // ── Datastores ──────────────────────────────────────────────────

    /// References of the datastores mounted on `host`.
    pub async fn datastore_refs(&self, host: &ObjectRef, opts: &CallOptions) -> EsxiResult<Vec<ObjectRef>> {
        self.rt
            .call("ListDatastores", opts, |api, session| {
                let host = host.clone();
                async move {
                    api.list_children(session.token(), &host, &ObjectKind::Datastore)
                        .await
                }
            })
            .await
    }

    /// Details of one datastore.
    pub async fn info(&self, datastore: &ObjectRef, opts: &CallOptions) -> EsxiResult<DatastoreInfo> {
        let read = self.rt.read_object(datastore, DATASTORE_ATTRIBUTES, opts).await?;
        datastore_info(&read.object)
    }

    /// Fetch `refs` one at a time as the stream is polled. A datastore that
    /// cannot be fetched becomes an `Err` item; the stream carries on.
    pub fn stream(&self, refs: Vec<ObjectRef>, opts: CallOptions) -> BoxStream<'static, DatastoreItem> {
        let rt = Arc::clone(self.rt);
        stream::iter(refs)
            .then(move |reference| {
                let rt = rt.clone();
                let opts = opts.clone();
                async move {
                    let result = StorageManager::new(&rt).info(&reference, &opts).await;
                    if let Err(e) = &result {
                        log::warn!("Datastore {} unavailable: {}", reference, e);
                    }
                    DatastoreItem { reference, result }
                }
            })
            .boxed()
    }
}

/// Build a [`DatastoreInfo`] from a datastore snapshot.
pub fn datastore_info(obj: &InventoryObject) -> EsxiResult<DatastoreInfo> {
    let name = obj
        .text("summary.name")
        .ok_or_else(|| EsxiError::protocol(format!("{} has no name", obj.reference)))?;
    Ok(DatastoreInfo {
        reference: obj.reference.clone(),
        name: name.to_string(),
        capacity_bytes: byte_count(obj, "summary.capacity")?,
        free_bytes: byte_count(obj, "summary.freeSpace")?,
    })
}

fn byte_count(obj: &InventoryObject, attribute: &str) -> EsxiResult<u64> {
    let raw = obj
        .integer(attribute)
        .ok_or_else(|| EsxiError::protocol(format!("{} has no {attribute}", obj.reference)))?;
    u64::try_from(raw)
        .map_err(|_| EsxiError::protocol(format!("{} reports negative {attribute}: {raw}", obj.reference)))
}
