//! ESXi host inventory: default-host resolution and host snapshots.

use crate::cache::CacheRead;
use crate::error::{EsxiError, EsxiResult};
use crate::service::{CallOptions, EndpointRuntime};
use crate::status::StatusTranslator;
use crate::types::*;

use std::sync::Arc;

/// Properties fetched for every host snapshot.
pub const HOST_ATTRIBUTES: &[&str] = &[
    "name",
    "summary.overallStatus",
    "summary.runtime.powerState",
    "summary.hardware.cpuMhz",
    "summary.hardware.memorySize",
    "datastore",
];

/// Host operations on one endpoint.
pub struct HostManager<'a> {
    rt: &'a Arc<EndpointRuntime>,
}

impl<'a> HostManager<'a> {
    pub(crate) fn new(rt: &'a Arc<EndpointRuntime>) -> Self {
        Self { rt }
    }

    // ── Resolve ─────────────────────────────────────────────────────

    /// The endpoint's first host. Looked up once, then remembered until the
    /// endpoint is invalidated.
    pub async fn default_host(&self, opts: &CallOptions) -> EsxiResult<ObjectRef> {
        if let Some(host) = self.rt.default_host() {
            return Ok(host);
        }

        let hosts = self
            .rt
            .call("ListHosts", opts, |api, session| async move {
                api.list_hosts(session.token()).await
            })
            .await?;
        let host = hosts
            .into_iter()
            .next()
            .ok_or_else(|| EsxiError::not_found(format!("{} exposes no host", self.rt.label())))?;

        log::debug!("Default host of {} is {}", self.rt.label(), host);
        self.rt.set_default_host(host.clone());
        Ok(host)
    }

    /// `host` if given, otherwise the default host.
    pub async fn resolve(&self, host: Option<&ObjectRef>, opts: &CallOptions) -> EsxiResult<ObjectRef> {
        match host {
            Some(h) if h.kind == ObjectKind::Host => Ok(h.clone()),
            Some(h) => Err(EsxiError::validation(format!("{h} is not a host"))),
            None => self.default_host(opts).await,
        }
    }

    // ── Info ────────────────────────────────────────────────────────

    pub async fn info(&self, host: &ObjectRef, opts: &CallOptions) -> EsxiResult<HostInfo> {
        let read = self.rt.read_object(host, HOST_ATTRIBUTES, opts).await?;
        host_info(&read, self.rt.translator())
    }

    /// Drop the cached snapshot and fetch it again.
    pub async fn refresh(&self, host: &ObjectRef, opts: &CallOptions) -> EsxiResult<HostInfo> {
        self.rt.cache().invalidate(host);
        self.info(host, opts).await
    }
}

/// Build a [`HostInfo`] from a host snapshot.
///
/// Status strings go through `translator`; absent numeric properties read
/// as zero (a disconnected host reports no hardware summary).
pub fn host_info(read: &CacheRead, translator: &StatusTranslator) -> EsxiResult<HostInfo> {
    let obj = &read.object;
    let name = obj
        .text("name")
        .ok_or_else(|| EsxiError::protocol(format!("{} has no name", obj.reference)))?;

    Ok(HostInfo {
        reference: obj.reference.clone(),
        name: name.to_string(),
        overall_status: obj
            .text("summary.overallStatus")
            .map(|s| translator.overall(s))
            .unwrap_or_default(),
        power_state: obj
            .text("summary.runtime.powerState")
            .map(|s| translator.power(s))
            .unwrap_or_default(),
        cpu_mhz: obj
            .integer("summary.hardware.cpuMhz")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        memory_bytes: obj
            .integer("summary.hardware.memorySize")
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0),
        datastore_refs: obj.references("datastore").to_vec(),
        stale: read.stale,
    })
}
