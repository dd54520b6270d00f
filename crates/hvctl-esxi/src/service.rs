//! Aggregate service façade for the ESXi crate.
//!
//! `InventoryService` owns one [`EndpointRuntime`] per registered endpoint
//! (session manager, inventory cache, status translator, VM name registry)
//! and exposes every domain operation. Every remote call goes through
//! [`EndpointRuntime::call`], which applies the caller's timeout and the
//! retry policy.

use crate::api::ManagementApi;
use crate::cache::{CachePolicy, CacheRead, InventoryCache};
use crate::config::{RetryPolicy, ServiceConfig, VmLimits};
use crate::error::{EsxiError, EsxiResult};
use crate::host::HostManager;
use crate::session::{Session, SessionManager};
use crate::status::StatusTranslator;
use crate::storage::StorageManager;
use crate::types::*;
use crate::vim::VimClient;
use crate::vm::{NameRegistry, VmManager};

use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Per-call options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOptions {
    /// Bound on each remote call (and each login attempt)
    pub timeout: Duration,
    pub cache: CachePolicy,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            cache: CachePolicy::Fresh,
        }
    }
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Accept an expired snapshot when the refresh fails, provided it is
    /// not older than `max_age`.
    pub fn allow_stale(mut self, max_age: Option<Duration>) -> Self {
        self.cache = CachePolicy::StaleAllowed { max_age };
        self
    }
}

// ── Endpoint runtime ────────────────────────────────────────────────

/// Everything the façade keeps for one endpoint.
pub struct EndpointRuntime {
    endpoint: Endpoint,
    label: String,
    sessions: SessionManager,
    cache: InventoryCache,
    translator: StatusTranslator,
    names: NameRegistry,
    retry: RetryPolicy,
    vm_limits: VmLimits,
    default_host: Mutex<Option<ObjectRef>>,
}

impl EndpointRuntime {
    fn new(endpoint: Endpoint, api: Arc<dyn ManagementApi>, config: &ServiceConfig) -> Self {
        let label = endpoint.id().to_string();
        Self {
            sessions: SessionManager::new(
                api,
                label.clone(),
                config.retry.clone(),
                config.max_consecutive_failures,
            ),
            cache: InventoryCache::new(config.cache_ttl()),
            translator: StatusTranslator::new(),
            names: NameRegistry::new(),
            retry: config.retry.clone(),
            vm_limits: config.vm_limits.clone(),
            default_host: Mutex::new(None),
            endpoint,
            label,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn cache(&self) -> &InventoryCache {
        &self.cache
    }

    pub fn translator(&self) -> &StatusTranslator {
        &self.translator
    }

    pub(crate) fn names(&self) -> &NameRegistry {
        &self.names
    }

    pub(crate) fn vm_limits(&self) -> &VmLimits {
        &self.vm_limits
    }

    pub(crate) fn default_host(&self) -> Option<ObjectRef> {
        self.default_host.lock().clone()
    }

    pub(crate) fn set_default_host(&self, host: ObjectRef) {
        *self.default_host.lock() = Some(host);
    }

    /// Run `op` on the endpoint's session.
    ///
    /// A failed `acquire` is returned as is (the session manager already
    /// retried the login). Connection-class and resource-exhausted errors
    /// from `op` are retried with backoff; a timed-out call leaves its
    /// session suspect so the retry reconnects.
    pub(crate) async fn call<T, F, Fut>(&self, what: &str, opts: &CallOptions, op: F) -> EsxiResult<T>
    where
        F: Fn(Arc<dyn ManagementApi>, Arc<Session>) -> Fut,
        Fut: Future<Output = EsxiResult<T>>,
    {
        self.call_with(what, opts, EsxiError::is_retryable, op).await
    }

    /// Like [`Self::call`], but only errors accepted by `retry_if` are
    /// retried. Failures still go through `record_failure`.
    pub(crate) async fn call_with<T, F, Fut>(
        &self,
        what: &str,
        opts: &CallOptions,
        retry_if: fn(&EsxiError) -> bool,
        op: F,
    ) -> EsxiResult<T>
    where
        F: Fn(Arc<dyn ManagementApi>, Arc<Session>) -> Fut,
        Fut: Future<Output = EsxiResult<T>>,
    {
        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            let session = self.sessions.acquire(opts.timeout).await?;
            let pending = op(self.sessions.api().clone(), session.clone());
            let result = match tokio::time::timeout(opts.timeout, pending).await {
                Ok(r) => r,
                Err(_) => Err(EsxiError::timeout(format!(
                    "{what} on {} timed out after {:?}",
                    self.label, opts.timeout
                ))),
            };

            match result {
                Ok(value) => {
                    self.sessions.release(session);
                    return Ok(value);
                }
                Err(e) => {
                    self.sessions.record_failure(&session, &e);
                    if !retry_if(&e) || attempt + 1 >= attempts {
                        return Err(e);
                    }
                    let delay = self.retry.backoff(attempt);
                    log::warn!(
                        "{} on {} failed (attempt {}/{}): {} - retrying in {}ms",
                        what,
                        self.label,
                        attempt + 1,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Read `reference` through the cache, fetching `attributes` on a miss.
    pub(crate) async fn read_object(
        self: &Arc<Self>,
        reference: &ObjectRef,
        attributes: &[&str],
        opts: &CallOptions,
    ) -> EsxiResult<CacheRead> {
        let attributes: Vec<String> = attributes.iter().map(|a| a.to_string()).collect();
        let rt = Arc::clone(self);
        let key = reference.clone();
        let wanted = attributes.clone();
        let fetch_opts = opts.clone();
        self.cache
            .get(reference, &attributes, opts.cache, move || {
                rt.fetch_properties(key, wanted, fetch_opts)
            })
            .await
    }

    async fn fetch_properties(
        self: Arc<Self>,
        reference: ObjectRef,
        attributes: Vec<String>,
        opts: CallOptions,
    ) -> EsxiResult<PropertyMap> {
        log::debug!("Fetching {} from {}", reference, self.label);
        self.call("RetrieveProperties", &opts, |api, session| {
            let reference = reference.clone();
            let attributes = attributes.clone();
            async move {
                api.retrieve_properties(session.token(), &reference, &attributes)
                    .await
            }
        })
        .await
    }
}

// ── Service ─────────────────────────────────────────────────────────

/// Top-level service over every registered endpoint.
pub struct InventoryService {
    config: ServiceConfig,
    endpoints: RwLock<HashMap<EndpointId, Arc<EndpointRuntime>>>,
}

impl Default for InventoryService {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

impl InventoryService {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Call options using the configured request timeout.
    pub fn default_options(&self) -> CallOptions {
        CallOptions::with_timeout(self.config.request_timeout())
    }

    fn runtime(&self, id: &EndpointId) -> EsxiResult<Arc<EndpointRuntime>> {
        self.endpoints
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EsxiError::not_found(format!("Endpoint {id} is not registered")))
    }

    // ── Endpoints ───────────────────────────────────────────────────

    /// Register `endpoint`, reached through `api`. No connection is made
    /// until the first call.
    pub fn add_endpoint(&self, endpoint: Endpoint, api: Arc<dyn ManagementApi>) -> EsxiResult<EndpointId> {
        let id = endpoint.id();
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&id) {
            return Err(EsxiError::validation(format!("Endpoint {id} is already registered")));
        }
        log::info!("Registered endpoint {} as {}", id, endpoint.username());
        endpoints.insert(id.clone(), Arc::new(EndpointRuntime::new(endpoint, api, &self.config)));
        Ok(id)
    }

    /// Register `endpoint` with the vim25 SOAP transport.
    pub fn add_vim_endpoint(&self, endpoint: Endpoint) -> EsxiResult<EndpointId> {
        let api = Arc::new(VimClient::new(&endpoint)?);
        self.add_endpoint(endpoint, api)
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self.endpoints.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn session_state(&self, id: &EndpointId) -> EsxiResult<SessionState> {
        Ok(self.runtime(id)?.sessions().state())
    }

    /// Probe the endpoint's session; `false` when there is none or the
    /// endpoint rejected it.
    pub async fn check_session(&self, id: &EndpointId, opts: &CallOptions) -> EsxiResult<bool> {
        let rt = self.runtime(id)?;
        Ok(rt.sessions().check_alive(opts.timeout).await)
    }

    /// Forget cached inventory, the default host and created VM names.
    pub fn invalidate_endpoint(&self, id: &EndpointId) -> EsxiResult<()> {
        let rt = self.runtime(id)?;
        rt.cache().invalidate_all();
        rt.names().clear_created();
        *rt.default_host.lock() = None;
        log::debug!("Invalidated inventory of {}", id);
        Ok(())
    }

    // ── Host operations ─────────────────────────────────────────────

    pub async fn get_host_info(&self, id: &EndpointId, opts: &CallOptions) -> EsxiResult<HostInfo> {
        let rt = self.runtime(id)?;
        let hosts = HostManager::new(&rt);
        let host = hosts.default_host(opts).await?;
        hosts.info(&host, opts).await
    }

    /// Like [`Self::get_host_info`], bypassing any cached snapshot.
    pub async fn refresh_host(&self, id: &EndpointId, opts: &CallOptions) -> EsxiResult<HostInfo> {
        let rt = self.runtime(id)?;
        let hosts = HostManager::new(&rt);
        let host = hosts.default_host(opts).await?;
        hosts.refresh(&host, opts).await
    }

    // ── Datastore operations ────────────────────────────────────────

    /// Datastores of `host` (the default host when `None`), fetched lazily
    /// one per polled item.
    pub async fn list_datastores(
        &self,
        id: &EndpointId,
        host: Option<&ObjectRef>,
        opts: &CallOptions,
    ) -> EsxiResult<BoxStream<'static, DatastoreItem>> {
        let rt = self.runtime(id)?;
        let host = HostManager::new(&rt).resolve(host, opts).await?;
        let storage = StorageManager::new(&rt);
        let refs = storage.datastore_refs(&host, opts).await?;
        log::debug!("{} has {} datastores", host, refs.len());
        Ok(storage.stream(refs, opts.clone()))
    }

    /// Drain [`Self::list_datastores`] into successes and failures.
    pub async fn collect_datastores(
        &self,
        id: &EndpointId,
        host: Option<&ObjectRef>,
        opts: &CallOptions,
    ) -> EsxiResult<DatastoreListing> {
        let mut items = self.list_datastores(id, host, opts).await?;
        let mut listing = DatastoreListing::default();
        while let Some(item) = items.next().await {
            match item.result {
                Ok(info) => listing.datastores.push(info),
                Err(e) => listing.failures.push((item.reference, e)),
            }
        }
        Ok(listing)
    }

    // ── VM operations ───────────────────────────────────────────────

    pub async fn create_vm(
        &self,
        id: &EndpointId,
        spec: &VmCreateSpec,
        opts: &CallOptions,
    ) -> EsxiResult<VmHandle> {
        let rt = self.runtime(id)?;
        VmManager::new(&rt).create(spec, opts).await
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Log out of every endpoint and drop all runtimes.
    pub async fn shutdown(&self) {
        let runtimes: Vec<Arc<EndpointRuntime>> = self.endpoints.write().drain().map(|(_, rt)| rt).collect();
        let timeout = self.config.request_timeout();
        futures::future::join_all(runtimes.iter().map(|rt| rt.sessions().close(timeout))).await;
        log::info!("Shut down {} endpoint(s)", runtimes.len());
    }
}
