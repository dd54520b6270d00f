//! VM creation.
//!
//! Everything that can be checked locally is checked before the first
//! remote call: name syntax, CPU and memory limits, and that the name is
//! not already known from the cached inventory or claimed by another
//! in-process create. The host's VMs are then listed by name before the
//! create request is sent.

use crate::cache::CachePolicy;
use crate::config::VmLimits;
use crate::error::{EsxiError, EsxiErrorKind, EsxiResult};
use crate::host::HostManager;
use crate::service::{CallOptions, EndpointRuntime};
use crate::types::*;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Longest display name vSphere accepts.
pub const MAX_VM_NAME_LEN: usize = 80;

/// ESXi sizes guest memory in 4 MiB units.
const MEMORY_GRANULE_MIB: u64 = 4;

const FORBIDDEN_NAME_CHARS: &[char] = &['/', '\\', '%', '*', '?', '"', '<', '>', '|'];

// ── Validation ──────────────────────────────────────────────────────

pub fn validate_name(name: &str) -> EsxiResult<()> {
    if name.trim().is_empty() {
        return Err(EsxiError::validation("VM name must not be empty"));
    }
    if name.trim() != name {
        return Err(EsxiError::validation(format!(
            "VM name '{name}' has leading or trailing whitespace"
        )));
    }
    if name.chars().count() > MAX_VM_NAME_LEN {
        return Err(EsxiError::validation(format!(
            "VM name is longer than {MAX_VM_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_control() || FORBIDDEN_NAME_CHARS.contains(c))
    {
        return Err(EsxiError::validation(format!(
            "VM name '{}' contains forbidden character {:?}",
            name.escape_debug(),
            c
        )));
    }
    Ok(())
}

/// Check a create spec against local limits.
pub fn validate_spec(spec: &VmCreateSpec, limits: &VmLimits) -> EsxiResult<()> {
    validate_name(&spec.name)?;

    if spec.cpu_count == 0 || spec.cpu_count > limits.max_cpu_count {
        return Err(EsxiError::validation(format!(
            "CPU count {} outside 1..={}",
            spec.cpu_count, limits.max_cpu_count
        )));
    }
    if spec.memory_mib < MEMORY_GRANULE_MIB || spec.memory_mib > limits.max_memory_mib {
        return Err(EsxiError::validation(format!(
            "Memory {} MiB outside {}..={} MiB",
            spec.memory_mib, MEMORY_GRANULE_MIB, limits.max_memory_mib
        )));
    }
    if spec.memory_mib % MEMORY_GRANULE_MIB != 0 {
        return Err(EsxiError::validation(format!(
            "Memory {} MiB is not a multiple of {MEMORY_GRANULE_MIB} MiB",
            spec.memory_mib
        )));
    }
    if spec.datastore.trim().is_empty() {
        return Err(EsxiError::validation("Datastore name must not be empty"));
    }
    if spec.guest_id.trim().is_empty() {
        return Err(EsxiError::validation("Guest id must not be empty"));
    }
    Ok(())
}

// ── Name registry ───────────────────────────────────────────────────

/// VM names claimed by creates in progress, plus names this process has
/// already created.
#[derive(Debug, Default)]
pub struct NameRegistry {
    inner: Mutex<NameSets>,
}

#[derive(Debug, Default)]
struct NameSets {
    pending: HashSet<String>,
    created: HashSet<String>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for the duration of a create. Fails when the name is
    /// already claimed or was created earlier.
    pub fn reserve(&self, name: &str) -> EsxiResult<NameReservation<'_>> {
        let mut sets = self.inner.lock();
        if sets.created.contains(name) {
            return Err(EsxiError::validation(format!("A VM named '{name}' already exists")));
        }
        if !sets.pending.insert(name.to_string()) {
            return Err(EsxiError::validation(format!(
                "A VM named '{name}' is already being created"
            )));
        }
        Ok(NameReservation {
            registry: self,
            name: name.to_string(),
            created: false,
        })
    }

    pub fn is_taken(&self, name: &str) -> bool {
        let sets = self.inner.lock();
        sets.pending.contains(name) || sets.created.contains(name)
    }

    /// Forget created names (their VMs may have been removed remotely).
    pub fn clear_created(&self) {
        self.inner.lock().created.clear();
    }
}

/// Held while a create is running; released on drop.
#[derive(Debug)]
pub struct NameReservation<'a> {
    registry: &'a NameRegistry,
    name: String,
    created: bool,
}

impl NameReservation<'_> {
    /// The VM exists now; keep the name taken after release.
    pub fn commit(mut self) {
        self.created = true;
    }
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        let mut sets = self.registry.inner.lock();
        sets.pending.remove(&self.name);
        if self.created {
            sets.created.insert(std::mem::take(&mut self.name));
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Properties fetched for every VM snapshot.
pub const VM_ATTRIBUTES: &[&str] = &["name"];

/// CreateVM is not idempotent: once the request may have reached the
/// endpoint only an explicit refusal is safe to resend.
fn create_is_retryable(err: &EsxiError) -> bool {
    err.kind == EsxiErrorKind::ResourceExhausted
}

/// VM operations on one endpoint.
pub struct VmManager<'a> {
    rt: &'a Arc<EndpointRuntime>,
}

impl<'a> VmManager<'a> {
    pub(crate) fn new(rt: &'a Arc<EndpointRuntime>) -> Self {
        Self { rt }
    }

    /// Create a VM from `spec` and wait for the creation task.
    ///
    /// When the create fails with a connection-class error (including a
    /// timeout) the VM may exist anyway; the host is searched by name and
    /// a match is returned as the created VM.
    pub async fn create(&self, spec: &VmCreateSpec, opts: &CallOptions) -> EsxiResult<VmHandle> {
        validate_spec(spec, self.rt.vm_limits())?;
        self.ensure_name_unknown(&spec.name)?;
        let reservation = self.rt.names().reserve(&spec.name)?;

        let host = HostManager::new(self.rt)
            .resolve(spec.host.as_ref(), opts)
            .await?;
        let lookup = CallOptions {
            cache: CachePolicy::Fresh,
            ..opts.clone()
        };
        if let Some(existing) = self.find_by_name(&host, &spec.name, &lookup).await? {
            return Err(EsxiError::validation(format!(
                "A VM named '{}' already exists on {} ({})",
                spec.name, host, existing
            )));
        }

        let placed = VmCreateSpec {
            host: Some(host.clone()),
            ..spec.clone()
        };
        let outcome = self
            .rt
            .call_with("CreateVM", opts, create_is_retryable, |api, session| {
                let spec = placed.clone();
                async move { api.create_vm(session.token(), &spec).await }
            })
            .await;

        let reference = match outcome {
            Ok(reference) => reference,
            Err(e) if e.is_connection_failure() => {
                self.recover_created(&host, &spec.name, e, &lookup).await?
            }
            Err(e) => return Err(e),
        };
        reservation.commit();

        log::info!("Created VM '{}' ({}) on {}", spec.name, reference, self.rt.label());
        Ok(VmHandle {
            reference,
            name: spec.name.clone(),
        })
    }

    /// The VM named `name` on `host`, if any. VM names are read through the
    /// inventory cache; VMs removed between listing and reading are skipped.
    pub async fn find_by_name(
        &self,
        host: &ObjectRef,
        name: &str,
        opts: &CallOptions,
    ) -> EsxiResult<Option<ObjectRef>> {
        let vms = self
            .rt
            .call("ListVms", opts, |api, session| {
                let host = host.clone();
                async move { api.list_children(session.token(), &host, &ObjectKind::Vm).await }
            })
            .await?;

        for vm in vms {
            match self.rt.read_object(&vm, VM_ATTRIBUTES, opts).await {
                Ok(read) if read.object.text("name") == Some(name) => return Ok(Some(vm)),
                Ok(_) => {}
                Err(e) if e.kind == EsxiErrorKind::NotFound => {
                    log::debug!("{} vanished while listing VMs: {}", vm, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// After a create whose outcome is unknown, look for the VM by name.
    async fn recover_created(
        &self,
        host: &ObjectRef,
        name: &str,
        cause: EsxiError,
        opts: &CallOptions,
    ) -> EsxiResult<ObjectRef> {
        log::warn!(
            "CreateVM '{}' on {} failed ({}), checking whether the VM exists",
            name,
            self.rt.label(),
            cause
        );
        match self.find_by_name(host, name, opts).await {
            Ok(Some(reference)) => {
                log::info!("VM '{}' was created despite the failed reply", name);
                Ok(reference)
            }
            Ok(None) => Err(EsxiError::connection(format!(
                "CreateVM '{name}' failed and no such VM exists on {host}: {}",
                cause.message
            ))),
            Err(e) => Err(EsxiError::connection(format!(
                "CreateVM '{name}' failed ({}) and the VM lookup failed too: {}",
                cause.message, e.message
            ))),
        }
    }

    fn ensure_name_unknown(&self, name: &str) -> EsxiResult<()> {
        let cached = self
            .rt
            .cache()
            .objects_of_kind(&ObjectKind::Vm)
            .iter()
            .any(|vm| vm.text("name") == Some(name));
        if cached {
            return Err(EsxiError::validation(format!("A VM named '{name}' already exists")));
        }
        Ok(())
    }
}
