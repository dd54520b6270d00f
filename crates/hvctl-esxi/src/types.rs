//! Shared types for ESXi inventory and control.

use crate::error::{EsxiError, EsxiResult};
use crate::status::{OverallStatus, PowerState};

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single managed ESXi host / vCenter: address plus credential.
///
/// Immutable once built; the façade shares it behind an `Arc`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Hostname or IP (e.g. "10.10.174.151")
    address: String,
    /// Port (default 443)
    #[serde(default = "default_port")]
    port: u16,
    /// Username (e.g. "root")
    username: String,
    /// Password, redacted in `Debug`
    password: SecretString,
    /// Skip TLS certificate verification (self-signed ESXi installs)
    #[serde(default)]
    insecure: bool,
}

fn default_port() -> u16 { 443 }

impl Endpoint {
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            address: address.into(),
            port: default_port(),
            username: username.into(),
            password,
            insecure: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    pub fn insecure(&self) -> bool {
        self.insecure
    }

    /// Stable key used by the façade to look the endpoint up.
    pub fn id(&self) -> EndpointId {
        EndpointId(format!("{}:{}", self.address, self.port))
    }

    /// The vim25 SDK URL, `https://{address}:{port}/sdk`.
    pub fn sdk_url(&self) -> EsxiResult<url::Url> {
        if self.address.trim().is_empty() {
            return Err(EsxiError::validation("Endpoint address is empty"));
        }
        let raw = format!("https://{}:{}/sdk", self.address, self.port);
        url::Url::parse(&raw)
            .map_err(|e| EsxiError::validation(format!("Invalid endpoint address '{}': {e}", self.address)))
    }
}

/// Key of a registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Object references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Managed-object type of a remote reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    Host,
    Datastore,
    Vm,
    Datacenter,
    Folder,
    ComputeResource,
    ResourcePool,
    Task,
    /// Any other vim type, kept verbatim
    Other(String),
}

impl ObjectKind {
    /// vim25 managed-object type name.
    pub fn vim_type(&self) -> &str {
        match self {
            Self::Host => "HostSystem",
            Self::Datastore => "Datastore",
            Self::Vm => "VirtualMachine",
            Self::Datacenter => "Datacenter",
            Self::Folder => "Folder",
            Self::ComputeResource => "ComputeResource",
            Self::ResourcePool => "ResourcePool",
            Self::Task => "Task",
            Self::Other(t) => t,
        }
    }

    pub fn from_vim_type(vim_type: &str) -> Self {
        match vim_type {
            "HostSystem" => Self::Host,
            "Datastore" => Self::Datastore,
            "VirtualMachine" => Self::Vm,
            "Datacenter" => Self::Datacenter,
            "Folder" => Self::Folder,
            "ComputeResource" => Self::ComputeResource,
            "ResourcePool" => Self::ResourcePool,
            "Task" => Self::Task,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Opaque remote identifier (vim25 `ManagedObjectReference`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub kind: ObjectKind,
    /// e.g. "ha-host", "datastore-12", "vm-42"
    pub value: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, value: impl Into<String>) -> Self {
        Self { kind, value: value.into() }
    }

    pub fn host(value: impl Into<String>) -> Self {
        Self::new(ObjectKind::Host, value)
    }

    pub fn datastore(value: impl Into<String>) -> Self {
        Self::new(ObjectKind::Datastore, value)
    }

    pub fn vm(value: impl Into<String>) -> Self {
        Self::new(ObjectKind::Vm, value)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.vim_type(), self.value)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Properties
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed value of a retrieved property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum AttributeValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Reference(ObjectRef),
    References(Vec<ObjectRef>),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ObjectRef> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// A single reference is returned as a one-element slice.
    pub fn as_references(&self) -> Option<&[ObjectRef]> {
        match self {
            Self::References(refs) => Some(refs),
            Self::Reference(r) => Some(std::slice::from_ref(r)),
            _ => None,
        }
    }
}

/// Property path → value, as returned by one property retrieval.
pub type PropertyMap = BTreeMap<String, AttributeValue>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Inventory snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable snapshot of a remote object's properties.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryObject {
    pub reference: ObjectRef,
    pub attributes: PropertyMap,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip)]
    fetched_instant: Instant,
}

impl InventoryObject {
    pub fn new(reference: ObjectRef, attributes: PropertyMap) -> Self {
        Self {
            reference,
            attributes,
            fetched_at: Utc::now(),
            fetched_instant: Instant::now(),
        }
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.reference.kind
    }

    /// Time since this snapshot was fetched (tokio clock, so paused-time
    /// tests see virtual time).
    pub fn age(&self) -> Duration {
        self.fetched_instant.elapsed()
    }

    pub fn has_attributes(&self, names: &[String]) -> bool {
        names.iter().all(|n| self.attributes.contains_key(n))
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::as_text)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttributeValue::as_i64)
    }

    pub fn references(&self, name: &str) -> &[ObjectRef] {
        self.get(name)
            .and_then(AttributeValue::as_references)
            .unwrap_or(&[])
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Host / Datastore value objects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub reference: ObjectRef,
    pub name: String,
    pub overall_status: OverallStatus,
    pub power_state: PowerState,
    pub cpu_mhz: u32,
    pub memory_bytes: u64,
    pub datastore_refs: Vec<ObjectRef>,
    /// Served from an expired snapshot because the refresh failed
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreInfo {
    pub reference: ObjectRef,
    pub name: String,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
}

impl DatastoreInfo {
    pub fn used_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.free_bytes)
    }
}

/// One element of a datastore listing: the datastore, or why it could
/// not be fetched.
#[derive(Debug, Clone)]
pub struct DatastoreItem {
    pub reference: ObjectRef,
    pub result: Result<DatastoreInfo, EsxiError>,
}

/// A fully drained datastore listing.
#[derive(Debug, Clone, Default)]
pub struct DatastoreListing {
    pub datastores: Vec<DatastoreInfo>,
    pub failures: Vec<(ObjectRef, EsxiError)>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VM creation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parameters for creating a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmCreateSpec {
    pub name: String,
    /// Target host; the endpoint's default host when `None`
    #[serde(default)]
    pub host: Option<ObjectRef>,
    pub cpu_count: u32,
    pub memory_mib: u64,
    /// Datastore name holding the VM files (e.g. "datastore1")
    pub datastore: String,
    /// Guest OS identifier (e.g. "otherGuest64")
    #[serde(default = "default_guest_id")]
    pub guest_id: String,
}

fn default_guest_id() -> String { "otherGuest64".to_string() }

/// Handle to a created VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmHandle {
    pub reference: ObjectRef,
    pub name: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of an endpoint's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
}

/// Credential material returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// `vmware_soap_session` cookie value (or an opaque token for other
    /// transports)
    pub cookie: String,
    /// Key of the remote `UserSession`, when reported
    pub key: Option<String>,
}
