//! In-memory `ManagementApi` modelled on a standalone ESXi host.

use async_trait::async_trait;
use hvctl_esxi::api::ManagementApi;
use hvctl_esxi::error::{EsxiError, EsxiResult};
use hvctl_esxi::types::*;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const GIB: i64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginBehavior {
    Accept,
    Unreachable,
    Deny,
}

/// How `create_vm` treats the first request it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateBehavior {
    Complete,
    /// The VM is created, then the reply stalls for the delay.
    ReplyLost(Duration),
    /// The request stalls for the delay before the VM is created.
    RequestLost(Duration),
    /// The request is refused with `ResourceExhausted`.
    BusyOnce,
}

pub struct FakeEsxi {
    login: LoginBehavior,
    create: CreateBehavior,
    hosts: Vec<ObjectRef>,
    datastores: Vec<ObjectRef>,
    properties: HashMap<ObjectRef, PropertyMap>,
    broken: HashSet<ObjectRef>,
    fetch_delay: Duration,
    offline: AtomicBool,
    logins: AtomicUsize,
    logouts: AtomicUsize,
    fetches: Mutex<HashMap<ObjectRef, usize>>,
    completed_fetches: AtomicUsize,
    vms: Mutex<Vec<(ObjectRef, String)>>,
    create_calls: AtomicUsize,
    created: Mutex<Vec<VmCreateSpec>>,
}

fn text(v: &str) -> AttributeValue {
    AttributeValue::Text(v.to_string())
}

impl FakeEsxi {
    /// One host, `esx01.lab`, with three datastores.
    pub fn standalone() -> Self {
        let host = ObjectRef::host("ha-host");
        let datastores: Vec<ObjectRef> = (1..=3)
            .map(|n| ObjectRef::datastore(format!("ds-{n}")))
            .collect();

        let mut properties = HashMap::new();
        let mut host_props = PropertyMap::new();
        host_props.insert("name".into(), text("esx01.lab"));
        host_props.insert("summary.overallStatus".into(), text("green"));
        host_props.insert("summary.runtime.powerState".into(), text("poweredOn"));
        host_props.insert("summary.hardware.cpuMhz".into(), AttributeValue::Integer(2394));
        host_props.insert("summary.hardware.memorySize".into(), AttributeValue::Integer(64 * GIB));
        host_props.insert("datastore".into(), AttributeValue::References(datastores.clone()));
        properties.insert(host.clone(), host_props);

        for (i, ds) in datastores.iter().enumerate() {
            let n = i as i64 + 1;
            let mut p = PropertyMap::new();
            p.insert("summary.name".into(), text(&format!("datastore{n}")));
            p.insert("summary.capacity".into(), AttributeValue::Integer(100 * n * GIB));
            p.insert("summary.freeSpace".into(), AttributeValue::Integer(40 * n * GIB));
            properties.insert(ds.clone(), p);
        }

        Self {
            login: LoginBehavior::Accept,
            create: CreateBehavior::Complete,
            hosts: vec![host],
            datastores,
            properties,
            broken: HashSet::new(),
            fetch_delay: Duration::ZERO,
            offline: AtomicBool::new(false),
            logins: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            fetches: Mutex::new(HashMap::new()),
            completed_fetches: AtomicUsize::new(0),
            vms: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn with_login(mut self, login: LoginBehavior) -> Self {
        self.login = login;
        self
    }

    pub fn with_create(mut self, create: CreateBehavior) -> Self {
        self.create = create;
        self
    }

    /// A VM named `name` that already exists on the host.
    pub fn with_vm(mut self, name: &str) -> Self {
        let vms = self.vms.get_mut();
        let reference = ObjectRef::vm(format!("{}", vms.len() + 1));
        vms.push((reference, name.to_string()));
        self
    }

    pub fn without_hosts(mut self) -> Self {
        self.hosts.clear();
        self
    }

    /// Property retrieval for `datastore` fails with `NotFound`.
    pub fn with_broken_datastore(mut self, value: &str) -> Self {
        self.broken.insert(ObjectRef::datastore(value));
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Make every property retrieval fail with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn fetches(&self, reference: &ObjectRef) -> usize {
        self.fetches.lock().get(reference).copied().unwrap_or(0)
    }

    /// Property retrievals that ran to completion.
    pub fn completed_fetches(&self) -> usize {
        self.completed_fetches.load(Ordering::SeqCst)
    }

    /// CreateVM requests received, successful or not.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> Vec<VmCreateSpec> {
        self.created.lock().clone()
    }

    fn add_vm(&self, name: &str) -> EsxiResult<ObjectRef> {
        let mut vms = self.vms.lock();
        if vms.iter().any(|(_, n)| n == name) {
            return Err(EsxiError::validation(format!(
                "DuplicateName: The name '{name}' already exists."
            )));
        }
        let reference = ObjectRef::vm(format!("{}", vms.len() + 1));
        vms.push((reference.clone(), name.to_string()));
        Ok(reference)
    }

    fn vm_properties(&self, reference: &ObjectRef, attributes: &[String]) -> EsxiResult<PropertyMap> {
        let vms = self.vms.lock();
        let (_, name) = vms
            .iter()
            .find(|(r, _)| r == reference)
            .ok_or_else(|| EsxiError::not_found(format!("No object {reference}")))?;
        let mut props = PropertyMap::new();
        if attributes.iter().any(|a| a == "name") {
            props.insert("name".into(), text(name));
        }
        Ok(props)
    }
}

#[async_trait]
impl ManagementApi for FakeEsxi {
    async fn login(&self) -> EsxiResult<SessionToken> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        match self.login {
            LoginBehavior::Accept => Ok(SessionToken {
                cookie: format!("vmware_soap_session=\"session-{n}\""),
                key: Some(format!("52{n:04}")),
            }),
            LoginBehavior::Unreachable => Err(EsxiError::connection("Connection refused (os error 111)")),
            LoginBehavior::Deny => Err(EsxiError::auth(
                "Cannot complete login due to an incorrect user name or password.",
            )),
        }
    }

    async fn logout(&self, _token: &SessionToken) -> EsxiResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_session(&self, _token: &SessionToken) -> EsxiResult<bool> {
        Ok(!self.offline.load(Ordering::SeqCst))
    }

    async fn list_hosts(&self, _token: &SessionToken) -> EsxiResult<Vec<ObjectRef>> {
        Ok(self.hosts.clone())
    }

    async fn retrieve_properties(
        &self,
        _token: &SessionToken,
        reference: &ObjectRef,
        attributes: &[String],
    ) -> EsxiResult<PropertyMap> {
        *self.fetches.lock().entry(reference.clone()).or_default() += 1;
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        self.completed_fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(EsxiError::connection("Connection reset by peer"));
        }
        if self.broken.contains(reference) {
            return Err(EsxiError::not_found(format!("The object '{reference}' has already been deleted")));
        }
        if reference.kind == ObjectKind::Vm {
            return self.vm_properties(reference, attributes);
        }
        let all = self
            .properties
            .get(reference)
            .ok_or_else(|| EsxiError::not_found(format!("No object {reference}")))?;
        Ok(all
            .iter()
            .filter(|(k, _)| attributes.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn list_children(
        &self,
        _token: &SessionToken,
        parent: &ObjectRef,
        kind: &ObjectKind,
    ) -> EsxiResult<Vec<ObjectRef>> {
        if !self.hosts.contains(parent) {
            return Err(EsxiError::not_found(format!("No object {parent}")));
        }
        match kind {
            ObjectKind::Datastore => Ok(self.datastores.clone()),
            ObjectKind::Vm => Ok(self.vms.lock().iter().map(|(r, _)| r.clone()).collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn create_vm(&self, _token: &SessionToken, spec: &VmCreateSpec) -> EsxiResult<ObjectRef> {
        let first = self.create_calls.fetch_add(1, Ordering::SeqCst) == 0;
        match self.create {
            CreateBehavior::RequestLost(delay) if first => tokio::time::sleep(delay).await,
            CreateBehavior::BusyOnce if first => {
                return Err(EsxiError::exhausted("Too many outstanding operations"));
            }
            _ => {}
        }

        let reference = self.add_vm(&spec.name)?;
        self.created.lock().push(spec.clone());

        if let CreateBehavior::ReplyLost(delay) = self.create {
            if first {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(reference)
    }
}

pub fn endpoint() -> Endpoint {
    Endpoint::new("esx01.lab", "root", SecretString::new("hunter2".into())).with_insecure(true)
}

pub fn vm_spec(name: &str) -> VmCreateSpec {
    VmCreateSpec {
        name: name.to_string(),
        host: None,
        cpu_count: 2,
        memory_mib: 4096,
        datastore: "datastore1".to_string(),
        guest_id: "otherGuest64".to_string(),
    }
}
