//! vim25 SOAP client with cookie-based session authentication.
//!
//! Communicates with ESXi / vCenter via `https://{host}/sdk`. Implements
//! [`ManagementApi`] on top of RetrieveServiceContent, Login/Logout,
//! RetrievePropertiesEx, container views and CreateVM_Task.

use crate::api::ManagementApi;
use crate::error::{EsxiError, EsxiResult};
use crate::types::*;
use crate::xml::{self, XmlNode};

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use secrecy::ExposeSecret;
use std::time::Duration;
use tokio::sync::OnceCell;

const SOAP_ACTION: &str = "urn:vim25/7.0";
const SESSION_COOKIE: &str = "vmware_soap_session";

/// Managed objects every call is addressed to, from RetrieveServiceContent.
#[derive(Debug, Clone, PartialEq)]
struct ServiceContent {
    root_folder: ObjectRef,
    property_collector: ObjectRef,
    view_manager: ObjectRef,
    session_manager: ObjectRef,
}

/// A SOAP fault as returned in the response body.
#[derive(Debug, Clone, PartialEq)]
pub struct SoapFault {
    /// Fault type, e.g. "InvalidLogin" (no "Fault" suffix)
    pub fault_type: Option<String>,
    pub message: String,
}

impl SoapFault {
    fn is(&self, fault_type: &str) -> bool {
        self.fault_type.as_deref() == Some(fault_type)
    }

    /// Map a vim25 fault onto the crate error taxonomy.
    pub fn into_error(self) -> EsxiError {
        classify_fault(self.fault_type.as_deref().unwrap_or(""), &self.message)
    }
}

fn classify_fault(fault_type: &str, message: &str) -> EsxiError {
    let msg = format!("{fault_type}: {message}");
    match fault_type {
        "InvalidLogin" | "NoPermission" | "InvalidLocale" => EsxiError::auth(msg),
        "NotAuthenticated" => EsxiError::connection(format!("Session expired ({msg})")),
        "HostCommunication" | "HostNotConnected" | "HostNotReachable" => {
            EsxiError::connection(msg)
        }
        "ManagedObjectNotFound" => EsxiError::not_found(msg),
        "NoDiskSpace" | "NotEnoughLicenses" => EsxiError::exhausted(msg),
        t if t.starts_with("Insufficient") => EsxiError::exhausted(msg),
        "DuplicateName" | "InvalidName" | "InvalidArgument" | "InvalidDatastorePath"
        | "InvalidDatastore" | "FileAlreadyExists" => EsxiError::validation(msg),
        _ => EsxiError::protocol(msg),
    }
}

/// vim25 SOAP API client for one endpoint.
pub struct VimClient {
    http: Client,
    sdk_url: String,
    endpoint: Endpoint,
    content: OnceCell<ServiceContent>,
    task_poll_interval: Duration,
}

impl VimClient {
    /// Build a new client from an endpoint (does NOT log in yet).
    pub fn new(endpoint: &Endpoint) -> EsxiResult<Self> {
        let sdk_url = endpoint.sdk_url()?.to_string();
        let http = Client::builder()
            .danger_accept_invalid_certs(endpoint.insecure())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EsxiError::connection(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            sdk_url,
            endpoint: endpoint.clone(),
            content: OnceCell::new(),
            task_poll_interval: Duration::from_millis(500),
        })
    }

    pub fn with_task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }

    pub fn sdk_url(&self) -> &str {
        &self.sdk_url
    }

    // ── Transport ───────────────────────────────────────────────────

    /// POST one SOAP request. Returns the first element inside `Body` (or
    /// the fault), plus the `Set-Cookie` session pair if one was issued.
    async fn invoke_raw(
        &self,
        body: &str,
        cookie: Option<&str>,
    ) -> EsxiResult<(Result<XmlNode, SoapFault>, Option<String>)> {
        let mut req = self
            .http
            .post(&self.sdk_url)
            .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .body(envelope(body));
        if let Some(c) = cookie {
            req = req.header(header::COOKIE, c);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let session_cookie = resp
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_cookie_pair);
        let text = resp.text().await?;

        match status {
            StatusCode::OK | StatusCode::INTERNAL_SERVER_ERROR => {}
            StatusCode::UNAUTHORIZED => return Err(EsxiError::auth("HTTP 401 from SDK endpoint")),
            s if s.is_server_error() => {
                return Err(EsxiError::connection(format!("SDK endpoint returned {s}")))
            }
            s => return Err(EsxiError::protocol(format!("Unexpected HTTP status {s}"))),
        }

        Ok((parse_body(&text)?, session_cookie))
    }

    async fn invoke(&self, body: &str, token: Option<&SessionToken>) -> EsxiResult<XmlNode> {
        let cookie = token.map(|t| t.cookie.as_str());
        let (result, _) = self.invoke_raw(body, cookie).await?;
        result.map_err(SoapFault::into_error)
    }

    async fn service_content(&self) -> EsxiResult<&ServiceContent> {
        self.content
            .get_or_try_init(|| async {
                let body = r#"<RetrieveServiceContent xmlns="urn:vim25"><_this type="ServiceInstance">ServiceInstance</_this></RetrieveServiceContent>"#;
                let resp = self.invoke(body, None).await?;
                parse_service_content(&resp)
            })
            .await
    }

    // ── Property collector ──────────────────────────────────────────

    async fn retrieve(
        &self,
        token: &SessionToken,
        reference: &ObjectRef,
        paths: &[String],
    ) -> EsxiResult<PropertyMap> {
        let sc = self.service_content().await?;
        let body = retrieve_properties_body(&sc.property_collector, reference, paths);
        let resp = self.invoke(&body, Some(token)).await?;
        parse_retrieve_response(&resp, reference)
    }

    async fn container_view(
        &self,
        token: &SessionToken,
        container: &ObjectRef,
        kind: &ObjectKind,
    ) -> EsxiResult<Vec<ObjectRef>> {
        let sc = self.service_content().await?;
        let body = format!(
            r#"<CreateContainerView xmlns="urn:vim25">{}{}<type>{}</type><recursive>true</recursive></CreateContainerView>"#,
            mor_element("_this", &sc.view_manager),
            mor_element("container", container),
            xml::escape(kind.vim_type()),
        );
        let resp = self.invoke(&body, Some(token)).await?;
        let view = resp
            .child("returnval")
            .map(mor_from_node)
            .ok_or_else(|| EsxiError::protocol("CreateContainerView returned no view"))?;

        let listed = self.retrieve(token, &view, &["view".to_string()]).await;

        let destroy = format!(
            r#"<DestroyView xmlns="urn:vim25">{}</DestroyView>"#,
            mor_element("_this", &view)
        );
        if let Err(e) = self.invoke(&destroy, Some(token)).await {
            log::debug!("DestroyView for {} failed: {}", view, e);
        }

        Ok(listed?
            .get("view")
            .and_then(AttributeValue::as_references)
            .map(<[ObjectRef]>::to_vec)
            .unwrap_or_default())
    }

    async fn single_ref(
        &self,
        token: &SessionToken,
        reference: &ObjectRef,
        path: &str,
    ) -> EsxiResult<ObjectRef> {
        let props = self.retrieve(token, reference, &[path.to_string()]).await?;
        props
            .get(path)
            .and_then(AttributeValue::as_reference)
            .cloned()
            .ok_or_else(|| EsxiError::not_found(format!("{reference} has no '{path}'")))
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn wait_for_task(&self, token: &SessionToken, task: &ObjectRef) -> EsxiResult<PropertyMap> {
        let paths = vec![
            "info.state".to_string(),
            "info.result".to_string(),
            "info.error".to_string(),
        ];
        loop {
            let props = self.retrieve(token, task, &paths).await?;
            match props.get("info.state").and_then(AttributeValue::as_text) {
                Some("success") => return Ok(props),
                Some("error") => {
                    let fault = props
                        .get("info.error.fault")
                        .and_then(AttributeValue::as_text)
                        .unwrap_or("");
                    let message = props
                        .get("info.error.localizedMessage")
                        .and_then(AttributeValue::as_text)
                        .unwrap_or("task failed");
                    return Err(classify_fault(fault, message));
                }
                _ => tokio::time::sleep(self.task_poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl ManagementApi for VimClient {
    async fn login(&self) -> EsxiResult<SessionToken> {
        let sc = self.service_content().await?;
        let body = format!(
            r#"<Login xmlns="urn:vim25">{}<userName>{}</userName><password>{}</password></Login>"#,
            mor_element("_this", &sc.session_manager),
            xml::escape(self.endpoint.username()),
            xml::escape(self.endpoint.password().expose_secret()),
        );
        let (result, cookie) = self.invoke_raw(&body, None).await?;
        let resp = result.map_err(SoapFault::into_error)?;
        let cookie = cookie.ok_or_else(|| {
            EsxiError::protocol("Login succeeded but no session cookie was issued")
        })?;
        let key = resp
            .path(&["returnval", "key"])
            .map(|n| n.text.clone());

        log::info!("Logged in to {} as {}", self.endpoint.address(), self.endpoint.username());
        Ok(SessionToken { cookie, key })
    }

    async fn logout(&self, token: &SessionToken) -> EsxiResult<()> {
        let sc = self.service_content().await?;
        let body = format!(
            r#"<Logout xmlns="urn:vim25">{}</Logout>"#,
            mor_element("_this", &sc.session_manager)
        );
        self.invoke(&body, Some(token)).await?;
        Ok(())
    }

    async fn check_session(&self, token: &SessionToken) -> EsxiResult<bool> {
        let sc = self.service_content().await?;
        let body = retrieve_properties_body(
            &sc.property_collector,
            &sc.session_manager,
            &["currentSession".to_string()],
        );
        let (result, _) = self.invoke_raw(&body, Some(token.cookie.as_str())).await?;
        match result {
            Ok(resp) => {
                let props = parse_retrieve_response(&resp, &sc.session_manager)?;
                Ok(props.contains_key("currentSession"))
            }
            Err(fault) if fault.is("NotAuthenticated") => Ok(false),
            Err(fault) => Err(fault.into_error()),
        }
    }

    async fn list_hosts(&self, token: &SessionToken) -> EsxiResult<Vec<ObjectRef>> {
        let root = self.service_content().await?.root_folder.clone();
        self.container_view(token, &root, &ObjectKind::Host).await
    }

    async fn retrieve_properties(
        &self,
        token: &SessionToken,
        reference: &ObjectRef,
        attributes: &[String],
    ) -> EsxiResult<PropertyMap> {
        self.retrieve(token, reference, attributes).await
    }

    async fn list_children(
        &self,
        token: &SessionToken,
        parent: &ObjectRef,
        kind: &ObjectKind,
    ) -> EsxiResult<Vec<ObjectRef>> {
        let path = match (&parent.kind, kind) {
            (ObjectKind::Host, ObjectKind::Datastore) => "datastore",
            (ObjectKind::Host, ObjectKind::Vm) => "vm",
            (ObjectKind::Host, other) => {
                return Err(EsxiError::validation(format!(
                    "Hosts have no {} children",
                    other.vim_type()
                )))
            }
            _ => return self.container_view(token, parent, kind).await,
        };
        let props = self.retrieve(token, parent, &[path.to_string()]).await?;
        Ok(props
            .get(path)
            .and_then(AttributeValue::as_references)
            .map(<[ObjectRef]>::to_vec)
            .unwrap_or_default())
    }

    async fn create_vm(&self, token: &SessionToken, spec: &VmCreateSpec) -> EsxiResult<ObjectRef> {
        let host = match &spec.host {
            Some(h) => h.clone(),
            None => self
                .list_hosts(token)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| EsxiError::not_found("Endpoint exposes no host"))?,
        };

        let compute = self.single_ref(token, &host, "parent").await?;
        let pool = self.single_ref(token, &compute, "resourcePool").await?;

        let root = self.service_content().await?.root_folder.clone();
        let datacenter = self
            .container_view(token, &root, &ObjectKind::Datacenter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EsxiError::not_found("Endpoint exposes no datacenter"))?;
        let folder = self.single_ref(token, &datacenter, "vmFolder").await?;

        let body = create_vm_body(&folder, &pool, &host, spec);
        let resp = self.invoke(&body, Some(token)).await?;
        let task = resp
            .child("returnval")
            .map(mor_from_node)
            .ok_or_else(|| EsxiError::protocol("CreateVM_Task returned no task"))?;

        log::info!("CreateVM_Task {} started for '{}'", task.value, spec.name);
        let info = self.wait_for_task(token, &task).await?;
        info.get("info.result")
            .and_then(AttributeValue::as_reference)
            .cloned()
            .ok_or_else(|| EsxiError::protocol("CreateVM_Task finished without a VM reference"))
    }
}

// ── Request builders ────────────────────────────────────────────────

fn envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
            "<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"
        ),
        body
    )
}

fn mor_element(tag: &str, r: &ObjectRef) -> String {
    format!(
        r#"<{tag} type="{}">{}</{tag}>"#,
        xml::escape(r.kind.vim_type()),
        xml::escape(&r.value)
    )
}

fn retrieve_properties_body(collector: &ObjectRef, obj: &ObjectRef, paths: &[String]) -> String {
    let path_set: String = paths
        .iter()
        .map(|p| format!("<pathSet>{}</pathSet>", xml::escape(p)))
        .collect();
    format!(
        concat!(
            r#"<RetrievePropertiesEx xmlns="urn:vim25">{}<specSet>"#,
            "<propSet><type>{}</type>{}</propSet>",
            "<objectSet>{}<skip>false</skip></objectSet>",
            "</specSet><options></options></RetrievePropertiesEx>"
        ),
        mor_element("_this", collector),
        xml::escape(obj.kind.vim_type()),
        path_set,
        mor_element("obj", obj),
    )
}

fn create_vm_body(folder: &ObjectRef, pool: &ObjectRef, host: &ObjectRef, spec: &VmCreateSpec) -> String {
    format!(
        concat!(
            r#"<CreateVM_Task xmlns="urn:vim25">{}"#,
            "<config><name>{}</name><guestId>{}</guestId>",
            "<files><vmPathName>[{}]</vmPathName></files>",
            "<numCPUs>{}</numCPUs><memoryMB>{}</memoryMB></config>",
            "{}{}</CreateVM_Task>"
        ),
        mor_element("_this", folder),
        xml::escape(&spec.name),
        xml::escape(&spec.guest_id),
        xml::escape(&spec.datastore),
        spec.cpu_count,
        spec.memory_mib,
        mor_element("pool", pool),
        mor_element("host", host),
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// `vmware_soap_session="..."` out of a `Set-Cookie` header value.
fn session_cookie_pair(set_cookie: &str) -> Option<String> {
    let pair = set_cookie.split(';').next()?.trim();
    pair.starts_with(SESSION_COOKIE).then(|| pair.to_string())
}

fn parse_body(text: &str) -> EsxiResult<Result<XmlNode, SoapFault>> {
    let root = xml::parse(text)?;
    let body = root
        .child("Body")
        .ok_or_else(|| EsxiError::protocol("SOAP response has no Body"))?;
    let first = body
        .children
        .first()
        .ok_or_else(|| EsxiError::protocol("SOAP Body is empty"))?;

    if first.name != "Fault" {
        return Ok(Ok(first.clone()));
    }

    let message = first.child_text("faultstring").unwrap_or("").to_string();
    let fault_type = first
        .child("detail")
        .and_then(|d| d.children.first())
        .map(|f| match f.xsi_type() {
            Some(t) => t.to_string(),
            None => f.name.strip_suffix("Fault").unwrap_or(&f.name).to_string(),
        });
    Ok(Err(SoapFault { fault_type, message }))
}

fn mor_from_node(node: &XmlNode) -> ObjectRef {
    ObjectRef::new(
        ObjectKind::from_vim_type(node.attr("type").unwrap_or("")),
        node.text.clone(),
    )
}

fn parse_service_content(resp: &XmlNode) -> EsxiResult<ServiceContent> {
    let rv = resp
        .child("returnval")
        .ok_or_else(|| EsxiError::protocol("RetrieveServiceContent returned nothing"))?;
    let get = |name: &str| {
        rv.child(name)
            .map(mor_from_node)
            .ok_or_else(|| EsxiError::protocol(format!("ServiceContent lacks {name}")))
    };
    Ok(ServiceContent {
        root_folder: get("rootFolder")?,
        property_collector: get("propertyCollector")?,
        view_manager: get("viewManager")?,
        session_manager: get("sessionManager")?,
    })
}

fn parse_retrieve_response(resp: &XmlNode, reference: &ObjectRef) -> EsxiResult<PropertyMap> {
    let objects = resp
        .path(&["returnval", "objects"])
        .ok_or_else(|| EsxiError::not_found(format!("{reference} not found")))?;

    let mut props = PropertyMap::new();
    for prop in objects.children_named("propSet") {
        let (Some(name), Some(val)) = (prop.child_text("name"), prop.child("val")) else {
            continue;
        };
        flatten_value(name, val, &mut props)?;
    }
    Ok(props)
}

/// Convert a `<val>` into typed attributes.
///
/// Scalars and references map directly. Data objects are flattened:
/// the path itself holds the object's type name, and each child field is
/// stored under `path.field` recursively.
fn flatten_value(path: &str, val: &XmlNode, out: &mut PropertyMap) -> EsxiResult<()> {
    let xsi = val.xsi_type().unwrap_or("");

    if xsi == "ManagedObjectReference" || (xsi.is_empty() && val.attr("type").is_some() && val.is_leaf()) {
        out.insert(path.to_string(), AttributeValue::Reference(mor_from_node(val)));
        return Ok(());
    }
    if xsi == "ArrayOfManagedObjectReference" {
        let refs = val.children.iter().map(mor_from_node).collect();
        out.insert(path.to_string(), AttributeValue::References(refs));
        return Ok(());
    }

    if val.is_leaf() {
        let value = match xsi {
            "int" | "long" | "short" | "byte" => {
                let n = val.text.trim().parse::<i64>().map_err(|e| {
                    EsxiError::protocol(format!("Property {path}: bad integer '{}': {e}", val.text))
                })?;
                AttributeValue::Integer(n)
            }
            "boolean" => AttributeValue::Boolean(val.text.trim() == "true"),
            t if val.text.is_empty() && !t.is_empty() => AttributeValue::Text(t.to_string()),
            _ => AttributeValue::Text(val.text.clone()),
        };
        out.insert(path.to_string(), value);
        return Ok(());
    }

    out.insert(path.to_string(), AttributeValue::Text(xsi.to_string()));
    for child in &val.children {
        flatten_value(&format!("{path}.{}", child.name), child, out)?;
    }
    Ok(())
}
