//! Kubernetes remote source: discovery, GVK resolution and a [`RemoteSource`]
//! over `kube::Api<DynamicObject>`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use serde::{Deserialize, Serialize};
use skein_core::{ListOptions, ObjectList, RemoteSource, Resource, ResourceVersion, SourceError, WatchEvent, WatchStream};
use tracing::{debug, info};

/// API servers reject watch timeouts at or above 295 seconds.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Served resources (CRDs included), sorted by group, version, kind.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// `v1/Pod` or `apps/v1/Deployment`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// A Kubernetes object as cached by an informer. `managedFields` is dropped on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KubeObject(pub DynamicObject);

impl From<DynamicObject> for KubeObject {
    fn from(mut obj: DynamicObject) -> Self {
        obj.metadata.managed_fields = None;
        Self(obj)
    }
}

impl Resource for KubeObject {
    fn name(&self) -> &str {
        self.0.metadata.name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> Option<&str> {
        self.0.metadata.namespace.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.0.metadata.resource_version.as_deref()
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.0.metadata.labels.as_ref()
    }
}

pub struct KubeSource {
    api: Api<DynamicObject>,
    gvk_key: String,
}

impl KubeSource {
    pub fn new(api: Api<DynamicObject>, gvk_key: impl Into<String>) -> Self {
        Self { api, gvk_key: gvk_key.into() }
    }

    /// Resolve `gvk_key` against the cluster and build a source for it. Cluster-scoped
    /// kinds ignore `namespace`.
    pub async fn connect(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kubehub: source ready");
        Ok(Self::new(api, gvk_key))
    }

    pub fn gvk_key(&self) -> &str {
        &self.gvk_key
    }
}

fn list_params(options: &ListOptions) -> ListParams {
    ListParams {
        label_selector: options.label_selector.clone(),
        field_selector: options.field_selector.clone(),
        limit: options.page_size,
        ..ListParams::default()
    }
}

fn watch_params(options: &ListOptions) -> WatchParams {
    WatchParams {
        label_selector: options.label_selector.clone(),
        field_selector: options.field_selector.clone(),
        timeout: options.timeout_secs.map(|t| t.min(MAX_WATCH_TIMEOUT_SECS)),
        bookmarks: true,
        ..WatchParams::default()
    }
}

fn status_error(status: &ErrorResponse) -> SourceError {
    if status.code == 410 || status.reason == "Expired" || status.reason == "Gone" {
        SourceError::Expired(status.message.clone())
    } else {
        SourceError::Transient(format!("{} ({} {})", status.message, status.code, status.reason))
    }
}

fn source_error(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(status) => status_error(&status),
        kube::Error::SerdeError(e) => SourceError::Decode(e.to_string()),
        other => SourceError::Transient(other.to_string()),
    }
}

fn watch_event(ev: KubeWatchEvent<DynamicObject>) -> WatchEvent<KubeObject> {
    match ev {
        KubeWatchEvent::Added(o) => WatchEvent::Added(o.into()),
        KubeWatchEvent::Modified(o) => WatchEvent::Updated(o.into()),
        KubeWatchEvent::Deleted(o) => WatchEvent::Deleted(o.into()),
        KubeWatchEvent::Bookmark(b) => WatchEvent::Bookmark(ResourceVersion::from(b.metadata.resource_version)),
        KubeWatchEvent::Error(status) => WatchEvent::Error(status_error(&status)),
    }
}

#[async_trait]
impl RemoteSource<KubeObject> for KubeSource {
    async fn list(&self, options: &ListOptions) -> Result<ObjectList<KubeObject>, SourceError> {
        let mut params = list_params(options);
        let mut items = Vec::new();
        let mut pages = 0usize;
        loop {
            let page = self.api.list(&params).await.map_err(source_error)?;
            pages += 1;
            items.extend(page.items.into_iter().map(KubeObject::from));
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(token) => params.continue_token = Some(token),
                None => {
                    let rv = page.metadata.resource_version.unwrap_or_default();
                    debug!(gvk = %self.gvk_key, items = items.len(), pages, rv = %rv, "kubehub: list");
                    return Ok(ObjectList { items, resource_version: ResourceVersion::from(rv) });
                }
            }
        }
    }

    async fn watch(&self, options: &ListOptions, from: &ResourceVersion) -> Result<WatchStream<KubeObject>, SourceError> {
        let stream = self.api.watch(&watch_params(options), from.as_str()).await.map_err(source_error)?;
        debug!(gvk = %self.gvk_key, rv = %from, "kubehub: watch opened");
        Ok(stream
            .map(|item| match item {
                Ok(ev) => watch_event(ev),
                Err(e) => WatchEvent::Error(source_error(e)),
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(name: &str, ns: Option<&str>, rv: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": ns,
                "resourceVersion": rv,
                "labels": {"app": "web"},
                "managedFields": [{"manager": "kubectl", "operation": "Apply"}]
            },
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    fn status(code: u16, reason: &str) -> ErrorResponse {
        ErrorResponse { status: "Failure".into(), message: "too old resource version: 1 (5)".into(), reason: reason.into(), code }
    }

    #[test]
    fn parses_core_and_grouped_keys() {
        let core = parse_gvk_key("v1/Pod").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "Pod"));
        let apps = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.group, "apps");
        assert!(parse_gvk_key("Pod").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn gvk_key_omits_empty_group() {
        let r = DiscoveredResource { group: String::new(), version: "v1".into(), kind: "Pod".into(), plural: "pods".into(), namespaced: true };
        assert_eq!(r.gvk_key(), "v1/Pod");
        let r = DiscoveredResource { group: "apps".into(), ..r };
        assert_eq!(r.gvk_key(), "apps/v1/Pod");
    }

    #[test]
    fn kube_object_exposes_identity_and_drops_managed_fields() {
        let o = KubeObject::from(object("cfg", Some("prod"), "42"));
        assert_eq!(o.name(), "cfg");
        assert_eq!(o.namespace(), Some("prod"));
        assert_eq!(o.resource_version(), Some("42"));
        assert_eq!(o.labels().and_then(|l| l.get("app")).map(String::as_str), Some("web"));
        assert!(o.0.metadata.managed_fields.is_none());
        assert_eq!(skein_core::ObjectKey::of(&o).as_str(), "prod/cfg");
    }

    #[test]
    fn gone_maps_to_expired() {
        assert!(status_error(&status(410, "Expired")).is_expired());
        assert!(status_error(&status(500, "Gone")).is_expired());
        assert!(!status_error(&status(500, "InternalError")).is_expired());
        assert!(source_error(kube::Error::Api(status(410, "Expired"))).is_expired());
    }

    #[test]
    fn watch_events_translate() {
        match watch_event(KubeWatchEvent::Modified(object("cfg", Some("prod"), "7"))) {
            WatchEvent::Updated(o) => {
                assert_eq!(o.resource_version(), Some("7"));
                assert!(o.0.metadata.managed_fields.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match watch_event(KubeWatchEvent::Error(status(410, "Expired"))) {
            WatchEvent::Error(e) => assert!(e.is_expired()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn params_carry_selectors_and_cap_timeout() {
        let opts = ListOptions { page_size: Some(500), ..ListOptions::default() }.labels("app=web").fields("metadata.name=x").timeout(600);
        let lp = list_params(&opts);
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(lp.field_selector.as_deref(), Some("metadata.name=x"));
        assert_eq!(lp.limit, Some(500));
        let wp = watch_params(&opts);
        assert_eq!(wp.timeout, Some(MAX_WATCH_TIMEOUT_SECS));
        assert!(wp.bookmarks);
    }
}
