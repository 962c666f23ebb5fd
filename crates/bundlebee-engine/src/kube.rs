//! Cluster access used by the awaiter and the command drivers.
//!
//! The engine only depends on the [`ResourceClient`] and [`ResourceApplier`] seams, [`KubeResources`]
//! implements them on top of a [`kube::Client`](::kube::Client) with dynamic objects resolved
//! through API discovery.
use ::kube::{
    Api, Client,
    api::{DeleteParams, DynamicObject, Patch, PatchParams},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use async_trait::async_trait;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::{substitutor::BoxedError, yaml};

pub const DEFAULT_FIELD_MANAGER: &str = "bundlebee";

const HTTP_OK: u16 = 200;
const HTTP_NOT_FOUND: u16 = 404;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse descriptor"))]
    ParseDescriptor { source: yaml::Error },

    #[snafu(display("descriptor object has no {field}"))]
    MissingField { field: String },

    #[snafu(display("failed to run API discovery"))]
    RunDiscovery { source: ::kube::Error },

    #[snafu(display("unknown resource type {api_version}/{kind}"))]
    UnknownResourceType { api_version: String, kind: String },

    #[snafu(display("failed to get {kind} {name:?}"))]
    GetResource {
        source: ::kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to apply {kind} {name:?}"))]
    ApplyResource {
        source: ::kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to delete {kind} {name:?}"))]
    DeleteResource {
        source: ::kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to serialize {kind} {name:?}"))]
    SerializeResource {
        source: serde_json::Error,
        kind: String,
        name: String,
    },
}

/// Outcome of fetching one object of a descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceResponse {
    /// HTTP like status, `200` when found, `404` when absent.
    pub status: u16,
    pub body: Value,

    /// Set when the request was not sent to the cluster, such responses are always satisfied.
    pub dry_run: bool,
}

/// Read access to the objects a descriptor declares.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetches every object of the descriptor.
    async fn get_resources(
        &self,
        content: &str,
        extension: &str,
    ) -> Result<Vec<ResourceResponse>, BoxedError>;

    /// `true` when every object of the descriptor exists.
    async fn exists(&self, content: &str, extension: &str) -> Result<bool, BoxedError>;

    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Write access to the objects a descriptor declares.
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    async fn apply(&self, content: &str, extension: &str) -> Result<(), BoxedError>;

    /// Deleting an absent object is not an error.
    async fn delete(&self, content: &str, extension: &str) -> Result<(), BoxedError>;
}

/// Coordinates of one object of a descriptor.
#[derive(Debug)]
struct ObjectRef {
    api_version: String,
    kind: String,
    name: String,
    namespace: Option<String>,
    object: Value,
}

impl ObjectRef {
    fn from_value(object: Value) -> Result<Self, Error> {
        let field = |pointer: &str| object.pointer(pointer).and_then(Value::as_str).map(str::to_owned);
        Ok(Self {
            api_version: field("/apiVersion").context(MissingFieldSnafu {
                field: "apiVersion",
            })?,
            kind: field("/kind").context(MissingFieldSnafu { field: "kind" })?,
            name: field("/metadata/name").context(MissingFieldSnafu {
                field: "metadata.name",
            })?,
            namespace: field("/metadata/namespace"),
            object,
        })
    }

    fn gvk(&self) -> GroupVersionKind {
        let (group, version) = self
            .api_version
            .split_once('/')
            .unwrap_or(("", &self.api_version));
        GroupVersionKind::gvk(group, version, &self.kind)
    }
}

/// Parses a descriptor into the objects it declares.
pub fn objects_of(content: &str, extension: &str) -> Result<Vec<Value>, yaml::Error> {
    Ok(yaml::resources(yaml::parse_documents(content, extension)?))
}

/// [`ResourceClient`] and [`ResourceApplier`] backed by the Kubernetes API.
///
/// Objects are applied with server-side apply (forcing conflicts) under a field manager. In dry-run
/// mode every write is sent as a dry-run request and reads are answered locally.
pub struct KubeResources {
    client: Client,
    discovery: OnceCell<Discovery>,
    field_manager: String,
    dry_run: bool,
}

impl KubeResources {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: OnceCell::new(),
            field_manager: DEFAULT_FIELD_MANAGER.to_owned(),
            dry_run: false,
        }
    }

    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Discovery runs once, on first use.
    async fn discovery(&self) -> Result<&Discovery, Error> {
        self.discovery
            .get_or_try_init(|| async {
                debug!("running API discovery");
                Discovery::new(self.client.clone())
                    .run()
                    .await
                    .context(RunDiscoverySnafu)
            })
            .await
    }

    async fn api_for(&self, object: &ObjectRef) -> Result<Api<DynamicObject>, Error> {
        let (resource, capabilities): (ApiResource, ApiCapabilities) = self
            .discovery()
            .await?
            .resolve_gvk(&object.gvk())
            .context(UnknownResourceTypeSnafu {
                api_version: &object.api_version,
                kind: &object.kind,
            })?;

        let client = self.client.clone();
        Ok(match (&capabilities.scope, object.namespace.as_deref()) {
            (Scope::Cluster, _) => Api::all_with(client, &resource),
            (Scope::Namespaced, Some(namespace)) => {
                Api::namespaced_with(client, namespace, &resource)
            }
            (Scope::Namespaced, None) => Api::default_namespaced_with(client, &resource),
        })
    }

    fn objects(content: &str, extension: &str) -> Result<Vec<ObjectRef>, Error> {
        objects_of(content, extension)
            .context(ParseDescriptorSnafu)?
            .into_iter()
            .map(ObjectRef::from_value)
            .collect()
    }

    async fn fetch(&self, object: &ObjectRef) -> Result<Option<DynamicObject>, Error> {
        self.api_for(object)
            .await?
            .get_opt(&object.name)
            .await
            .with_context(|_| GetResourceSnafu {
                kind: &object.kind,
                name: &object.name,
            })
    }
}

#[async_trait]
impl ResourceClient for KubeResources {
    async fn get_resources(
        &self,
        content: &str,
        extension: &str,
    ) -> Result<Vec<ResourceResponse>, BoxedError> {
        let mut responses = Vec::new();
        for object in Self::objects(content, extension)? {
            if self.dry_run {
                responses.push(ResourceResponse {
                    status: HTTP_OK,
                    body: object.object,
                    dry_run: true,
                });
                continue;
            }

            let response = match self.fetch(&object).await? {
                Some(found) => ResourceResponse {
                    status: HTTP_OK,
                    body: serde_json::to_value(&found).with_context(|_| {
                        SerializeResourceSnafu {
                            kind: &object.kind,
                            name: &object.name,
                        }
                    })?,
                    dry_run: false,
                },
                None => ResourceResponse {
                    status: HTTP_NOT_FOUND,
                    body: Value::Null,
                    dry_run: false,
                },
            };
            responses.push(response);
        }
        Ok(responses)
    }

    async fn exists(&self, content: &str, extension: &str) -> Result<bool, BoxedError> {
        if self.dry_run {
            return Ok(true);
        }
        for object in Self::objects(content, extension)? {
            if self.fetch(&object).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

#[async_trait]
impl ResourceApplier for KubeResources {
    #[instrument(skip_all)]
    async fn apply(&self, content: &str, extension: &str) -> Result<(), BoxedError> {
        let params = PatchParams {
            dry_run: self.dry_run,
            ..PatchParams::apply(&self.field_manager).force()
        };
        for object in Self::objects(content, extension)? {
            self.api_for(&object)
                .await?
                .patch(&object.name, &params, &Patch::Apply(&object.object))
                .await
                .with_context(|_| ApplyResourceSnafu {
                    kind: &object.kind,
                    name: &object.name,
                })?;
            info!(
                kind = %object.kind,
                name = %object.name,
                namespace = ?object.namespace,
                dry_run = self.dry_run,
                "applied object"
            );
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn delete(&self, content: &str, extension: &str) -> Result<(), BoxedError> {
        let params = DeleteParams {
            dry_run: self.dry_run,
            ..DeleteParams::default()
        };
        for object in Self::objects(content, extension)?.into_iter().rev() {
            let api = self.api_for(&object).await?;
            let present = api
                .get_opt(&object.name)
                .await
                .with_context(|_| GetResourceSnafu {
                    kind: &object.kind,
                    name: &object.name,
                })?
                .is_some();
            if !present {
                debug!(kind = %object.kind, name = %object.name, "object already absent");
                continue;
            }

            api.delete(&object.name, &params)
                .await
                .with_context(|_| DeleteResourceSnafu {
                    kind: &object.kind,
                    name: &object.name,
                })?;
            info!(
                kind = %object.kind,
                name = %object.name,
                namespace = ?object.namespace,
                dry_run = self.dry_run,
                "deleted object"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::core("v1", "", "v1")]
    #[case::grouped("apps/v1", "apps", "v1")]
    #[case::crd("bundlebee.yupiik.io/v1alpha1", "bundlebee.yupiik.io", "v1alpha1")]
    fn group_version_is_split(
        #[case] api_version: &str,
        #[case] group: &str,
        #[case] version: &str,
    ) {
        let object = ObjectRef::from_value(json!({
            "apiVersion": api_version,
            "kind": "Thing",
            "metadata": {"name": "thing"}
        }))
        .unwrap();

        let gvk = object.gvk();
        assert_eq!(gvk.group, group);
        assert_eq!(gvk.version, version);
        assert_eq!(gvk.kind, "Thing");
    }

    #[test]
    fn missing_name_is_reported() {
        let error = ObjectRef::from_value(json!({"apiVersion": "v1", "kind": "ConfigMap"}))
            .unwrap_err();

        assert_eq!(error.to_string(), "descriptor object has no metadata.name");
    }

    #[test]
    fn lists_are_expanded() {
        let objects = KubeResources::objects(
            indoc! {"
                apiVersion: v1
                kind: List
                items:
                  - apiVersion: v1
                    kind: ConfigMap
                    metadata:
                      name: first
                  - apiVersion: v1
                    kind: Secret
                    metadata:
                      name: second
                      namespace: apps
                ---
                apiVersion: v1
                kind: Service
                metadata:
                  name: third
            "},
            yaml::YAML_EXTENSION,
        )
        .unwrap();

        assert_eq!(
            objects
                .iter()
                .map(|it| (it.kind.as_str(), it.name.as_str(), it.namespace.as_deref()))
                .collect::<Vec<_>>(),
            vec![
                ("ConfigMap", "first", None),
                ("Secret", "second", Some("apps")),
                ("Service", "third", None)
            ]
        );
    }
}
