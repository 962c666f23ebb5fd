#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bundlebee_engine::{
    archive::{Archive, ArchiveLoader},
    command::Engine,
    config::{AwaiterOptions, Configuration},
    kube::{ResourceApplier, ResourceClient, ResourceResponse, objects_of},
    manifest::Manifest,
    resolver::Resolver,
    substitutor::BoxedError,
};
use serde_json::Value;

pub const AWAIT_INTERVAL: Duration = Duration::from_millis(100);
pub const AWAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Only the local bundle is available.
pub struct NoArchives;

#[async_trait]
impl ArchiveLoader for NoArchives {
    async fn load_archive(
        &self,
        location: &str,
        _execution_id: &str,
    ) -> Result<Archive, BoxedError> {
        Err(format!("{location} is not reachable").into())
    }
}

/// Serves pre-registered archives by location.
#[derive(Default)]
pub struct InMemoryArchives {
    archives: HashMap<String, Archive>,
}

impl InMemoryArchives {
    pub fn with(mut self, archive: Archive) -> Self {
        self.archives.insert(archive.location.clone(), archive);
        self
    }
}

#[async_trait]
impl ArchiveLoader for InMemoryArchives {
    async fn load_archive(
        &self,
        location: &str,
        _execution_id: &str,
    ) -> Result<Archive, BoxedError> {
        self.archives
            .get(location)
            .cloned()
            .ok_or_else(|| format!("{location} is not reachable").into())
    }
}

pub fn config_map(name: &str) -> String {
    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n")
}

/// A bundle with `manifest` and `descriptors`, stored as `bundlebee/kubernetes/<name>`, `.yaml`
/// being appended to names without extension.
pub fn bundle(location: &str, manifest: Value, descriptors: &[(&str, String)]) -> Archive {
    let manifest: Manifest = serde_json::from_value(manifest).unwrap();
    Archive::new(
        location,
        Some(manifest),
        descriptors.iter().map(|(name, content)| {
            let file = if name.contains('.') {
                (*name).to_owned()
            } else {
                format!("{name}.yaml")
            };
            (format!("bundlebee/kubernetes/{file}"), content.clone())
        }),
    )
}

pub fn engine(manifest: Value, descriptors: &[(&str, String)]) -> Engine {
    engine_with_archives(manifest, descriptors, Arc::new(NoArchives))
}

pub fn engine_with_archives(
    manifest: Value,
    descriptors: &[(&str, String)],
    archives: Arc<dyn ArchiveLoader>,
) -> Engine {
    engine_with_configuration(
        manifest,
        descriptors,
        archives,
        Configuration::default().with_environment(BTreeMap::new()),
    )
}

pub fn engine_with_configuration(
    manifest: Value,
    descriptors: &[(&str, String)],
    archives: Arc<dyn ArchiveLoader>,
    configuration: Configuration,
) -> Engine {
    let resolver =
        Resolver::new(configuration).with_local_bundle(bundle("local", manifest, descriptors));
    Engine::new(resolver, archives).with_awaiter_options(AwaiterOptions {
        interval: AWAIT_INTERVAL.into(),
        timeout: AWAIT_TIMEOUT.into(),
    })
}

/// In-memory cluster recording every call.
#[derive(Default)]
pub struct FakeCluster {
    pub events: Mutex<Vec<String>>,
    pub objects: Mutex<BTreeMap<String, Value>>,

    /// Time an apply of the named object takes.
    pub apply_delays: BTreeMap<String, Duration>,

    /// `status` served for the named object once applied.
    pub statuses: BTreeMap<String, Value>,

    /// Objects staying in the cluster once deleted, as if held by a finalizer.
    pub retained_on_delete: BTreeSet<String>,
}

impl FakeCluster {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Names of the applied objects, in completion order.
    pub fn applied(&self) -> Vec<String> {
        self.events_with_prefix("applied:")
    }

    pub fn deleted(&self) -> Vec<String> {
        self.events_with_prefix("deleted:")
    }

    pub fn object(&self, name: &str) -> Option<Value> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, object: Value) {
        let name = name_of(&object);
        self.objects.lock().unwrap().insert(name, object);
    }

    fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| event.strip_prefix(prefix).map(str::to_owned))
            .collect()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

fn name_of(object: &Value) -> String {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn get_resources(
        &self,
        content: &str,
        extension: &str,
    ) -> Result<Vec<ResourceResponse>, BoxedError> {
        let mut responses = Vec::new();
        for object in objects_of(content, extension)? {
            let name = name_of(&object);
            self.record(format!("get:{name}"));
            responses.push(match self.object(&name) {
                Some(mut found) => {
                    if let (Some(status), Some(found)) =
                        (self.statuses.get(&name), found.as_object_mut())
                    {
                        found.insert("status".to_owned(), status.clone());
                    }
                    ResourceResponse {
                        status: 200,
                        body: found,
                        dry_run: false,
                    }
                }
                None => ResourceResponse {
                    status: 404,
                    body: Value::Null,
                    dry_run: false,
                },
            });
        }
        Ok(responses)
    }

    async fn exists(&self, content: &str, extension: &str) -> Result<bool, BoxedError> {
        Ok(objects_of(content, extension)?
            .iter()
            .all(|object| self.object(&name_of(object)).is_some()))
    }
}

#[async_trait]
impl ResourceApplier for FakeCluster {
    async fn apply(&self, content: &str, extension: &str) -> Result<(), BoxedError> {
        for object in objects_of(content, extension)? {
            let name = name_of(&object);
            self.record(format!("apply:{name}"));
            if let Some(delay) = self.apply_delays.get(&name) {
                tokio::time::sleep(*delay).await;
            }
            self.insert(object);
            self.record(format!("applied:{name}"));
        }
        Ok(())
    }

    async fn delete(&self, content: &str, extension: &str) -> Result<(), BoxedError> {
        for object in objects_of(content, extension)? {
            let name = name_of(&object);
            if !self.retained_on_delete.contains(&name) {
                self.objects.lock().unwrap().remove(&name);
            }
            self.record(format!("deleted:{name}"));
        }
        Ok(())
    }
}

/// Renders an error with all its sources.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
