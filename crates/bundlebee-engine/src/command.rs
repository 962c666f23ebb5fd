//! The apply, delete and process drivers.
//!
//! Every command resolves its root alveoli, checks the manifest requirements, overlays the
//! command line exclusions and walks each root concurrently with a fresh archive cache.
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use jiff::Timestamp;
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{info, instrument};

use crate::{
    archive::{ArchiveCache, ArchiveLoader},
    awaiter::{self, APPLY_COMMAND, CommandAwaiter, ConditionAwaiter, DELETE_COMMAND},
    config::{ApplyOptions, AwaiterOptions},
    futures::{Aggregate, chain, join_all},
    kube::{ResourceApplier, ResourceClient, objects_of},
    manifest::{Alveolus, ENGINE_VERSION, Manifest, ManifestAndAlveolus, RequirementError},
    patch::LoadedDescriptor,
    resolver::{self, AlveolusContext, AlveolusVisitor, DescriptorAwaiter, Resolver, list_errors},
    substitutor::BoxedError,
    yaml,
};

pub const TIMESTAMP_LABEL: &str = "bundlebee.timestamp";
pub const ROOT_ALVEOLUS_NAME_LABEL: &str = "bundlebee.root.alveolus.name";
pub const ROOT_ALVEOLUS_VERSION_LABEL: &str = "bundlebee.root.alveolus.version";

const MAX_LABEL_VALUE_LENGTH: usize = 63;
const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve the root alveoli"))]
    FindRootAlveoli { source: resolver::Error },

    #[snafu(display("manifest of {alveolus:?} does not accept this bundlebee version"))]
    CheckRequirements {
        source: RequirementError,
        alveolus: String,
    },

    #[snafu(display("dry-run requested but the cluster client is not in dry-run mode"))]
    DryRunUnsupported,

    #[snafu(display("failed to execute {command} on {alveolus:?}"))]
    Execute {
        source: resolver::Error,
        command: String,
        alveolus: String,
    },

    #[snafu(display("failed to inject labels in {descriptor:?}"))]
    InjectLabels {
        source: yaml::Error,
        descriptor: String,
    },

    #[snafu(display("failed to delete {descriptor:?}"))]
    DeleteDescriptor {
        source: BoxedError,
        descriptor: String,
    },

    #[snafu(display("failed to await the deletion"))]
    AwaitDeletion { source: awaiter::Error },

    #[snafu(display("{} command failures:{}", errors.len(), list_errors(errors)))]
    Multiple { errors: Vec<Error> },
}

impl Aggregate for Error {
    fn aggregate(errors: Vec<Self>) -> Self {
        Self::Multiple { errors }
    }
}

/// Where the root alveoli are looked up.
#[derive(Clone, Debug, Default)]
pub struct Source {
    /// Coordinates of the bundle to read the alveolus from, local bundles are used when unset.
    pub location: Option<String>,

    /// Explicit manifest, takes precedence over `location`.
    pub manifest: Option<Arc<Manifest>>,
}

impl Source {
    pub fn from_location(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            manifest: None,
        }
    }

    pub fn from_manifest(manifest: Manifest) -> Self {
        Self {
            location: None,
            manifest: Some(Arc::new(manifest)),
        }
    }
}

/// Entry point of the commands.
pub struct Engine {
    resolver: Resolver,
    archives: Arc<dyn ArchiveLoader>,
    awaiter_options: AwaiterOptions,
}

impl Engine {
    pub fn new(resolver: Resolver, archives: Arc<dyn ArchiveLoader>) -> Self {
        Self {
            resolver,
            archives,
            awaiter_options: AwaiterOptions::default(),
        }
    }

    pub fn with_awaiter_options(mut self, awaiter_options: AwaiterOptions) -> Self {
        self.awaiter_options = awaiter_options;
        self
    }

    /// Deploys the selected alveoli, awaiting descriptors between ordering barriers.
    #[instrument(skip_all, fields(alveolus = %options.alveolus))]
    pub async fn apply<K>(
        &self,
        source: &Source,
        options: &ApplyOptions,
        cluster: Arc<K>,
    ) -> Result<(), Error>
    where
        K: ResourceClient + ResourceApplier + 'static,
    {
        ensure!(!options.dry_run || cluster.is_dry_run(), DryRunUnsupportedSnafu);

        let execution_id = new_execution_id();
        let cache = ArchiveCache::new(self.archives.clone());
        let roots = self.roots(source, options, &cache, &execution_id).await?;

        let awaiter = CommandAwaiter::new(
            Arc::new(ConditionAwaiter::new(
                cluster.clone(),
                self.awaiter_options.clone(),
            )),
            APPLY_COMMAND,
        );
        join_all(
            roots
                .iter()
                .map(|root| {
                    let visitor = ApplyVisitor {
                        applier: cluster.as_ref(),
                        labels: create_labels(&root.alveolus, options),
                    };
                    let awaiter: &dyn DescriptorAwaiter = &awaiter;
                    let cache = &cache;
                    let execution_id = &execution_id;
                    async move {
                        self.resolver
                            .execute_on_alveolus(root, &visitor, Some(awaiter), cache, execution_id)
                            .await
                            .with_context(|_| ExecuteSnafu {
                                command: APPLY_COMMAND,
                                alveolus: &root.alveolus.name,
                            })
                    }
                })
                .collect::<Vec<_>>(),
        )
        .await?;
        info!("apply completed");
        Ok(())
    }

    /// Deletes the descriptors of the selected alveoli, dependents first, then awaits their
    /// removal.
    #[instrument(skip_all, fields(alveolus = %options.alveolus))]
    pub async fn delete<K>(
        &self,
        source: &Source,
        options: &ApplyOptions,
        cluster: Arc<K>,
    ) -> Result<(), Error>
    where
        K: ResourceClient + ResourceApplier + 'static,
    {
        ensure!(!options.dry_run || cluster.is_dry_run(), DryRunUnsupportedSnafu);

        let execution_id = new_execution_id();
        let cache = ArchiveCache::new(self.archives.clone());
        let roots = self.roots(source, options, &cache, &execution_id).await?;
        let awaiter = ConditionAwaiter::new(cluster.clone(), self.awaiter_options.clone());

        join_all(
            roots
                .iter()
                .map(|root| self.delete_root(root, cluster.as_ref(), &awaiter, &cache, &execution_id))
                .collect::<Vec<_>>(),
        )
        .await?;
        info!("delete completed");
        Ok(())
    }

    async fn delete_root(
        &self,
        root: &ManifestAndAlveolus,
        applier: &dyn ResourceApplier,
        awaiter: &ConditionAwaiter,
        cache: &ArchiveCache,
        execution_id: &str,
    ) -> Result<(), Error> {
        let collector = Collector::default();
        self.resolver
            .execute_on_alveolus(root, &collector, None, cache, execution_id)
            .await
            .with_context(|_| ExecuteSnafu {
                command: DELETE_COMMAND,
                alveolus: &root.alveolus.name,
            })?;

        let mut descriptors = collector.into_descriptors();
        descriptors.reverse();

        chain(descriptors.iter().map(|descriptor| async move {
            applier
                .delete(&descriptor.content, &descriptor.extension)
                .await
                .with_context(|_| DeleteDescriptorSnafu {
                    descriptor: descriptor.name(),
                })
        }))
        .await?;

        join_all(
            descriptors
                .iter()
                .map(|descriptor| awaiter.await_descriptor(DELETE_COMMAND, descriptor))
                .collect::<Vec<_>>(),
        )
        .await
        .context(AwaitDeletionSnafu)?;
        Ok(())
    }

    /// Renders the descriptors of the selected alveoli in application order without touching any
    /// cluster.
    #[instrument(skip_all, fields(alveolus = %options.alveolus))]
    pub async fn process(
        &self,
        source: &Source,
        options: &ApplyOptions,
    ) -> Result<Vec<LoadedDescriptor>, Error> {
        let execution_id = new_execution_id();
        let cache = ArchiveCache::new(self.archives.clone());
        let roots = self.roots(source, options, &cache, &execution_id).await?;

        let rendered = join_all(
            roots
                .iter()
                .map(|root| {
                    let cache = &cache;
                    let execution_id = &execution_id;
                    async move {
                        let collector = Collector::default();
                        self.resolver
                            .execute_on_alveolus(root, &collector, None, cache, execution_id)
                            .await
                            .with_context(|_| ExecuteSnafu {
                                command: "process",
                                alveolus: &root.alveolus.name,
                            })?;

                        let labels = create_labels(&root.alveolus, options);
                        collector
                            .into_descriptors()
                            .into_iter()
                            .map(|descriptor| with_labels(descriptor, &labels))
                            .collect::<Result<Vec<_>, _>>()
                    }
                })
                .collect::<Vec<_>>(),
        )
        .await?;
        Ok(rendered.into_iter().flatten().collect())
    }

    async fn roots(
        &self,
        source: &Source,
        options: &ApplyOptions,
        cache: &ArchiveCache,
        execution_id: &str,
    ) -> Result<Vec<ManifestAndAlveolus>, Error> {
        let roots = self
            .resolver
            .find_root_alveoli(
                source.location.as_deref(),
                source.manifest.clone(),
                &options.alveolus,
                cache,
                execution_id,
            )
            .await
            .context(FindRootAlveoliSnafu)?;

        roots
            .iter()
            .map(|root| {
                root.manifest
                    .check_requirements(ENGINE_VERSION)
                    .with_context(|_| CheckRequirementsSnafu {
                        alveolus: &root.alveolus.name,
                    })?;
                Ok(root.exclude(&options.excluded_locations, &options.excluded_descriptors))
            })
            .collect()
    }
}

struct ApplyVisitor<'a> {
    applier: &'a dyn ResourceApplier,
    labels: BTreeMap<String, String>,
}

#[async_trait]
impl AlveolusVisitor for ApplyVisitor<'_> {
    async fn on_alveolus(&self, context: &AlveolusContext) -> Result<(), BoxedError> {
        info!(alveolus = %context.alveolus.name, "deploying alveolus");
        Ok(())
    }

    async fn on_descriptor(
        &self,
        _context: &AlveolusContext,
        descriptor: &LoadedDescriptor,
    ) -> Result<(), BoxedError> {
        let labeled = with_labels(descriptor.clone(), &self.labels)?;
        self.applier
            .apply(&labeled.content, &labeled.extension)
            .await?;
        info!(descriptor = %descriptor.name(), uri = %descriptor.uri, "applied descriptor");
        Ok(())
    }
}

/// Records the visited descriptors in visit order.
#[derive(Default)]
struct Collector {
    descriptors: Mutex<Vec<LoadedDescriptor>>,
}

impl Collector {
    fn into_descriptors(self) -> Vec<LoadedDescriptor> {
        self.descriptors
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AlveolusVisitor for Collector {
    async fn on_descriptor(
        &self,
        _context: &AlveolusContext,
        descriptor: &LoadedDescriptor,
    ) -> Result<(), BoxedError> {
        self.descriptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(descriptor.clone());
        Ok(())
    }
}

/// Unique enough identifier of one command execution, exposed as the `executionId` placeholder.
fn new_execution_id() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    format!(
        "{:x}-{:x}",
        Timestamp::now().as_millisecond(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Labels injected in every object of the descriptors deployed from `root`.
pub fn create_labels(root: &Alveolus, options: &ApplyOptions) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if options.inject_timestamp {
        labels.insert(
            TIMESTAMP_LABEL.to_owned(),
            Timestamp::now().as_millisecond().to_string(),
        );
    }
    if options.inject_metadata {
        labels.insert(
            ROOT_ALVEOLUS_NAME_LABEL.to_owned(),
            sanitize_label_value(&root.name),
        );
        labels.insert(
            ROOT_ALVEOLUS_VERSION_LABEL.to_owned(),
            sanitize_label_value(root.resolved_version().unwrap_or(UNKNOWN_VERSION)),
        );
    }
    labels
}

/// Makes `value` a valid label value.
///
/// Characters outside `[-_.A-Za-z0-9]` become `-`, the value is cut to 63 characters and must
/// start and end with an alphanumeric character.
pub fn sanitize_label_value(value: &str) -> String {
    let replaced = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect::<String>();
    let is_boundary = |c: char| !c.is_ascii_alphanumeric();

    // only ASCII is left so byte slicing is safe
    let trimmed = replaced.trim_start_matches(is_boundary);
    let truncated = &trimmed[..trimmed.len().min(MAX_LABEL_VALUE_LENGTH)];
    truncated.trim_end_matches(is_boundary).to_owned()
}

/// Returns `descriptor` with `labels` merged in the labels of each of its objects, as JSON.
fn with_labels(
    descriptor: LoadedDescriptor,
    labels: &BTreeMap<String, String>,
) -> Result<LoadedDescriptor, Error> {
    if labels.is_empty() {
        return Ok(descriptor);
    }

    let context = || InjectLabelsSnafu {
        descriptor: descriptor.name(),
    };
    let mut objects = objects_of(&descriptor.content, &descriptor.extension).with_context(|_| context())?;
    for object in &mut objects {
        inject_labels(object, labels);
    }
    let content = match objects.len() {
        1 => yaml::to_json_string(&objects[0]),
        _ => yaml::to_json_string(&Value::Array(objects)),
    }
    .with_context(|_| context())?;

    Ok(LoadedDescriptor {
        content,
        extension: yaml::JSON_EXTENSION.to_owned(),
        ..descriptor
    })
}

fn inject_labels(object: &mut Value, labels: &BTreeMap<String, String>) {
    let Some(object) = object.as_object_mut() else {
        return;
    };
    let Some(metadata) = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
    else {
        return;
    };
    let Some(target) = metadata
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
    else {
        return;
    };
    for (key, value) in labels {
        target.insert(key.clone(), Value::String(value.clone()));
    }
}
