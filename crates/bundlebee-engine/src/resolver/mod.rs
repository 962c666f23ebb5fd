//! Walks the alveolus dependency graph and hands every prepared descriptor to a visitor.
//!
//! For each alveolus:
//!
//! 1. the inherited exclusions, patches and placeholders are merged with its own,
//! 2. its dependencies are visited, one after the other if `chainDependencies` is set, otherwise
//!    concurrently,
//! 3. its descriptors are selected, loaded and prepared (patches and interpolation),
//! 4. the descriptors are split into ordering-barrier groups which run in sequence. Within a group
//!    every descriptor is visited and awaited concurrently.
//!
//! A `(name, rendered content)` pair is visited at most once per run, so a dependency reachable
//! through several paths is only deployed once. Later paths wait for that visit to complete.
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

use crate::{
    archive::{self, Archive, ArchiveCache},
    condition::ConditionEvaluator,
    config::{Configuration, PlaceholderScope},
    futures::{Aggregate, chain, join_all},
    manifest::{
        Alveolus, AlveolusDependency, Descriptor, DescriptorRef, KUBERNETES_DESCRIPTOR_TYPE,
        Manifest, ManifestAndAlveolus,
    },
    patch::{self, LoadedDescriptor, PatchEngine, PatchSet, PredicateError},
    substitutor::BoxedError,
};

mod rank;

pub use rank::*;

/// Alveolus name selecting the root alveoli automatically.
pub const AUTO_ALVEOLUS: &str = "auto";

const DESCRIPTOR_EXTENSIONS: [&str; 3] = [".yaml", ".yml", ".json"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no alveolus named {name:?} found"))]
    AlveolusNotFound { name: String },

    #[snafu(display("no alveolus {name:?} found in {location:?}, available: {available}"))]
    AlveolusNotInArchive {
        name: String,
        location: String,
        available: String,
    },

    #[snafu(display("no manifest found in {location:?}"))]
    MissingArchiveManifest { location: String },

    #[snafu(display("unsupported type {type_:?} for descriptor {descriptor:?}"))]
    UnsupportedDescriptorType { descriptor: String, type_: String },

    #[snafu(display("no location for descriptor {descriptor:?} so it is not downloadable"))]
    MissingDescriptorLocation { descriptor: String },

    #[snafu(display("no descriptor {resource:?} found in {location:?}"))]
    DescriptorNotFound { resource: String, location: String },

    #[snafu(display("failed to load archive"))]
    LoadArchive { source: archive::Error },

    #[snafu(display("invalid patch of alveolus {alveolus:?}"))]
    CompilePatches {
        source: PredicateError,
        alveolus: String,
    },

    #[snafu(display("failed to prepare descriptor"))]
    PrepareDescriptor { source: patch::Error },

    #[snafu(display("preparation of descriptor {descriptor:?} did not complete"))]
    JoinPreparation {
        source: tokio::task::JoinError,
        descriptor: String,
    },

    #[snafu(display("alveolus hook failed for {alveolus:?}"))]
    OnAlveolus {
        source: BoxedError,
        alveolus: String,
    },

    #[snafu(display("descriptor hook failed for {descriptor:?}"))]
    OnDescriptor {
        source: BoxedError,
        descriptor: String,
    },

    #[snafu(display("failed to await descriptor {descriptor:?}"))]
    AwaitDescriptor {
        source: BoxedError,
        descriptor: String,
    },

    #[snafu(display("{} failures:{}", errors.len(), list_errors(errors)))]
    Multiple { errors: Vec<Error> },
}

impl Aggregate for Error {
    fn aggregate(errors: Vec<Self>) -> Self {
        Self::Multiple { errors }
    }
}

/// Renders every error with its chain of sources, one per line.
pub(crate) fn list_errors<E: std::error::Error>(errors: &[E]) -> String {
    let mut rendered = String::new();
    for error in errors {
        let _ = write!(rendered, "\n- {error}");
        let mut source = error.source();
        while let Some(cause) = source {
            let _ = write!(rendered, ": {cause}");
            source = cause.source();
        }
    }
    rendered
}

/// Traversal state of one alveolus, merged from everything its dependents declared.
#[derive(Clone, Debug)]
pub struct AlveolusContext {
    pub manifest: Arc<Manifest>,
    pub alveolus: Arc<Alveolus>,
    pub patches: PatchSet,
    pub placeholders: Arc<BTreeMap<String, String>>,
    pub excludes: Arc<Vec<DescriptorRef>>,
    pub execution_id: Arc<str>,
}

impl AlveolusContext {
    pub fn root(
        manifest: Arc<Manifest>,
        alveolus: Alveolus,
        execution_id: &str,
    ) -> Result<Self, Error> {
        Self {
            manifest: manifest.clone(),
            alveolus: Arc::new(Alveolus::default()),
            patches: PatchSet::default(),
            placeholders: Arc::default(),
            excludes: Arc::default(),
            execution_id: execution_id.into(),
        }
        .enter(manifest, alveolus)
    }

    /// Context of `alveolus` reached from this one.
    ///
    /// Exclusions and patches accumulate (inherited first), placeholders of `alveolus` win over
    /// inherited ones.
    pub fn enter(&self, manifest: Arc<Manifest>, alveolus: Alveolus) -> Result<Self, Error> {
        let patches = self
            .patches
            .merge(&alveolus.patches)
            .with_context(|_| CompilePatchesSnafu {
                alveolus: alveolus.name.clone(),
            })?;

        let mut excludes = self.excludes.as_ref().clone();
        for exclude in &alveolus.excluded_descriptors {
            if !excludes.contains(exclude) {
                excludes.push(exclude.clone());
            }
        }

        let mut placeholders = self.placeholders.as_ref().clone();
        placeholders.extend(
            alveolus
                .placeholders
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        Ok(Self {
            manifest,
            alveolus: Arc::new(alveolus),
            patches,
            placeholders: Arc::new(placeholders),
            excludes: Arc::new(excludes),
            execution_id: self.execution_id.clone(),
        })
    }

    fn is_excluded(&self, descriptor: &Descriptor) -> bool {
        self.excludes
            .iter()
            .any(|exclude| exclude.matches(descriptor))
    }
}

/// Callbacks of a traversal.
#[async_trait]
pub trait AlveolusVisitor: Send + Sync {
    /// Called when an alveolus is entered, before its dependencies.
    async fn on_alveolus(&self, _context: &AlveolusContext) -> Result<(), BoxedError> {
        Ok(())
    }

    /// Called once per prepared descriptor (after deduplication).
    async fn on_descriptor(
        &self,
        context: &AlveolusContext,
        descriptor: &LoadedDescriptor,
    ) -> Result<(), BoxedError>;
}

/// Waits for a visited descriptor to be ready before its group completes.
#[async_trait]
pub trait DescriptorAwaiter: Send + Sync {
    async fn await_descriptor(&self, descriptor: &LoadedDescriptor) -> Result<(), BoxedError>;
}

/// Per run collaborators and state.
struct Run<'a> {
    visitor: &'a dyn AlveolusVisitor,
    awaiter: Option<&'a dyn DescriptorAwaiter>,
    cache: &'a ArchiveCache,
    processed: Mutex<HashMap<(String, String), Arc<OnceCell<()>>>>,
}

impl Run<'_> {
    /// Completion slot of this rendered descriptor, shared by every path reaching it.
    fn slot(&self, descriptor: &LoadedDescriptor) -> Arc<OnceCell<()>> {
        self.processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((descriptor.name().to_owned(), descriptor.content.clone()))
            .or_default()
            .clone()
    }
}

pub struct Resolver {
    /// Bundles available without download, searched for alveoli and descriptors before any
    /// archive is fetched.
    local_bundles: Vec<Arc<Archive>>,
    patch_engine: PatchEngine,
    conditions: ConditionEvaluator,
}

impl Resolver {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            local_bundles: Vec::new(),
            patch_engine: PatchEngine::new(configuration.clone()),
            conditions: ConditionEvaluator::new(configuration),
        }
    }

    pub fn with_local_bundle(mut self, bundle: Archive) -> Self {
        self.local_bundles.push(Arc::new(bundle));
        self
    }

    /// Manifests of the local bundles, in registration order.
    pub fn local_manifests(&self) -> impl Iterator<Item = &Arc<Manifest>> {
        self.local_bundles
            .iter()
            .filter_map(|bundle| bundle.manifest.as_ref())
    }

    /// Resolves the alveoli a command starts from.
    ///
    /// - With a `manifest`, `alveolus` is looked up in it (`auto` selects the only alveolus of a
    ///   single alveolus manifest).
    /// - `auto` without manifest selects every alveolus of every local bundle.
    /// - Otherwise the alveolus is looked up in the bundle at `location`, or in the local bundles
    ///   when there is no location.
    #[instrument(skip(self, manifest, cache))]
    pub async fn find_root_alveoli(
        &self,
        location: Option<&str>,
        manifest: Option<Arc<Manifest>>,
        alveolus: &str,
        cache: &ArchiveCache,
        execution_id: &str,
    ) -> Result<Vec<ManifestAndAlveolus>, Error> {
        if let Some(manifest) = manifest {
            let name = match manifest.alveoli.as_slice() {
                [single] if alveolus == AUTO_ALVEOLUS => single.name.clone(),
                _ => alveolus.to_owned(),
            };
            let found = manifest
                .find_alveolus(&name)
                .cloned()
                .context(AlveolusNotFoundSnafu { name })?;
            return Ok(vec![ManifestAndAlveolus::new(manifest, found)]);
        }

        if alveolus == AUTO_ALVEOLUS {
            info!("no alveolus set, using every alveolus of the local bundles");
            return Ok(self
                .local_manifests()
                .flat_map(|manifest| {
                    manifest
                        .alveoli
                        .iter()
                        .map(move |it| ManifestAndAlveolus::new(manifest.clone(), it.clone()))
                })
                .collect());
        }

        match location.filter(|it| *it != AUTO_ALVEOLUS) {
            None => Ok(vec![self.find_local_alveolus(alveolus)?]),
            Some(location) => Ok(vec![
                self.find_archive_alveolus(location, alveolus, cache, execution_id)
                    .await?,
            ]),
        }
    }

    /// Visits `root` and, transitively, its dependencies.
    #[instrument(skip_all, fields(alveolus = %root.alveolus.name, execution_id = %execution_id))]
    pub async fn execute_on_alveolus(
        &self,
        root: &ManifestAndAlveolus,
        visitor: &dyn AlveolusVisitor,
        awaiter: Option<&dyn DescriptorAwaiter>,
        cache: &ArchiveCache,
        execution_id: &str,
    ) -> Result<(), Error> {
        let run = Run {
            visitor,
            awaiter,
            cache,
            processed: Mutex::default(),
        };
        let context =
            AlveolusContext::root(root.manifest.clone(), root.alveolus.clone(), execution_id)?;
        self.visit(&run, context).await
    }

    fn visit<'a>(
        &'a self,
        run: &'a Run<'a>,
        context: AlveolusContext,
    ) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let alveolus = context.alveolus.clone();
            info!(alveolus = %alveolus.name, "visiting alveolus");
            run.visitor
                .on_alveolus(&context)
                .await
                .with_context(|_| OnAlveolusSnafu {
                    alveolus: alveolus.name.clone(),
                })?;

            let (included_dependencies, included_descriptors) = self.included(&context);

            let dependencies = included_dependencies
                .into_iter()
                .map(|dependency| self.visit_dependency(run, &context, dependency))
                .collect::<Vec<_>>();
            if alveolus.chain_dependencies {
                chain(dependencies).await?;
            } else {
                join_all(dependencies).await?;
            }

            let selected = included_descriptors
                .into_iter()
                .map(|descriptor| self.find_descriptor(run, &context, descriptor))
                .collect::<Vec<_>>();
            let loaded = join_all(selected).await?;
            let prepared = join_all(
                loaded
                    .into_iter()
                    .map(|descriptor| self.prepare(&context, descriptor))
                    .collect::<Vec<_>>(),
            )
            .await?;

            for group in rank_descriptors(prepared) {
                let processing = group
                    .iter()
                    .map(|descriptor| self.process_descriptor(run, &context, descriptor))
                    .collect::<Vec<_>>();
                join_all(processing).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Dependencies and descriptors of the alveolus passing their `includeIf` and the exclusions.
    ///
    /// Conditions see the alveolus placeholders, as patch conditions do.
    fn included<'c>(
        &self,
        context: &'c AlveolusContext,
    ) -> (Vec<&'c AlveolusDependency>, Vec<&'c Descriptor>) {
        let _scope = PlaceholderScope::enter(context.placeholders.clone());
        let dependencies = context
            .alveolus
            .dependencies
            .iter()
            .filter(|dependency| self.conditions.test(dependency.include_if.as_ref()))
            .collect();
        let descriptors = context
            .alveolus
            .descriptors
            .iter()
            .filter(|descriptor| {
                let included = self.conditions.test(descriptor.include_if.as_ref())
                    && !context.is_excluded(descriptor);
                if !included {
                    debug!(descriptor = %descriptor.name, "descriptor excluded");
                }
                included
            })
            .collect();
        (dependencies, descriptors)
    }

    /// Patches and interpolates `descriptor` on the blocking pool, inline-file placeholders read
    /// the filesystem.
    async fn prepare(
        &self,
        context: &AlveolusContext,
        descriptor: LoadedDescriptor,
    ) -> Result<LoadedDescriptor, Error> {
        let engine = self.patch_engine.clone();
        let context = context.clone();
        let name = descriptor.name().to_owned();
        tokio::task::spawn_blocking(move || {
            engine.prepare(
                &context.alveolus,
                &descriptor,
                &context.patches,
                &context.placeholders,
                &context.execution_id,
            )
        })
        .await
        .context(JoinPreparationSnafu { descriptor: name })?
        .context(PrepareDescriptorSnafu)
    }

    async fn visit_dependency(
        &self,
        run: &Run<'_>,
        context: &AlveolusContext,
        dependency: &AlveolusDependency,
    ) -> Result<(), Error> {
        let target = match dependency.location.as_deref() {
            None => match context.manifest.find_alveolus(&dependency.name) {
                Some(found) => ManifestAndAlveolus::new(context.manifest.clone(), found.clone()),
                None => self.find_local_alveolus(&dependency.name)?,
            },
            Some(location) => {
                self.find_archive_alveolus(
                    location,
                    &dependency.name,
                    run.cache,
                    &context.execution_id,
                )
                .await?
            }
        };

        let child = context.enter(target.manifest, target.alveolus)?;
        self.visit(run, child).await
    }

    async fn process_descriptor(
        &self,
        run: &Run<'_>,
        context: &AlveolusContext,
        descriptor: &LoadedDescriptor,
    ) -> Result<(), Error> {
        let slot = run.slot(descriptor);
        let mut visited_here = false;
        slot.get_or_try_init(|| {
            visited_here = true;
            async {
                run.visitor
                    .on_descriptor(context, descriptor)
                    .await
                    .with_context(|_| OnDescriptorSnafu {
                        descriptor: descriptor.name(),
                    })?;
                if let Some(awaiter) = run.awaiter {
                    awaiter
                        .await_descriptor(descriptor)
                        .await
                        .with_context(|_| AwaitDescriptorSnafu {
                            descriptor: descriptor.name(),
                        })?;
                }
                Ok::<_, Error>(())
            }
        })
        .await?;

        if !visited_here {
            debug!(descriptor = %descriptor.name(), "descriptor already visited in this run");
        }
        Ok(())
    }

    /// Reads a descriptor from the local bundles, then from the archive at its location.
    async fn find_descriptor(
        &self,
        run: &Run<'_>,
        context: &AlveolusContext,
        descriptor: &Descriptor,
    ) -> Result<LoadedDescriptor, Error> {
        let resource = descriptor_resource(descriptor)?;

        if let Some((bundle, content)) = self.local_bundles.iter().find_map(|bundle| {
            bundle
                .descriptors
                .get(&resource)
                .map(|content| (bundle, content))
        }) {
            return Ok(LoadedDescriptor::new(
                descriptor.clone(),
                content.as_str(),
                resource.as_str(),
                format!("{}!/{resource}", bundle.location),
            ));
        }

        let location = descriptor
            .location
            .as_deref()
            .filter(|it| !it.trim().is_empty())
            .context(MissingDescriptorLocationSnafu {
                descriptor: &descriptor.name,
            })?;
        let archive = run
            .cache
            .load_archive(location, &context.execution_id)
            .await
            .context(LoadArchiveSnafu)?;
        let content = archive
            .descriptors
            .get(&resource)
            .context(DescriptorNotFoundSnafu {
                resource: &resource,
                location,
            })?;

        Ok(LoadedDescriptor::new(
            descriptor.clone(),
            content.as_str(),
            resource.as_str(),
            format!("{location}!/{resource}"),
        ))
    }

    fn find_local_alveolus(&self, name: &str) -> Result<ManifestAndAlveolus, Error> {
        self.local_manifests()
            .find_map(|manifest| {
                manifest
                    .find_alveolus(name)
                    .map(|it| ManifestAndAlveolus::new(manifest.clone(), it.clone()))
            })
            .context(AlveolusNotFoundSnafu { name })
    }

    /// Looks `name` up in the bundle at `location`.
    ///
    /// Descriptors of the returned alveolus without location get `location` so they can be
    /// downloaded from the same bundle.
    async fn find_archive_alveolus(
        &self,
        location: &str,
        name: &str,
        cache: &ArchiveCache,
        execution_id: &str,
    ) -> Result<ManifestAndAlveolus, Error> {
        let archive = cache
            .load_archive(location, execution_id)
            .await
            .context(LoadArchiveSnafu)?;
        let manifest = archive
            .manifest
            .clone()
            .context(MissingArchiveManifestSnafu { location })?;

        let mut alveolus = manifest.find_alveolus(name).cloned().with_context(|| {
            AlveolusNotInArchiveSnafu {
                name,
                location,
                available: manifest
                    .alveoli
                    .iter()
                    .map(|it| it.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            }
        })?;
        for descriptor in &mut alveolus.descriptors {
            if descriptor.location.is_none() {
                descriptor.location = Some(location.to_owned());
            }
        }

        Ok(ManifestAndAlveolus::new(manifest, alveolus))
    }
}

/// Path of a descriptor inside its bundle: `bundlebee/<type>/<name>`, `.yaml` being appended
/// when the name has no known extension.
pub fn descriptor_resource(descriptor: &Descriptor) -> Result<String, Error> {
    ensure!(
        descriptor.type_ == KUBERNETES_DESCRIPTOR_TYPE,
        UnsupportedDescriptorTypeSnafu {
            descriptor: &descriptor.name,
            type_: &descriptor.type_,
        }
    );

    let name = &descriptor.name;
    let extension = if DESCRIPTOR_EXTENSIONS
        .iter()
        .any(|extension| name.ends_with(extension))
    {
        ""
    } else {
        DESCRIPTOR_EXTENSIONS[0]
    };
    Ok(format!("bundlebee/{}/{name}{extension}", descriptor.type_))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::archive::ArchiveLoader;

    #[rstest]
    #[case::no_extension("svc", "bundlebee/kubernetes/svc.yaml")]
    #[case::yaml("svc.yaml", "bundlebee/kubernetes/svc.yaml")]
    #[case::yml("svc.yml", "bundlebee/kubernetes/svc.yml")]
    #[case::json("svc.json", "bundlebee/kubernetes/svc.json")]
    #[case::dotted("svc.v1", "bundlebee/kubernetes/svc.v1.yaml")]
    fn resource_names(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(descriptor_resource(&Descriptor::new(name)).unwrap(), expected);
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let mut descriptor = Descriptor::new("svc");
        descriptor.type_ = "helm".to_owned();

        assert!(matches!(
            descriptor_resource(&descriptor),
            Err(Error::UnsupportedDescriptorType { .. })
        ));
    }

    #[test]
    fn context_merges_inherited_values() {
        let parent = Alveolus {
            name: "parent".to_owned(),
            excluded_descriptors: vec![DescriptorRef::new("a", "*")],
            placeholders: BTreeMap::from([
                ("shared".to_owned(), "parent".to_owned()),
                ("parent.only".to_owned(), "p".to_owned()),
            ]),
            ..Default::default()
        };
        let child = Alveolus {
            name: "child".to_owned(),
            excluded_descriptors: vec![DescriptorRef::new("a", "*"), DescriptorRef::new("b", "*")],
            placeholders: BTreeMap::from([("shared".to_owned(), "child".to_owned())]),
            ..Default::default()
        };
        let manifest = Arc::new(Manifest::default());

        let root = AlveolusContext::root(manifest.clone(), parent, "run").unwrap();
        let entered = root.enter(manifest, child).unwrap();

        assert_eq!(
            entered.excludes.as_slice(),
            [DescriptorRef::new("a", "*"), DescriptorRef::new("b", "*")]
        );
        assert_eq!(entered.placeholders["shared"], "child");
        assert_eq!(entered.placeholders["parent.only"], "p");
        assert_eq!(root.placeholders["shared"], "parent");
        assert_eq!(&*entered.execution_id, "run");
    }

    struct NoArchives;

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

    fn local_resolver() -> Resolver {
        let manifest = Manifest {
            alveoli: vec![
                Alveolus {
                    name: "first".to_owned(),
                    ..Default::default()
                },
                Alveolus {
                    name: "second".to_owned(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        Resolver::new(Configuration::default().with_environment(BTreeMap::new()))
            .with_local_bundle(Archive::new("local", Some(manifest), []))
    }

    #[tokio::test]
    async fn root_alveoli_lookup() {
        let resolver = local_resolver();
        let cache = ArchiveCache::new(Arc::new(NoArchives));

        let all = resolver
            .find_root_alveoli(None, None, AUTO_ALVEOLUS, &cache, "run")
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let second = resolver
            .find_root_alveoli(None, None, "second", &cache, "run")
            .await
            .unwrap();
        assert_eq!(second[0].alveolus.name, "second");

        let single = Arc::new(Manifest {
            alveoli: vec![Alveolus {
                name: "only".to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let only = resolver
            .find_root_alveoli(None, Some(single), AUTO_ALVEOLUS, &cache, "run")
            .await
            .unwrap();
        assert_eq!(only[0].alveolus.name, "only");

        let missing = resolver
            .find_root_alveoli(None, None, "missing", &cache, "run")
            .await
            .unwrap_err();
        assert_eq!(missing.to_string(), "no alveolus named \"missing\" found");

        let unreachable = resolver
            .find_root_alveoli(Some("g:a:1"), None, "x", &cache, "run")
            .await
            .unwrap_err();
        assert!(matches!(unreachable, Error::LoadArchive { .. }));
    }
}
