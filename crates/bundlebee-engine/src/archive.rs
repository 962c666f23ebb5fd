//! Bundles (archives) providing manifests and descriptor files.
//!
//! A bundle contains `bundlebee/manifest.json` and descriptor files under
//! `bundlebee/<type>/`. [`ArchiveCache`] memoizes loaded bundles per location for a run.
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument};

use crate::{config::Configuration, manifest, manifest::Manifest, substitutor::BoxedError};

pub const MANIFEST_RESOURCE: &str = "bundlebee/manifest.json";
const BUNDLE_ROOT: &str = "bundlebee";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load archive {location:?}"))]
    LoadArchive {
        source: BoxedError,
        location: String,
    },

    #[snafu(display("failed to read bundle file {path:?}"))]
    ReadBundle {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read manifest of bundle {path:?}"))]
    ReadManifest {
        source: manifest::Error,
        path: PathBuf,
    },
}

/// An opened bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Archive {
    /// Location (coordinates or path) the bundle was loaded from.
    pub location: String,

    /// `None` when the bundle only ships descriptors.
    pub manifest: Option<Arc<Manifest>>,

    /// Descriptor contents keyed by their path in the bundle (`bundlebee/kubernetes/svc.yaml`).
    pub descriptors: BTreeMap<String, String>,
}

impl Archive {
    pub fn new(
        location: impl Into<String>,
        manifest: Option<Manifest>,
        descriptors: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            location: location.into(),
            manifest: manifest.map(Arc::new),
            descriptors: descriptors.into_iter().collect(),
        }
    }

    /// Reads an exploded bundle, `directory` being the folder containing `bundlebee/`.
    pub async fn from_directory(
        location: &str,
        directory: &Path,
        configuration: &Configuration,
    ) -> Result<Self, Error> {
        let mut manifest = None;
        let mut descriptors = BTreeMap::new();

        let mut pending = vec![directory.join(BUNDLE_ROOT)];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current)
                .await
                .context(ReadBundleSnafu { path: &current })?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .context(ReadBundleSnafu { path: &current })?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .context(ReadBundleSnafu { path: &path })?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Some(resource) = resource_name(directory, &path) else {
                    continue;
                };
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .context(ReadBundleSnafu { path: &path })?;
                if resource == MANIFEST_RESOURCE {
                    manifest = Some(
                        Manifest::from_json_str(&content, configuration)
                            .context(ReadManifestSnafu { path: &path })?,
                    );
                } else {
                    descriptors.insert(resource, content);
                }
            }
        }

        debug!(
            location,
            descriptors = descriptors.len(),
            has_manifest = manifest.is_some(),
            "read bundle directory"
        );
        Ok(Self::new(location, manifest, descriptors))
    }
}

/// `/`-separated path of `path` relative to `root`.
fn resource_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(segments.join("/"))
}

/// Source of remote bundles, usually backed by an artifact repository.
#[async_trait]
pub trait ArchiveLoader: Send + Sync {
    async fn load_archive(&self, location: &str, execution_id: &str)
    -> Result<Archive, BoxedError>;
}

/// Reads exploded bundles from a local directory.
///
/// `group:artifact:version` coordinates map to `<root>/<group with dots as slashes>/<artifact>/<version>`,
/// any other location is taken as a path relative to the root.
#[derive(Clone, Debug)]
pub struct DirectoryArchiveLoader {
    root: PathBuf,
    configuration: Configuration,
}

impl DirectoryArchiveLoader {
    pub fn new(root: impl Into<PathBuf>, configuration: Configuration) -> Self {
        Self {
            root: root.into(),
            configuration,
        }
    }

    fn directory_of(&self, location: &str) -> PathBuf {
        let mut segments = location.split(':');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(group), Some(artifact), Some(version), None) => self
                .root
                .join(group.replace('.', "/"))
                .join(artifact)
                .join(version),
            _ => self.root.join(location),
        }
    }
}

#[async_trait]
impl ArchiveLoader for DirectoryArchiveLoader {
    async fn load_archive(
        &self,
        location: &str,
        _execution_id: &str,
    ) -> Result<Archive, BoxedError> {
        let directory = self.directory_of(location);
        Ok(Archive::from_directory(location, &directory, &self.configuration).await?)
    }
}

/// Memoizes bundles per location for one run.
///
/// Concurrent callers asking for the same location share a single load. Failed loads are not
/// memoized, the next caller retries.
pub struct ArchiveCache {
    loader: Arc<dyn ArchiveLoader>,
    archives: Mutex<HashMap<String, Arc<OnceCell<Arc<Archive>>>>>,
}

impl ArchiveCache {
    pub fn new(loader: Arc<dyn ArchiveLoader>) -> Self {
        Self {
            loader,
            archives: Mutex::default(),
        }
    }

    #[instrument(skip(self))]
    pub async fn load_archive(
        &self,
        location: &str,
        execution_id: &str,
    ) -> Result<Arc<Archive>, Error> {
        let cell = self
            .archives
            .lock()
            .await
            .entry(location.to_owned())
            .or_default()
            .clone();

        cell.get_or_try_init(|| async {
            debug!("loading archive");
            self.loader
                .load_archive(location, execution_id)
                .await
                .map(Arc::new)
                .context(LoadArchiveSnafu { location })
        })
        .await
        .cloned()
    }
}
