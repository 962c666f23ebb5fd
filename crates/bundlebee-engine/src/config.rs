//! Configuration lookup shared by the manifest reader, the placeholder chain and the include-if
//! conditions, plus the option structs of the engine.
//!
//! Lookup order of [`Configuration::get`]:
//!
//! 1. explicit properties (highest priority),
//! 2. the placeholders of the alveolus currently being prepared, see [`PlaceholderScope`],
//! 3. the environment, first with the key as is, then upper-cased with every non-alphanumeric
//!    character replaced by `_` (`app.version` is also read from `APP_VERSION`).
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt::Debug,
    marker::PhantomData,
    sync::Arc,
};

/// Source of environment variables, injectable so tests never touch the process environment.
pub trait Environment: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Environment for BTreeMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

#[derive(Clone)]
pub struct Configuration {
    properties: BTreeMap<String, String>,
    environment: Arc<dyn Environment>,
}

impl Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            properties: BTreeMap::new(),
            environment: Arc::new(ProcessEnvironment),
        }
    }
}

impl Configuration {
    pub fn from_properties<K, V>(properties: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            properties: properties
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Environment + 'static) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    /// Resolves `key` through properties, the active placeholder scope and the environment.
    pub fn get(&self, key: &str) -> Option<String> {
        self.property(key)
            .or_else(|| PlaceholderScope::get(key))
            .or_else(|| self.env_var(key))
    }

    /// Explicit properties only.
    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.get(key).cloned()
    }

    /// Environment only, including the normalized variable name fallback.
    pub fn env_var(&self, key: &str) -> Option<String> {
        self.environment.var(key).or_else(|| {
            let normalized = normalize_env_key(key);
            (normalized != key)
                .then(|| self.environment.var(&normalized))
                .flatten()
        })
    }
}

fn normalize_env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

thread_local! {
    static ACTIVE_PLACEHOLDERS: RefCell<Option<Arc<BTreeMap<String, String>>>> =
        const { RefCell::new(None) };
}

/// Exposes the placeholders of the alveolus being prepared to configuration lookups running on
/// the current thread.
///
/// The previous scope is restored when the guard is dropped, on every exit path. The guard is
/// neither `Send` nor `Sync` and must not be held across an `.await`.
#[must_use = "the placeholder scope is left as soon as the guard is dropped"]
pub struct PlaceholderScope {
    previous: Option<Arc<BTreeMap<String, String>>>,
    _thread_bound: PhantomData<*const ()>,
}

impl PlaceholderScope {
    pub fn enter(placeholders: Arc<BTreeMap<String, String>>) -> Self {
        let previous = ACTIVE_PLACEHOLDERS.with(|active| active.replace(Some(placeholders)));
        Self {
            previous,
            _thread_bound: PhantomData,
        }
    }

    /// Value of `key` in the innermost active scope of this thread.
    pub fn get(key: &str) -> Option<String> {
        ACTIVE_PLACEHOLDERS.with(|active| {
            active
                .borrow()
                .as_ref()
                .and_then(|placeholders| placeholders.get(key).cloned())
        })
    }
}

impl Drop for PlaceholderScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE_PLACEHOLDERS.with(|active| *active.borrow_mut() = previous);
    }
}

/// Available options to configure the [`crate::awaiter::ConditionAwaiter`].
///
/// Additionally, this struct can be used as CLI arguments. This functionality is only available if
/// the feature `clap` is enabled.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwaiterOptions {
    /// Delay between two polls of the cluster while awaiting a descriptor.
    #[cfg_attr(feature = "clap", arg(
        long = "await-interval",
        env = "BUNDLEBEE_AWAIT_INTERVAL",
        default_value_t = Self::default_interval()
    ))]
    pub interval: humantime::Duration,

    /// How long a single descriptor may take to reach its await conditions.
    #[cfg_attr(feature = "clap", arg(
        long = "await-timeout",
        env = "BUNDLEBEE_AWAIT_TIMEOUT",
        default_value_t = Self::default_timeout()
    ))]
    pub timeout: humantime::Duration,
}

impl AwaiterOptions {
    fn default_interval() -> humantime::Duration {
        std::time::Duration::from_millis(500).into()
    }

    fn default_timeout() -> humantime::Duration {
        std::time::Duration::from_secs(60).into()
    }
}

impl Default for AwaiterOptions {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            timeout: Self::default_timeout(),
        }
    }
}

/// Options of the apply and delete commands.
#[cfg_attr(feature = "clap", derive(clap::Args))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Name of the root alveolus to deploy, `auto` picks it from the visible manifests.
    #[cfg_attr(feature = "clap", arg(
        long = "alveolus",
        env = "BUNDLEBEE_ALVEOLUS",
        default_value = "auto"
    ))]
    pub alveolus: String,

    /// Inject the `bundlebee.timestamp` label in applied descriptors.
    #[cfg_attr(feature = "clap", arg(
        long = "inject-timestamp",
        env = "BUNDLEBEE_INJECT_TIMESTAMP",
        default_value_t = true,
        action = clap::ArgAction::Set
    ))]
    pub inject_timestamp: bool,

    /// Inject the `bundlebee.root.alveolus.*` labels in applied descriptors.
    #[cfg_attr(feature = "clap", arg(
        long = "inject-bundlebee-metadata",
        env = "BUNDLEBEE_INJECT_METADATA",
        default_value_t = true,
        action = clap::ArgAction::Set
    ))]
    pub inject_metadata: bool,

    /// Comma separated descriptor names to skip, `none` disables it.
    #[cfg_attr(feature = "clap", arg(
        long = "excluded-descriptors",
        env = "BUNDLEBEE_EXCLUDED_DESCRIPTORS",
        default_value = "none"
    ))]
    pub excluded_descriptors: String,

    /// Comma separated descriptor locations to skip, `none` disables it.
    #[cfg_attr(feature = "clap", arg(
        long = "excluded-locations",
        env = "BUNDLEBEE_EXCLUDED_LOCATIONS",
        default_value = "none"
    ))]
    pub excluded_locations: String,

    /// Only render and send dry-run requests, nothing is persisted in the cluster.
    #[cfg_attr(feature = "clap", arg(long = "dry-run", env = "BUNDLEBEE_DRY_RUN"))]
    pub dry_run: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            alveolus: crate::resolver::AUTO_ALVEOLUS.to_owned(),
            inject_timestamp: true,
            inject_metadata: true,
            excluded_descriptors: "none".to_owned(),
            excluded_locations: "none".to_owned(),
            dry_run: false,
        }
    }
}
