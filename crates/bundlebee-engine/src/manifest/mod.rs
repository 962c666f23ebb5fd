//! The manifest data model: alveoli, their descriptors, dependencies, patches and the
//! conditions gating them.
//!
//! All structs (de)serialize from the camelCase JSON layout of `bundlebee/manifest.json`.
use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{config::Configuration, substitutor};

mod requirements;

pub use requirements::*;

/// The only descriptor type the engine knows how to load.
pub const KUBERNETES_DESCRIPTOR_TYPE: &str = "kubernetes";

/// Marker used in exclusion lists and [`DescriptorRef`]s to match anything.
pub const WILDCARD: &str = "*";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to interpolate manifest"))]
    InterpolateManifest { source: substitutor::Error },

    #[snafu(display("failed to parse manifest JSON"))]
    ParseManifest { source: serde_json::Error },
}

/// Top level document, listing the alveoli a bundle provides.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Version gates which must pass before anything in this manifest is executed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,

    /// List of described applications/libraries.
    ///
    /// Names are expected to be unique but this is a convention, the first match wins on lookup.
    #[serde(default)]
    pub alveoli: Vec<Alveolus>,
}

impl Manifest {
    /// Reads a manifest from its JSON text.
    ///
    /// The raw text is interpolated against `configuration` before being parsed, unknown
    /// placeholders without default keep their bare key.
    pub fn from_json_str(text: &str, configuration: &Configuration) -> Result<Self, Error> {
        let lookup = |key: &str, _default: Option<&str>| -> Result<_, substitutor::BoxedError> {
            Ok(configuration.get(key))
        };
        let interpolated =
            substitutor::replace(text, &lookup).context(InterpolateManifestSnafu)?;
        serde_json::from_str(&interpolated).context(ParseManifestSnafu)
    }

    /// Returns the first alveolus named `name`.
    pub fn find_alveolus(&self, name: &str) -> Option<&Alveolus> {
        self.alveoli.iter().find(|alveolus| alveolus.name == name)
    }
}

/// A deployable unit: a set of descriptors plus dependencies on other alveoli.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Alveolus {
    /// Name of the alveolus, conventionally `<groupId>:<artifactId>:<version>`.
    pub name: String,

    /// Explicit version, used in priority over the one deduced from the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Descriptors to install for this alveolus, in declaration (and application) order.
    #[serde(default)]
    pub descriptors: Vec<Descriptor>,

    /// Alveoli to install (transitively) before the descriptors of this one.
    #[serde(default)]
    pub dependencies: Vec<AlveolusDependency>,

    /// Descriptors to skip, inherited by every dependency.
    #[serde(default)]
    pub excluded_descriptors: Vec<DescriptorRef>,

    /// Patches applied on matching descriptors, including transitive ones.
    #[serde(default)]
    pub patches: Vec<Patch>,

    /// Placeholder values visible to this alveolus and its dependencies.
    #[serde(default)]
    pub placeholders: BTreeMap<String, String>,

    /// If `true`, dependencies are executed one after the other instead of concurrently.
    #[serde(default)]
    pub chain_dependencies: bool,
}

impl Alveolus {
    /// The explicit version if set, otherwise the last segment of a
    /// `<groupId>:<artifactId>:<version>` name.
    pub fn resolved_version(&self) -> Option<&str> {
        if let Some(version) = self.version.as_deref() {
            return Some(version);
        }
        let mut segments = self.name.split(':');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(_), Some(version), None) if !version.is_empty() => Some(version),
            _ => None,
        }
    }
}

/// Reference to another alveolus.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AlveolusDependency {
    /// Alveolus name.
    pub name: String,

    /// Artifact coordinates of the archive providing the alveolus.
    ///
    /// When absent the alveolus is looked up in the same manifest first, then in the other
    /// manifests visible to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Only follow this dependency if the conditions pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_if: Option<Conditions>,
}

/// One Kubernetes resource definition (file) belonging to an alveolus.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Type of the descriptor, it selects the `bundlebee/<type>/` folder it is read from.
    #[serde(rename = "type", default = "default_descriptor_type")]
    pub type_: String,

    /// Name of the descriptor, the `.yaml` extension can be omitted.
    pub name: String,

    /// Archive to download to get the descriptor if it is not available locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Closes an ordering barrier: following descriptors wait until this one exists and its
    /// await conditions are met.
    #[serde(rename = "await", default)]
    pub await_: bool,

    #[serde(default)]
    pub await_conditions: Vec<AwaitConditions>,

    /// Interpolate the descriptor once patched.
    #[serde(default)]
    pub interpolate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_if: Option<Conditions>,
}

fn default_descriptor_type() -> String {
    KUBERNETES_DESCRIPTOR_TYPE.to_owned()
}

impl Descriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            type_: default_descriptor_type(),
            name: name.into(),
            location: None,
            await_: false,
            await_conditions: Vec::new(),
            interpolate: false,
            include_if: None,
        }
    }
}

/// A `(name, location)` pair used for exclusions.
///
/// A missing field or [`WILDCARD`] matches anything.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl DescriptorRef {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            location: Some(location.into()),
        }
    }

    /// Whether this reference matches the given descriptor.
    pub fn matches(&self, descriptor: &Descriptor) -> bool {
        fn matches(expected: Option<&str>, actual: Option<&str>) -> bool {
            match expected {
                None | Some(WILDCARD) => true,
                Some(expected) => Some(expected) == actual,
            }
        }

        matches(self.name.as_deref(), Some(&descriptor.name))
            && matches(self.location.as_deref(), descriptor.location.as_deref())
    }
}

/// A JSON-Patch targeting descriptors by name.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// Target descriptor: an exact name, `*`, a pattern containing `*` or a `regex:` prefixed
    /// regular expression.
    pub descriptor_name: String,

    /// Interpolate the descriptor before patching it, and the patch itself.
    #[serde(default)]
    pub interpolate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_if: Option<Conditions>,

    /// RFC 6902 document (a JSON array of operations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOperator {
    /// Every condition must be true.
    #[default]
    All,

    /// At least one condition must be true.
    Any,
}

/// A set of boolean conditions, see [`crate::condition::ConditionEvaluator`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    #[serde(default)]
    pub operator: ConditionOperator,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    /// Read the key from the process environment.
    #[default]
    Env,

    /// Read the key from the engine configuration properties.
    SystemProperty,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type", default)]
    pub type_: ConditionType,

    /// A blank key makes the condition always true (before negation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Expected value, `"true"` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default)]
    pub negate: bool,
}

/// A group of readiness conditions evaluated against the live resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AwaitConditions {
    /// Command this group applies to, `apply` when unset (compared case-insensitively).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub operator: ConditionOperator,

    #[serde(default)]
    pub conditions: Vec<AwaitCondition>,
}

impl AwaitConditions {
    pub fn applies_to(&self, command: &str) -> bool {
        self.command
            .as_deref()
            .unwrap_or("apply")
            .eq_ignore_ascii_case(command)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AwaitCondition {
    /// Compares the value at a JSON-Pointer of the resource.
    #[serde(rename_all = "camelCase")]
    JsonPointer {
        pointer: String,

        #[serde(default)]
        operator_type: JsonPointerOperator,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// Matches an entry of `/status/conditions` by `type` and `status`.
    #[serde(rename_all = "camelCase")]
    StatusCondition {
        condition_type: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

impl Display for AwaitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::JsonPointer {
                pointer,
                operator_type,
                value,
            } => write!(
                f,
                "JSON_POINTER {pointer} {operator_type} {value}",
                value = value.as_deref().unwrap_or_default()
            ),
            Self::StatusCondition {
                condition_type,
                value,
            } => write!(
                f,
                "STATUS_CONDITION {condition_type}={value}",
                value = value.as_deref().unwrap_or_default()
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JsonPointerOperator {
    Exists,
    Missing,
    #[default]
    Equals,
    NotEquals,
    EqualsIgnoreCase,
    NotEqualsIgnoreCase,
    Contains,
}

/// An alveolus together with the manifest declaring it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestAndAlveolus {
    pub manifest: Arc<Manifest>,
    pub alveolus: Alveolus,
}

impl ManifestAndAlveolus {
    pub fn new(manifest: Arc<Manifest>, alveolus: Alveolus) -> Self {
        Self { manifest, alveolus }
    }

    /// Returns a copy of this alveolus with extra exclusions.
    ///
    /// Both inputs are comma separated lists, `none` disables them. Excluded descriptors match any
    /// location and excluded locations match any descriptor name.
    pub fn exclude(&self, excluded_locations: &str, excluded_descriptors: &str) -> Self {
        if excluded_locations == "none" && excluded_descriptors == "none" {
            return self.clone();
        }

        let mut alveolus = self.alveolus.clone();
        if excluded_descriptors != "none" {
            alveolus.excluded_descriptors.extend(
                split_list(excluded_descriptors).map(|name| DescriptorRef::new(name, WILDCARD)),
            );
        }
        if excluded_locations != "none" {
            alveolus.excluded_descriptors.extend(
                split_list(excluded_locations)
                    .map(|location| DescriptorRef::new(WILDCARD, location)),
            );
        }

        Self::new(self.manifest.clone(), alveolus)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|it| !it.is_empty())
}
