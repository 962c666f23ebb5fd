//! Patch and interpolation pipeline run on every loaded descriptor before it is handed to the
//! descriptor hook.
use std::{collections::BTreeMap, sync::Arc};

use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    condition::ConditionEvaluator,
    config::{Configuration, PlaceholderScope},
    manifest::{Alveolus, Descriptor},
    placeholders::DescriptorPlaceholders,
    substitutor, yaml,
};

mod predicate;

pub use predicate::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to interpolate descriptor {descriptor:?}"))]
    Interpolate {
        source: substitutor::Error,
        descriptor: String,
    },

    #[snafu(display("failed to parse patch {patch:?} of descriptor {descriptor:?}"))]
    ParsePatch {
        source: serde_json::Error,
        descriptor: String,
        patch: String,
    },

    #[snafu(display("failed to read descriptor {descriptor:?} as JSON"))]
    NormalizeDescriptor {
        source: yaml::Error,
        descriptor: String,
    },

    #[snafu(display("failed to apply patch {patch:?} on descriptor {descriptor:?}"))]
    ApplyPatch {
        source: json_patch::PatchError,
        descriptor: String,
        patch: String,
    },
}

/// A descriptor with its raw content, as fetched (or as produced by [`PatchEngine::prepare`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedDescriptor {
    pub descriptor: Descriptor,
    pub content: String,

    /// `yaml` or `json`.
    pub extension: String,

    /// Where the content was read from, for diagnostics.
    pub uri: String,

    /// Path of the descriptor inside its bundle, `bundlebee/<type>/<file>`.
    pub resource: String,
}

impl LoadedDescriptor {
    pub fn new(
        descriptor: Descriptor,
        content: impl Into<String>,
        resource: impl Into<String>,
        uri: impl Into<String>,
    ) -> Self {
        let resource = resource.into();
        Self {
            descriptor,
            content: content.into(),
            extension: yaml::extension_of(&resource),
            uri: uri.into(),
            resource,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn with_content(&self, content: String, extension: String) -> Self {
        Self {
            content,
            extension,
            ..self.clone()
        }
    }
}

/// Applies the accumulated patches of an alveolus chain and interpolates descriptors.
#[derive(Clone, Debug, Default)]
pub struct PatchEngine {
    configuration: Configuration,
    conditions: ConditionEvaluator,
}

impl PatchEngine {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            conditions: ConditionEvaluator::new(configuration.clone()),
            configuration,
        }
    }

    /// Produces the final content of `loaded`, the input is left untouched.
    ///
    /// The placeholders are exposed through [`PlaceholderScope`] for the duration of the call so
    /// include-if conditions and configuration lookups see them too.
    #[instrument(skip_all, fields(descriptor = %loaded.name(), alveolus = %alveolus.name))]
    pub fn prepare(
        &self,
        alveolus: &Alveolus,
        loaded: &LoadedDescriptor,
        patches: &PatchSet,
        placeholders: &Arc<BTreeMap<String, String>>,
        execution_id: &str,
    ) -> Result<LoadedDescriptor, Error> {
        let _scope = PlaceholderScope::enter(placeholders.clone());
        let name = loaded.name();
        let lookup = DescriptorPlaceholders {
            configuration: &self.configuration,
            placeholders,
            execution_id,
            alveolus,
            descriptor_name: name,
        };
        let interpolate = |content: &str| {
            substitutor::replace(content, &lookup).context(InterpolateSnafu { descriptor: name })
        };

        let mut content = loaded.content.clone();
        let mut extension = loaded.extension.clone();
        let mut interpolated = false;
        let mut forced_interpolation = false;

        for patch in patches.matching(name, &loaded.extension) {
            if patch.interpolate {
                content = interpolate(&content)?;
                interpolated = true;
            }
            if !self.conditions.test(patch.include_if.as_ref()) {
                debug!(target = %patch.descriptor_name, "patch skipped by its includeIf");
                continue;
            }
            let Some(body) = &patch.patch else {
                continue;
            };

            let operations = parse_patch(body, patch.interpolate, name, &interpolate)?;
            content = match apply_patch(&content, &extension, &operations, name) {
                Ok(patched) => patched,
                Err(error) if !interpolated => {
                    debug!(%error, "patch failed on raw content, retrying on interpolated content");
                    content = interpolate(&content)?;
                    interpolated = true;
                    forced_interpolation = true;
                    apply_patch(&content, &extension, &operations, name)?
                }
                Err(error) => return Err(error),
            };
            extension = yaml::JSON_EXTENSION.to_owned();
        }

        if loaded.descriptor.interpolate && !forced_interpolation {
            content = interpolate(&content)?;
        }

        Ok(loaded.with_content(content, extension))
    }
}

fn parse_patch(
    body: &serde_json::Value,
    interpolate_body: bool,
    descriptor: &str,
    interpolate: &dyn Fn(&str) -> Result<String, Error>,
) -> Result<json_patch::Patch, Error> {
    let text = body.to_string();
    let text = if interpolate_body {
        interpolate(&text)?
    } else {
        text
    };
    serde_json::from_str(&text).context(ParsePatchSnafu {
        descriptor,
        patch: text.clone(),
    })
}

fn apply_patch(
    content: &str,
    extension: &str,
    operations: &json_patch::Patch,
    descriptor: &str,
) -> Result<String, Error> {
    let mut document =
        yaml::to_json(content, extension).context(NormalizeDescriptorSnafu { descriptor })?;
    json_patch::patch(&mut document, operations).with_context(|_| ApplyPatchSnafu {
        descriptor,
        patch: serde_json::to_string(operations).unwrap_or_default(),
    })?;
    yaml::to_json_string(&document).context(NormalizeDescriptorSnafu { descriptor })
}
