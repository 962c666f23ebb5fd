use std::sync::Arc;

use regex::Regex;
use snafu::{ResultExt, Snafu};

use crate::manifest::{Patch, WILDCARD};

const REGEX_PREFIX: &str = "regex:";

#[derive(Debug, Snafu)]
pub enum PredicateError {
    #[snafu(display("invalid descriptor name pattern {pattern:?}"))]
    InvalidPattern {
        source: regex::Error,
        pattern: String,
    },
}

/// Descriptor name matcher of a [`Patch`], compiled once when the patch is merged.
#[derive(Clone, Debug)]
pub enum PatchPredicate {
    Any,
    Exact(String),
    Regex(Regex),
}

impl PatchPredicate {
    /// `*` matches everything, a name containing `*` is used as a regular expression as is and a
    /// `regex:` prefix forces regular expression mode. Anything else is an exact match.
    ///
    /// Regular expressions must match the whole name.
    pub fn compile(descriptor_name: &str) -> Result<Self, PredicateError> {
        if descriptor_name == WILDCARD {
            return Ok(Self::Any);
        }
        let pattern = match descriptor_name.strip_prefix(REGEX_PREFIX) {
            Some(pattern) => pattern,
            None if descriptor_name.contains(WILDCARD) => descriptor_name,
            None => return Ok(Self::Exact(descriptor_name.to_owned())),
        };
        Regex::new(&format!("^(?:{pattern})$"))
            .map(Self::Regex)
            .context(InvalidPatternSnafu { pattern })
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == name,
            Self::Regex(regex) => regex.is_match(name),
        }
    }
}

#[derive(Debug)]
struct CompiledPatch {
    predicate: PatchPredicate,
    patch: Patch,
}

/// Patches accumulated along an alveolus chain, in application order.
///
/// Inherited patches come first. A patch structurally equal to one already in the set is not added
/// twice, distinct patches targeting the same descriptor all apply.
#[derive(Clone, Debug, Default)]
pub struct PatchSet {
    patches: Vec<Arc<CompiledPatch>>,
}

impl PatchSet {
    /// Returns a new set with `patches` appended, `self` is left untouched.
    pub fn merge(&self, patches: &[Patch]) -> Result<Self, PredicateError> {
        let mut merged = self.patches.clone();
        for patch in patches {
            if merged.iter().any(|existing| existing.patch == *patch) {
                continue;
            }
            merged.push(Arc::new(CompiledPatch {
                predicate: PatchPredicate::compile(&patch.descriptor_name)?,
                patch: patch.clone(),
            }));
        }
        Ok(Self { patches: merged })
    }

    /// Patches targeting a descriptor, matched on its name or its name with extension.
    pub fn matching<'a>(
        &'a self,
        name: &'a str,
        extension: &str,
    ) -> impl Iterator<Item = &'a Patch> + use<'a> {
        let with_extension = format!("{name}.{extension}");
        self.patches
            .iter()
            .filter(move |compiled| {
                compiled.predicate.matches(name) || compiled.predicate.matches(&with_extension)
            })
            .map(|compiled| &compiled.patch)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}
