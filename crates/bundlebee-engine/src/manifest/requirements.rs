use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

/// The engine version manifests are checked against.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum RequirementError {
    #[snafu(display("invalid bundlebee version {actual:?}, expected at least {minimum:?}"))]
    VersionTooOld { actual: String, minimum: String },

    #[snafu(display("invalid bundlebee version {actual:?}, expected at most {maximum:?}"))]
    VersionTooRecent { actual: String, maximum: String },

    #[snafu(display("invalid bundlebee version {actual:?}, forbidden versions are {forbidden:?}"))]
    ForbiddenVersion {
        actual: String,
        forbidden: Vec<String>,
    },
}

/// Version gate of a manifest.
///
/// Versions are compared segment by segment (dot separated), a `*` segment matches anything and
/// a `-SNAPSHOT` suffix is ignored.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_bundlebee_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bundlebee_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_versions: Vec<String>,
}

impl Requirement {
    pub fn check(&self, actual: &str) -> Result<(), RequirementError> {
        if let Some(minimum) = non_blank(self.min_bundlebee_version.as_deref()) {
            ensure!(
                compare(minimum, actual, Expectation::AtMostActual),
                VersionTooOldSnafu { actual, minimum }
            );
        }
        if let Some(maximum) = non_blank(self.max_bundlebee_version.as_deref()) {
            ensure!(
                compare(maximum, actual, Expectation::AtLeastActual),
                VersionTooRecentSnafu { actual, maximum }
            );
        }
        for forbidden in &self.forbidden_versions {
            ensure!(
                !compare(forbidden, actual, Expectation::Equal),
                ForbiddenVersionSnafu {
                    actual,
                    forbidden: self.forbidden_versions.clone(),
                }
            );
        }
        Ok(())
    }
}

impl super::Manifest {
    /// Checks every requirement of this manifest against `actual`, usually [`ENGINE_VERSION`].
    pub fn check_requirements(&self, actual: &str) -> Result<(), RequirementError> {
        self.requirements
            .iter()
            .try_for_each(|requirement| requirement.check(actual))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|it| !it.trim().is_empty())
}

#[derive(Clone, Copy)]
enum Expectation {
    /// The expected version must be lower than or equal to the actual one.
    AtMostActual,
    /// The expected version must be greater than or equal to the actual one.
    AtLeastActual,
    Equal,
}

fn compare(expected: &str, actual: &str, expectation: Expectation) -> bool {
    let expected = expected.strip_suffix(SNAPSHOT_SUFFIX).unwrap_or(expected);
    let actual = actual.strip_suffix(SNAPSHOT_SUFFIX).unwrap_or(actual);
    let expected_segments = expected.split('.').collect::<Vec<_>>();
    let actual_segments = actual.split('.').collect::<Vec<_>>();

    for (expected, actual) in expected_segments.iter().zip(&actual_segments) {
        if *expected == "*" || expected == actual {
            continue;
        }
        let (Ok(expected), Ok(actual)) = (expected.parse::<i64>(), actual.parse::<i64>()) else {
            return false;
        };
        return match expectation {
            Expectation::Equal => false,
            Expectation::AtMostActual => expected < actual,
            Expectation::AtLeastActual => expected > actual,
        };
    }

    // Missing trailing segments of the expected version act as wildcards
    expected_segments.len() <= actual_segments.len()
}
