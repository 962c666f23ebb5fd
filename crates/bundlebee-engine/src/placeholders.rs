//! Lookup chain used to interpolate descriptors and patches.
//!
//! Resolution order: built-in keys, explicit configuration properties, the placeholders
//! accumulated along the alveolus chain, then the environment.
//!
//! `date:<pattern>` formats the current local time with a `java.time` `DateTimeFormatter`
//! pattern, translated to `strftime` by [`date_pattern_to_strftime`]:
//!
//! | Pattern | strftime | | Pattern | strftime |
//! |---|---|---|---|---|
//! | `yyyy`, `uuuu` | `%Y` | | `HH` / `H` | `%H` / `%-H` |
//! | `yy` | `%y` | | `hh` / `h` | `%I` / `%-I` |
//! | `MM` / `M` | `%m` / `%-m` | | `mm` / `m` | `%M` / `%-M` |
//! | `MMM` / `MMMM` | `%b` / `%B` | | `ss` / `s` | `%S` / `%-S` |
//! | `dd` / `d` | `%d` / `%-d` | | `S` to `SSSSSSSSS` | `%1f` to `%9f` |
//! | `D` / `DDD` | `%-j` / `%j` | | `a` | `%p` |
//! | `EEE` / `EEEE` | `%a` / `%A` | | `Z`, `X`, `XX` | `%z` |
//! | `z` | `%Z` | | `ZZZZZ`, `XXX` | `%:z` |
//! | `VV` | `%Q` | | `'text'`, `''` | literal text, `'` |
//!
//! Other letters are rejected, so a `{{date:...:-default}}` placeholder falls back to its default.
use std::{collections::BTreeMap, path::Path};

use jiff::{Timestamp, Zoned};
use snafu::Snafu;

use crate::{
    config::Configuration,
    manifest::Alveolus,
    substitutor::{BoxedError, Lookup},
};

pub const EXECUTION_ID: &str = "executionId";
pub const DESCRIPTOR_NAME: &str = "descriptor.name";
pub const ALVEOLUS_NAME: &str = "alveolus.name";
pub const ALVEOLUS_VERSION: &str = "alveolus.version";
pub const TIMESTAMP: &str = "timestamp";
pub const TIMESTAMP_SECONDS: &str = "timestampSec";
pub const NOW: &str = "now";
pub const NOW_UTC: &str = "nowUTC";

const DATE_PREFIX: &str = "date:";
const INLINE_FILE_PREFIX: &str = "bundlebee-inline-file:";
const QUOTE_ESCAPED_INLINE_FILE_PREFIX: &str = "bundlebee-quote-escaped-inline-file:";
const JSON_INLINE_FILE_PREFIX: &str = "bundlebee-json-inline-file:";

/// Placeholder values visible while preparing one descriptor.
pub struct DescriptorPlaceholders<'a> {
    pub configuration: &'a Configuration,
    pub placeholders: &'a BTreeMap<String, String>,
    pub execution_id: &'a str,
    pub alveolus: &'a Alveolus,
    pub descriptor_name: &'a str,
}

impl DescriptorPlaceholders<'_> {
    fn builtin(&self, key: &str) -> Result<Option<String>, BoxedError> {
        if let Some(pattern) = key.strip_prefix(DATE_PREFIX) {
            let format = date_pattern_to_strftime(pattern)?;
            return Ok(Some(jiff::fmt::strtime::format(format, &Zoned::now())?));
        }
        if let Some(path) = key.strip_prefix(INLINE_FILE_PREFIX) {
            return read_file(path);
        }
        if let Some(path) = key.strip_prefix(QUOTE_ESCAPED_INLINE_FILE_PREFIX) {
            return Ok(read_file(path)?.map(|content| {
                content.replace('"', "\\\"").replace('\n', "\\\\n")
            }));
        }
        if let Some(path) = key.strip_prefix(JSON_INLINE_FILE_PREFIX) {
            let Some(content) = read_file(path)? else {
                return Ok(None);
            };
            let quoted = serde_json::to_string(&content)?;
            return Ok(quoted
                .strip_prefix('"')
                .and_then(|it| it.strip_suffix('"'))
                .map(ToOwned::to_owned));
        }

        Ok(match key {
            EXECUTION_ID => Some(self.execution_id.to_owned()),
            DESCRIPTOR_NAME => Some(self.descriptor_name.to_owned()),
            ALVEOLUS_NAME => Some(self.alveolus.name.clone()),
            ALVEOLUS_VERSION => self.alveolus.resolved_version().map(ToOwned::to_owned),
            TIMESTAMP => Some(Timestamp::now().as_millisecond().to_string()),
            TIMESTAMP_SECONDS => Some(Timestamp::now().as_second().to_string()),
            NOW => {
                let now = Zoned::now();
                Some(now.timestamp().display_with_offset(now.offset()).to_string())
            }
            NOW_UTC => Some(Timestamp::now().to_string()),
            _ => None,
        })
    }
}

impl Lookup for DescriptorPlaceholders<'_> {
    fn lookup(&self, key: &str, _default: Option<&str>) -> Result<Option<String>, BoxedError> {
        if let Some(value) = self.builtin(key)? {
            return Ok(Some(value));
        }
        Ok(self
            .configuration
            .property(key)
            .or_else(|| self.placeholders.get(key).cloned())
            .or_else(|| self.configuration.env_var(key)))
    }
}

/// Reads a file to inline, a missing file is an unknown placeholder.
fn read_file(path: &str) -> Result<Option<String>, BoxedError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::debug!(path = %path.display(), "inline file not found");
        return Ok(None);
    }
    Ok(Some(std::fs::read_to_string(path)?))
}

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum DatePatternError {
    #[snafu(display("unsupported date pattern field {field:?}"))]
    UnsupportedField { field: String },

    #[snafu(display("unterminated quote in date pattern"))]
    UnterminatedQuote,
}

/// Translates a `DateTimeFormatter` pattern into a `strftime` format, see the module docs.
pub fn date_pattern_to_strftime(pattern: &str) -> Result<String, DatePatternError> {
    let chars = pattern.chars().collect::<Vec<_>>();
    let mut output = String::with_capacity(pattern.len());
    let mut index = 0;
    while let Some(&current) = chars.get(index) {
        if current == '\'' {
            index += 1;
            if chars.get(index) == Some(&'\'') {
                output.push('\'');
                index += 1;
                continue;
            }
            loop {
                match chars.get(index) {
                    None => return UnterminatedQuoteSnafu.fail(),
                    Some('\'') if chars.get(index + 1) == Some(&'\'') => {
                        output.push('\'');
                        index += 2;
                    }
                    Some('\'') => {
                        index += 1;
                        break;
                    }
                    Some(literal) => {
                        push_literal(&mut output, *literal);
                        index += 1;
                    }
                }
            }
        } else if current.is_ascii_alphabetic() {
            let count = chars[index..].iter().take_while(|it| **it == current).count();
            output.push_str(&strftime_field(current, count)?);
            index += count;
        } else {
            push_literal(&mut output, current);
            index += 1;
        }
    }
    Ok(output)
}

fn push_literal(output: &mut String, literal: char) {
    if literal == '%' {
        output.push_str("%%");
    } else {
        output.push(literal);
    }
}

fn strftime_field(letter: char, count: usize) -> Result<String, DatePatternError> {
    let field = match (letter, count) {
        ('y' | 'u', 2) => "%y",
        ('y' | 'u', _) => "%Y",
        ('M' | 'L', 1) => "%-m",
        ('M' | 'L', 2) => "%m",
        ('M' | 'L', 3) => "%b",
        ('M' | 'L', _) => "%B",
        ('d', 1) => "%-d",
        ('d', 2) => "%d",
        ('D', 1) => "%-j",
        ('D', 3) => "%j",
        ('H', 1) => "%-H",
        ('H', 2) => "%H",
        ('h', 1) => "%-I",
        ('h', 2) => "%I",
        ('m', 1) => "%-M",
        ('m', 2) => "%M",
        ('s', 1) => "%-S",
        ('s', 2) => "%S",
        ('S', 1..=9) => return Ok(format!("%{count}f")),
        ('a', 1) => "%p",
        ('E', 1..=3) => "%a",
        ('E', 4) => "%A",
        ('Z', 1..=3) | ('X', 1 | 2) => "%z",
        ('Z', 5) | ('X', 3) => "%:z",
        ('z', 1..=3) => "%Z",
        ('V', 2) => "%Q",
        _ => {
            return UnsupportedFieldSnafu {
                field: letter.to_string().repeat(count),
            }
            .fail();
        }
    };
    Ok(field.to_owned())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rstest::rstest;

    use super::*;
    use crate::substitutor;

    fn alveolus() -> Alveolus {
        Alveolus {
            name: "com.company:app:1.2.3".to_owned(),
            ..Default::default()
        }
    }

    fn render(template: &str, configuration: &Configuration) -> String {
        let alveolus = alveolus();
        let placeholders = BTreeMap::from([
            ("replicas".to_owned(), "3".to_owned()),
            ("overridden".to_owned(), "from-alveolus".to_owned()),
        ]);
        let lookup = DescriptorPlaceholders {
            configuration,
            placeholders: &placeholders,
            execution_id: "run-1",
            alveolus: &alveolus,
            descriptor_name: "svc",
        };
        substitutor::replace(template, &lookup).unwrap()
    }

    #[rstest]
    #[case::execution_id("{{executionId}}", "run-1")]
    #[case::descriptor_name("{{descriptor.name}}", "svc")]
    #[case::alveolus_name("{{alveolus.name}}", "com.company:app:1.2.3")]
    #[case::alveolus_version("{{alveolus.version}}", "1.2.3")]
    #[case::alveolus_placeholder("{{replicas}}", "3")]
    #[case::property_wins("{{overridden}}", "from-properties")]
    #[case::environment("{{env.only}}", "from-env")]
    #[case::unknown("{{unknown:-fallback}}", "fallback")]
    fn resolution_order(#[case] template: &str, #[case] expected: &str) {
        let configuration = Configuration::from_properties([("overridden", "from-properties")])
            .with_environment(BTreeMap::from([(
                "ENV_ONLY".to_owned(),
                "from-env".to_owned(),
            )]));

        assert_eq!(render(template, &configuration), expected);
    }

    #[rstest]
    #[case::iso_date("yyyy-MM-dd", "%Y-%m-%d")]
    #[case::iso_date_time("yyyy-MM-dd'T'HH:mm:ss.SSSXXX", "%Y-%m-%dT%H:%M:%S.%3f%:z")]
    #[case::unpadded("d/M/yy H:m", "%-d/%-m/%y %-H:%-M")]
    #[case::names("EEEE d MMMM, EEE MMM", "%A %-d %B, %a %b")]
    #[case::quotes("'it''s' hh a", "it's %I %p")]
    #[case::lone_quote("''", "'")]
    #[case::percent("100% yyyy", "100%% %Y")]
    fn date_patterns_translate(#[case] pattern: &str, #[case] expected: &str) {
        assert_eq!(date_pattern_to_strftime(pattern).unwrap(), expected);
    }

    #[rstest]
    #[case::unknown_letter("QQQ", DatePatternError::UnsupportedField { field: "QQQ".to_owned() })]
    #[case::unclosed_quote("'open", DatePatternError::UnterminatedQuote)]
    fn invalid_date_patterns(#[case] pattern: &str, #[case] expected: DatePatternError) {
        assert_eq!(date_pattern_to_strftime(pattern).unwrap_err(), expected);
    }

    #[test]
    fn date_placeholder_formats_now() {
        let configuration = Configuration::default().with_environment(BTreeMap::new());

        let today = render("{{date:yyyy-MM-dd}}", &configuration);
        assert!(today.parse::<jiff::civil::Date>().is_ok(), "{today}");
        assert_eq!(render("{{date:QQQ:-none}}", &configuration), "none");
    }

    #[test]
    fn timestamps_are_numeric() {
        let configuration = Configuration::default().with_environment(BTreeMap::new());

        assert!(render("{{timestamp}}", &configuration).parse::<i64>().is_ok());
        assert!(render("{{timestampSec}}", &configuration).parse::<i64>().is_ok());
        assert!(render("{{nowUTC}}", &configuration).ends_with('Z'));
    }

    #[test]
    fn inline_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "say \"hi\"\nbye").unwrap();
        let path = file.path().display().to_string();
        let configuration = Configuration::default().with_environment(BTreeMap::new());

        assert_eq!(
            render(&format!("{{{{bundlebee-inline-file:{path}}}}}"), &configuration),
            "say \"hi\"\nbye"
        );
        assert_eq!(
            render(
                &format!("{{{{bundlebee-quote-escaped-inline-file:{path}}}}}"),
                &configuration
            ),
            "say \\\"hi\\\"\\\\nbye"
        );
        assert_eq!(
            render(&format!("{{{{bundlebee-json-inline-file:{path}}}}}"), &configuration),
            "say \\\"hi\\\"\\nbye"
        );
    }

    #[test]
    fn missing_inline_file_keeps_default() {
        let configuration = Configuration::default().with_environment(BTreeMap::new());

        assert_eq!(
            render(
                "{{bundlebee-inline-file:/does/not/exist:-none}}",
                &configuration
            ),
            "none"
        );
    }
}
