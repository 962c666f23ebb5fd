//! Recursive `{{placeholder}}` substitution.
//!
//! Syntax:
//!
//! - `{{name}}` is replaced by the value the lookup returns for `name`, or by `name` itself when
//!   the lookup has no value.
//! - `{{name:-default}}` falls back to `default` when the lookup has no value or fails.
//! - `\{{name}}` is left untouched (the escape character is dropped from the final output).
//! - `{{prefix.{{inner}}}}` resolves `inner` first and then looks up the resulting key.
//!
//! The whole text is rescanned until it stabilizes, values can therefore contain placeholders
//! themselves. [`MAX_PASSES`] bounds this to break placeholder cycles.
//!
//! The lookup is a plain function value, it is free to call [`replace`] again on nested content.
use snafu::{ResultExt, Snafu};

/// Maximum number of full passes (and nesting depth) before the text is returned as is.
pub const MAX_PASSES: usize = 25;

const ESCAPE: u8 = b'\\';
const PREFIX: &str = "{{";
const SUFFIX: &str = "}}";
const VALUE_DELIMITER: &str = ":-";

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve placeholder {key:?}"))]
    Lookup { source: BoxedError, key: String },
}

/// Resolves a placeholder name, receiving the default value declared in the placeholder if any.
///
/// `Ok(None)` means "unknown", the caller then falls back on the default or the bare key.
pub trait Lookup {
    fn lookup(&self, key: &str, default: Option<&str>) -> Result<Option<String>, BoxedError>;
}

impl<F> Lookup for F
where
    F: Fn(&str, Option<&str>) -> Result<Option<String>, BoxedError>,
{
    fn lookup(&self, key: &str, default: Option<&str>) -> Result<Option<String>, BoxedError> {
        self(key, default)
    }
}

/// Replaces every placeholder of `source` using `lookup`.
pub fn replace(source: &str, lookup: &dyn Lookup) -> Result<String, Error> {
    let mut current = source.to_owned();
    for _ in 0..MAX_PASSES {
        let next = substitute_pass(&current, lookup, 0)?;
        if next == current {
            break;
        }
        current = next;
    }
    Ok(current.replace("\\{{", PREFIX))
}

/// Reusable substitution bound to one lookup.
pub struct Substitutor<L> {
    lookup: L,
}

impl<L: Lookup> Substitutor<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    pub fn replace(&self, source: &str) -> Result<String, Error> {
        replace(source, &self.lookup)
    }
}

/// Replaces every unescaped placeholder of `input` once, left to right. Substituted values are not
/// rescanned within the same pass.
fn substitute_pass(input: &str, lookup: &dyn Lookup, depth: usize) -> Result<String, Error> {
    let mut output = String::with_capacity(input.len());
    let mut from = 0;

    while let Some(start) = find_unescaped(input, from) {
        let key_start = start + PREFIX.len();
        let Some(end) = find_matching_suffix(input, key_start) else {
            // unclosed prefix, kept as text while the rest is still scanned
            output.push_str(&input[from..key_start]);
            from = key_start;
            continue;
        };

        let raw_key = &input[key_start..end];
        let key = if depth < MAX_PASSES && find_unescaped(raw_key, 0).is_some() {
            substitute_pass(raw_key, lookup, depth + 1)?
        } else {
            raw_key.to_owned()
        };

        output.push_str(&input[from..start]);
        output.push_str(&resolve(&key, lookup)?);
        from = end + SUFFIX.len();
    }

    output.push_str(&input[from..]);
    Ok(output)
}

fn resolve(key: &str, lookup: &dyn Lookup) -> Result<String, Error> {
    let (name, default) = match key.find(VALUE_DELIMITER) {
        Some(separator) if separator > 0 => (
            &key[..separator],
            Some(&key[separator + VALUE_DELIMITER.len()..]),
        ),
        _ => (key, None),
    };

    match lookup.lookup(name, default) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Ok(default.unwrap_or(name).to_owned()),
        Err(_) if default.is_some() => Ok(default.unwrap_or_default().to_owned()),
        Err(source) => Err(source).context(LookupSnafu { key: name }),
    }
}

fn find_unescaped(input: &str, from: usize) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut from = from;
    while from < input.len() {
        let start = from + input[from..].find(PREFIX)?;
        if start == 0 || bytes[start - 1] != ESCAPE {
            return Some(start);
        }
        from = start + PREFIX.len();
    }
    None
}

/// Finds the `}}` closing the placeholder whose key starts at `key_start`, skipping over nested
/// placeholders.
fn find_matching_suffix(input: &str, key_start: usize) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut depth = 1;
    let mut index = key_start;
    while index + 1 < bytes.len() {
        if bytes[index..].starts_with(PREFIX.as_bytes())
            && (index == 0 || bytes[index - 1] != ESCAPE)
        {
            depth += 1;
            index += PREFIX.len();
        } else if bytes[index..].starts_with(SUFFIX.as_bytes()) {
            depth -= 1;
            if depth == 0 {
                return Some(index);
            }
            index += SUFFIX.len();
        } else {
            index += 1;
        }
    }
    None
}
