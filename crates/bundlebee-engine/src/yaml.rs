//! Utility functions normalizing YAML and JSON descriptors to the JSON document model
use serde::Deserialize;
use serde_json::Value;
use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

pub const YAML_EXTENSION: &str = "yaml";
pub const JSON_EXTENSION: &str = "json";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse JSON descriptor"))]
    ParseJson { source: serde_json::Error },

    #[snafu(display("failed to parse YAML descriptor"))]
    ParseYaml { source: serde_yaml::Error },

    #[snafu(display("failed to serialize descriptor as JSON"))]
    SerializeJson { source: serde_json::Error },
}

/// Extension of a resource path, `yml` is normalized to `yaml` and a path without extension is
/// considered YAML.
pub fn extension_of(resource: &str) -> String {
    let extension = resource
        .rsplit_once('/')
        .map_or(resource, |(_, file)| file)
        .rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .map_or(YAML_EXTENSION, |(_, extension)| extension)
        .to_ascii_lowercase();
    if extension == "yml" {
        YAML_EXTENSION.to_owned()
    } else {
        extension
    }
}

/// Parses every document of `content`.
///
/// YAML streams yield one value per non empty document. JSON content is a single document.
pub fn parse_documents(content: &str, extension: &str) -> Result<Vec<Value>> {
    if extension == JSON_EXTENSION {
        return Ok(vec![serde_json::from_str(content.trim()).context(ParseJsonSnafu)?]);
    }

    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).context(ParseYamlSnafu)?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Parses `content` as one JSON document, a multi-document YAML stream becomes an array.
pub fn to_json(content: &str, extension: &str) -> Result<Value> {
    let mut documents = parse_documents(content, extension)?;
    Ok(match documents.len() {
        0 => Value::Null,
        1 => documents.remove(0),
        _ => Value::Array(documents),
    })
}

/// Flattens a parsed descriptor into the Kubernetes objects it declares.
///
/// Arrays and `kind: List` objects are expanded into their items.
pub fn resources(documents: Vec<Value>) -> Vec<Value> {
    documents
        .into_iter()
        .flat_map(|document| match document {
            Value::Array(items) => resources(items),
            Value::Object(mut object)
                if object.get("kind").and_then(Value::as_str) == Some("List") =>
            {
                match object.remove("items") {
                    Some(Value::Array(items)) => resources(items),
                    _ => Vec::new(),
                }
            }
            other => vec![other],
        })
        .collect()
}

pub fn to_json_string(value: &Value) -> Result<String> {
    serde_json::to_string(value).context(SerializeJsonSnafu)
}
