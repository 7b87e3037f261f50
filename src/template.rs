use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::stack::Error;

pub const FORMAT_VERSION: &str = "2010-09-09";

/// A synthesized CloudFormation template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,

    pub resources: BTreeMap<String, Resource>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Default for Template {
    fn default() -> Self {
        Template {
            format_version: FORMAT_VERSION.to_string(),
            description: None,
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl Template {
    /// All resources of a CloudFormation type, e.g. "AWS::EC2::SecurityGroup"
    pub fn resources_of_type(&self, kind: &str) -> Vec<(&String, &Resource)> {
        self.resources
            .iter()
            .filter(|(_, resource)| resource.kind == kind)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<Value>,
}

impl Resource {
    /// Build a resource from a type name and a `json!` object of properties
    pub fn new(kind: &str, properties: Value) -> Result<Self, Error> {
        let properties = match properties {
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidProperties {
                    kind: kind.to_string(),
                    found: other.to_string(),
                })
            }
        };

        Ok(Resource {
            kind: kind.to_string(),
            properties,
            depends_on: vec![],
            deletion_policy: None,
            update_replace_policy: None,
            update_policy: None,
        })
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        for id in ids {
            self.add_dependency(id);
        }

        self
    }

    pub fn retain(mut self) -> Self {
        self.deletion_policy = Some("Retain".to_string());
        self.update_replace_policy = Some("Retain".to_string());
        self
    }

    pub fn add_dependency(&mut self, id: &str) {
        if !self.depends_on.iter().any(|d| d == id) {
            self.depends_on.push(id.to_string());
        }
    }

    pub fn set_property(&mut self, key: &str, value: Value) {
        self.properties.insert(key.to_string(), value);
    }

    /// Append to a list property, creating the list when missing
    pub fn push_property(&mut self, key: &str, value: Value) {
        let entry = self
            .properties
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(vec![]));

        match entry {
            Value::Array(items) => items.push(value),
            other => *other = Value::Array(vec![other.clone(), value]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Turn construct path parts into a logical ID
///
/// Only ASCII alphanumerics survive, so `["-service", "LB"]` becomes `serviceLB`.
pub fn logical_id(parts: &[&str]) -> String {
    parts
        .iter()
        .flat_map(|part| part.chars())
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

pub fn reference(id: &str) -> Value {
    json!({ "Ref": id })
}

pub fn get_att(id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [id, attribute] })
}

pub fn join(separator: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [separator, parts] })
}

pub fn select(index: usize, list: Value) -> Value {
    json!({ "Fn::Select": [index, list] })
}

/// Availability zones of the deployment region
pub fn get_azs() -> Value {
    json!({ "Fn::GetAZs": "" })
}

pub fn base64(value: Value) -> Value {
    json!({ "Fn::Base64": value })
}

/// ARN of an AWS managed IAM policy, partition-aware
pub fn managed_policy_arn(name: &str) -> Value {
    join(
        "",
        vec![
            json!("arn:"),
            reference("AWS::Partition"),
            json!(format!(":iam::aws:policy/{name}")),
        ],
    )
}
