use log::debug;
use serde_json::Value;

use crate::template::{Output, Parameter, Resource, Template};

const LISTENER_TYPE: &str = "AWS::ElasticLoadBalancingV2::Listener";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Logical ID {0} is already used in the stack")]
    DuplicateLogicalId(String),

    #[error("Properties of {kind} have to be an object, got {found}")]
    InvalidProperties { kind: String, found: String },

    #[error("Resource {0} does not exist in the stack")]
    UnknownResource(String),

    #[error("Resource {from} references {to}, which is not defined")]
    DanglingReference { from: String, to: String },

    #[error("Listener {0} has no default action, add targets to it")]
    MissingDefaultAction(String),

    #[error("Invalid CIDR block {0}")]
    InvalidCidr(String),

    #[error("A VPC needs at least one availability zone")]
    NoAvailabilityZones,

    #[error("Invalid port range {from}-{to}")]
    InvalidPortRange { from: u16, to: u16 },

    #[error("Invalid capacity for {id}: min {min}, desired {desired:?}, max {max}")]
    InvalidCapacity {
        id: String,
        min: u32,
        desired: Option<u32>,
        max: u32,
    },

    #[error("Auto scaling group {0} is not attached to an application load balancer")]
    NotAttachedToLoadBalancer(String),

    #[error("Auto scaling group {0} is attached to more than one application load balancer")]
    MultipleLoadBalancers(String),

    #[error("Listener {0} already has a default target group")]
    DefaultActionExists(String),

    #[error("Capacity provider {0}: managed termination protection requires managed scaling")]
    TerminationProtectionRequiresManagedScaling(String),

    #[error("Cluster {0} needs EC2 capacity, add a capacity provider to it first")]
    NoEc2Capacity(String),

    #[error("Container {0} needs a memory limit")]
    MissingMemoryLimit(String),

    #[error("Task definition {0} has no containers")]
    NoContainers(String),
}

/// A stack under construction
///
/// Constructs register their resources here and keep only logical IDs. Later
/// wiring (an extra security group, user data, target group ARNs) edits the
/// registered resources in place through [`Stack::resource_mut`].
#[derive(Debug, Clone)]
pub struct Stack {
    pub name: String,

    template: Template,
}

impl Stack {
    pub fn new(name: &str) -> Self {
        Stack {
            name: name.to_string(),
            template: Template::default(),
        }
    }

    /// Construct path as shown in tags and descriptions, e.g. "LoadBalancerStack/VPC"
    pub fn path(&self, id: &str) -> String {
        format!("{}/{}", self.name, id)
    }

    pub fn set_description(&mut self, description: &str) {
        self.template.description = Some(description.to_string());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.template.resources.contains_key(id)
    }

    pub fn add_resource(&mut self, id: &str, resource: Resource) -> Result<(), Error> {
        if self.contains(id) {
            return Err(Error::DuplicateLogicalId(id.to_string()));
        }

        debug!("{}: adding {} ({})", self.name, id, resource.kind);
        self.template.resources.insert(id.to_string(), resource);
        Ok(())
    }

    pub fn resource(&self, id: &str) -> Result<&Resource, Error> {
        self.template
            .resources
            .get(id)
            .ok_or_else(|| Error::UnknownResource(id.to_string()))
    }

    pub fn resource_mut(&mut self, id: &str) -> Result<&mut Resource, Error> {
        self.template
            .resources
            .get_mut(id)
            .ok_or_else(|| Error::UnknownResource(id.to_string()))
    }

    /// Parameters are shared, e.g. two groups using the same SSM image
    pub fn add_parameter(&mut self, id: &str, parameter: Parameter) {
        self.template
            .parameters
            .entry(id.to_string())
            .or_insert(parameter);
    }

    pub fn add_output(&mut self, id: &str, output: Output) -> Result<(), Error> {
        if self.template.outputs.contains_key(id) {
            return Err(Error::DuplicateLogicalId(id.to_string()));
        }

        self.template.outputs.insert(id.to_string(), output);
        Ok(())
    }

    /// Check the structure of the stack and return its template
    pub fn synth(self) -> Result<Template, Error> {
        let template = self.template;

        for (id, resource) in template.resources.iter() {
            for dependency in resource.depends_on.iter() {
                if !template.resources.contains_key(dependency) {
                    return Err(Error::DanglingReference {
                        from: id.clone(),
                        to: dependency.clone(),
                    });
                }
            }

            for value in resource.properties.values() {
                check_references(&template, id, value)?;
            }

            if resource.kind == LISTENER_TYPE {
                let has_actions = resource
                    .properties
                    .get("DefaultActions")
                    .and_then(Value::as_array)
                    .map(|actions| !actions.is_empty())
                    .unwrap_or(false);

                if !has_actions {
                    return Err(Error::MissingDefaultAction(id.clone()));
                }
            }
        }

        for (id, output) in template.outputs.iter() {
            check_references(&template, id, &output.value)?;
        }

        Ok(template)
    }
}

/// Every Ref and Fn::GetAtt inside the value must point at something defined
fn check_references(template: &Template, from: &str, value: &Value) -> Result<(), Error> {
    let dangling = |to: &str| Error::DanglingReference {
        from: from.to_string(),
        to: to.to_string(),
    };

    match value {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get("Ref") {
                let known = target.starts_with("AWS::")
                    || template.resources.contains_key(target)
                    || template.parameters.contains_key(target);
                if !known {
                    return Err(dangling(target));
                }
            }

            if let Some(Value::Array(args)) = map.get("Fn::GetAtt") {
                if let Some(Value::String(target)) = args.first() {
                    if !template.resources.contains_key(target) {
                        return Err(dangling(target));
                    }
                }
            }

            for nested in map.values() {
                check_references(template, from, nested)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                check_references(template, from, item)?;
            }
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::template::{get_att, reference};

    #[test]
    fn rejects_duplicate_logical_ids() {
        let mut stack = Stack::new("Test");
        stack
            .add_resource("Queue", Resource::new("AWS::SQS::Queue", json!({})).unwrap())
            .unwrap();

        let result = stack.add_resource("Queue", Resource::new("AWS::SQS::Queue", json!({})).unwrap());
        assert_eq!(result, Err(Error::DuplicateLogicalId("Queue".to_string())));
    }

    #[test]
    fn rejects_dangling_references() {
        let mut stack = Stack::new("Test");
        stack
            .add_resource(
                "Mapping",
                Resource::new(
                    "AWS::Lambda::EventSourceMapping",
                    json!({ "EventSourceArn": get_att("Missing", "Arn") }),
                ).unwrap(),
            )
            .unwrap();

        match stack.synth() {
            Err(Error::DanglingReference { from, to }) => {
                assert_eq!(from, "Mapping");
                assert_eq!(to, "Missing");
            }
            other => panic!("Expected `DanglingReference` error, got {:?}", other),
        }
    }

    #[test]
    fn accepts_pseudo_parameters_and_known_ids() {
        let mut stack = Stack::new("Test");
        stack
            .add_resource("Queue", Resource::new("AWS::SQS::Queue", json!({})).unwrap())
            .unwrap();
        stack
            .add_resource(
                "Policy",
                Resource::new(
                    "AWS::SQS::QueuePolicy",
                    json!({
                        "Queues": [reference("Queue")],
                        "Region": reference("AWS::Region"),
                    }),
                ).unwrap()
                .depends_on(&["Queue"]),
            )
            .unwrap();

        let template = stack.synth().unwrap();
        assert_eq!(template.resources.len(), 2);
    }

    #[test]
    fn rejects_dangling_dependencies() {
        let mut stack = Stack::new("Test");
        stack
            .add_resource(
                "Queue",
                Resource::new("AWS::SQS::Queue", json!({})).unwrap().depends_on(&["Nope"]),
            )
            .unwrap();

        assert!(matches!(
            stack.synth(),
            Err(Error::DanglingReference { .. })
        ));
    }
}
