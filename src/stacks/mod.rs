use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::stack::Error;
use crate::template::Template;

pub mod ecs_pattern;
pub mod load_balancer;

pub use ecs_pattern::{ecs_pattern_stack, EcsPatternProps};
pub use load_balancer::{load_balancer_stack, LoadBalancerProps};

/// Which stack to build, with its tunable values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StackKind {
    LoadBalancer(LoadBalancerProps),
    EcsPattern(EcsPatternProps),
}

impl StackKind {
    pub fn name(&self) -> &'static str {
        match self {
            StackKind::LoadBalancer(_) => "load-balancer",
            StackKind::EcsPattern(_) => "ecs-pattern",
        }
    }
}

/// Build the stack and synthesize its template
pub fn build(name: &str, kind: &StackKind) -> Result<Template, Error> {
    let stack = match kind {
        StackKind::LoadBalancer(props) => load_balancer_stack(name, props)?,
        StackKind::EcsPattern(props) => ecs_pattern_stack(name, props)?,
    };

    stack.synth()
}

pub fn validate_stack_kind(kind: &StackKind) -> Result<(), ValidationError> {
    let result = match kind {
        StackKind::LoadBalancer(props) => props.validate(),
        StackKind::EcsPattern(props) => props.validate(),
    };

    match result {
        Ok(_) => Ok(()),
        Err(errors) => {
            let mut error = ValidationError::new("stack");
            error.message = Some(Cow::from(format!("{}: {}", kind.name(), errors)));
            Err(error)
        }
    }
}

/// Instance types look like "t2.micro"
pub fn validate_instance_type(instance_type: &str) -> Result<(), ValidationError> {
    let valid = match instance_type.split_once('.') {
        Some((family, size)) => {
            !family.is_empty()
                && !size.is_empty()
                && family.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && size.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    };

    if !valid {
        return Err(ValidationError::new(
            "The instance type has to look like `t2.micro`",
        ));
    }

    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_type_shape() {
        assert!(validate_instance_type("t2.micro").is_ok());
        assert!(validate_instance_type("m5.2xlarge").is_ok());
        assert!(validate_instance_type("t2").is_err());
        assert!(validate_instance_type(".micro").is_err());
    }

    #[test]
    fn kind_is_read_from_the_tag() {
        let kind: StackKind = serde_yaml::from_str("kind: ecs-pattern\ndesired_count: 3\n").unwrap();

        match kind {
            StackKind::EcsPattern(props) => {
                assert_eq!(props.desired_count, 3);
                assert_eq!(props.memory_limit_mib, 1024);
            }
            _ => panic!("Expected `EcsPattern` kind"),
        }
    }

    #[test]
    fn build_synthesizes_both_stacks() {
        let load_balancer = build(
            "LoadBalancerStack",
            &StackKind::LoadBalancer(LoadBalancerProps::default()),
        )
        .unwrap();
        assert!(!load_balancer.resources.is_empty());

        let ecs = build(
            "sample-ecs-pattern-ec2-alb",
            &StackKind::EcsPattern(EcsPatternProps::default()),
        )
        .unwrap();
        assert_eq!(ecs.outputs.len(), 2);
    }
}
