use log::info;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validate_instance_type;
use crate::autoscaling::{AutoScalingGroup, AutoScalingGroupProps};
use crate::ec2::{InstanceClass, InstanceSize, InstanceType, MachineImage, Vpc, VpcProps};
use crate::elbv2::{AddTargetsProps, ApplicationLoadBalancer, ApplicationLoadBalancerProps, ListenerProps};
use crate::stack::{Error, Stack};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoadBalancerProps {
    #[validate(custom = "validate_instance_type")]
    pub instance_type: String,

    #[validate(range(min = 1))]
    pub max_azs: usize,

    #[validate(range(min = 1))]
    pub listener_port: u16,

    #[validate(range(min = 1))]
    pub target_port: u16,

    #[validate(range(min = 1))]
    pub target_requests_per_second: u32,

    pub internet_facing: bool,
}

impl Default for LoadBalancerProps {
    fn default() -> Self {
        LoadBalancerProps {
            instance_type: InstanceType::of(InstanceClass::Burstable2, InstanceSize::Micro)
                .to_string(),
            max_azs: 3,
            listener_port: 80,
            target_port: 80,
            target_requests_per_second: 1,
            internet_facing: true,
        }
    }
}

/// An auto scaling group behind an internet-facing application load balancer
pub fn load_balancer_stack(name: &str, props: &LoadBalancerProps) -> Result<Stack, Error> {
    let mut stack = Stack::new(name);
    stack.set_description("Auto scaling group behind an application load balancer");

    let vpc = Vpc::new(
        &mut stack,
        "VPC",
        VpcProps {
            max_azs: props.max_azs,
            ..VpcProps::default()
        },
    )?;

    let mut asg = AutoScalingGroup::new(
        &mut stack,
        "ASG",
        &vpc,
        AutoScalingGroupProps::new(
            InstanceType::new(&props.instance_type),
            MachineImage::AmazonLinux,
        ),
    )?;

    let lb = ApplicationLoadBalancer::new(
        &mut stack,
        "LB",
        &vpc,
        ApplicationLoadBalancerProps {
            internet_facing: props.internet_facing,
        },
    )?;

    let mut listener = lb.add_listener(
        &mut stack,
        "Listener",
        ListenerProps {
            port: props.listener_port,
            open: true,
        },
    )?;

    listener.add_targets(
        &mut stack,
        "Target",
        AddTargetsProps {
            port: props.target_port,
        },
        &mut [&mut asg],
    )?;
    listener.allow_default_port_from_any_ipv4(&mut stack, "Open to the world")?;

    asg.scale_on_request_count(&mut stack, "AModestLoad", props.target_requests_per_second)?;

    info!("{}: built load balancer stack", name);
    Ok(stack)
}
