use std::collections::BTreeMap;

use log::info;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::validate_instance_type;
use crate::autoscaling::{AutoScalingGroup, AutoScalingGroupProps};
use crate::ec2::{
    InstanceType, MachineImage, Peer, Port, Protocol, SecurityGroup, SecurityGroupProps, Vpc,
    VpcProps,
};
use crate::ecs::{AsgCapacityProvider, AsgCapacityProviderProps, Cluster, ClusterProps, ContainerImage};
use crate::patterns::{
    ApplicationLoadBalancedEc2Service, ApplicationLoadBalancedEc2ServiceProps,
    ApplicationLoadBalancedTaskImageOptions,
};
use crate::stack::{Error, Stack};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_capacity"))]
pub struct EcsPatternProps {
    #[validate(range(min = 1))]
    pub max_azs: usize,

    pub container_insights: bool,

    #[validate(custom = "validate_instance_type")]
    pub instance_type: String,

    pub min_capacity: u32,
    pub max_capacity: u32,
    pub desired_capacity: Option<u32>,

    #[validate(length(min = 1, max = 255))]
    pub asg_security_group_name: String,

    #[validate(length(min = 1, max = 255))]
    pub lb_security_group_name: String,

    #[validate(length(min = 1))]
    pub image: String,

    /// ECS refuses containers with less than 6 MiB
    #[validate(range(min = 6))]
    pub memory_limit_mib: u32,

    pub environment: BTreeMap<String, String>,
    pub desired_count: u32,
}

impl Default for EcsPatternProps {
    fn default() -> Self {
        let mut environment = BTreeMap::new();
        environment.insert(
            "TEST_ENVIRONMENT_VARIABLE1".to_string(),
            "test environment variable 1 value".to_string(),
        );
        environment.insert(
            "TEST_ENVIRONMENT_VARIABLE2".to_string(),
            "test environment variable 2 value".to_string(),
        );

        EcsPatternProps {
            max_azs: 2,
            container_insights: true,
            instance_type: "t2.medium".to_string(),
            min_capacity: 0,
            max_capacity: 5,
            desired_capacity: Some(1),
            asg_security_group_name: "overridden-asg-security-group".to_string(),
            lb_security_group_name: "overridden-lb-security-group".to_string(),
            image: "amazon/amazon-ecs-sample".to_string(),
            memory_limit_mib: 1024,
            environment,
            desired_count: 1,
        }
    }
}

fn validate_capacity(props: &EcsPatternProps) -> Result<(), ValidationError> {
    let desired_in_range = props
        .desired_capacity
        .map(|desired| props.min_capacity <= desired && desired <= props.max_capacity)
        .unwrap_or(true);

    if props.max_capacity == 0 || props.min_capacity > props.max_capacity || !desired_in_range {
        return Err(ValidationError::new(
            "Capacity has to satisfy min <= desired <= max and max > 0",
        ));
    }

    return Ok(());
}

/// An EC2-backed ECS service behind a load balancer, with explicit security groups
/// for both sides
pub fn ecs_pattern_stack(name: &str, props: &EcsPatternProps) -> Result<Stack, Error> {
    let mut stack = Stack::new(name);
    stack.set_description("Load balanced ECS service on EC2 capacity");

    let vpc = Vpc::new(
        &mut stack,
        "MyVpc",
        VpcProps {
            max_azs: props.max_azs,
            ..VpcProps::default()
        },
    )?;

    let mut cluster = Cluster::new(
        &mut stack,
        "cluster",
        &vpc,
        ClusterProps {
            container_insights: props.container_insights,
        },
    )?;

    let provider_security_group = SecurityGroup::new(
        &mut stack,
        "asg-security-group",
        &vpc,
        SecurityGroupProps {
            security_group_name: Some(props.asg_security_group_name.clone()),
            ..SecurityGroupProps::default()
        },
    )?;

    let auto_scaling_group = AutoScalingGroup::new(
        &mut stack,
        "ASG",
        &vpc,
        AutoScalingGroupProps {
            min_capacity: props.min_capacity,
            max_capacity: Some(props.max_capacity),
            desired_capacity: props.desired_capacity,
            security_group: Some(provider_security_group.clone()),
            ..AutoScalingGroupProps::new(
                InstanceType::new(&props.instance_type),
                MachineImage::EcsOptimizedAmazonLinux2,
            )
        },
    )?;

    let load_balancer_security_group = SecurityGroup::new(
        &mut stack,
        "lb-sg",
        &vpc,
        SecurityGroupProps {
            security_group_name: Some(props.lb_security_group_name.clone()),
            ..SecurityGroupProps::default()
        },
    )?;

    load_balancer_security_group.add_ingress_rule(
        &mut stack,
        &Peer::any_ipv4(),
        &Port::new("all inbound on 80", Protocol::Tcp, 80, 80)?,
        Some("inbound on port 80"),
    )?;

    provider_security_group.add_ingress_rule(
        &mut stack,
        &Peer::security_group(&load_balancer_security_group),
        &Port::new("lb-connectivity", Protocol::Tcp, 32768, 65535)?,
        Some("connectivity from LB to ASG"),
    )?;

    let capacity_provider = AsgCapacityProvider::new(
        &mut stack,
        "AsgCapacityProvider",
        &auto_scaling_group,
        AsgCapacityProviderProps::default(),
    )?;
    cluster.add_asg_capacity_provider(&mut stack, &capacity_provider)?;

    let mut service = ApplicationLoadBalancedEc2Service::new(
        &mut stack,
        "-service",
        ApplicationLoadBalancedEc2ServiceProps {
            memory_limit_mib: Some(props.memory_limit_mib),
            desired_count: props.desired_count,
            ..ApplicationLoadBalancedEc2ServiceProps::new(
                &cluster,
                ApplicationLoadBalancedTaskImageOptions {
                    environment: props.environment.clone(),
                    ..ApplicationLoadBalancedTaskImageOptions::new(ContainerImage::from_registry(
                        &props.image,
                    ))
                },
            )
        },
    )?;

    service
        .load_balancer
        .add_security_group(&mut stack, &load_balancer_security_group)?;

    info!("{}: built ECS pattern stack", name);
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::template::{get_att, join, reference, Template};

    fn template() -> Template {
        ecs_pattern_stack("sample-ecs-pattern-ec2-alb", &EcsPatternProps::default())
            .unwrap()
            .synth()
            .unwrap()
    }

    #[test]
    fn asg_group_accepts_ephemeral_ports_from_lb_group() {
        let template = template();
        let rule = &template.resources["asgsecuritygroupfromlbsgtcp32768to65535"];

        assert_eq!(rule.kind, "AWS::EC2::SecurityGroupIngress");
        assert_eq!(rule.properties["SourceSecurityGroupId"], get_att("lbsg", "GroupId"));
        assert_eq!(rule.properties["GroupId"], get_att("asgsecuritygroup", "GroupId"));
        assert_eq!(rule.properties["FromPort"], 32768);
        assert_eq!(rule.properties["ToPort"], 65535);
        assert_eq!(rule.properties["Description"], "connectivity from LB to ASG");
    }

    #[test]
    fn lb_group_accepts_port_80_from_anywhere() {
        let template = template();
        let group = &template.resources["lbsg"];

        assert_eq!(group.properties["GroupName"], "overridden-lb-security-group");
        assert_eq!(
            group.properties["SecurityGroupIngress"],
            json!([{
                "CidrIp": "0.0.0.0/0",
                "Description": "inbound on port 80",
                "FromPort": 80,
                "IpProtocol": "tcp",
                "ToPort": 80
            }])
        );
    }

    #[test]
    fn lb_group_is_attached_to_the_service_load_balancer() {
        let template = template();
        let load_balancer = &template.resources["serviceLB"];

        assert_eq!(
            load_balancer.properties["SecurityGroups"],
            json!([
                get_att("serviceLBSecurityGroup", "GroupId"),
                get_att("lbsg", "GroupId")
            ])
        );
    }

    #[test]
    fn asg_uses_the_provider_group() {
        let template = template();
        let launch = &template.resources["ASGLaunchConfig"];

        assert_eq!(
            launch.properties["SecurityGroups"],
            json!([get_att("asgsecuritygroup", "GroupId")])
        );
        assert_eq!(launch.properties["InstanceType"], "t2.medium");
        assert!(!template.resources.contains_key("ASGInstanceSecurityGroup"));

        let group = &template.resources["ASGASG"];
        assert_eq!(group.properties["MinSize"], "0");
        assert_eq!(group.properties["MaxSize"], "5");
        assert_eq!(group.properties["DesiredCapacity"], "1");
    }

    #[test]
    fn service_runs_the_sample_image() {
        let template = template();
        let definition = &template.resources["serviceTaskDef"];
        let container = &definition.properties["ContainerDefinitions"][0];

        assert_eq!(container["Image"], "amazon/amazon-ecs-sample");
        assert_eq!(container["Memory"], 1024);
        assert_eq!(
            container["Environment"],
            json!([
                {"Name": "TEST_ENVIRONMENT_VARIABLE1", "Value": "test environment variable 1 value"},
                {"Name": "TEST_ENVIRONMENT_VARIABLE2", "Value": "test environment variable 2 value"}
            ])
        );

        let service = &template.resources["serviceService"];
        assert_eq!(service.properties["DesiredCount"], 1);
        assert_eq!(service.properties["Cluster"], reference("cluster"));
        assert_eq!(
            service.properties["LoadBalancers"][0]["TargetGroupArn"],
            reference("serviceLBPublicListenerECSGroup")
        );
        assert!(service
            .depends_on
            .contains(&"serviceLBPublicListener".to_string()));
    }

    #[test]
    fn outputs_the_service_url() {
        let template = template();

        assert_eq!(
            template.outputs["serviceServiceURL"].value,
            join("", vec![json!("http://"), get_att("serviceLB", "DNSName")])
        );
        assert_eq!(
            template.outputs["serviceLoadBalancerDNS"].value,
            get_att("serviceLB", "DNSName")
        );
    }

    #[test]
    fn rejects_desired_capacity_out_of_range() {
        let props = EcsPatternProps {
            desired_capacity: Some(9),
            ..EcsPatternProps::default()
        };

        assert!(props.validate().is_err());
        assert!(EcsPatternProps::default().validate().is_ok());
    }
}
