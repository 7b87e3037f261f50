use std::collections::BTreeMap;

use serde_json::json;

use crate::ec2::Vpc;
use crate::ecs::{
    Cluster, ContainerDefinitionOptions, ContainerImage, Ec2Service, Ec2ServiceProps,
    Ec2TaskDefinition, LogDriver, NetworkMode,
};
use crate::elbv2::{
    AddTargetsProps, ApplicationLoadBalancer, ApplicationLoadBalancerProps, Listener,
    ListenerProps, TargetGroup,
};
use crate::stack::{Error, Stack};
use crate::template::{join, logical_id, Output};

#[derive(Debug, Clone)]
pub struct ApplicationLoadBalancedTaskImageOptions {
    pub image: ContainerImage,
    pub environment: BTreeMap<String, String>,
    pub container_name: String,
    pub container_port: u16,
    pub enable_logging: bool,
}

impl ApplicationLoadBalancedTaskImageOptions {
    pub fn new(image: ContainerImage) -> Self {
        ApplicationLoadBalancedTaskImageOptions {
            image,
            environment: BTreeMap::new(),
            container_name: "web".to_string(),
            container_port: 80,
            enable_logging: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationLoadBalancedEc2ServiceProps<'a> {
    pub cluster: &'a Cluster,
    pub task_image_options: ApplicationLoadBalancedTaskImageOptions,
    pub memory_limit_mib: Option<u32>,
    pub desired_count: u32,
    pub listener_port: u16,
    pub public_load_balancer: bool,
}

impl<'a> ApplicationLoadBalancedEc2ServiceProps<'a> {
    pub fn new(cluster: &'a Cluster, task_image_options: ApplicationLoadBalancedTaskImageOptions) -> Self {
        ApplicationLoadBalancedEc2ServiceProps {
            cluster,
            task_image_options,
            memory_limit_mib: None,
            desired_count: 1,
            listener_port: 80,
            public_load_balancer: true,
        }
    }
}

/// An EC2 service behind its own application load balancer
#[derive(Debug, Clone)]
pub struct ApplicationLoadBalancedEc2Service {
    pub load_balancer: ApplicationLoadBalancer,
    pub listener: Listener,
    pub target_group: TargetGroup,
    pub task_definition: Ec2TaskDefinition,
    pub service: Ec2Service,
}

impl ApplicationLoadBalancedEc2Service {
    pub fn new(
        stack: &mut Stack,
        id: &str,
        props: ApplicationLoadBalancedEc2ServiceProps,
    ) -> Result<Self, Error> {
        let base = logical_id(&[id]);
        let vpc: &Vpc = &props.cluster.vpc;
        let options = props.task_image_options;

        let load_balancer = ApplicationLoadBalancer::new(
            stack,
            &format!("{base}LB"),
            vpc,
            ApplicationLoadBalancerProps {
                internet_facing: props.public_load_balancer,
            },
        )?;

        let mut listener = load_balancer.add_listener(
            stack,
            "PublicListener",
            ListenerProps {
                port: props.listener_port,
                open: true,
            },
        )?;

        let mut task_definition =
            Ec2TaskDefinition::new(stack, &format!("{base}TaskDef"), NetworkMode::Bridge)?;

        let logging = if options.enable_logging {
            Some(LogDriver::AwsLogs {
                stream_prefix: id.to_string(),
            })
        } else {
            None
        };

        task_definition.add_container(
            stack,
            &options.container_name,
            ContainerDefinitionOptions {
                memory_limit_mib: props.memory_limit_mib,
                environment: options.environment.clone(),
                container_ports: vec![options.container_port],
                logging,
                ..ContainerDefinitionOptions::new(options.image.clone())
            },
        )?;

        let mut service = Ec2Service::new(
            stack,
            &format!("{base}Service"),
            Ec2ServiceProps {
                desired_count: props.desired_count,
                ..Ec2ServiceProps::new(props.cluster, &task_definition)
            },
        )?;

        let target_group = listener.add_targets(
            stack,
            "ECS",
            AddTargetsProps {
                port: options.container_port,
            },
            &mut [&mut service],
        )?;

        let dns_name = load_balancer.dns_name();
        stack.add_output(
            &format!("{base}LoadBalancerDNS"),
            Output {
                value: dns_name.clone(),
                description: None,
            },
        )?;
        stack.add_output(
            &format!("{base}ServiceURL"),
            Output {
                value: join("", vec![json!("http://"), dns_name]),
                description: None,
            },
        )?;

        Ok(ApplicationLoadBalancedEc2Service {
            load_balancer,
            listener,
            target_group,
            task_definition,
            service,
        })
    }
}
