use log::debug;
use serde_json::{json, Value};

use crate::ec2::{Connections, Peer, Port, SecurityGroup, SecurityGroupProps, SubnetType, Vpc};
use crate::stack::{Error, Stack};
use crate::template::{get_att, logical_id, reference, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Instance,
    Ip,
}

impl TargetType {
    fn as_str(&self) -> &'static str {
        match self {
            TargetType::Instance => "instance",
            TargetType::Ip => "ip",
        }
    }
}

/// What a target learns about the group it is being registered with
pub struct TargetGroupAttachment<'a> {
    /// `LoadBalancerFullName` of the balancer in front of the group
    pub load_balancer_full_name: &'a Value,
    pub listener: &'a str,
    pub target_group: &'a TargetGroup,

    /// Connections of the load balancer, used to open the target port
    pub connections: &'a Connections,
    pub port: u16,
}

/// Something a listener can forward traffic to
pub trait ApplicationTarget {
    fn attach_to_target_group(
        &mut self,
        stack: &mut Stack,
        attachment: &TargetGroupAttachment,
    ) -> Result<TargetType, Error>;
}

#[derive(Debug, Clone)]
pub struct ApplicationLoadBalancerProps {
    pub internet_facing: bool,
}

impl Default for ApplicationLoadBalancerProps {
    fn default() -> Self {
        ApplicationLoadBalancerProps {
            internet_facing: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationLoadBalancer {
    pub logical_id: String,
    pub security_group: SecurityGroup,
    pub connections: Connections,
    vpc: String,
}

impl ApplicationLoadBalancer {
    pub fn new(
        stack: &mut Stack,
        id: &str,
        vpc: &Vpc,
        props: ApplicationLoadBalancerProps,
    ) -> Result<Self, Error> {
        let lb_id = logical_id(&[id]);
        let description = format!(
            "Automatically created Security Group for ELB {}",
            stack.path(id)
        );

        let security_group = SecurityGroup::new(
            stack,
            &format!("{lb_id}SecurityGroup"),
            vpc,
            SecurityGroupProps {
                description: Some(description),
                security_group_name: None,
                allow_all_outbound: false,
            },
        )?;

        let (scheme, subnet_type) = if props.internet_facing {
            ("internet-facing", SubnetType::Public)
        } else {
            ("internal", SubnetType::Private)
        };

        let mut resource = Resource::new(
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "LoadBalancerAttributes": [{
                    "Key": "deletion_protection.enabled",
                    "Value": "false"
                }],
                "Scheme": scheme,
                "SecurityGroups": [security_group.group_id()],
                "Subnets": vpc.subnet_ids(subnet_type),
                "Type": "application"
            }),
        )?;

        // Internet-facing load balancers are unreachable until the gateway routes exist
        if props.internet_facing {
            for subnet in vpc.public_subnets.iter() {
                resource.add_dependency(&subnet.default_route);
            }
        }

        stack.add_resource(&lb_id, resource)?;

        Ok(ApplicationLoadBalancer {
            logical_id: lb_id,
            connections: Connections::new(vec![security_group.clone()], None),
            security_group,
            vpc: vpc.logical_id.clone(),
        })
    }

    pub fn dns_name(&self) -> Value {
        get_att(&self.logical_id, "DNSName")
    }

    pub fn full_name(&self) -> Value {
        get_att(&self.logical_id, "LoadBalancerFullName")
    }

    /// Attach another security group to an existing load balancer
    pub fn add_security_group(
        &mut self,
        stack: &mut Stack,
        group: &SecurityGroup,
    ) -> Result<(), Error> {
        if self.connections.security_groups.contains(group) {
            return Ok(());
        }

        stack
            .resource_mut(&self.logical_id)?
            .push_property("SecurityGroups", group.group_id());
        self.connections.add_security_group(group);

        debug!(
            "{}: attached {} to {}",
            stack.name, group.logical_id, self.logical_id
        );
        Ok(())
    }

    pub fn add_listener(
        &self,
        stack: &mut Stack,
        id: &str,
        props: ListenerProps,
    ) -> Result<Listener, Error> {
        let listener_id = logical_id(&[&self.logical_id, id]);

        stack.add_resource(
            &listener_id,
            Resource::new(
                "AWS::ElasticLoadBalancingV2::Listener",
                json!({
                    "LoadBalancerArn": reference(&self.logical_id),
                    "Port": props.port,
                    "Protocol": "HTTP"
                }),
            )?,
        )?;

        let listener = Listener {
            logical_id: listener_id,
            port: props.port,
            load_balancer_full_name: self.full_name(),
            vpc: self.vpc.clone(),
            connections: Connections::new(
                self.connections.security_groups.clone(),
                Some(Port::tcp(props.port)),
            ),
            default_target_group: None,
        };

        if props.open {
            listener.connections.allow_default_port_from(
                stack,
                &Peer::any_ipv4(),
                &format!("Allow from anyone on port {}", props.port),
            )?;
        }

        Ok(listener)
    }
}

#[derive(Debug, Clone)]
pub struct ListenerProps {
    pub port: u16,

    /// Allow the port from anywhere
    pub open: bool,
}

impl Default for ListenerProps {
    fn default() -> Self {
        ListenerProps {
            port: 80,
            open: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddTargetsProps {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Listener {
    pub logical_id: String,
    pub port: u16,

    /// The load balancer's security groups as of listener creation, groups
    /// attached to the balancer afterwards do not get the target rules
    pub connections: Connections,
    load_balancer_full_name: Value,
    vpc: String,
    default_target_group: Option<String>,
}

impl Listener {
    /// Create a target group, forward to it by default and register the targets
    pub fn add_targets(
        &mut self,
        stack: &mut Stack,
        id: &str,
        props: AddTargetsProps,
        targets: &mut [&mut dyn ApplicationTarget],
    ) -> Result<TargetGroup, Error> {
        if self.default_target_group.is_some() {
            return Err(Error::DefaultActionExists(self.logical_id.clone()));
        }

        let group_id = logical_id(&[&self.logical_id, id, "Group"]);

        stack.add_resource(
            &group_id,
            Resource::new(
                "AWS::ElasticLoadBalancingV2::TargetGroup",
                json!({
                    "Port": props.port,
                    "Protocol": "HTTP",
                    "VpcId": reference(&self.vpc)
                }),
            )?,
        )?;

        let target_group = TargetGroup {
            logical_id: group_id,
            port: props.port,
        };

        stack.resource_mut(&self.logical_id)?.set_property(
            "DefaultActions",
            json!([{
                "Type": "forward",
                "TargetGroupArn": target_group.target_group_arn()
            }]),
        );
        self.default_target_group = Some(target_group.logical_id.clone());

        let attachment = TargetGroupAttachment {
            load_balancer_full_name: &self.load_balancer_full_name,
            listener: &self.logical_id,
            target_group: &target_group,
            connections: &self.connections,
            port: props.port,
        };

        for target in targets.iter_mut() {
            let target_type = target.attach_to_target_group(stack, &attachment)?;
            stack
                .resource_mut(&target_group.logical_id)?
                .set_property("TargetType", json!(target_type.as_str()));
        }

        Ok(target_group)
    }

    pub fn allow_default_port_from_any_ipv4(
        &self,
        stack: &mut Stack,
        description: &str,
    ) -> Result<(), Error> {
        self.connections
            .allow_from_any_ipv4(stack, &Port::tcp(self.port), description)
    }
}

#[derive(Debug, Clone)]
pub struct TargetGroup {
    pub logical_id: String,
    pub port: u16,
}

impl TargetGroup {
    pub fn target_group_arn(&self) -> Value {
        reference(&self.logical_id)
    }

    pub fn full_name(&self) -> Value {
        get_att(&self.logical_id, "TargetGroupFullName")
    }
}
