use std::collections::BTreeMap;

use log::debug;
use serde_json::{json, Value};

use crate::autoscaling::AutoScalingGroup;
use crate::ec2::{Connections, Port, Vpc};
use crate::elbv2::{ApplicationTarget, TargetGroupAttachment, TargetType};
use crate::stack::{Error, Stack};
use crate::template::{get_att, logical_id, reference, Resource};

/// Host ports docker hands out for dynamic port mappings
const EPHEMERAL_PORTS: (u16, u16) = (32768, 65535);

#[derive(Debug, Clone, Default)]
pub struct ClusterProps {
    pub container_insights: bool,
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub logical_id: String,
    pub vpc: Vpc,

    /// Security groups of the instances providing capacity
    pub connections: Connections,
    has_ec2_capacity: bool,
}

impl Cluster {
    pub fn new(stack: &mut Stack, id: &str, vpc: &Vpc, props: ClusterProps) -> Result<Self, Error> {
        let cluster_id = logical_id(&[id]);

        let properties = if props.container_insights {
            json!({"ClusterSettings": [{"Name": "containerInsights", "Value": "enabled"}]})
        } else {
            json!({})
        };

        stack.add_resource(&cluster_id, Resource::new("AWS::ECS::Cluster", properties)?)?;

        Ok(Cluster {
            logical_id: cluster_id,
            vpc: vpc.clone(),
            connections: Connections::default(),
            has_ec2_capacity: false,
        })
    }

    pub fn cluster_name(&self) -> Value {
        reference(&self.logical_id)
    }

    pub fn has_ec2_capacity(&self) -> bool {
        self.has_ec2_capacity
    }

    /// Register a capacity provider and prepare its instances to join the cluster
    pub fn add_asg_capacity_provider(
        &mut self,
        stack: &mut Stack,
        provider: &AsgCapacityProvider,
    ) -> Result<(), Error> {
        let associations = format!("{}CapacityProviderAssociations", self.logical_id);

        if !stack.contains(&associations) {
            stack.add_resource(
                &associations,
                Resource::new(
                    "AWS::ECS::ClusterCapacityProviderAssociations",
                    json!({
                        "Cluster": self.cluster_name(),
                        "CapacityProviders": [],
                        "DefaultCapacityProviderStrategy": []
                    }),
                )?,
            )?;
        }

        let capacity_provider = reference(&provider.logical_id);
        let resource = stack.resource_mut(&associations)?;
        let registered = resource
            .properties
            .get("CapacityProviders")
            .and_then(Value::as_array)
            .map(|providers| providers.contains(&capacity_provider))
            .unwrap_or(false);

        if registered {
            return Ok(());
        }
        resource.push_property("CapacityProviders", capacity_provider);

        self.configure_auto_scaling_group(stack, &provider.auto_scaling_group)?;
        self.has_ec2_capacity = true;

        debug!(
            "{}: {} provides capacity to {}",
            stack.name, provider.logical_id, self.logical_id
        );
        Ok(())
    }

    /// ECS agent settings, instance permissions and network access for the group
    fn configure_auto_scaling_group(
        &mut self,
        stack: &mut Stack,
        group: &AutoScalingGroup,
    ) -> Result<(), Error> {
        group.add_user_data(
            stack,
            vec![
                json!("echo ECS_CLUSTER="),
                self.cluster_name(),
                json!(" >> /etc/ecs/ecs.config"),
            ],
        )?;

        // Containers must not borrow the instance role through the metadata endpoint
        for line in [
            "sudo iptables --insert FORWARD 1 --in-interface docker+ --destination 169.254.169.254/32 --jump DROP",
            "sudo service iptables save",
            "echo ECS_AWSVPC_BLOCK_IMDS=true >> /etc/ecs/ecs.config",
        ] {
            group.add_user_data(stack, vec![json!(line)])?;
        }

        group.add_managed_policy(stack, "service-role/AmazonEC2ContainerServiceforEC2Role")?;

        for security_group in group.connections.security_groups.iter() {
            self.connections.add_security_group(security_group);
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AsgCapacityProviderProps {
    pub capacity_provider_name: Option<String>,
    pub enable_managed_scaling: bool,
    pub enable_managed_termination_protection: bool,
    pub target_capacity_percent: u32,
}

impl Default for AsgCapacityProviderProps {
    fn default() -> Self {
        AsgCapacityProviderProps {
            capacity_provider_name: None,
            enable_managed_scaling: true,
            enable_managed_termination_protection: true,
            target_capacity_percent: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsgCapacityProvider {
    pub logical_id: String,
    pub auto_scaling_group: AutoScalingGroup,
}

impl AsgCapacityProvider {
    pub fn new(
        stack: &mut Stack,
        id: &str,
        auto_scaling_group: &AutoScalingGroup,
        props: AsgCapacityProviderProps,
    ) -> Result<Self, Error> {
        let provider_id = logical_id(&[id]);

        if props.enable_managed_termination_protection && !props.enable_managed_scaling {
            return Err(Error::TerminationProtectionRequiresManagedScaling(provider_id));
        }

        let termination_protection = if props.enable_managed_termination_protection {
            "ENABLED"
        } else {
            "DISABLED"
        };

        let mut group_provider = json!({
            "AutoScalingGroupArn": auto_scaling_group.group_name(),
            "ManagedTerminationProtection": termination_protection
        });
        if props.enable_managed_scaling {
            group_provider["ManagedScaling"] = json!({
                "Status": "ENABLED",
                "TargetCapacity": props.target_capacity_percent
            });
        }

        let mut properties = json!({"AutoScalingGroupProvider": group_provider});
        if let Some(name) = props.capacity_provider_name {
            properties["Name"] = json!(name);
        }

        stack.add_resource(
            &provider_id,
            Resource::new("AWS::ECS::CapacityProvider", properties)?,
        )?;

        if props.enable_managed_termination_protection {
            auto_scaling_group.protect_new_instances_from_scale_in(stack)?;
        }

        Ok(AsgCapacityProvider {
            logical_id: provider_id,
            auto_scaling_group: auto_scaling_group.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage(String);

impl ContainerImage {
    /// Public image from Docker Hub or any other registry, e.g. "amazon/amazon-ecs-sample"
    pub fn from_registry(name: &str) -> Self {
        ContainerImage(name.to_string())
    }

    pub fn image_name(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Bridge,
    Host,
    AwsVpc,
}

impl NetworkMode {
    fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
            NetworkMode::AwsVpc => "awsvpc",
        }
    }
}

#[derive(Debug, Clone)]
pub enum LogDriver {
    AwsLogs { stream_prefix: String },
}

#[derive(Debug, Clone)]
pub struct ContainerDefinitionOptions {
    pub image: ContainerImage,
    pub memory_limit_mib: Option<u32>,
    pub memory_reservation_mib: Option<u32>,
    pub environment: BTreeMap<String, String>,
    pub container_ports: Vec<u16>,
    pub logging: Option<LogDriver>,
}

impl ContainerDefinitionOptions {
    pub fn new(image: ContainerImage) -> Self {
        ContainerDefinitionOptions {
            image,
            memory_limit_mib: None,
            memory_reservation_mib: None,
            environment: BTreeMap::new(),
            container_ports: vec![],
            logging: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DefaultContainer {
    name: String,
    port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Ec2TaskDefinition {
    pub logical_id: String,
    pub task_role: String,
    pub network_mode: NetworkMode,
    execution_role: Option<String>,
    default_container: Option<DefaultContainer>,
}

impl Ec2TaskDefinition {
    pub fn new(stack: &mut Stack, id: &str, network_mode: NetworkMode) -> Result<Self, Error> {
        let task_definition = logical_id(&[id]);
        let task_role = format!("{task_definition}TaskRole");
        let family = logical_id(&[&stack.name, id]);

        stack.add_resource(&task_role, ecs_tasks_role()?)?;

        stack.add_resource(
            &task_definition,
            Resource::new(
                "AWS::ECS::TaskDefinition",
                json!({
                    "ContainerDefinitions": [],
                    "Family": family,
                    "NetworkMode": network_mode.as_str(),
                    "RequiresCompatibilities": ["EC2"],
                    "TaskRoleArn": get_att(&task_role, "Arn")
                }),
            )?,
        )?;

        Ok(Ec2TaskDefinition {
            logical_id: task_definition,
            task_role,
            network_mode,
            execution_role: None,
            default_container: None,
        })
    }

    /// Add a container, the first one receives load balancer traffic
    pub fn add_container(
        &mut self,
        stack: &mut Stack,
        name: &str,
        options: ContainerDefinitionOptions,
    ) -> Result<(), Error> {
        if options.memory_limit_mib.is_none() && options.memory_reservation_mib.is_none() {
            return Err(Error::MissingMemoryLimit(name.to_string()));
        }

        let port_mappings: Vec<Value> = options
            .container_ports
            .iter()
            .map(|port| {
                // Bridge mode maps to a dynamic host port
                let host_port = match self.network_mode {
                    NetworkMode::Bridge => 0,
                    _ => *port,
                };

                json!({
                    "ContainerPort": port,
                    "HostPort": host_port,
                    "Protocol": "tcp"
                })
            })
            .collect();

        let mut container = json!({
            "Essential": true,
            "Image": options.image.image_name(),
            "Name": name,
            "PortMappings": port_mappings
        });

        if let Some(memory) = options.memory_limit_mib {
            container["Memory"] = json!(memory);
        }

        if let Some(reservation) = options.memory_reservation_mib {
            container["MemoryReservation"] = json!(reservation);
        }

        if !options.environment.is_empty() {
            container["Environment"] = options
                .environment
                .iter()
                .map(|(key, value)| json!({"Name": key, "Value": value}))
                .collect();
        }

        if let Some(LogDriver::AwsLogs { stream_prefix }) = &options.logging {
            let log_group = logical_id(&[&self.logical_id, name, "LogGroup"]);

            stack.add_resource(
                &log_group,
                Resource::new("AWS::Logs::LogGroup", json!({}))?.retain(),
            )?;
            self.allow_logging_to(stack, &log_group)?;

            container["LogConfiguration"] = json!({
                "LogDriver": "awslogs",
                "Options": {
                    "awslogs-group": reference(&log_group),
                    "awslogs-stream-prefix": stream_prefix,
                    "awslogs-region": reference("AWS::Region")
                }
            });
        }

        stack
            .resource_mut(&self.logical_id)?
            .push_property("ContainerDefinitions", container);

        if self.default_container.is_none() {
            self.default_container = Some(DefaultContainer {
                name: name.to_string(),
                port: options.container_ports.first().copied(),
            });
        }

        Ok(())
    }

    /// Execution role permissions for the agent to ship logs to a group
    fn allow_logging_to(&mut self, stack: &mut Stack, log_group: &str) -> Result<(), Error> {
        let execution_role = format!("{}ExecutionRole", self.logical_id);
        let policy = format!("{execution_role}DefaultPolicy");

        if self.execution_role.is_none() {
            stack.add_resource(&execution_role, ecs_tasks_role()?)?;
            stack.add_resource(
                &policy,
                Resource::new(
                    "AWS::IAM::Policy",
                    json!({
                        "PolicyDocument": {
                            "Statement": [],
                            "Version": "2012-10-17"
                        },
                        "PolicyName": policy,
                        "Roles": [reference(&execution_role)]
                    }),
                )?,
            )?;
            stack
                .resource_mut(&self.logical_id)?
                .set_property("ExecutionRoleArn", get_att(&execution_role, "Arn"));
            self.execution_role = Some(execution_role);
        }

        let statement = json!({
            "Action": ["logs:CreateLogStream", "logs:PutLogEvents"],
            "Effect": "Allow",
            "Resource": get_att(log_group, "Arn")
        });

        let policy = stack.resource_mut(&policy)?;
        if let Some(Value::Array(statements)) = policy
            .properties
            .get_mut("PolicyDocument")
            .and_then(|document| document.get_mut("Statement"))
        {
            statements.push(statement);
        }

        Ok(())
    }
}

/// Role assumable by ECS tasks
fn ecs_tasks_role() -> Result<Resource, Error> {
    Resource::new(
        "AWS::IAM::Role",
        json!({
            "AssumeRolePolicyDocument": {
                "Statement": [{
                    "Action": "sts:AssumeRole",
                    "Effect": "Allow",
                    "Principal": {"Service": "ecs-tasks.amazonaws.com"}
                }],
                "Version": "2012-10-17"
            }
        }),
    )
}

#[derive(Debug, Clone)]
pub struct Ec2ServiceProps<'a> {
    pub cluster: &'a Cluster,
    pub task_definition: &'a Ec2TaskDefinition,
    pub desired_count: u32,
    pub min_healthy_percent: u32,
    pub max_healthy_percent: u32,

    /// Set to 60 seconds when the service joins a load balancer
    pub health_check_grace_period_seconds: Option<u32>,
}

impl<'a> Ec2ServiceProps<'a> {
    pub fn new(cluster: &'a Cluster, task_definition: &'a Ec2TaskDefinition) -> Self {
        Ec2ServiceProps {
            cluster,
            task_definition,
            desired_count: 1,
            min_healthy_percent: 50,
            max_healthy_percent: 200,
            health_check_grace_period_seconds: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ec2Service {
    pub logical_id: String,
    pub connections: Connections,
    container: DefaultContainer,
    network_mode: NetworkMode,
}

impl Ec2Service {
    pub fn new(stack: &mut Stack, id: &str, props: Ec2ServiceProps) -> Result<Self, Error> {
        let service_id = logical_id(&[id]);

        if !props.cluster.has_ec2_capacity() {
            return Err(Error::NoEc2Capacity(props.cluster.logical_id.clone()));
        }

        let container = props
            .task_definition
            .default_container
            .clone()
            .ok_or_else(|| Error::NoContainers(props.task_definition.logical_id.clone()))?;

        let mut properties = json!({
            "Cluster": props.cluster.cluster_name(),
            "DeploymentConfiguration": {
                "MaximumPercent": props.max_healthy_percent,
                "MinimumHealthyPercent": props.min_healthy_percent
            },
            "DesiredCount": props.desired_count,
            "EnableECSManagedTags": false,
            "LaunchType": "EC2",
            "SchedulingStrategy": "REPLICA",
            "TaskDefinition": reference(&props.task_definition.logical_id)
        });
        if let Some(grace_period) = props.health_check_grace_period_seconds {
            properties["HealthCheckGracePeriodSeconds"] = json!(grace_period);
        }

        stack.add_resource(&service_id, Resource::new("AWS::ECS::Service", properties)?)?;

        Ok(Ec2Service {
            logical_id: service_id,
            connections: props.cluster.connections.clone(),
            container,
            network_mode: props.task_definition.network_mode,
        })
    }
}

impl ApplicationTarget for Ec2Service {
    fn attach_to_target_group(
        &mut self,
        stack: &mut Stack,
        attachment: &TargetGroupAttachment,
    ) -> Result<TargetType, Error> {
        let container_port = self.container.port.unwrap_or(attachment.port);

        let service = stack.resource_mut(&self.logical_id)?;
        service.push_property(
            "LoadBalancers",
            json!({
                "ContainerName": self.container.name,
                "ContainerPort": container_port,
                "TargetGroupArn": attachment.target_group.target_group_arn()
            }),
        );
        if !service.properties.contains_key("HealthCheckGracePeriodSeconds") {
            service.set_property("HealthCheckGracePeriodSeconds", json!(60));
        }
        // The target group only becomes valid once a listener uses it
        service.add_dependency(attachment.listener);

        let (port, target_type) = match self.network_mode {
            NetworkMode::Bridge => (
                Port::tcp_range(EPHEMERAL_PORTS.0, EPHEMERAL_PORTS.1)?,
                TargetType::Instance,
            ),
            NetworkMode::Host => (Port::tcp(container_port), TargetType::Instance),
            NetworkMode::AwsVpc => (Port::tcp(container_port), TargetType::Ip),
        };

        attachment
            .connections
            .allow_to(stack, &self.connections, &port, "Load balancer to target")?;

        Ok(target_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaling::AutoScalingGroupProps;
    use crate::ec2::{InstanceType, MachineImage, VpcProps};

    fn cluster_with_group(stack: &mut Stack) -> (Cluster, AutoScalingGroup) {
        let vpc = Vpc::new(stack, "Vpc", VpcProps::default()).unwrap();
        let cluster = Cluster::new(
            stack,
            "cluster",
            &vpc,
            ClusterProps {
                container_insights: true,
            },
        )
        .unwrap();
        let group = AutoScalingGroup::new(
            stack,
            "ASG",
            &vpc,
            AutoScalingGroupProps {
                min_capacity: 0,
                max_capacity: Some(5),
                desired_capacity: Some(1),
                ..AutoScalingGroupProps::new(
                    InstanceType::new("t2.medium"),
                    MachineImage::EcsOptimizedAmazonLinux2,
                )
            },
        )
        .unwrap();

        (cluster, group)
    }

    fn task_definition(stack: &mut Stack) -> Ec2TaskDefinition {
        let mut task_definition =
            Ec2TaskDefinition::new(stack, "TaskDef", NetworkMode::Bridge).unwrap();
        let options = ContainerDefinitionOptions {
            memory_limit_mib: Some(512),
            container_ports: vec![80],
            ..ContainerDefinitionOptions::new(ContainerImage::from_registry("nginx"))
        };
        task_definition.add_container(stack, "web", options).unwrap();
        task_definition
    }

    #[test]
    fn service_needs_capacity() {
        let mut stack = Stack::new("Test");
        let (cluster, _) = cluster_with_group(&mut stack);
        let task_definition = task_definition(&mut stack);

        let result = Ec2Service::new(
            &mut stack,
            "Service",
            Ec2ServiceProps::new(&cluster, &task_definition),
        );
        assert_eq!(result.err(), Some(Error::NoEc2Capacity("cluster".to_string())));
    }

    #[test]
    fn service_needs_a_container() {
        let mut stack = Stack::new("Test");
        let (mut cluster, group) = cluster_with_group(&mut stack);
        let provider = AsgCapacityProvider::new(
            &mut stack,
            "AsgCapacityProvider",
            &group,
            AsgCapacityProviderProps::default(),
        )
        .unwrap();
        cluster
            .add_asg_capacity_provider(&mut stack, &provider)
            .unwrap();

        let empty = Ec2TaskDefinition::new(&mut stack, "Empty", NetworkMode::Bridge).unwrap();
        let result = Ec2Service::new(
            &mut stack,
            "Service",
            Ec2ServiceProps::new(&cluster, &empty),
        );

        assert_eq!(result.err(), Some(Error::NoContainers("Empty".to_string())));
        assert!(!stack.contains("Service"));
    }

    #[test]
    fn termination_protection_needs_managed_scaling() {
        let mut stack = Stack::new("Test");
        let (_, group) = cluster_with_group(&mut stack);

        let props = AsgCapacityProviderProps {
            enable_managed_scaling: false,
            ..AsgCapacityProviderProps::default()
        };
        let result = AsgCapacityProvider::new(&mut stack, "Provider", &group, props);

        assert!(matches!(
            result,
            Err(Error::TerminationProtectionRequiresManagedScaling(_))
        ));
    }

    #[test]
    fn capacity_provider_prepares_instances() {
        let mut stack = Stack::new("Test");
        let (mut cluster, group) = cluster_with_group(&mut stack);

        let provider = AsgCapacityProvider::new(
            &mut stack,
            "AsgCapacityProvider",
            &group,
            AsgCapacityProviderProps::default(),
        )
        .unwrap();
        cluster
            .add_asg_capacity_provider(&mut stack, &provider)
            .unwrap();
        cluster
            .add_asg_capacity_provider(&mut stack, &provider)
            .unwrap();

        assert!(cluster.has_ec2_capacity());
        assert_eq!(cluster.connections.security_groups.len(), 1);

        let template = stack.synth().unwrap();
        let associations = &template.resources["clusterCapacityProviderAssociations"];
        assert_eq!(
            associations.properties["CapacityProviders"],
            json!([reference("AsgCapacityProvider")])
        );

        let group = &template.resources["ASGASG"];
        assert_eq!(group.properties["NewInstancesProtectedFromScaleIn"], true);

        let user_data = &template.resources["ASGLaunchConfig"].properties["UserData"];
        let lines = &user_data["Fn::Base64"]["Fn::Join"][1];
        assert!(lines.as_array().unwrap().contains(&reference("cluster")));

        let cluster = &template.resources["cluster"];
        assert_eq!(
            cluster.properties["ClusterSettings"][0]["Value"],
            "enabled"
        );
    }

    #[test]
    fn container_needs_memory() {
        let mut stack = Stack::new("Test");
        let mut task_definition =
            Ec2TaskDefinition::new(&mut stack, "TaskDef", NetworkMode::Bridge).unwrap();

        let result = task_definition.add_container(
            &mut stack,
            "web",
            ContainerDefinitionOptions::new(ContainerImage::from_registry("nginx")),
        );
        assert_eq!(result, Err(Error::MissingMemoryLimit("web".to_string())));
    }

    #[test]
    fn awslogs_creates_group_and_execution_role() {
        let mut stack = Stack::new("Test");
        let mut task_definition =
            Ec2TaskDefinition::new(&mut stack, "TaskDef", NetworkMode::Bridge).unwrap();

        let mut environment = BTreeMap::new();
        environment.insert("KEY".to_string(), "value".to_string());
        let options = ContainerDefinitionOptions {
            memory_limit_mib: Some(256),
            environment,
            container_ports: vec![80],
            logging: Some(LogDriver::AwsLogs {
                stream_prefix: "web".to_string(),
            }),
            ..ContainerDefinitionOptions::new(ContainerImage::from_registry("nginx"))
        };
        task_definition
            .add_container(&mut stack, "web", options)
            .unwrap();

        let template = stack.synth().unwrap();
        let definition = &template.resources["TaskDef"];
        let container = &definition.properties["ContainerDefinitions"][0];

        assert_eq!(container["PortMappings"][0]["HostPort"], 0);
        assert_eq!(container["Environment"], json!([{"Name": "KEY", "Value": "value"}]));
        assert_eq!(
            container["LogConfiguration"]["Options"]["awslogs-group"],
            reference("TaskDefwebLogGroup")
        );
        assert_eq!(
            definition.properties["ExecutionRoleArn"],
            get_att("TaskDefExecutionRole", "Arn")
        );
        assert_eq!(
            template.resources["TaskDefwebLogGroup"].deletion_policy.as_deref(),
            Some("Retain")
        );
    }
}
