use log::debug;
use serde_json::{json, Value};

use crate::ec2::{
    Connections, InstanceType, MachineImage, Port, SecurityGroup, SecurityGroupProps, SubnetType,
    Vpc,
};
use crate::elbv2::{ApplicationTarget, TargetGroupAttachment, TargetType};
use crate::stack::{Error, Stack};
use crate::template::{base64, join, logical_id, managed_policy_arn, reference, Resource};

#[derive(Debug, Clone)]
pub struct AutoScalingGroupProps {
    pub instance_type: InstanceType,
    pub machine_image: MachineImage,
    pub min_capacity: u32,

    /// Defaults to `max(min_capacity, 1)`
    pub max_capacity: Option<u32>,
    pub desired_capacity: Option<u32>,

    /// A group is created for the instances when unset
    pub security_group: Option<SecurityGroup>,
    pub subnet_type: SubnetType,
}

impl AutoScalingGroupProps {
    pub fn new(instance_type: InstanceType, machine_image: MachineImage) -> Self {
        AutoScalingGroupProps {
            instance_type,
            machine_image,
            min_capacity: 1,
            max_capacity: None,
            desired_capacity: None,
            security_group: None,
            subnet_type: SubnetType::Private,
        }
    }
}

/// Target group the group's instances are registered in
#[derive(Debug, Clone, PartialEq)]
struct LoadBalancerAttachment {
    listener: String,

    /// "<load balancer full name>/<target group full name>"
    resource_label: Value,
}

#[derive(Debug, Clone)]
pub struct AutoScalingGroup {
    pub logical_id: String,
    pub launch_configuration: String,
    pub role: String,
    pub connections: Connections,
    attachments: Vec<LoadBalancerAttachment>,
}

impl AutoScalingGroup {
    pub fn new(
        stack: &mut Stack,
        id: &str,
        vpc: &Vpc,
        props: AutoScalingGroupProps,
    ) -> Result<Self, Error> {
        let min = props.min_capacity;
        let max = props.max_capacity.unwrap_or_else(|| min.max(1));
        let desired = props.desired_capacity;

        let desired_in_range = desired.map(|d| min <= d && d <= max).unwrap_or(true);
        if max == 0 || min > max || !desired_in_range {
            return Err(Error::InvalidCapacity {
                id: id.to_string(),
                min,
                desired,
                max,
            });
        }

        let base = logical_id(&[id]);
        let path = stack.path(id);

        let security_group = match props.security_group {
            Some(group) => group,
            None => SecurityGroup::new(
                stack,
                &format!("{base}InstanceSecurityGroup"),
                vpc,
                SecurityGroupProps::default(),
            )?,
        };

        let role = format!("{base}InstanceRole");
        let profile = format!("{base}InstanceProfile");
        let launch_configuration = format!("{base}LaunchConfig");
        let group = format!("{base}ASG");

        stack.add_resource(
            &role,
            Resource::new(
                "AWS::IAM::Role",
                json!({
                    "AssumeRolePolicyDocument": {
                        "Statement": [{
                            "Action": "sts:AssumeRole",
                            "Effect": "Allow",
                            "Principal": {"Service": "ec2.amazonaws.com"}
                        }],
                        "Version": "2012-10-17"
                    },
                    "Tags": [{"Key": "Name", "Value": path}]
                }),
            )?,
        )?;

        stack.add_resource(
            &profile,
            Resource::new(
                "AWS::IAM::InstanceProfile",
                json!({"Roles": [reference(&role)]}),
            )?,
        )?;

        let image_id = props.machine_image.image_id(stack);

        stack.add_resource(
            &launch_configuration,
            Resource::new(
                "AWS::AutoScaling::LaunchConfiguration",
                json!({
                    "ImageId": image_id,
                    "InstanceType": props.instance_type.as_str(),
                    "IamInstanceProfile": reference(&profile),
                    "SecurityGroups": [security_group.group_id()],
                    "UserData": base64(join("", vec![json!("#!/bin/bash")]))
                }),
            )?
            .depends_on(&[&role]),
        )?;

        let mut properties = json!({
            "MaxSize": max.to_string(),
            "MinSize": min.to_string(),
            "LaunchConfigurationName": reference(&launch_configuration),
            "VPCZoneIdentifier": vpc.subnet_ids(props.subnet_type),
            "Tags": [{"Key": "Name", "PropagateAtLaunch": true, "Value": path}]
        });
        if let Some(desired) = desired {
            properties["DesiredCapacity"] = json!(desired.to_string());
        }

        let mut resource = Resource::new("AWS::AutoScaling::AutoScalingGroup", properties)?;
        resource.update_policy = Some(json!({
            "AutoScalingScheduledAction": {
                "IgnoreUnmodifiedGroupSizeProperties": true
            }
        }));
        stack.add_resource(&group, resource)?;

        debug!(
            "{}: auto scaling group {} ({}, {}..{})",
            stack.name, group, props.instance_type, min, max
        );

        Ok(AutoScalingGroup {
            logical_id: group,
            launch_configuration,
            role,
            connections: Connections::new(vec![security_group], None),
            attachments: vec![],
        })
    }

    pub fn group_name(&self) -> Value {
        reference(&self.logical_id)
    }

    /// Append a line to the instances' user data script
    ///
    /// Parts are joined without separator, so a line may mix strings and tokens.
    pub fn add_user_data(&self, stack: &mut Stack, parts: Vec<Value>) -> Result<(), Error> {
        let launch_configuration = stack.resource_mut(&self.launch_configuration)?;

        let lines = launch_configuration
            .properties
            .get_mut("UserData")
            .and_then(|user_data| user_data.get_mut("Fn::Base64"))
            .and_then(|encoded| encoded.get_mut("Fn::Join"))
            .and_then(|joined| joined.get_mut(1))
            .and_then(Value::as_array_mut)
            .ok_or_else(|| Error::UnknownResource(format!("{}.UserData", self.launch_configuration)))?;

        lines.push(json!("\n"));
        lines.extend(parts);
        Ok(())
    }

    /// Attach an AWS managed policy, e.g. "AmazonSSMManagedInstanceCore"
    pub fn add_managed_policy(&self, stack: &mut Stack, name: &str) -> Result<(), Error> {
        let arn = managed_policy_arn(name);
        let role = stack.resource_mut(&self.role)?;

        let attached = role
            .properties
            .get("ManagedPolicyArns")
            .and_then(Value::as_array)
            .map(|arns| arns.contains(&arn))
            .unwrap_or(false);

        if !attached {
            role.push_property("ManagedPolicyArns", arn);
        }

        Ok(())
    }

    pub fn protect_new_instances_from_scale_in(&self, stack: &mut Stack) -> Result<(), Error> {
        stack
            .resource_mut(&self.logical_id)?
            .set_property("NewInstancesProtectedFromScaleIn", json!(true));
        Ok(())
    }

    /// Track the request count per target of the load balancer in front of the group
    ///
    /// The policy aims at `target_requests_per_second` on every instance,
    /// CloudWatch reports the metric per minute.
    pub fn scale_on_request_count(
        &self,
        stack: &mut Stack,
        id: &str,
        target_requests_per_second: u32,
    ) -> Result<String, Error> {
        let attachment = match self.attachments.as_slice() {
            [] => return Err(Error::NotAttachedToLoadBalancer(self.logical_id.clone())),
            [attachment] => attachment,
            _ => return Err(Error::MultipleLoadBalancers(self.logical_id.clone())),
        };

        let policy = logical_id(&[&self.logical_id, id]);

        stack.add_resource(
            &policy,
            Resource::new(
                "AWS::AutoScaling::ScalingPolicy",
                json!({
                    "AutoScalingGroupName": self.group_name(),
                    "PolicyType": "TargetTrackingScaling",
                    "TargetTrackingConfiguration": {
                        "PredefinedMetricSpecification": {
                            "PredefinedMetricType": "ALBRequestCountPerTarget",
                            "ResourceLabel": attachment.resource_label
                        },
                        "TargetValue": f64::from(target_requests_per_second) * 60.0
                    }
                }),
            )?
            .depends_on(&[&attachment.listener]),
        )?;

        Ok(policy)
    }
}

impl ApplicationTarget for AutoScalingGroup {
    fn attach_to_target_group(
        &mut self,
        stack: &mut Stack,
        attachment: &TargetGroupAttachment,
    ) -> Result<TargetType, Error> {
        stack
            .resource_mut(&self.logical_id)?
            .push_property("TargetGroupARNs", attachment.target_group.target_group_arn());

        attachment.connections.allow_to(
            stack,
            &self.connections,
            &Port::tcp(attachment.port),
            "Load balancer to target",
        )?;

        self.attachments.push(LoadBalancerAttachment {
            listener: attachment.listener.to_string(),
            resource_label: join(
                "/",
                vec![
                    attachment.load_balancer_full_name.clone(),
                    attachment.target_group.full_name(),
                ],
            ),
        });

        Ok(TargetType::Instance)
    }
}
