use std::fmt;
use std::net::Ipv4Addr;

use log::debug;
use serde_json::{json, Value};

use crate::stack::{Error, Stack};
use crate::template::{get_att, get_azs, logical_id, reference, select, Parameter, Resource};

/// Environment-agnostic stacks only know about two availability zones
const AGNOSTIC_AZS: usize = 2;

/// Smallest subnet AWS allows
const MAX_SUBNET_PREFIX: u8 = 28;

const ANY_IPV4: &str = "0.0.0.0/0";

#[derive(Debug, Clone)]
pub struct VpcProps {
    pub cidr: String,
    pub max_azs: usize,

    /// One per availability zone when unset
    pub nat_gateways: Option<usize>,
}

impl Default for VpcProps {
    fn default() -> Self {
        VpcProps {
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 3,
            nat_gateways: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subnet {
    pub logical_id: String,
    pub cidr: String,
    pub route_table: String,
    pub association: String,
    pub default_route: String,
}

impl Subnet {
    pub fn subnet_id(&self) -> Value {
        reference(&self.logical_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum SubnetType {
    Public,
    Private,
}

#[derive(Debug, Clone)]
pub struct Vpc {
    pub logical_id: String,
    pub public_subnets: Vec<Subnet>,
    pub private_subnets: Vec<Subnet>,
}

impl Vpc {
    pub fn new(stack: &mut Stack, id: &str, props: VpcProps) -> Result<Self, Error> {
        let azs = props.max_azs.min(AGNOSTIC_AZS);
        if azs == 0 {
            return Err(Error::NoAvailabilityZones);
        }

        let nat_gateways = props.nat_gateways.unwrap_or(azs).min(azs);
        let blocks = split_cidr(&props.cidr, azs * 2)?;
        let vpc_id = logical_id(&[id]);
        let path = stack.path(id);

        stack.add_resource(
            &vpc_id,
            Resource::new(
                "AWS::EC2::VPC",
                json!({
                    "CidrBlock": props.cidr,
                    "EnableDnsHostnames": true,
                    "EnableDnsSupport": true,
                    "InstanceTenancy": "default",
                    "Tags": [{"Key": "Name", "Value": path}]
                }),
            )?,
        )?;

        let igw = format!("{vpc_id}IGW");
        let gateway_attachment = format!("{vpc_id}VPCGW");

        stack.add_resource(
            &igw,
            Resource::new(
                "AWS::EC2::InternetGateway",
                json!({"Tags": [{"Key": "Name", "Value": path}]}),
            )?,
        )?;

        stack.add_resource(
            &gateway_attachment,
            Resource::new(
                "AWS::EC2::VPCGatewayAttachment",
                json!({
                    "VpcId": reference(&vpc_id),
                    "InternetGatewayId": reference(&igw)
                }),
            )?,
        )?;

        let mut public_subnets = Vec::with_capacity(azs);
        let mut nat_ids = Vec::with_capacity(nat_gateways);

        for az in 0..azs {
            let name = format!("PublicSubnet{}", az + 1);
            let subnet = add_subnet(stack, id, &name, az, &blocks[az], SubnetType::Public)?;

            stack.add_resource(
                &subnet.default_route,
                Resource::new(
                    "AWS::EC2::Route",
                    json!({
                        "RouteTableId": reference(&subnet.route_table),
                        "DestinationCidrBlock": ANY_IPV4,
                        "GatewayId": reference(&igw)
                    }),
                )?
                .depends_on(&[&gateway_attachment]),
            )?;

            if az < nat_gateways {
                let eip = logical_id(&[id, &name, "EIP"]);
                let nat = logical_id(&[id, &name, "NATGateway"]);
                let tags = json!([{"Key": "Name", "Value": stack.path(&format!("{id}/{name}"))}]);

                stack.add_resource(
                    &eip,
                    Resource::new("AWS::EC2::EIP", json!({"Domain": "vpc", "Tags": tags}))?,
                )?;

                stack.add_resource(
                    &nat,
                    Resource::new(
                        "AWS::EC2::NatGateway",
                        json!({
                            "SubnetId": subnet.subnet_id(),
                            "AllocationId": get_att(&eip, "AllocationId"),
                            "Tags": tags
                        }),
                    )?
                    .depends_on(&[&subnet.default_route, &subnet.association]),
                )?;

                nat_ids.push(nat);
            }

            public_subnets.push(subnet);
        }

        let mut private_subnets = Vec::with_capacity(azs);

        for az in 0..azs {
            let name = format!("PrivateSubnet{}", az + 1);
            let block = &blocks[azs + az];
            let subnet = add_subnet(stack, id, &name, az, block, SubnetType::Private)?;

            // Without NAT gateways private subnets stay isolated
            if !nat_ids.is_empty() {
                let nat = &nat_ids[az % nat_ids.len()];
                stack.add_resource(
                    &subnet.default_route,
                    Resource::new(
                        "AWS::EC2::Route",
                        json!({
                            "RouteTableId": reference(&subnet.route_table),
                            "DestinationCidrBlock": ANY_IPV4,
                            "NatGatewayId": reference(nat)
                        }),
                    )?,
                )?;
            }

            private_subnets.push(subnet);
        }

        debug!(
            "{}: VPC {} with {} availability zones and {} NAT gateways",
            stack.name, vpc_id, azs, nat_gateways
        );

        Ok(Vpc {
            logical_id: vpc_id,
            public_subnets,
            private_subnets,
        })
    }

    pub fn vpc_id(&self) -> Value {
        reference(&self.logical_id)
    }

    pub fn subnets(&self, subnet_type: SubnetType) -> &[Subnet] {
        match subnet_type {
            SubnetType::Public => &self.public_subnets,
            SubnetType::Private => &self.private_subnets,
        }
    }

    pub fn subnet_ids(&self, subnet_type: SubnetType) -> Vec<Value> {
        self.subnets(subnet_type)
            .iter()
            .map(Subnet::subnet_id)
            .collect()
    }
}

/// Subnet, its route table and the association between them
fn add_subnet(
    stack: &mut Stack,
    vpc_id: &str,
    name: &str,
    az: usize,
    cidr: &str,
    subnet_type: SubnetType,
) -> Result<Subnet, Error> {
    let vpc = logical_id(&[vpc_id]);
    let subnet_id = logical_id(&[vpc_id, name, "Subnet"]);
    let route_table = logical_id(&[vpc_id, name, "RouteTable"]);
    let association = logical_id(&[vpc_id, name, "RouteTableAssociation"]);
    let default_route = logical_id(&[vpc_id, name, "DefaultRoute"]);
    let path = stack.path(&format!("{vpc_id}/{name}"));

    let (kind, public) = match subnet_type {
        SubnetType::Public => ("Public", true),
        SubnetType::Private => ("Private", false),
    };

    stack.add_resource(
        &subnet_id,
        Resource::new(
            "AWS::EC2::Subnet",
            json!({
                "VpcId": reference(&vpc),
                "AvailabilityZone": select(az, get_azs()),
                "CidrBlock": cidr,
                "MapPublicIpOnLaunch": public,
                "Tags": [
                    {"Key": "aws-cdk:subnet-name", "Value": kind},
                    {"Key": "aws-cdk:subnet-type", "Value": kind},
                    {"Key": "Name", "Value": path}
                ]
            }),
        )?,
    )?;

    stack.add_resource(
        &route_table,
        Resource::new(
            "AWS::EC2::RouteTable",
            json!({
                "VpcId": reference(&vpc),
                "Tags": [{"Key": "Name", "Value": path}]
            }),
        )?,
    )?;

    stack.add_resource(
        &association,
        Resource::new(
            "AWS::EC2::SubnetRouteTableAssociation",
            json!({
                "RouteTableId": reference(&route_table),
                "SubnetId": reference(&subnet_id)
            }),
        )?,
    )?;

    Ok(Subnet {
        logical_id: subnet_id,
        cidr: cidr.to_string(),
        route_table,
        association,
        default_route,
    })
}

fn parse_cidr(cidr: &str) -> Result<(u32, u8), Error> {
    let invalid = || Error::InvalidCidr(cidr.to_string());

    let (address, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;

    if prefix > 32 {
        return Err(invalid());
    }

    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    Ok((u32::from(address) & mask, prefix))
}

/// Carve `count` equal blocks out of a CIDR, rounding up to a power of two
fn split_cidr(cidr: &str, count: usize) -> Result<Vec<String>, Error> {
    let (network, prefix) = parse_cidr(cidr)?;
    let bits = count.next_power_of_two().trailing_zeros() as u8;
    let subnet_prefix = prefix + bits;

    if subnet_prefix > MAX_SUBNET_PREFIX {
        return Err(Error::InvalidCidr(cidr.to_string()));
    }

    let size = 1u32 << (32 - subnet_prefix);

    Ok((0..count as u32)
        .map(|i| format!("{}/{}", Ipv4Addr::from(network + i * size), subnet_prefix))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::All => "-1",
        }
    }
}

/// Protocol and port range of a security group rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub label: String,
    pub protocol: Protocol,
    pub from: u16,
    pub to: u16,
}

impl Port {
    pub fn new(label: &str, protocol: Protocol, from: u16, to: u16) -> Result<Self, Error> {
        if from > to {
            return Err(Error::InvalidPortRange { from, to });
        }

        Ok(Port {
            label: label.to_string(),
            protocol,
            from,
            to,
        })
    }

    pub fn tcp(port: u16) -> Self {
        Port {
            label: port.to_string(),
            protocol: Protocol::Tcp,
            from: port,
            to: port,
        }
    }

    pub fn tcp_range(from: u16, to: u16) -> Result<Self, Error> {
        Port::new(&format!("{from}-{to}"), Protocol::Tcp, from, to)
    }

    pub fn all_traffic() -> Self {
        Port {
            label: "ALL TRAFFIC".to_string(),
            protocol: Protocol::All,
            from: 0,
            to: 65535,
        }
    }

    /// Protocol and range as a logical ID fragment, e.g. `tcp80` or `tcp32768to65535`
    fn id_part(&self) -> String {
        match self.protocol {
            Protocol::All => "all".to_string(),
            protocol if self.from == self.to => format!("{}{}", protocol.as_str(), self.from),
            protocol => format!("{}{}to{}", protocol.as_str(), self.from, self.to),
        }
    }

    /// IpProtocol, FromPort and ToPort of a rule
    fn rule_fields(&self) -> serde_json::Map<String, Value> {
        let mut fields = serde_json::Map::new();
        fields.insert("IpProtocol".into(), json!(self.protocol.as_str()));

        if self.protocol != Protocol::All {
            fields.insert("FromPort".into(), json!(self.from));
            fields.insert("ToPort".into(), json!(self.to));
        }

        fields
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Resource type and peer side of a group-to-group rule
struct GroupRule<'a> {
    kind: &'a str,
    direction: &'a str,
    peer_key: &'a str,
    peer: &'a str,
}

/// Source or destination of a security group rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Ipv4(String),
    SecurityGroup(String),
}

impl Peer {
    pub fn any_ipv4() -> Self {
        Peer::Ipv4(ANY_IPV4.to_string())
    }

    pub fn ipv4(cidr: &str) -> Self {
        Peer::Ipv4(cidr.to_string())
    }

    pub fn security_group(group: &SecurityGroup) -> Self {
        Peer::SecurityGroup(group.logical_id.clone())
    }

    fn unique_id(&self) -> &str {
        match self {
            Peer::Ipv4(cidr) => cidr,
            Peer::SecurityGroup(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityGroupProps {
    /// Defaults to the construct path
    pub description: Option<String>,
    pub security_group_name: Option<String>,
    pub allow_all_outbound: bool,
}

impl Default for SecurityGroupProps {
    fn default() -> Self {
        SecurityGroupProps {
            description: None,
            security_group_name: None,
            allow_all_outbound: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecurityGroup {
    pub logical_id: String,
    pub allow_all_outbound: bool,
}

impl SecurityGroup {
    pub fn new(
        stack: &mut Stack,
        id: &str,
        vpc: &Vpc,
        props: SecurityGroupProps,
    ) -> Result<Self, Error> {
        let logical_id = logical_id(&[id]);
        let description = props.description.unwrap_or_else(|| stack.path(id));

        let egress = if props.allow_all_outbound {
            json!({
                "CidrIp": ANY_IPV4,
                "Description": "Allow all outbound traffic by default",
                "IpProtocol": "-1"
            })
        } else {
            disallow_all_rule()
        };

        let mut properties = json!({
            "GroupDescription": description,
            "VpcId": vpc.vpc_id(),
            "SecurityGroupEgress": [egress]
        });
        if let Some(name) = props.security_group_name {
            properties["GroupName"] = json!(name);
        }

        stack.add_resource(
            &logical_id,
            Resource::new("AWS::EC2::SecurityGroup", properties)?,
        )?;

        Ok(SecurityGroup {
            logical_id,
            allow_all_outbound: props.allow_all_outbound,
        })
    }

    pub fn group_id(&self) -> Value {
        get_att(&self.logical_id, "GroupId")
    }

    /// Allow traffic in from a peer
    ///
    /// CIDR peers are inlined into the group, group peers get their own
    /// resource so that two groups can reference each other. A rule for the
    /// same peer and port is only added once.
    pub fn add_ingress_rule(
        &self,
        stack: &mut Stack,
        peer: &Peer,
        port: &Port,
        description: Option<&str>,
    ) -> Result<(), Error> {
        let description = description
            .map(str::to_string)
            .unwrap_or_else(|| format!("from {}:{}", peer.unique_id(), port));

        match peer {
            Peer::Ipv4(cidr) => {
                let mut rule = port.rule_fields();
                rule.insert("CidrIp".into(), json!(cidr));
                rule.insert("Description".into(), json!(description));
                self.push_inline_rule(stack, "SecurityGroupIngress", Value::Object(rule))
            }
            Peer::SecurityGroup(source) => self.add_group_rule(
                stack,
                GroupRule {
                    kind: "AWS::EC2::SecurityGroupIngress",
                    direction: "from",
                    peer_key: "SourceSecurityGroupId",
                    peer: source,
                },
                port,
                description,
            ),
        }
    }

    /// Allow traffic out to a peer, a no-op when all outbound traffic is allowed
    pub fn add_egress_rule(
        &self,
        stack: &mut Stack,
        peer: &Peer,
        port: &Port,
        description: Option<&str>,
    ) -> Result<(), Error> {
        if self.allow_all_outbound {
            return Ok(());
        }

        let description = description
            .map(str::to_string)
            .unwrap_or_else(|| format!("to {}:{}", peer.unique_id(), port));

        match peer {
            Peer::Ipv4(cidr) => {
                let group = stack.resource_mut(&self.logical_id)?;
                if let Some(Value::Array(rules)) = group.properties.get_mut("SecurityGroupEgress") {
                    rules.retain(|rule| *rule != disallow_all_rule());
                }

                let mut rule = port.rule_fields();
                rule.insert("CidrIp".into(), json!(cidr));
                rule.insert("Description".into(), json!(description));
                self.push_inline_rule(stack, "SecurityGroupEgress", Value::Object(rule))
            }
            Peer::SecurityGroup(destination) => self.add_group_rule(
                stack,
                GroupRule {
                    kind: "AWS::EC2::SecurityGroupEgress",
                    direction: "to",
                    peer_key: "DestinationSecurityGroupId",
                    peer: destination,
                },
                port,
                description,
            ),
        }
    }

    /// Standalone rule towards another group, keyed by direction, peer, protocol and ports
    ///
    /// An existing rule under the same ID is only skipped when it allows the
    /// same traffic, anything else surfaces as a duplicate logical ID.
    fn add_group_rule(
        &self,
        stack: &mut Stack,
        rule: GroupRule,
        port: &Port,
        description: String,
    ) -> Result<(), Error> {
        let id = logical_id(&[&self.logical_id, rule.direction, rule.peer, &port.id_part()]);

        let mut properties = port.rule_fields();
        properties.insert("GroupId".into(), self.group_id());
        properties.insert(rule.peer_key.into(), get_att(rule.peer, "GroupId"));

        if let Ok(existing) = stack.resource(&id) {
            let same_traffic = existing.kind == rule.kind
                && properties
                    .iter()
                    .all(|(key, value)| existing.properties.get(key) == Some(value));

            if same_traffic {
                debug!("{}: skipping duplicate rule {}", self.logical_id, id);
                return Ok(());
            }
        }

        properties.insert("Description".into(), json!(description));
        stack.add_resource(&id, Resource::new(rule.kind, Value::Object(properties))?)
    }

    fn push_inline_rule(&self, stack: &mut Stack, key: &str, rule: Value) -> Result<(), Error> {
        let group = stack.resource_mut(&self.logical_id)?;

        let duplicate = group
            .properties
            .get(key)
            .and_then(Value::as_array)
            .map(|rules| rules.iter().any(|existing| same_rule(existing, &rule)))
            .unwrap_or(false);

        if duplicate {
            debug!("{}: skipping duplicate {} rule", self.logical_id, key);
            return Ok(());
        }

        group.push_property(key, rule);
        Ok(())
    }
}

/// Egress placeholder for groups with no outbound traffic allowed
fn disallow_all_rule() -> Value {
    json!({
        "CidrIp": "255.255.255.255/32",
        "Description": "Disallow all traffic",
        "FromPort": 252,
        "IpProtocol": "icmp",
        "ToPort": 86
    })
}

/// Rules are equal when peer and port match, descriptions are ignored
fn same_rule(a: &Value, b: &Value) -> bool {
    ["CidrIp", "IpProtocol", "FromPort", "ToPort"]
        .iter()
        .all(|key| a.get(key) == b.get(key))
}

/// Security groups of a construct together with its default port
#[derive(Debug, Clone, Default)]
pub struct Connections {
    pub security_groups: Vec<SecurityGroup>,
    pub default_port: Option<Port>,
}

impl Connections {
    pub fn new(security_groups: Vec<SecurityGroup>, default_port: Option<Port>) -> Self {
        Connections {
            security_groups,
            default_port,
        }
    }

    pub fn add_security_group(&mut self, group: &SecurityGroup) {
        if !self.security_groups.contains(group) {
            self.security_groups.push(group.clone());
        }
    }

    /// Let `other` reach us on `port`, emitting the matching egress on its side
    pub fn allow_from(
        &self,
        stack: &mut Stack,
        other: &Connections,
        port: &Port,
        description: &str,
    ) -> Result<(), Error> {
        for ours in self.security_groups.iter() {
            for theirs in other.security_groups.iter() {
                ours.add_ingress_rule(stack, &Peer::security_group(theirs), port, Some(description))?;
                theirs.add_egress_rule(stack, &Peer::security_group(ours), port, Some(description))?;
            }
        }

        Ok(())
    }

    pub fn allow_to(
        &self,
        stack: &mut Stack,
        other: &Connections,
        port: &Port,
        description: &str,
    ) -> Result<(), Error> {
        other.allow_from(stack, self, port, description)
    }

    pub fn allow_from_any_ipv4(
        &self,
        stack: &mut Stack,
        port: &Port,
        description: &str,
    ) -> Result<(), Error> {
        for group in self.security_groups.iter() {
            group.add_ingress_rule(stack, &Peer::any_ipv4(), port, Some(description))?;
        }

        Ok(())
    }

    /// Open the default port to a peer, a no-op without a default port
    pub fn allow_default_port_from(
        &self,
        stack: &mut Stack,
        peer: &Peer,
        description: &str,
    ) -> Result<(), Error> {
        let port = match &self.default_port {
            Some(port) => port,
            None => return Ok(()),
        };

        for group in self.security_groups.iter() {
            group.add_ingress_rule(stack, peer, port, Some(description))?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceClass {
    Burstable2,
    Burstable3,
    Burstable3Amd,
    Burstable4Graviton,
    Standard5,
    Compute5,
    Memory5,
}

impl InstanceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceClass::Burstable2 => "t2",
            InstanceClass::Burstable3 => "t3",
            InstanceClass::Burstable3Amd => "t3a",
            InstanceClass::Burstable4Graviton => "t4g",
            InstanceClass::Standard5 => "m5",
            InstanceClass::Compute5 => "c5",
            InstanceClass::Memory5 => "r5",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceSize {
    Nano,
    Micro,
    Small,
    Medium,
    Large,
    Xlarge,
    Xlarge2,
}

impl InstanceSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceSize::Nano => "nano",
            InstanceSize::Micro => "micro",
            InstanceSize::Small => "small",
            InstanceSize::Medium => "medium",
            InstanceSize::Large => "large",
            InstanceSize::Xlarge => "xlarge",
            InstanceSize::Xlarge2 => "2xlarge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceType(String);

impl InstanceType {
    pub fn new(name: &str) -> Self {
        InstanceType(name.to_string())
    }

    pub fn of(class: InstanceClass, size: InstanceSize) -> Self {
        InstanceType(format!("{}.{}", class.as_str(), size.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineImage {
    /// Latest Amazon Linux, HVM, x86_64, gp2
    AmazonLinux,

    /// Latest ECS-optimized Amazon Linux 2
    EcsOptimizedAmazonLinux2,

    Ami(String),
}

impl MachineImage {
    fn ssm_parameter(&self) -> Option<&'static str> {
        match self {
            MachineImage::AmazonLinux => {
                Some("/aws/service/ami-amazon-linux-latest/amzn-ami-hvm-x86_64-gp2")
            }
            MachineImage::EcsOptimizedAmazonLinux2 => {
                Some("/aws/service/ecs/optimized-ami/amazon-linux-2/recommended/image_id")
            }
            MachineImage::Ami(_) => None,
        }
    }

    /// Image ID to launch, resolved from SSM at deploy time when possible
    pub fn image_id(&self, stack: &mut Stack) -> Value {
        if let MachineImage::Ami(id) = self {
            return json!(id);
        }

        match self.ssm_parameter() {
            Some(path) => {
                let id = logical_id(&["SsmParameterValue", path, "Parameter"]);
                stack.add_parameter(
                    &id,
                    Parameter {
                        kind: "AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>".to_string(),
                        default: Some(path.to_string()),
                        description: None,
                    },
                );
                reference(&id)
            }
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpc(stack: &mut Stack) -> Vpc {
        Vpc::new(stack, "VPC", VpcProps::default()).unwrap()
    }

    #[test]
    fn splits_cidr_into_equal_blocks() {
        assert_eq!(
            split_cidr("10.0.0.0/16", 4).unwrap(),
            vec!["10.0.0.0/18", "10.0.64.0/18", "10.0.128.0/18", "10.0.192.0/18"]
        );
        assert_eq!(
            split_cidr("10.0.0.0/16", 6).unwrap()[5],
            "10.0.160.0/19".to_string()
        );
    }

    #[test]
    fn rejects_bad_cidr() {
        assert!(matches!(split_cidr("10.0.0/16", 4), Err(Error::InvalidCidr(_))));
        assert!(matches!(split_cidr("10.0.0.0/27", 4), Err(Error::InvalidCidr(_))));
    }

    #[test]
    fn vpc_has_public_and_private_subnet_per_az() {
        let mut stack = Stack::new("Test");
        let vpc = vpc(&mut stack);

        assert_eq!(vpc.public_subnets.len(), 2);
        assert_eq!(vpc.private_subnets.len(), 2);
        assert_eq!(vpc.public_subnets[0].cidr, "10.0.0.0/18");
        assert_eq!(vpc.private_subnets[1].cidr, "10.0.192.0/18");

        let template = stack.synth().unwrap();
        assert_eq!(template.resources_of_type("AWS::EC2::NatGateway").len(), 2);
        assert_eq!(template.resources_of_type("AWS::EC2::Subnet").len(), 4);

        let private_route = &template.resources["VPCPrivateSubnet2DefaultRoute"];
        assert_eq!(
            private_route.properties["NatGatewayId"],
            reference("VPCPublicSubnet2NATGateway")
        );
    }

    #[test]
    fn single_nat_gateway_is_shared() {
        let mut stack = Stack::new("Test");
        let props = VpcProps {
            nat_gateways: Some(1),
            ..VpcProps::default()
        };
        Vpc::new(&mut stack, "VPC", props).unwrap();

        let template = stack.synth().unwrap();
        assert_eq!(template.resources_of_type("AWS::EC2::NatGateway").len(), 1);
        assert_eq!(
            template.resources["VPCPrivateSubnet2DefaultRoute"].properties["NatGatewayId"],
            reference("VPCPublicSubnet1NATGateway")
        );
    }

    #[test]
    fn rejects_zero_azs() {
        let mut stack = Stack::new("Test");
        let props = VpcProps {
            max_azs: 0,
            ..VpcProps::default()
        };

        assert_eq!(
            Vpc::new(&mut stack, "VPC", props).err(),
            Some(Error::NoAvailabilityZones)
        );
    }

    #[test]
    fn rejects_reversed_port_range() {
        assert_eq!(
            Port::tcp_range(80, 79),
            Err(Error::InvalidPortRange { from: 80, to: 79 })
        );
    }

    #[test]
    fn cidr_ingress_is_deduplicated() {
        let mut stack = Stack::new("Test");
        let vpc = vpc(&mut stack);
        let group = SecurityGroup::new(&mut stack, "lb-sg", &vpc, SecurityGroupProps::default())
            .unwrap();

        let port = Port::tcp(80);
        group
            .add_ingress_rule(&mut stack, &Peer::any_ipv4(), &port, Some("first"))
            .unwrap();
        group
            .add_ingress_rule(&mut stack, &Peer::any_ipv4(), &port, Some("second"))
            .unwrap();

        let rules = &stack.resource("lbsg").unwrap().properties["SecurityGroupIngress"];
        assert_eq!(rules.as_array().unwrap().len(), 1);
        assert_eq!(rules[0]["Description"], "first");
        assert_eq!(rules[0]["FromPort"], 80);
    }

    #[test]
    fn group_peer_gets_its_own_ingress_resource() {
        let mut stack = Stack::new("Test");
        let vpc = vpc(&mut stack);
        let lb = SecurityGroup::new(&mut stack, "lb-sg", &vpc, SecurityGroupProps::default())
            .unwrap();
        let asg = SecurityGroup::new(&mut stack, "asg-sg", &vpc, SecurityGroupProps::default())
            .unwrap();

        let port = Port::tcp_range(32768, 65535).unwrap();
        asg.add_ingress_rule(&mut stack, &Peer::security_group(&lb), &port, None)
            .unwrap();

        let template = stack.synth().unwrap();
        let ingress = template.resources_of_type("AWS::EC2::SecurityGroupIngress");
        assert_eq!(ingress.len(), 1);

        let (id, rule) = ingress[0];
        assert_eq!(id, "asgsgfromlbsgtcp32768to65535");
        assert_eq!(rule.properties["SourceSecurityGroupId"], get_att("lbsg", "GroupId"));
        assert_eq!(rule.properties["GroupId"], get_att("asgsg", "GroupId"));
        assert_eq!(rule.properties["Description"], "from lbsg:32768-65535");
    }

    #[test]
    fn group_rules_are_keyed_by_protocol_and_range() {
        let mut stack = Stack::new("Test");
        let vpc = vpc(&mut stack);
        let lb = SecurityGroup::new(&mut stack, "lb", &vpc, SecurityGroupProps::default())
            .unwrap();
        let asg = SecurityGroup::new(&mut stack, "asg", &vpc, SecurityGroupProps::default())
            .unwrap();
        let peer = Peer::security_group(&lb);

        for port in [
            Port::tcp_range(1, 234).unwrap(),
            Port::tcp_range(12, 34).unwrap(),
            Port::tcp(53),
            Port::new("53", Protocol::Udp, 53, 53).unwrap(),
            Port::tcp(53),
        ] {
            asg.add_ingress_rule(&mut stack, &peer, &port, None).unwrap();
        }

        let template = stack.synth().unwrap();
        let ingress = template.resources_of_type("AWS::EC2::SecurityGroupIngress");
        let ids: Vec<&str> = ingress.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "asgfromlbtcp12to34",
                "asgfromlbtcp1to234",
                "asgfromlbtcp53",
                "asgfromlbudp53"
            ]
        );

        let udp = &template.resources["asgfromlbudp53"];
        assert_eq!(udp.properties["IpProtocol"], "udp");
        assert_eq!(udp.properties["FromPort"], 53);
    }

    #[test]
    fn conflicting_group_rule_is_reported() {
        let mut stack = Stack::new("Test");
        let vpc = vpc(&mut stack);
        let lb = SecurityGroup::new(&mut stack, "lb", &vpc, SecurityGroupProps::default())
            .unwrap();
        let asg = SecurityGroup::new(&mut stack, "asg", &vpc, SecurityGroupProps::default())
            .unwrap();

        stack
            .add_resource(
                "asgfromlbtcp80",
                Resource::new("AWS::EC2::SecurityGroupIngress", json!({"IpProtocol": "udp"}))
                    .unwrap(),
            )
            .unwrap();

        let result =
            asg.add_ingress_rule(&mut stack, &Peer::security_group(&lb), &Port::tcp(80), None);
        assert_eq!(
            result,
            Err(Error::DuplicateLogicalId("asgfromlbtcp80".to_string()))
        );
    }

    #[test]
    fn egress_placeholder_is_replaced() {
        let mut stack = Stack::new("Test");
        let vpc = vpc(&mut stack);
        let props = SecurityGroupProps {
            allow_all_outbound: false,
            ..SecurityGroupProps::default()
        };
        let group = SecurityGroup::new(&mut stack, "locked", &vpc, props).unwrap();

        let egress = &stack.resource("locked").unwrap().properties["SecurityGroupEgress"];
        assert_eq!(egress[0]["Description"], "Disallow all traffic");

        group
            .add_egress_rule(&mut stack, &Peer::ipv4("10.0.0.0/8"), &Port::tcp(443), None)
            .unwrap();

        let egress = &stack.resource("locked").unwrap().properties["SecurityGroupEgress"];
        assert_eq!(egress.as_array().unwrap().len(), 1);
        assert_eq!(egress[0]["CidrIp"], "10.0.0.0/8");
    }

    #[test]
    fn instance_type_from_class_and_size() {
        assert_eq!(
            InstanceType::of(InstanceClass::Burstable2, InstanceSize::Micro).as_str(),
            "t2.micro"
        );
    }

    #[test]
    fn ssm_images_share_one_parameter() {
        let mut stack = Stack::new("Test");
        let first = MachineImage::EcsOptimizedAmazonLinux2.image_id(&mut stack);
        let second = MachineImage::EcsOptimizedAmazonLinux2.image_id(&mut stack);
        assert_eq!(first, second);

        let template = stack.synth().unwrap();
        assert_eq!(template.parameters.len(), 1);
    }
}
