use crate::{CloudResourceId, IpNet};
use sha2::{Digest, Sha256};
use std::fmt;

/// An ingress rule: traffic allowed into the appliedTo group's members.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngressRule {
    pub protocol: Option<i32>,
    pub from_port: Option<u16>,
    pub from_src_ip: Vec<IpNet>,
    pub from_security_groups: Vec<CloudResourceId>,
}

/// An egress rule: traffic allowed out of the appliedTo group's members.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EgressRule {
    pub protocol: Option<i32>,
    pub to_port: Option<u16>,
    pub to_dst_ip: Vec<IpNet>,
    pub to_security_groups: Vec<CloudResourceId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Rule {
    Ingress(IngressRule),
    Egress(EgressRule),
}

impl Rule {
    pub fn is_ingress(&self) -> bool {
        matches!(self, Self::Ingress(_))
    }

    /// A canonical encoding of the rule. Peer lists are sorted so that two
    /// semantically equal rules encode identically regardless of the order
    /// the cloud or the policy layer reports them in.
    pub fn canonical(&self) -> String {
        match self {
            Self::Ingress(r) => encode(
                "ingress",
                r.protocol,
                r.from_port,
                &r.from_src_ip,
                &r.from_security_groups,
            ),
            Self::Egress(r) => encode(
                "egress",
                r.protocol,
                r.to_port,
                &r.to_dst_ip,
                &r.to_security_groups,
            ),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.canonical().fmt(f)
    }
}

impl From<IngressRule> for Rule {
    fn from(r: IngressRule) -> Self {
        Self::Ingress(r)
    }
}

impl From<EgressRule> for Rule {
    fn from(r: EgressRule) -> Self {
        Self::Egress(r)
    }
}

fn encode(
    direction: &str,
    protocol: Option<i32>,
    port: Option<u16>,
    nets: &[IpNet],
    groups: &[CloudResourceId],
) -> String {
    let mut nets = nets.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    nets.sort();
    let mut groups = groups.iter().map(|g| g.to_string()).collect::<Vec<_>>();
    groups.sort();
    format!(
        "{}|protocol={}|port={}|ip={}|sg={}",
        direction,
        protocol.unwrap_or(0),
        port.unwrap_or(0),
        nets.join(","),
        groups.join(","),
    )
}

/// A realized cloud rule: the rule payload plus the appliedTo group that
/// carries it and the policy it was derived from. The hash uniquely
/// identifies the rule within its appliedTo group.
#[derive(Clone, Debug, PartialEq)]
pub struct CloudRule {
    pub rule: Rule,
    pub applied_to_group: String,
    pub network_policy: String,
    /// The description pushed alongside the rule so the cloud reflects it
    /// back during synchronization. Absent on rules ingested from the cloud.
    pub description: Option<String>,
    pub hash: String,
}

impl CloudRule {
    pub fn new(rule: Rule, applied_to_group: impl ToString, network_policy: impl ToString) -> Self {
        let applied_to_group = applied_to_group.to_string();
        let hash = Self::compute_hash(&rule, &applied_to_group);
        Self {
            rule,
            applied_to_group,
            network_policy: network_policy.to_string(),
            description: None,
            hash,
        }
    }

    pub fn with_description(mut self, description: impl ToString) -> Self {
        self.description = Some(description.to_string());
        self
    }

    fn compute_hash(rule: &Rule, applied_to_group: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(rule.canonical().as_bytes());
        hasher.update(applied_to_group.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
