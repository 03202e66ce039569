use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

/// The description attached to every cloud rule so a rule observed in the
/// cloud can be mapped back to the policy and appliedTo group it realizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleDescription {
    pub name: String,
    pub namespace: String,
    pub applied_to_group: String,
}

impl RuleDescription {
    /// Builds a description from a `namespace/name` policy reference.
    pub fn from_policy(namespaced_name: &str, applied_to_group: &str) -> Result<Self> {
        let (namespace, name) = namespaced_name
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid namespaced name {}", namespaced_name))?;
        if namespace.is_empty() || name.is_empty() {
            return Err(anyhow!("invalid namespaced name {}", namespaced_name));
        }
        Ok(Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            applied_to_group: applied_to_group.to_string(),
        })
    }
}

impl fmt::Display for RuleDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name:{},namespace:{},appliedToGroup:{}",
            self.name, self.namespace, self.applied_to_group
        )
    }
}

impl FromStr for RuleDescription {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut name = None;
        let mut namespace = None;
        let mut applied_to_group = None;
        let pairs = s.split(',').collect::<Vec<_>>();
        if pairs.len() != 3 {
            return Err(anyhow!("malformed rule description {:?}", s));
        }
        for pair in pairs {
            match pair.trim().split_once(':') {
                Some(("name", v)) => name = Some(v.to_string()),
                Some(("namespace", v)) => namespace = Some(v.to_string()),
                Some(("appliedToGroup", v)) => applied_to_group = Some(v.to_string()),
                _ => return Err(anyhow!("malformed rule description {:?}", s)),
            }
        }
        match (name, namespace, applied_to_group) {
            (Some(name), Some(namespace), Some(applied_to_group))
                if !name.is_empty() && !namespace.is_empty() && !applied_to_group.is_empty() =>
            {
                Ok(Self {
                    name,
                    namespace,
                    applied_to_group,
                })
            }
            _ => Err(anyhow!("malformed rule description {:?}", s)),
        }
    }
}
