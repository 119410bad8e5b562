use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddressError;

/// Opaque peer identifier: `localpart@domain` with an optional `/resource`
/// suffix. Two addresses are the same peer when their bare (resourceless)
/// forms match — equality, ordering and hashing all ignore the resource.
#[derive(Debug, Clone)]
pub struct AgentAddress {
    local: String,
    domain: String,
    resource: Option<String>,
}

impl AgentAddress {
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
            resource: None,
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The resourceless form used as the canonical peer key.
    pub fn bare(&self) -> AgentAddress {
        AgentAddress {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl FromStr for AgentAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, rest) = s
            .split_once('@')
            .ok_or_else(|| AddressError::MissingDomain(s.to_string()))?;
        if local.is_empty() {
            return Err(AddressError::EmptyLocal(s.to_string()));
        }
        let (domain, resource) = match rest.split_once('/') {
            Some((d, r)) if !r.is_empty() => (d, Some(r.to_string())),
            Some((d, _)) => (d, None),
            None => (rest, None),
        };
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain(s.to_string()));
        }
        Ok(AgentAddress {
            local: local.to_string(),
            domain: domain.to_string(),
            resource,
        })
    }
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(r) => write!(f, "{}@{}/{}", self.local, self.domain, r),
            None => write!(f, "{}@{}", self.local, self.domain),
        }
    }
}

impl PartialEq for AgentAddress {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && self.domain == other.domain
    }
}

impl Eq for AgentAddress {}

impl Hash for AgentAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.local.hash(state);
        self.domain.hash(state);
    }
}

impl Ord for AgentAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.local, &self.domain).cmp(&(&other.local, &other.domain))
    }
}

impl PartialOrd for AgentAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for AgentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AgentAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare() {
        let a: AgentAddress = "a0@localhost".parse().unwrap();
        assert_eq!(a.local(), "a0");
        assert_eq!(a.domain(), "localhost");
        assert!(a.resource().is_none());
        assert_eq!(a.to_string(), "a0@localhost");
    }

    #[test]
    fn test_parse_with_resource() {
        let a: AgentAddress = "a0@localhost/lnvf1R8J".parse().unwrap();
        assert_eq!(a.resource(), Some("lnvf1R8J"));
        assert_eq!(a.bare().to_string(), "a0@localhost");
    }

    #[test]
    fn test_equality_ignores_resource() {
        let full: AgentAddress = "a0@localhost/session1".parse().unwrap();
        let bare: AgentAddress = "a0@localhost".parse().unwrap();
        assert_eq!(full, bare);

        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(full);
        assert!(set.contains(&bare));
    }

    #[test]
    fn test_malformed() {
        assert!("nodomain".parse::<AgentAddress>().is_err());
        assert!("@localhost".parse::<AgentAddress>().is_err());
        assert!("a0@".parse::<AgentAddress>().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let a: AgentAddress = "a1@example.org/res".parse().unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"a1@example.org/res\"");
        let back: AgentAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back.resource(), Some("res"));
    }
}
