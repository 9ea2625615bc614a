//! Addressing: the `local@domain/resource` identifier.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// An XMPP address.
///
/// The resource part is assigned by the server during resource binding;
/// until then client addresses are bare (`local@domain`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Create a bare address from local and domain parts.
    pub fn bare(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: Some(local.into()),
            domain: domain.into(),
            resource: None,
        }
    }

    /// Create a domain-only address.
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            local: None,
            domain: domain.into(),
            resource: None,
        }
    }

    /// Return a copy with the given resource attached.
    pub fn with_resource(&self, resource: impl Into<String>) -> Self {
        Self {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.into()),
        }
    }

    /// Local part, if any.
    pub fn local_part(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// Domain part.
    pub fn domain_part(&self) -> &str {
        &self.domain
    }

    /// Resource part, if any.
    pub fn resource_part(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The address without its resource part.
    pub fn to_bare(&self) -> Jid {
        Self {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{local}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, resource)) if !resource.is_empty() => (rest, Some(resource.to_string())),
            Some(_) => return Err(Error::IllegalState(format!("empty resource in jid '{s}'"))),
            None => (s, None),
        };
        let (local, domain) = match rest.split_once('@') {
            Some((local, domain)) if !local.is_empty() => (Some(local.to_string()), domain),
            Some(_) => return Err(Error::IllegalState(format!("empty local part in jid '{s}'"))),
            None => (None, rest),
        };
        if domain.is_empty() {
            return Err(Error::IllegalState(format!("empty domain in jid '{s}'")));
        }
        Ok(Self {
            local,
            domain: domain.to_string(),
            resource,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "alice@example.org/phone".parse().unwrap();
        assert_eq!(jid.local_part(), Some("alice"));
        assert_eq!(jid.domain_part(), "example.org");
        assert_eq!(jid.resource_part(), Some("phone"));
        assert_eq!(jid.to_string(), "alice@example.org/phone");
    }

    #[test]
    fn test_parse_bare_and_domain() {
        let bare: Jid = "alice@example.org".parse().unwrap();
        assert_eq!(bare.resource_part(), None);

        let domain: Jid = "example.org".parse().unwrap();
        assert_eq!(domain.local_part(), None);
        assert_eq!(domain.domain_part(), "example.org");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("@example.org".parse::<Jid>().is_err());
        assert!("alice@example.org/".parse::<Jid>().is_err());
        assert!("".parse::<Jid>().is_err());
    }

    #[test]
    fn test_to_bare() {
        let jid: Jid = "alice@example.org/phone".parse().unwrap();
        assert_eq!(jid.to_bare().to_string(), "alice@example.org");
    }
}
