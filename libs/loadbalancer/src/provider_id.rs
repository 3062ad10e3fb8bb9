//! Provider ID encoding for CloudStack instances.
//!
//! The canonical form is `external-cloudstack:///<instanceID>` with the
//! region slot reserved but empty. Bare instance IDs written by older
//! deployments are accepted on read.

use crate::error::{Error, Result};

const PROVIDER_PREFIX: &str = "external-cloudstack://";

pub fn format_provider_id(instance_id: &str) -> String {
    format!("{PROVIDER_PREFIX}/{instance_id}")
}

pub fn parse_provider_id(provider_id: &str) -> Result<&str> {
    let id = match provider_id.strip_prefix(PROVIDER_PREFIX) {
        Some(rest) => rest.rsplit('/').next().unwrap_or(""),
        None if provider_id.contains("://") => "",
        None => provider_id,
    };
    if id.is_empty() {
        return Err(Error::InstanceNotFound(provider_id.to_string()));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let formatted = format_provider_id("f23028ac");
        assert_eq!(formatted, "external-cloudstack:///f23028ac");
        assert_eq!(parse_provider_id(&formatted).unwrap(), "f23028ac");
    }

    #[test]
    fn test_legacy_bare_id() {
        assert_eq!(parse_provider_id("f23028ac").unwrap(), "f23028ac");
    }

    #[test]
    fn test_rejects_foreign_and_empty() {
        assert!(parse_provider_id("aws:///i-abc123").is_err());
        assert!(parse_provider_id("external-cloudstack:///").is_err());
        assert!(parse_provider_id("").is_err());
    }
}
