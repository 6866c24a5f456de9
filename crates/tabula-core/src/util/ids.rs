use crate::error::{Result, TabulaError};

/// Short random identifier, e.g. `job-1a2b3c4d`.
pub fn short_id(prefix: &str) -> String {
    format!("{prefix}-{:08x}", fastrand::u32(..))
}

/// Tenant and dataset ids become path components of tenant stores, so they
/// are restricted to a conservative character set.
pub fn validate_identifier(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(TabulaError::InvalidIdentifier(format!(
            "{kind} must be 1..=128 characters"
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(TabulaError::InvalidIdentifier(format!(
            "{kind} {id:?} may only contain [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_have_prefix() {
        let id = short_id("job");
        assert!(id.starts_with("job-"));
        assert_eq!(id.len(), "job-".len() + 8);
    }

    #[test]
    fn identifier_rules() {
        assert!(validate_identifier("tenant", "acme_corp-1").is_ok());
        assert!(validate_identifier("tenant", "").is_err());
        assert!(validate_identifier("tenant", "../escape").is_err());
        assert!(validate_identifier("dataset", "a/b").is_err());
    }
}
