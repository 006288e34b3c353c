//! Recovery of correlation identifiers from search base DNs.
//!
//! Probes place the identifier in the base DN as if it were a hostname under
//! the server's root domain, eg `ldap://host/sub.<id>.example.com/a`. The DN is
//! treated the way a URL path segment would be: arbitrary text, of which the
//! first run of dotted labels ending at the root domain is inspected.

use regex::Regex;

use crate::constants::{CORRELATION_KEY_LENGTH, UNIQUE_ID_LENGTH};
use crate::error::OperationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId {
    /// The 33 character identifier label.
    pub unique_id: String,
    /// Every label up to and including the identifier, joined by dots.
    pub full_id: String,
}

impl CorrelationId {
    /// The storage lookup key, the leading part of the identifier.
    pub fn correlation_key(&self) -> &str {
        self.unique_id
            .get(..CORRELATION_KEY_LENGTH)
            .unwrap_or(self.unique_id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationMatcher {
    domain: String,
    re: Regex,
}

impl CorrelationMatcher {
    pub fn new(domain: &str) -> Result<Self, OperationError> {
        let pattern = format!(r"(?:[a-z0-9\-]+\.)+{}", regex::escape(domain));
        let re = Regex::new(pattern.as_str()).map_err(|source| OperationError::InvalidDomain {
            domain: domain.to_string(),
            source,
        })?;
        Ok(CorrelationMatcher {
            domain: domain.to_string(),
            re,
        })
    }

    pub fn domain(&self) -> &str {
        self.domain.as_str()
    }

    /// Find the identifier in `base`. A domain match without a label of the
    /// identifier width is not a probe, and yields nothing.
    pub fn extract(&self, base: &str) -> Option<CorrelationId> {
        let found = self.re.find(base)?;
        let parts: Vec<&str> = found.as_str().split('.').collect();

        // Later labels overwrite earlier ones.
        let mut last = None;
        for (i, part) in parts.iter().enumerate() {
            if part.len() == UNIQUE_ID_LENGTH {
                last = Some(i);
            }
        }

        last.map(|i| CorrelationId {
            unique_id: parts[i].to_string(),
            full_id: parts[..=i].join("."),
        })
    }
}
