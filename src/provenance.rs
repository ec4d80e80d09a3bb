//! Provenance handling for one-way forwarding.
//!
//! A one-way forwarder subscribes to the same channels it republishes
//! inbound messages on. Without a filter every inbound message would be
//! forwarded straight back out, so only publications that originated in
//! this domain are forwarded. Inbound messages carry the sender's domain
//! plus a transport suffix, which never equals our own identity.

use crate::config::Limits;
use crate::wire::fitting_prefix;

/// Decides which publications a one-way forwarder may send.
#[derive(Debug, Clone)]
pub struct ProvenanceFilter {
    own_domain: String,
}

impl ProvenanceFilter {
    pub fn new(own_domain: impl Into<String>) -> Self {
        Self {
            own_domain: own_domain.into(),
        }
    }

    pub fn own_domain(&self) -> &str {
        &self.own_domain
    }

    /// `true` when a publication from `origin` should go out on the link.
    pub fn should_forward(&self, origin: &str) -> bool {
        origin == self.own_domain
    }
}

/// Append a transport suffix to a received domain, keeping the result
/// within the domain field.
pub fn tag_domain(domain: &str, suffix: &str, limits: &Limits) -> String {
    let tagged = format!("{domain}{suffix}");
    let max = limits.max_domain_name.saturating_sub(1);
    let fitted = fitting_prefix(&tagged, max);
    if fitted.len() < tagged.len() {
        tracing::warn!(
            domain,
            suffix,
            max,
            "Tagged domain too long, truncated"
        );
    }
    fitted.to_string()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_only_own_publications_are_forwarded() {
        let filter = ProvenanceFilter::new("cpuapp");
        assert!(filter.should_forward("cpuapp"));
        assert!(!filter.should_forward("cpurad_stream"));
        assert!(!filter.should_forward("cpuapp_stream"));
    }

    #[test]
    fn test_tag_domain() {
        let limits = Limits::default();
        assert_eq!(tag_domain("cpurad", "_stream", &limits), "cpurad_stream");

        let tight = Limits {
            max_domain_name: 10,
            ..Limits::default()
        };
        assert_eq!(tag_domain("cpurad", "_stream", &tight), "cpurad_st");
    }
}
