//! Gateway ingress rules.
//!
//! Maps external hostnames to in-mesh services. A host is exposed only
//! when an exposing rule matches; exact hosts take precedence over
//! single-level wildcards (`*.example.com` matches `api.example.com` but
//! not `a.b.example.com`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PolicyError, PolicyResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRule {
    pub host: String,
    pub namespace: String,
    pub service: String,
    pub port: u16,
    #[serde(default)]
    pub expose: bool,
}

/// Where an admitted request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    pub namespace: String,
    pub service: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Ingress {
    Route(RouteTarget),
    Blocked,
}

/// Lowercase, without a trailing dot or `:port` suffix.
fn normalize(host: &str) -> String {
    let host = host.rsplit_once(':').map_or(host, |(h, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn check_host(host: &str) -> Result<(), String> {
    if host.is_empty() {
        return Err("host is empty".to_string());
    }
    let rest = host.strip_prefix("*.").unwrap_or(host);
    if rest.contains('*') {
        return Err("only a single leading `*.` label is allowed".to_string());
    }
    if rest.split('.').any(str::is_empty) {
        return Err("empty DNS label".to_string());
    }
    Ok(())
}

/// Resolved gateway rule set.
#[derive(Debug, Clone, Default)]
pub struct Gateway {
    exact: HashMap<String, GatewayRule>,
    /// Keyed by the suffix after `*.`.
    wildcard: HashMap<String, GatewayRule>,
}

impl Gateway {
    pub fn new(rules: Vec<GatewayRule>) -> PolicyResult<Self> {
        let mut gateway = Gateway::default();
        for mut rule in rules {
            rule.host = normalize(&rule.host);
            check_host(&rule.host).map_err(|reason| PolicyError::InvalidGatewayRule {
                host: rule.host.clone(),
                reason,
            })?;
            if rule.port == 0 {
                return Err(PolicyError::InvalidGatewayRule {
                    host: rule.host,
                    reason: "port must be non-zero".to_string(),
                });
            }
            let host = rule.host.clone();
            let previous = match host.strip_prefix("*.") {
                Some(suffix) => gateway.wildcard.insert(suffix.to_string(), rule),
                None => gateway.exact.insert(host.clone(), rule),
            };
            if previous.is_some() {
                return Err(PolicyError::DuplicateHost(host));
            }
        }
        debug!(
            exact = gateway.exact.len(),
            wildcard = gateway.wildcard.len(),
            "gateway rules loaded"
        );
        Ok(gateway)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decide whether external traffic for `host` is admitted.
    pub fn ingress(&self, host: &str) -> Ingress {
        let host = normalize(host);
        let rule = self.exact.get(&host).or_else(|| {
            host.split_once('.')
                .and_then(|(label, suffix)| (!label.is_empty()).then_some(suffix))
                .and_then(|suffix| self.wildcard.get(suffix))
        });
        match rule {
            Some(rule) if rule.expose => Ingress::Route(RouteTarget {
                namespace: rule.namespace.clone(),
                service: rule.service.clone(),
                port: rule.port,
            }),
            _ => Ingress::Blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(host: &str, service: &str, expose: bool) -> GatewayRule {
        GatewayRule {
            host: host.to_string(),
            namespace: "web".to_string(),
            service: service.to_string(),
            port: 8080,
            expose,
        }
    }

    fn service_of(ingress: Ingress) -> Option<String> {
        match ingress {
            Ingress::Route(target) => Some(target.service),
            Ingress::Blocked => None,
        }
    }

    #[test]
    fn exact_beats_wildcard() {
        let gw = Gateway::new(vec![
            rule("*.example.com", "catch-all", true),
            rule("api.example.com", "api", true),
        ])
        .unwrap();

        assert_eq!(service_of(gw.ingress("api.example.com")).as_deref(), Some("api"));
        assert_eq!(
            service_of(gw.ingress("shop.example.com")).as_deref(),
            Some("catch-all")
        );
    }

    #[test]
    fn wildcard_matches_a_single_label_only() {
        let gw = Gateway::new(vec![rule("*.example.com", "catch-all", true)]).unwrap();
        assert_eq!(gw.ingress("a.b.example.com"), Ingress::Blocked);
        assert_eq!(gw.ingress("example.com"), Ingress::Blocked);
        assert_eq!(gw.ingress("fooexample.com"), Ingress::Blocked);
    }

    #[test]
    fn exact_non_exposed_rule_blocks_wildcard() {
        let gw = Gateway::new(vec![
            rule("*.example.com", "catch-all", true),
            rule("admin.example.com", "admin", false),
        ])
        .unwrap();
        assert_eq!(gw.ingress("admin.example.com"), Ingress::Blocked);
    }

    #[test]
    fn unknown_host_is_blocked() {
        let gw = Gateway::default();
        assert_eq!(gw.ingress("api.example.com"), Ingress::Blocked);
    }

    #[test]
    fn host_is_normalized() {
        let gw = Gateway::new(vec![rule("API.example.com", "api", true)]).unwrap();
        assert_eq!(service_of(gw.ingress("api.EXAMPLE.com.")).as_deref(), Some("api"));
        assert_eq!(service_of(gw.ingress("api.example.com:443")).as_deref(), Some("api"));
    }

    #[test]
    fn invalid_rules_are_rejected() {
        assert!(matches!(
            Gateway::new(vec![rule("a.*.example.com", "x", true)]),
            Err(PolicyError::InvalidGatewayRule { .. })
        ));
        assert!(matches!(
            Gateway::new(vec![rule("a.com", "x", true), rule("A.com", "y", true)]),
            Err(PolicyError::DuplicateHost(_))
        ));
    }
}
