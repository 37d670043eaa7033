//! Traffic policy model.
//!
//! A policy is attached to one of three scopes: the system default, a
//! namespace, or a namespace + workload class pair. Fields left unset
//! inherit from the enclosing scope.

use std::collections::BTreeSet;
use std::fmt;

use capgrid_state::WorkloadClass;
use serde::{Deserialize, Serialize};

/// Mutual TLS enforcement between workloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MtlsMode {
    Permissive,
    #[default]
    Strict,
}

impl fmt::Display for MtlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MtlsMode::Permissive => f.write_str("permissive"),
            MtlsMode::Strict => f.write_str("strict"),
        }
    }
}

/// Where a policy applies. Ordered from least to most specific.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum Scope {
    Default,
    Namespace {
        namespace: String,
    },
    Class {
        namespace: String,
        class: WorkloadClass,
    },
}

impl Scope {
    pub fn namespace(namespace: &str) -> Self {
        Scope::Namespace {
            namespace: namespace.to_string(),
        }
    }

    pub fn class(namespace: &str, class: WorkloadClass) -> Self {
        Scope::Class {
            namespace: namespace.to_string(),
            class,
        }
    }

    /// The enclosing scope, if any.
    pub fn parent(&self) -> Option<Scope> {
        match self {
            Scope::Default => None,
            Scope::Namespace { .. } => Some(Scope::Default),
            Scope::Class { namespace, .. } => Some(Scope::namespace(namespace)),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Default => f.write_str("default scope"),
            Scope::Namespace { namespace } => write!(f, "namespace {namespace}"),
            Scope::Class { namespace, class } => write!(f, "namespace {namespace} class {class}"),
        }
    }
}

/// Outlier ejection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub max_pending_requests: u32,
    pub consecutive_errors: u32,
    pub ejection_window_secs: u64,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            max_pending_requests: 1024,
            consecutive_errors: 5,
            ejection_window_secs: 30,
        }
    }
}

impl CircuitBreaker {
    /// Returns the first threshold in which `self` is laxer than `parent`.
    pub fn loosened_against(&self, parent: &CircuitBreaker) -> Option<String> {
        if self.max_pending_requests > parent.max_pending_requests {
            return Some(format!(
                "max_pending_requests raised from {} to {}",
                parent.max_pending_requests, self.max_pending_requests
            ));
        }
        if self.consecutive_errors > parent.consecutive_errors {
            return Some(format!(
                "consecutive_errors raised from {} to {}",
                parent.consecutive_errors, self.consecutive_errors
            ));
        }
        if self.ejection_window_secs < parent.ejection_window_secs {
            return Some(format!(
                "ejection window shortened from {}s to {}s",
                parent.ejection_window_secs, self.ejection_window_secs
            ));
        }
        None
    }
}

/// Sources permitted to call into a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowList {
    #[serde(default)]
    pub namespaces: BTreeSet<String>,
    /// Workload identities; only honoured under strict mTLS.
    #[serde(default)]
    pub identities: BTreeSet<String>,
}

impl AllowList {
    pub fn is_subset_of(&self, other: &AllowList) -> bool {
        self.namespaces.is_subset(&other.namespaces) && self.identities.is_subset(&other.identities)
    }
}

/// Operator-authored policy for a single scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficPolicy {
    pub scope: Scope,
    #[serde(default)]
    pub mtls: Option<MtlsMode>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreaker>,
    #[serde(default)]
    pub allow: Option<AllowList>,
    /// Reason text that permits this scope to be laxer than its ancestor.
    #[serde(default)]
    pub loosen: Option<String>,
}

impl TrafficPolicy {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            mtls: None,
            circuit_breaker: None,
            allow: None,
            loosen: None,
        }
    }

    pub fn with_mtls(mut self, mode: MtlsMode) -> Self {
        self.mtls = Some(mode);
        self
    }

    pub fn with_circuit_breaker(mut self, cb: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(cb);
        self
    }

    pub fn allow_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allow = self.allow.get_or_insert_with(AllowList::default);
        allow.namespaces.extend(namespaces.into_iter().map(Into::into));
        self
    }

    pub fn allow_identities<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allow = self.allow.get_or_insert_with(AllowList::default);
        allow.identities.extend(identities.into_iter().map(Into::into));
        self
    }

    pub fn loosen(mut self, reason: &str) -> Self {
        self.loosen = Some(reason.to_string());
        self
    }
}
