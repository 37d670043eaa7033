//! Policy validation and resolution.
//!
//! Resolution walks the destination's scope chain from the system default
//! to the most specific scope and lets each present policy override the
//! fields it sets. A scope may only be laxer than its ancestor when it
//! carries a `loosen` statement; [`validate`] rejects anything else.

use std::collections::BTreeMap;

use capgrid_state::WorkloadClass;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PolicyError, PolicyResult};
use crate::model::{AllowList, CircuitBreaker, MtlsMode, Scope, TrafficPolicy};

/// The merged policy governing one source → destination request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivePolicy {
    pub mtls: MtlsMode,
    pub circuit_breaker: CircuitBreaker,
    pub allowed: bool,
    /// Most specific scope that contributed to the result.
    pub matched_scope: Scope,
    /// Reason of the innermost `loosen` statement on the chain.
    pub loosened: Option<String>,
    pub reason: String,
}

/// A request to authorize.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub source_namespace: &'a str,
    pub source_identity: Option<&'a str>,
    pub dest_namespace: &'a str,
    pub dest_class: Option<WorkloadClass>,
}

/// Fields accumulated while walking a scope chain.
#[derive(Debug, Clone)]
struct Merged {
    mtls: MtlsMode,
    circuit_breaker: CircuitBreaker,
    allow: Option<AllowList>,
    matched: Scope,
    loosened: Option<String>,
}

fn chain(target: &Scope) -> Vec<Scope> {
    let mut scopes = vec![target.clone()];
    let mut cursor = target.parent();
    while let Some(scope) = cursor {
        cursor = scope.parent();
        scopes.push(scope);
    }
    scopes.reverse();
    scopes
}

fn merge(policies: &BTreeMap<Scope, TrafficPolicy>, target: &Scope) -> Merged {
    let mut merged = Merged {
        mtls: MtlsMode::Strict,
        circuit_breaker: CircuitBreaker::default(),
        allow: None,
        matched: Scope::Default,
        loosened: None,
    };

    for scope in chain(target) {
        let Some(policy) = policies.get(&scope) else {
            continue;
        };
        let may_loosen = policy.loosen.is_some();
        merged.matched = scope.clone();

        if let Some(mode) = policy.mtls {
            if mode == MtlsMode::Permissive && merged.mtls == MtlsMode::Strict && !may_loosen {
                warn!(%scope, "ignoring mTLS downgrade without loosen statement");
            } else {
                merged.mtls = mode;
            }
        }
        if let Some(cb) = policy.circuit_breaker {
            if cb.loosened_against(&merged.circuit_breaker).is_some() && !may_loosen {
                warn!(%scope, "ignoring relaxed circuit breaker without loosen statement");
            } else {
                merged.circuit_breaker = cb;
            }
        }
        if let Some(allow) = &policy.allow {
            let widens = merged
                .allow
                .as_ref()
                .is_some_and(|parent| !allow.is_subset_of(parent));
            if widens && !may_loosen {
                warn!(%scope, "ignoring widened allow list without loosen statement");
            } else {
                merged.allow = Some(allow.clone());
            }
        }
        if may_loosen {
            merged.loosened = policy.loosen.clone();
        }
    }
    merged
}

/// Validate a full policy set, collecting every error.
pub fn validate_all(policies: &[TrafficPolicy]) -> Vec<PolicyError> {
    let mut errors = Vec::new();
    let mut by_scope = BTreeMap::new();
    for policy in policies {
        if by_scope
            .insert(policy.scope.clone(), policy.clone())
            .is_some()
        {
            errors.push(PolicyError::DuplicateScope(policy.scope.clone()));
        }
    }

    for (scope, policy) in &by_scope {
        if let Some(reason) = &policy.loosen
            && reason.trim().is_empty()
        {
            errors.push(PolicyError::EmptyLoosenReason(scope.clone()));
        }
        if let Some(cb) = &policy.circuit_breaker {
            let problem = if cb.max_pending_requests == 0 {
                Some("max_pending_requests must be positive")
            } else if cb.consecutive_errors == 0 {
                Some("consecutive_errors must be positive")
            } else if cb.ejection_window_secs == 0 {
                Some("ejection window must be positive")
            } else {
                None
            };
            if let Some(reason) = problem {
                errors.push(PolicyError::InvalidCircuitBreaker {
                    scope: scope.clone(),
                    reason: reason.to_string(),
                });
            }
        }

        let Some(parent_scope) = scope.parent() else {
            if policy.mtls == Some(MtlsMode::Permissive) {
                errors.push(PolicyError::PermissiveDefault);
            }
            continue;
        };
        if policy.loosen.is_some() {
            continue;
        }

        let parent = merge(&by_scope, &parent_scope);
        let conflict = |detail: String| PolicyError::PolicyConflict {
            scope: scope.clone(),
            detail,
        };
        if policy.mtls == Some(MtlsMode::Permissive) && parent.mtls == MtlsMode::Strict {
            errors.push(conflict(format!(
                "mTLS downgraded to permissive below strict {}",
                parent.matched
            )));
        }
        if let Some(cb) = &policy.circuit_breaker
            && let Some(detail) = cb.loosened_against(&parent.circuit_breaker)
        {
            errors.push(conflict(detail));
        }
        if let Some(allow) = &policy.allow
            && let Some(parent_allow) = &parent.allow
            && !allow.is_subset_of(parent_allow)
        {
            errors.push(conflict(format!(
                "allow list widens the one set at {}",
                parent.matched
            )));
        }
    }
    errors
}

/// Validate a policy set, failing on the first error.
pub fn validate(policies: &[TrafficPolicy]) -> PolicyResult<()> {
    match validate_all(policies).into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Validated, immutable set of traffic policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    policies: BTreeMap<Scope, TrafficPolicy>,
}

impl PolicyEngine {
    /// Build an engine from a policy set that passes [`validate`].
    pub fn new(policies: Vec<TrafficPolicy>) -> PolicyResult<Self> {
        validate(&policies)?;
        let policies = policies
            .into_iter()
            .map(|p| (p.scope.clone(), p))
            .collect::<BTreeMap<_, _>>();
        debug!(count = policies.len(), "traffic policies loaded");
        Ok(Self { policies })
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn policies(&self) -> impl Iterator<Item = &TrafficPolicy> {
        self.policies.values()
    }

    /// Namespace-level resolution.
    pub fn resolve(&self, source_namespace: &str, dest_namespace: &str) -> EffectivePolicy {
        self.resolve_request(&RequestContext {
            source_namespace,
            source_identity: None,
            dest_namespace,
            dest_class: None,
        })
    }

    /// Full resolution including source identity and destination class.
    pub fn resolve_request(&self, ctx: &RequestContext<'_>) -> EffectivePolicy {
        let target = match ctx.dest_class {
            Some(class) => Scope::class(ctx.dest_namespace, class),
            None => Scope::namespace(ctx.dest_namespace),
        };
        let merged = merge(&self.policies, &target);

        let (allowed, reason) = match &merged.allow {
            None => (false, "no allow rule matches (deny by default)".to_string()),
            Some(allow) if allow.namespaces.contains(ctx.source_namespace) => (
                true,
                format!(
                    "namespace {} allowed by {}",
                    ctx.source_namespace, merged.matched
                ),
            ),
            Some(allow) => match ctx.source_identity {
                Some(identity) if allow.identities.contains(identity) => {
                    if merged.mtls == MtlsMode::Strict {
                        (
                            true,
                            format!("identity {identity} allowed by {}", merged.matched),
                        )
                    } else {
                        (
                            false,
                            "identity rules require strict mTLS".to_string(),
                        )
                    }
                }
                _ => (false, "no allow rule matches (deny by default)".to_string()),
            },
        };

        EffectivePolicy {
            mtls: merged.mtls,
            circuit_breaker: merged.circuit_breaker,
            allowed,
            matched_scope: merged.matched,
            loosened: merged.loosened,
            reason,
        }
    }
}
