//! Rule-based Router implementation

use std::time::Duration;

use tracing::debug;

use crate::common::{Destination, Result};
use crate::error::Error;

use super::{CompiledRule, Router, Rule, ValidityMap};

/// How long a routing decision is reused
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Rule-based router
///
/// Rules are evaluated in declared order and the first match wins. Every
/// decision, including "no rule applies", is cached per destination.
pub struct RuleRouter {
    rules: Vec<CompiledRule>,
    cache: ValidityMap<Destination, Option<String>>,
    cache_ttl: Duration,
}

impl RuleRouter {
    /// Compile `rules`; fails on the first invalid pattern.
    pub fn new(rules: &[Rule]) -> Result<Self> {
        let rules = rules.iter().map(Rule::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            cache: ValidityMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
        })
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Outbound tags referenced by the rules
    pub fn outbound_tags(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.outbound_tag())
    }

    fn evaluate(&self, destination: &Destination) -> Option<String> {
        self.rules
            .iter()
            .find(|rule| rule.matches(destination))
            .map(|rule| rule.outbound_tag().to_string())
    }
}

impl Router for RuleRouter {
    fn take_detour(&self, destination: &Destination) -> Result<String> {
        if let Some(decision) = self.cache.get(destination) {
            return decision.ok_or(Error::NoRuleApplicable);
        }

        let decision = self.evaluate(destination);
        debug!(
            "Router: {} -> {}",
            destination,
            decision.as_deref().unwrap_or("<no rule>")
        );
        self.cache
            .set(destination.clone(), decision.clone(), self.cache_ttl);
        decision.ok_or(Error::NoRuleApplicable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;

    fn rules() -> Vec<Rule> {
        vec![
            Rule {
                domain: vec!["domain:google.com".into()],
                outbound_tag: "proxy".into(),
                ..Default::default()
            },
            Rule {
                port: Some("443".into()),
                outbound_tag: "tls".into(),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_first_match_wins() {
        let router = RuleRouter::new(&rules()).unwrap();

        let google = Destination::tcp(Address::domain("www.google.com"), 443);
        assert_eq!(router.take_detour(&google).unwrap(), "proxy");

        let other = Destination::tcp(Address::domain("example.com"), 443);
        assert_eq!(router.take_detour(&other).unwrap(), "tls");

        let none = Destination::tcp(Address::domain("example.com"), 80);
        assert!(matches!(
            router.take_detour(&none),
            Err(Error::NoRuleApplicable)
        ));
    }

    #[test]
    fn test_decisions_are_cached() {
        let router = RuleRouter::new(&rules()).unwrap();
        let none = Destination::tcp(Address::domain("example.com"), 80);
        let hit = Destination::tcp(Address::domain("mail.google.com"), 25);

        assert!(router.take_detour(&none).is_err());
        assert_eq!(router.take_detour(&hit).unwrap(), "proxy");
        assert_eq!(router.cache.len(), 2);
        assert_eq!(router.cache.get(&none), Some(None));
        assert_eq!(router.cache.get(&hit), Some(Some("proxy".to_string())));

        // Served from the cache
        assert!(router.take_detour(&none).is_err());
        assert_eq!(router.take_detour(&hit).unwrap(), "proxy");
        assert_eq!(router.cache.len(), 2);
    }

    #[test]
    fn test_cache_hit_skips_rules() {
        let router = RuleRouter::new(&rules()).unwrap();
        let google = Destination::tcp(Address::domain("www.google.com"), 443);
        let other = Destination::tcp(Address::domain("example.com"), 80);

        // Planted decisions contradict the rules; a hit must not re-evaluate.
        let ttl = Duration::from_secs(60);
        router.cache.set(google.clone(), None, ttl);
        router.cache.set(other.clone(), Some("planted".to_string()), ttl);

        assert!(matches!(
            router.take_detour(&google),
            Err(Error::NoRuleApplicable)
        ));
        assert_eq!(router.take_detour(&other).unwrap(), "planted");
    }

    #[test]
    fn test_huge_cache_ttl_does_not_overflow() {
        let router = RuleRouter::new(&[])
            .unwrap()
            .with_cache_ttl(Duration::from_secs(u64::MAX));
        let dest = Destination::tcp(Address::domain("example.com"), 80);

        assert!(matches!(
            router.take_detour(&dest),
            Err(Error::NoRuleApplicable)
        ));
        assert_eq!(router.cache.get(&dest), Some(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_decision_is_reevaluated() {
        let router = RuleRouter::new(&rules())
            .unwrap()
            .with_cache_ttl(Duration::from_secs(60));
        let dest = Destination::tcp(Address::domain("example.com"), 443);

        assert_eq!(router.take_detour(&dest).unwrap(), "tls");
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(router.cache.get(&dest).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(router.cache.get(&dest).is_none());

        assert_eq!(router.take_detour(&dest).unwrap(), "tls");
        assert!(router.cache.get(&dest).is_some());
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let bad = vec![Rule {
            ip: vec!["not-an-ip".into()],
            outbound_tag: "x".into(),
            ..Default::default()
        }];
        assert!(RuleRouter::new(&bad).is_err());
    }
}
