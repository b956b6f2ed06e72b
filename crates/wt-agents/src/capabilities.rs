//! Capability → executor mapping and capability-specific config rules.
//!
//! The executor variant is resolved once when an agent is created or its
//! capabilities change, and stored with the agent. Executions never
//! re-derive it.

use std::collections::BTreeSet;

use wt_core::types::{AgentConfig, Capability, ExecutorKind};

pub const MAX_UPDATE_FREQUENCY_MINUTES: u32 = 7 * 24 * 60;
pub const MAX_RESULTS_PER_UPDATE: u32 = 500;
/// Trend aggregation needs enough elapsed time between runs to be meaningful.
pub const MIN_TREND_FREQUENCY_MINUTES: u32 = 15;
pub const MAX_KEYWORDS: usize = 50;

/// Source name used for news monitoring.
pub const NEWS_SOURCE: &str = "news";
/// Source name used for trend analysis.
pub const TRENDS_SOURCE: &str = "trends";

/// Every rule an agent definition violates, in a stable order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid agent definition: {}", .0.join("; "))]
pub struct ValidationError(pub Vec<String>);

impl ValidationError {
    pub fn single(msg: impl Into<String>) -> Self {
        Self(vec![msg.into()])
    }

    pub fn issues(&self) -> &[String] {
        &self.0
    }
}

/// Pick the executor variant for a capability set. Precedence:
/// custom keyword > trend analysis > news monitoring.
pub fn resolve_executor(capabilities: &BTreeSet<Capability>) -> Option<ExecutorKind> {
    if capabilities.contains(&Capability::CustomKeyword) {
        Some(ExecutorKind::KeywordWatcher)
    } else if capabilities.contains(&Capability::TrendAnalysis) {
        Some(ExecutorKind::TrendAnalyzer)
    } else if capabilities.contains(&Capability::NewsMonitoring) {
        Some(ExecutorKind::NewsMonitor)
    } else {
        None
    }
}

/// Validate `config` against `capabilities` and return the executor
/// variant to store.
pub fn validate(
    capabilities: &BTreeSet<Capability>,
    config: &AgentConfig,
) -> Result<ExecutorKind, ValidationError> {
    let mut issues = Vec::new();

    if !(1..=MAX_UPDATE_FREQUENCY_MINUTES).contains(&config.update_frequency_minutes) {
        issues.push(format!(
            "update_frequency_minutes must be within 1..={MAX_UPDATE_FREQUENCY_MINUTES}"
        ));
    }
    if !(1..=MAX_RESULTS_PER_UPDATE).contains(&config.max_results_per_update) {
        issues.push(format!(
            "max_results_per_update must be within 1..={MAX_RESULTS_PER_UPDATE}"
        ));
    }
    if config.keywords.len() > MAX_KEYWORDS {
        issues.push(format!("at most {MAX_KEYWORDS} keywords are allowed"));
    }
    if config.keywords.iter().any(|k| k.trim().is_empty()) {
        issues.push("keywords must not be blank".to_string());
    }
    if config.custom_sources.iter().any(|s| s.trim().is_empty()) {
        issues.push("custom_sources must not be blank".to_string());
    }

    if capabilities.contains(&Capability::CustomKeyword) && config.keywords.is_empty() {
        issues.push("custom_keyword requires at least one keyword".to_string());
    }
    if capabilities.contains(&Capability::TrendAnalysis)
        && config.update_frequency_minutes < MIN_TREND_FREQUENCY_MINUTES
    {
        issues.push(format!(
            "trend_analysis requires update_frequency_minutes >= {MIN_TREND_FREQUENCY_MINUTES}"
        ));
    }
    if !config.custom_sources.is_empty() && !capabilities.contains(&Capability::CustomKeyword) {
        issues.push("custom_sources are only used by the custom_keyword capability".to_string());
    }

    let executor = resolve_executor(capabilities);
    if executor.is_none() {
        issues.push("at least one capability is required".to_string());
    }

    match executor {
        Some(kind) if issues.is_empty() => Ok(kind),
        _ => Err(ValidationError(issues)),
    }
}

/// Data sources an agent fetches from, deduplicated, in capability order.
pub fn source_names(capabilities: &BTreeSet<Capability>, config: &AgentConfig) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };
    for capability in capabilities {
        match capability {
            Capability::NewsMonitoring => push(NEWS_SOURCE),
            Capability::TrendAnalysis => push(TRENDS_SOURCE),
            Capability::CustomKeyword if config.custom_sources.is_empty() => push(NEWS_SOURCE),
            Capability::CustomKeyword => {
                for source in &config.custom_sources {
                    push(source.trim());
                }
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[Capability]) -> BTreeSet<Capability> {
        list.iter().copied().collect()
    }

    fn config(keywords: &[&str]) -> AgentConfig {
        AgentConfig {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn executor_precedence() {
        assert_eq!(
            resolve_executor(&caps(&[Capability::NewsMonitoring, Capability::CustomKeyword])),
            Some(ExecutorKind::KeywordWatcher)
        );
        assert_eq!(
            resolve_executor(&caps(&[Capability::NewsMonitoring, Capability::TrendAnalysis])),
            Some(ExecutorKind::TrendAnalyzer)
        );
        assert_eq!(
            resolve_executor(&caps(&[Capability::NewsMonitoring])),
            Some(ExecutorKind::NewsMonitor)
        );
        assert_eq!(resolve_executor(&BTreeSet::new()), None);
    }

    #[test]
    fn custom_keyword_requires_keywords() {
        let err = validate(&caps(&[Capability::CustomKeyword]), &config(&[])).expect_err("invalid");
        assert!(err.issues().iter().any(|i| i.contains("custom_keyword")));

        let kind = validate(&caps(&[Capability::CustomKeyword]), &config(&["rust"])).expect("valid");
        assert_eq!(kind, ExecutorKind::KeywordWatcher);
    }

    #[test]
    fn empty_capabilities_rejected() {
        let err = validate(&BTreeSet::new(), &config(&[])).expect_err("invalid");
        assert!(err.to_string().contains("at least one capability"));
    }

    #[test]
    fn trend_analysis_needs_minimum_frequency() {
        let mut cfg = config(&[]);
        cfg.update_frequency_minutes = 5;
        let err = validate(&caps(&[Capability::TrendAnalysis]), &cfg).expect_err("invalid");
        assert!(err.to_string().contains("trend_analysis"));
    }

    #[test]
    fn custom_sources_without_custom_keyword_is_a_mismatch() {
        let mut cfg = config(&["rust"]);
        cfg.custom_sources = vec!["https://feeds.example.com/rust".into()];
        let err = validate(&caps(&[Capability::NewsMonitoring]), &cfg).expect_err("mismatch");
        assert!(err.to_string().contains("custom_sources"));
    }

    #[test]
    fn all_issues_are_reported() {
        let cfg = AgentConfig {
            keywords: vec![" ".into()],
            update_frequency_minutes: 0,
            max_results_per_update: 0,
            ..AgentConfig::default()
        };
        let err = validate(&caps(&[Capability::NewsMonitoring]), &cfg).expect_err("invalid");
        assert_eq!(err.issues().len(), 3);
    }

    #[test]
    fn sources_follow_capabilities() {
        let mut cfg = config(&["rust"]);
        assert_eq!(
            source_names(&caps(&[Capability::NewsMonitoring, Capability::TrendAnalysis]), &cfg),
            vec!["news".to_string(), "trends".to_string()]
        );

        cfg.custom_sources = vec!["alpha".into(), "news".into()];
        assert_eq!(
            source_names(&caps(&[Capability::NewsMonitoring, Capability::CustomKeyword]), &cfg),
            vec!["news".to_string(), "alpha".to_string()]
        );
    }
}
