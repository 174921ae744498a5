//! Automatic topic-to-hierarchy mapping.
//!
//! Patterns are token templates matched against a topic's segments, e.g.
//! `{Prefix}/{Enterprise}/{Site}/{Area}`. `{Prefix}` stands for a
//! configured protocol prefix (Sparkplug `spBv1.0`, version segments,
//! ...), which is stripped *before* tokenization so level placeholders
//! never shift. A topic maps only when every fixed token matches, the
//! segment count lines up exactly (no partial matches), and the resolved
//! hierarchy node allows topics.
//!
//! Mapping only computes a path. Assigning that path to the visible
//! topic record is a separate step driven by the `TopicAutoMapped` event
//! so a consumer crash in between leaves the topic merely unmapped.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::config::{Config, MatchPolicy};
use crate::error::{Result, UnshubError};
use crate::models::HierarchicalPath;
use crate::namespace::NamespaceIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    /// Literal topic segment.
    Fixed(String),
    /// The configured strip prefix (any number of segments).
    Prefix,
    /// A hierarchy level capture.
    Level(String),
}

/// A parsed mapping pattern.
#[derive(Debug, Clone)]
pub struct MappingPattern {
    template: String,
    tokens: Vec<PatternToken>,
    /// Fixed-token count, used by the most-specific tie-break.
    specificity: usize,
}

impl MappingPattern {
    /// Parse a token template against the active hierarchy levels.
    ///
    /// Level placeholders must be the leading hierarchy levels in order;
    /// `{Prefix}`, if present, must come first.
    pub fn parse(template: &str, levels: &[String]) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut next_level = 0usize;

        for (i, segment) in template.split('/').filter(|s| !s.is_empty()).enumerate() {
            if let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if name == "Prefix" {
                    if i != 0 {
                        return Err(UnshubError::Validation(format!(
                            "pattern '{}': {{Prefix}} must be the first token",
                            template
                        )));
                    }
                    tokens.push(PatternToken::Prefix);
                } else if levels.get(next_level).map(String::as_str) == Some(name) {
                    tokens.push(PatternToken::Level(name.to_string()));
                    next_level += 1;
                } else {
                    return Err(UnshubError::Validation(format!(
                        "pattern '{}': placeholder '{{{}}}' does not follow the hierarchy \
                         level order {:?}",
                        template, name, levels
                    )));
                }
            } else {
                tokens.push(PatternToken::Fixed(segment.to_string()));
            }
        }

        if next_level == 0 {
            return Err(UnshubError::Validation(format!(
                "pattern '{}' captures no hierarchy levels",
                template
            )));
        }

        let specificity = tokens
            .iter()
            .filter(|t| matches!(t, PatternToken::Fixed(_)))
            .count();
        Ok(Self {
            template: template.to_string(),
            tokens,
            specificity,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Match pre-split topic segments, returning captured level values in
    /// hierarchy order. `stripped` reports whether a configured prefix
    /// was removed from the topic; patterns starting with `{Prefix}`
    /// require it.
    fn matches(&self, segments: &[&str], stripped: bool) -> Option<Vec<String>> {
        let mut tokens = self.tokens.as_slice();
        if let Some(PatternToken::Prefix) = tokens.first() {
            if !stripped {
                return None;
            }
            tokens = &tokens[1..];
        }
        // No partial matches: segment count must equal token count.
        if segments.len() != tokens.len() {
            return None;
        }

        let mut captured = Vec::new();
        for (token, segment) in tokens.iter().zip(segments.iter()) {
            match token {
                PatternToken::Fixed(fixed) => {
                    if fixed != segment {
                        return None;
                    }
                }
                PatternToken::Level(_) => captured.push((*segment).to_string()),
                PatternToken::Prefix => return None,
            }
        }
        Some(captured)
    }
}

/// Decides whether and where a topic belongs in the hierarchy.
pub struct AutoTopicMapper {
    patterns: Vec<MappingPattern>,
    policy: MatchPolicy,
    strip_prefixes: Vec<String>,
    levels: Vec<String>,
    namespaces: RwLock<NamespaceIndex>,
    /// Successful mappings by exact topic; revalidated on every hit and
    /// cleared when configuration changes.
    resolved: RwLock<HashMap<String, HierarchicalPath>>,
}

impl AutoTopicMapper {
    pub fn new(config: &Config, namespaces: NamespaceIndex) -> Result<Self> {
        let patterns = config
            .mapping
            .patterns
            .iter()
            .map(|t| MappingPattern::parse(t, &config.hierarchy.levels))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            policy: config.mapping.policy,
            strip_prefixes: config.mapping.strip_prefixes.clone(),
            levels: config.hierarchy.levels.clone(),
            namespaces: RwLock::new(namespaces),
            resolved: RwLock::new(HashMap::new()),
        })
    }

    /// Try to resolve a hierarchy path for `topic`.
    ///
    /// Returns `None` when no pattern matches or the resolved node does
    /// not allow topics; the caller keeps the topic visible as unmapped.
    pub fn try_map_topic(&self, topic: &str) -> Option<HierarchicalPath> {
        // Step 1: existing mapping by exact topic, revalidated against
        // the current namespace policy.
        if let Some(path) = self.resolved.read().unwrap().get(topic).cloned() {
            if self.namespaces.read().unwrap().allows_topics(&path) {
                return Some(path);
            }
            self.resolved.write().unwrap().remove(topic);
        }

        // Step 2: prefix stripping, before tokenization.
        let (rest, stripped) = self.strip_prefix(topic);
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        // Step 3: evaluate patterns under the configured tie-break policy.
        let mut candidates: Vec<(&MappingPattern, Vec<String>)> = Vec::new();
        for pattern in &self.patterns {
            if let Some(captured) = pattern.matches(&segments, stripped) {
                if self.policy == MatchPolicy::ConfigOrder && candidates.is_empty() {
                    candidates.push((pattern, captured));
                    // Later patterns could also match; note the ambiguity
                    // but the first one wins.
                    continue;
                }
                candidates.push((pattern, captured));
            }
        }
        if candidates.is_empty() {
            debug!(topic, "no mapping pattern matched");
            return None;
        }
        if candidates.len() > 1 {
            warn!(
                topic,
                matches = candidates.len(),
                policy = ?self.policy,
                "multiple mapping patterns matched; tie-break policy applies"
            );
        }
        let (pattern, captured) = match self.policy {
            MatchPolicy::ConfigOrder => candidates.swap_remove(0),
            MatchPolicy::MostSpecific => {
                let best = candidates
                    .iter()
                    .enumerate()
                    .max_by_key(|(i, (p, _))| (p.specificity, std::cmp::Reverse(*i)))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                candidates.swap_remove(best)
            }
        };

        let path = match HierarchicalPath::from_segments(&self.levels, &captured) {
            Ok(path) => path,
            Err(err) => {
                warn!(topic, pattern = pattern.template(), %err, "capture did not form a valid path");
                return None;
            }
        };

        // Step 4: the resolved node must explicitly allow topics; no
        // silent fallback to an ancestor.
        if !self.namespaces.read().unwrap().allows_topics(&path) {
            debug!(topic, path = %path, "namespace does not allow topics");
            return None;
        }

        self.resolved
            .write()
            .unwrap()
            .insert(topic.to_string(), path.clone());
        Some(path)
    }

    fn strip_prefix<'a>(&self, topic: &'a str) -> (&'a str, bool) {
        for prefix in &self.strip_prefixes {
            if let Some(rest) = topic.strip_prefix(prefix.as_str()) {
                if let Some(rest) = rest.strip_prefix('/') {
                    return (rest, true);
                }
            }
        }
        (topic, false)
    }

    /// Replace the namespace view and drop all cached resolutions.
    /// Called whenever hierarchy or namespace configuration changes so
    /// previously-unmapped topics get re-evaluated.
    pub fn update_namespaces(&self, namespaces: NamespaceIndex) {
        *self.namespaces.write().unwrap() = namespaces;
        self.invalidate();
    }

    /// Drop all cached topic resolutions.
    pub fn invalidate(&self) {
        self.resolved.write().unwrap().clear();
    }
}
