//! PII redaction.
//!
//! [`RedactionEngine`] applies a tenant's active [`RedactionRule`]s to raw
//! text and returns the masked text plus one [`Redaction`] record per
//! masked span. The original substrings are never returned.
//!
//! # Overlap resolution
//!
//! Rules are ranked by type priority (ssn, credit_card, account_number,
//! email, phone, address), then creation time, then id. All matches are
//! collected and then accepted greedily in this order:
//!
//! 1. lower type priority first,
//! 2. longer match first,
//! 3. earlier start first,
//! 4. lower rule rank first.
//!
//! A match fully inside an accepted span is discarded. A match that only
//! partially overlaps accepted spans is absorbed: the highest-ranked of
//! those spans widens to the union, so no matched byte is left unmasked.
//!
//! Each span is replaced by the fixed-length mask of its type, e.g.
//! `***-**-****` for an SSN. Offsets in the records refer to the original
//! text.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use crate::config::RedactionConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{Redaction, RedactionRule, RedactionType};
use crate::store::Store;

const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A rule that could not be applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRule {
    pub rule_id: String,
    pub error: String,
}

impl SkippedRule {
    pub fn to_error(&self) -> EngineError {
        EngineError::InvalidPattern {
            rule_id: self.rule_id.clone(),
            message: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RedactionOutcome {
    pub masked_text: String,
    /// Ordered by `start`.
    pub redactions: Vec<Redaction>,
    pub skipped_rules: Vec<SkippedRule>,
}

struct CachedPattern {
    updated_at: DateTime<Utc>,
    pattern: String,
    compiled: Result<Regex, String>,
}

struct Candidate {
    start: usize,
    end: usize,
    rule_type: RedactionType,
    rank: usize,
}

struct Span {
    start: usize,
    end: usize,
    rule_type: RedactionType,
    rank: usize,
}

pub struct RedactionEngine {
    mask_char: char,
    max_pattern_len: usize,
    cache: Mutex<HashMap<String, CachedPattern>>,
}

impl RedactionEngine {
    pub fn new(config: &RedactionConfig) -> Self {
        Self {
            mask_char: config.mask_char,
            max_pattern_len: config.max_pattern_len,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load the tenant's active rules and redact `text`.
    pub async fn redact(
        &self,
        store: &dyn Store,
        tenant_id: &str,
        text: &str,
    ) -> EngineResult<RedactionOutcome> {
        let rules = store
            .active_redaction_rules(tenant_id)
            .await
            .map_err(EngineError::Storage)?;
        let outcome = self.redact_with_rules(text, &rules);
        for skipped in &outcome.skipped_rules {
            tracing::warn!(
                tenant_id,
                rule_id = %skipped.rule_id,
                error = %skipped.error,
                "security event: redaction rule skipped"
            );
        }
        Ok(outcome)
    }

    /// Redact `text` with an explicit rule set. Inactive rules are ignored.
    pub fn redact_with_rules(&self, text: &str, rules: &[RedactionRule]) -> RedactionOutcome {
        let mut ordered: Vec<&RedactionRule> = rules.iter().filter(|r| r.is_active).collect();
        ordered.sort_by(|a, b| {
            a.rule_type
                .priority()
                .cmp(&b.rule_type.priority())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let mut skipped_rules = Vec::new();
        let mut candidates = Vec::new();
        for (rank, rule) in ordered.iter().enumerate() {
            let regex = match self.compiled(rule) {
                Ok(regex) => regex,
                Err(error) => {
                    skipped_rules.push(SkippedRule {
                        rule_id: rule.id.clone(),
                        error,
                    });
                    continue;
                }
            };
            for m in regex.find_iter(text) {
                if m.start() == m.end() {
                    continue;
                }
                candidates.push(Candidate {
                    start: m.start(),
                    end: m.end(),
                    rule_type: rule.rule_type,
                    rank,
                });
            }
        }

        candidates.sort_by(|a, b| {
            a.rule_type
                .priority()
                .cmp(&b.rule_type.priority())
                .then((b.end - b.start).cmp(&(a.end - a.start)))
                .then(a.start.cmp(&b.start))
                .then(a.rank.cmp(&b.rank))
        });

        let spans = resolve_overlaps(candidates);
        let (masked_text, redactions) = self.apply(text, spans, &ordered);
        RedactionOutcome {
            masked_text,
            redactions,
            skipped_rules,
        }
    }

    fn compiled(&self, rule: &RedactionRule) -> Result<Regex, String> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(hit) = cache.get(&rule.id) {
            if hit.updated_at == rule.updated_at && hit.pattern == rule.pattern {
                return hit.compiled.clone();
            }
        }
        let compiled = if rule.pattern.len() > self.max_pattern_len {
            Err(format!(
                "pattern is {} bytes, limit is {}",
                rule.pattern.len(),
                self.max_pattern_len
            ))
        } else {
            RegexBuilder::new(&rule.pattern)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|e| e.to_string())
        };
        cache.insert(
            rule.id.clone(),
            CachedPattern {
                updated_at: rule.updated_at,
                pattern: rule.pattern.clone(),
                compiled: compiled.clone(),
            },
        );
        compiled
    }

    fn apply(
        &self,
        text: &str,
        mut spans: Vec<Span>,
        rules: &[&RedactionRule],
    ) -> (String, Vec<Redaction>) {
        spans.sort_by_key(|s| s.start);
        let mut masked = String::with_capacity(text.len());
        let mut redactions = Vec::with_capacity(spans.len());
        let mut cursor = 0;
        for span in spans {
            let mask = self.mask(span.rule_type);
            masked.push_str(&text[cursor..span.start]);
            masked.push_str(&mask);
            cursor = span.end;
            redactions.push(Redaction {
                redaction_type: span.rule_type,
                start: span.start,
                end: span.end,
                rule_id: rules[span.rank].id.clone(),
                masked_value: mask,
            });
        }
        masked.push_str(&text[cursor..]);
        (masked, redactions)
    }

    /// The type-shaped mask rendered with the configured character.
    pub fn mask(&self, rule_type: RedactionType) -> String {
        rule_type
            .mask_template()
            .chars()
            .map(|c| if c == '#' { self.mask_char } else { c })
            .collect()
    }
}

/// Greedy acceptance over candidates already sorted by precedence.
fn resolve_overlaps(candidates: Vec<Candidate>) -> Vec<Span> {
    let mut accepted: Vec<Span> = Vec::new();
    for c in candidates {
        let overlapping: Vec<usize> = accepted
            .iter()
            .enumerate()
            .filter(|(_, a)| c.start < a.end && a.start < c.end)
            .map(|(i, _)| i)
            .collect();

        let Some(&keep) = overlapping.first() else {
            accepted.push(Span {
                start: c.start,
                end: c.end,
                rule_type: c.rule_type,
                rank: c.rank,
            });
            continue;
        };

        if overlapping
            .iter()
            .any(|&i| accepted[i].start <= c.start && c.end <= accepted[i].end)
        {
            continue;
        }

        let mut start = c.start;
        let mut end = c.end;
        for &i in &overlapping {
            start = start.min(accepted[i].start);
            end = end.max(accepted[i].end);
        }
        accepted[keep].start = start;
        accepted[keep].end = end;
        for &i in overlapping[1..].iter().rev() {
            accepted.remove(i);
        }
    }
    accepted
}
