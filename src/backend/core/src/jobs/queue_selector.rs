//! Queue filter expressions.
//!
//! A worker's `queues` setting is a comma-separated list. `*` selects every
//! queue; `name*` selects every queue starting with `name`; anything else is an
//! exact queue name. Order is significant: queues are drained in the order they
//! are listed.

use crate::db::Transaction;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePattern {
    All,
    Exact(String),
    Prefix(String),
}

impl QueuePattern {
    fn parse(raw: &str) -> Self {
        if raw == "*" {
            QueuePattern::All
        } else if let Some(prefix) = raw.strip_suffix('*') {
            QueuePattern::Prefix(prefix.to_string())
        } else {
            QueuePattern::Exact(raw.to_string())
        }
    }
}

/// What a claim should read from, resolved against current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueScope {
    /// Every queue except the paused ones, ordered globally.
    All { excluded: Vec<String> },
    /// These queues, drained in order. May be empty.
    Ordered(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSelector {
    patterns: Vec<QueuePattern>,
}

impl QueueSelector {
    pub fn parse(expression: &str) -> Self {
        let patterns = expression
            .split(',')
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(QueuePattern::parse)
            .collect();
        Self { patterns }
    }

    pub fn from_list<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = queues
            .into_iter()
            .map(|q| q.as_ref().trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(|raw| QueuePattern::parse(&raw))
            .collect();
        Self { patterns }
    }

    pub fn all() -> Self {
        Self {
            patterns: vec![QueuePattern::All],
        }
    }

    pub fn includes_all(&self) -> bool {
        self.patterns.contains(&QueuePattern::All)
    }

    fn has_prefix(&self) -> bool {
        self.patterns
            .iter()
            .any(|p| matches!(p, QueuePattern::Prefix(_)))
    }

    /// Resolve against the pause set and, for prefix patterns, the queue
    /// names that currently have ready work.
    pub async fn resolve(&self, tx: &mut dyn Transaction) -> Result<QueueScope> {
        let paused = tx.paused_queues().await?;
        let ready_names = if !self.includes_all() && self.has_prefix() {
            tx.ready_queue_names().await?
        } else {
            Vec::new()
        };
        Ok(self.resolve_with(&ready_names, &paused))
    }

    pub fn resolve_with(&self, ready_names: &[String], paused: &[String]) -> QueueScope {
        if self.includes_all() {
            return QueueScope::All {
                excluded: paused.to_vec(),
            };
        }

        let mut names: Vec<String> = Vec::new();
        for pattern in &self.patterns {
            match pattern {
                QueuePattern::Exact(name) => names.push(name.clone()),
                QueuePattern::Prefix(prefix) => {
                    let mut matching: Vec<&String> =
                        ready_names.iter().filter(|n| n.starts_with(prefix.as_str())).collect();
                    matching.sort();
                    names.extend(matching.into_iter().cloned());
                }
                QueuePattern::All => {}
            }
        }

        let mut seen = std::collections::HashSet::new();
        names.retain(|name| !paused.contains(name) && seen.insert(name.clone()));
        QueueScope::Ordered(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_wildcard_excludes_paused() {
        let selector = QueueSelector::parse("*");
        assert_eq!(
            selector.resolve_with(&[], &strings(&["mail"])),
            QueueScope::All {
                excluded: strings(&["mail"])
            }
        );
    }

    #[test]
    fn test_ordered_list_keeps_order() {
        let selector = QueueSelector::parse("critical, default ,mail");
        assert_eq!(
            selector.resolve_with(&[], &strings(&["mail"])),
            QueueScope::Ordered(strings(&["critical", "default"]))
        );
    }

    #[test]
    fn test_prefix_expands_sorted() {
        let selector = QueueSelector::parse("urgent,reports*");
        let ready = strings(&["reports_weekly", "default", "reports_daily"]);
        assert_eq!(
            selector.resolve_with(&ready, &[]),
            QueueScope::Ordered(strings(&["urgent", "reports_daily", "reports_weekly"]))
        );
    }

    #[test]
    fn test_duplicates_collapse() {
        let selector = QueueSelector::from_list(["a", "a*"]);
        let ready = strings(&["a", "ab"]);
        assert_eq!(
            selector.resolve_with(&ready, &[]),
            QueueScope::Ordered(strings(&["a", "ab"]))
        );
    }
}
