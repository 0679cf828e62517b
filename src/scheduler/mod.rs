//! Least-recently-used category scheduler for work generation
//!
//! Idle agents ask for the next ideation category. Selection is strict LRU
//! over the enabled categories, with never-tried categories first. A
//! category that yields no usable idea is marked exhausted and sits out
//! until the recovery window elapses; producing an idea clears the flag.

use crate::config::MusterConfig;
use crate::store::{Namespace, StateStore};
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Per-category usage tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub category: String,
    /// Last time this category produced an ideation attempt
    pub last_used_at: Option<DateTime<Utc>>,
    /// Projects generated from this category over its lifetime
    pub projects_generated: u64,
    /// Set when ideation yielded nothing; expires after the recovery window
    pub no_idea_at: Option<DateTime<Utc>>,
}

impl CategoryUsage {
    /// Whether the exhaustion flag is currently in force
    pub fn is_exhausted(&self, expiry: Duration) -> bool {
        match self.no_idea_at {
            Some(at) => {
                Utc::now() - at < ChronoDuration::from_std(expiry).unwrap_or(ChronoDuration::MAX)
            }
            None => false,
        }
    }
}

/// The durable usage map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsageDoc {
    categories: HashMap<String, CategoryUsage>,
}

/// Aggregate view for operators and the health monitor
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub per_category: Vec<CategoryUsage>,
    pub enabled: usize,
    pub available: usize,
    pub exhausted: usize,
}

const USAGE_KEY: &str = "usage";

/// LRU category selection with temporary exhaustion
#[derive(Clone)]
pub struct CategoryScheduler {
    store: StateStore,
    enabled: Vec<String>,
    exhaustion_expiry: Duration,
}

impl CategoryScheduler {
    pub fn new(store: StateStore, config: &MusterConfig) -> Self {
        Self {
            store,
            enabled: config.categories.clone(),
            exhaustion_expiry: config.exhaustion_expiry(),
        }
    }

    fn load(&self) -> Result<UsageDoc> {
        self.store.get_or_heal(Namespace::Categories, USAGE_KEY)
    }

    /// Pick the category an idle agent should explore next
    ///
    /// Never-tried categories win over everything; among the previously
    /// used, the oldest `last_used_at` wins. Returns `None` only when every
    /// enabled category is currently exhausted.
    pub fn next(&self) -> Result<Option<String>> {
        let doc = self.load()?;

        let mut best: Option<(&str, Option<DateTime<Utc>>)> = None;
        for name in &self.enabled {
            let usage = doc.categories.get(name);
            if usage.is_some_and(|u| u.is_exhausted(self.exhaustion_expiry)) {
                continue;
            }
            let last_used = usage.and_then(|u| u.last_used_at);
            match (last_used, &best) {
                // Never used: immediate winner
                (None, _) => return Ok(Some(name.clone())),
                (Some(_), None) => best = Some((name, last_used)),
                (Some(at), Some((_, Some(best_at)))) if at < *best_at => {
                    best = Some((name, last_used));
                }
                _ => {}
            }
        }

        let chosen = best.map(|(name, _)| name.to_string());
        debug!(category = ?chosen, "Next ideation category selected");
        Ok(chosen)
    }

    /// Record that ideation in a category produced a project
    ///
    /// Clears any exhaustion flag: a category that just produced an idea is
    /// no longer exhausted.
    pub fn mark_used(&self, category: &str) -> Result<()> {
        self.store
            .update(Namespace::Categories, USAGE_KEY, |doc: &mut UsageDoc| {
                let usage = doc
                    .categories
                    .entry(category.to_string())
                    .or_insert_with(|| CategoryUsage {
                        category: category.to_string(),
                        ..Default::default()
                    });
                usage.last_used_at = Some(Utc::now());
                usage.projects_generated += 1;
                usage.no_idea_at = None;
                Ok(())
            })?;
        info!(category, "Category used");
        Ok(())
    }

    /// Record that ideation in a category yielded nothing
    pub fn mark_exhausted(&self, category: &str) -> Result<()> {
        self.store
            .update(Namespace::Categories, USAGE_KEY, |doc: &mut UsageDoc| {
                let usage = doc
                    .categories
                    .entry(category.to_string())
                    .or_insert_with(|| CategoryUsage {
                        category: category.to_string(),
                        ..Default::default()
                    });
                usage.no_idea_at = Some(Utc::now());
                Ok(())
            })?;
        info!(category, "Category exhausted");
        Ok(())
    }

    /// Proactively clear exhaustion flags past the recovery window
    ///
    /// Idempotent with the read-time check in `next()`; provided as an
    /// explicit maintenance pass. Returns how many flags were cleared.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let expiry = self.exhaustion_expiry;
        self.store
            .update(Namespace::Categories, USAGE_KEY, |doc: &mut UsageDoc| {
                let mut cleared = 0;
                for usage in doc.categories.values_mut() {
                    if usage.no_idea_at.is_some() && !usage.is_exhausted(expiry) {
                        usage.no_idea_at = None;
                        cleared += 1;
                    }
                }
                Ok(cleared)
            })
    }

    /// Per-category usage plus aggregate counts
    pub fn usage_stats(&self) -> Result<UsageStats> {
        let doc = self.load()?;
        let mut per_category = Vec::new();
        let mut exhausted = 0;

        for name in &self.enabled {
            let usage = doc.categories.get(name).cloned().unwrap_or_else(|| {
                CategoryUsage {
                    category: name.clone(),
                    ..Default::default()
                }
            });
            if usage.is_exhausted(self.exhaustion_expiry) {
                exhausted += 1;
            }
            per_category.push(usage);
        }

        Ok(UsageStats {
            enabled: self.enabled.len(),
            available: self.enabled.len() - exhausted,
            exhausted,
            per_category,
        })
    }

    /// Categories used since the given cutoff (for coverage reporting)
    pub fn used_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let doc = self.load()?;
        Ok(self
            .enabled
            .iter()
            .filter(|name| {
                doc.categories
                    .get(*name)
                    .and_then(|u| u.last_used_at)
                    .is_some_and(|at| at >= cutoff)
            })
            .cloned()
            .collect())
    }

    /// The enabled category list
    pub fn enabled(&self) -> &[String] {
        &self.enabled
    }
}
