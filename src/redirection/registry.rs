use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use super::{RedirectionError, RedirectionRule};
use crate::types::{CapabilityName, RegistryVersion};

/// Full rule set as of one registry version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectionSnapshot {
    pub version: RegistryVersion,
    pub rules: Vec<RedirectionRule>,
}

/// Rules by id plus an index of rule ids by source capability.
#[derive(Debug, Clone, Default)]
struct RuleTable {
    rules: HashMap<Uuid, RedirectionRule>,
    by_source: HashMap<CapabilityName, Vec<Uuid>>,
}

impl RuleTable {
    /// Insert one rule. `Ok(false)` when the id is already present.
    fn try_push(&mut self, rule: &RedirectionRule) -> Result<bool, RedirectionError> {
        if self.rules.contains_key(&rule.id) {
            return Ok(false);
        }

        let siblings = self.by_source.get(&rule.source).map(Vec::as_slice).unwrap_or_default();
        if let Some(existing) = siblings
            .iter()
            .filter_map(|id| self.rules.get(id))
            .find(|existing| existing.conflicts_with(rule))
        {
            return Err(RedirectionError::Conflict {
                incoming: rule.id,
                existing: existing.id,
                capability: rule.source.clone(),
            });
        }

        self.by_source.entry(rule.source.clone()).or_default().push(rule.id);
        self.rules.insert(rule.id, rule.clone());
        Ok(true)
    }

    fn remove(&mut self, id: &Uuid) -> bool {
        let Some(rule) = self.rules.remove(id) else {
            return false;
        };

        if let Some(ids) = self.by_source.get_mut(&rule.source) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_source.remove(&rule.source);
            }
        }
        true
    }
}

/// Versioned table of redirection rules.
///
/// Not internally synchronized: one owner mutates it at a time. The version
/// is regenerated exactly once per call that changed something.
#[derive(Debug, Clone)]
pub struct RedirectionRegistry {
    table: RuleTable,
    version: RegistryVersion,
}

impl Default for RedirectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RedirectionRegistry {
    pub fn new() -> Self {
        Self {
            table: RuleTable::default(),
            version: RegistryVersion::fresh(),
        }
    }

    /// Rebuild a registry from persisted rules, keeping their version.
    pub fn from_parts(
        rules: impl IntoIterator<Item = RedirectionRule>,
        version: RegistryVersion,
    ) -> Result<Self, RedirectionError> {
        let mut table = RuleTable::default();
        for rule in rules {
            table.try_push(&rule)?;
        }
        Ok(Self { table, version })
    }

    pub fn version(&self) -> &RegistryVersion {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.table.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.rules.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&RedirectionRule> {
        self.table.rules.get(id)
    }

    /// Every rule, ordered by id.
    pub fn get_all(&self) -> Vec<RedirectionRule> {
        let mut rules: Vec<RedirectionRule> = self.table.rules.values().cloned().collect();
        rules.sort_by_key(|r| r.id);
        rules
    }

    /// Rules redirecting `source`, in insertion order.
    pub fn rules_for(&self, source: &CapabilityName) -> Vec<&RedirectionRule> {
        self.table
            .by_source
            .get(source)
            .into_iter()
            .flatten()
            .filter_map(|id| self.table.rules.get(id))
            .collect()
    }

    /// Insert one rule.
    ///
    /// A rule whose id is already registered is ignored and yields
    /// `Ok(false)`. A rule that conflicts with a registered one is an error
    /// and nothing changes.
    pub fn push_one(&mut self, rule: RedirectionRule) -> Result<bool, RedirectionError> {
        rule.validate()?;

        let changed = self.table.try_push(&rule)?;
        if changed {
            self.bump();
        }
        Ok(changed)
    }

    /// Insert several rules atomically.
    ///
    /// Every rule is validated first. The batch is then applied to a copy
    /// of the table so a conflict anywhere in it (with existing rules or
    /// within the batch) leaves the registry untouched. Duplicate ids are
    /// skipped individually.
    pub fn push_batch(&mut self, rules: &[RedirectionRule]) -> Result<bool, RedirectionError> {
        for rule in rules {
            rule.validate()?;
        }

        let mut scratch = self.table.clone();
        let mut changed = false;
        for rule in rules {
            changed |= scratch.try_push(rule)?;
        }

        if !changed {
            debug!("Redirection batch of {} rules changed nothing", rules.len());
            return Ok(false);
        }

        // Replaying on the live table cannot fail: it starts from the same
        // state the scratch copy did.
        for rule in rules {
            self.table.try_push(rule)?;
        }
        self.bump();
        Ok(true)
    }

    pub fn pop_one(&mut self, id: &Uuid) -> bool {
        self.pop_batch(std::slice::from_ref(id))
    }

    /// Remove rules by id. Returns whether anything was removed.
    pub fn pop_batch(&mut self, ids: &[Uuid]) -> bool {
        let mut changed = false;
        for id in ids {
            changed |= self.table.remove(id);
        }

        if changed {
            self.bump();
        }
        changed
    }

    /// The full rule set, unless the caller already holds the current
    /// version.
    pub fn get_snapshot(&self, caller_version: Option<&RegistryVersion>) -> Option<RedirectionSnapshot> {
        if caller_version == Some(&self.version) {
            return None;
        }
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> RedirectionSnapshot {
        RedirectionSnapshot {
            version: self.version.clone(),
            rules: self.get_all(),
        }
    }

    fn bump(&mut self) {
        self.version = RegistryVersion::fresh();
        debug!("Redirection registry now at version {}", self.version);
    }
}
