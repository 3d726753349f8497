// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The send policy filter: a globally ordered accept/reject rule list.

use std::fmt;
use v4v_core::protocol::TablesRule;
use v4v_core::Address;
use v4v_core::DomainId;
use v4v_core::PORT_ANY;

/// One accept/reject rule. Either side may wildcard its domain, its port,
/// or both.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rule {
    pub accept: bool,
    pub src: Address,
    pub dst: Address,
}

fn addr_matches(pattern: Address, addr: Address) -> bool {
    (pattern.domain == DomainId::ANY || pattern.domain == addr.domain)
        && (pattern.port == PORT_ANY || pattern.port == addr.port)
}

impl Rule {
    /// Whether this rule applies to a send from `src` to `dst`.
    pub fn matches(&self, src: Address, dst: Address) -> bool {
        addr_matches(self.src, src) && addr_matches(self.dst, dst)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            if self.accept { "ACCEPT" } else { "REJECT" },
            self.src,
            self.dst
        )
    }
}

impl From<TablesRule> for Rule {
    fn from(wire: TablesRule) -> Self {
        Self {
            accept: wire.accept != 0,
            src: wire.src.into(),
            dst: wire.dst.into(),
        }
    }
}

impl From<Rule> for TablesRule {
    fn from(rule: Rule) -> Self {
        Self {
            src: rule.src.into(),
            dst: rule.dst.into(),
            accept: rule.accept.into(),
        }
    }
}

/// The ordered rule list. First match wins; an empty table accepts.
#[derive(Debug, Default)]
pub(crate) struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    /// Inserts `rule` before the rule at 1-based `position`; positions
    /// beyond the end append.
    pub fn add(&mut self, rule: Rule, position: u32) {
        let index = (position.saturating_sub(1) as usize).min(self.rules.len());
        self.rules.insert(index, rule);
    }

    /// Removes the rule at 1-based `position`, if there is one.
    pub fn remove_at(&mut self, position: u32) -> Option<Rule> {
        let index = position.checked_sub(1)? as usize;
        (index < self.rules.len()).then(|| self.rules.remove(index))
    }

    /// Removes the first rule whose addresses exactly match.
    pub fn remove_matching(&mut self, src: Address, dst: Address) -> Option<Rule> {
        let index = self
            .rules
            .iter()
            .position(|r| r.src == src && r.dst == dst)?;
        Some(self.rules.remove(index))
    }

    /// Drops every rule.
    pub fn flush(&mut self) {
        self.rules.clear();
    }

    /// The window of rules starting at 0-based `start`, at most `limit` of
    /// them.
    pub fn list(&self, start: u32, limit: u32) -> &[Rule] {
        let start = (start as usize).min(self.rules.len());
        let end = start
            .saturating_add(limit as usize)
            .min(self.rules.len());
        &self.rules[start..end]
    }

    /// Applies the table to a send from `src` to `dst`, returning whether
    /// it is accepted.
    pub fn check(&self, src: Address, dst: Address) -> bool {
        for rule in &self.rules {
            if rule.matches(src, dst) {
                return rule.accept;
            }
        }
        true
    }
}
