/// Volume filtering
///
/// Hard exclusion rules followed by the user's whitelist and blacklist.
/// Every rejection carries a reason and the source of the rule that fired.

use std::collections::BTreeMap;
use tracing::debug;

/// Volumes used as caches by the backup engines themselves
pub const DEFAULT_BLACKLIST: [&str; 4] = [
    "duplicity_cache",
    "restic_cache",
    "duplicity-cache",
    "restic-cache",
];

/// Label that opts a volume out of backups
pub const IGNORE_LABEL: &str = "bivac.ignore";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Unnamed,
    Blacklisted,
    Ignored,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Unnamed => write!(f, "unnamed"),
            RejectReason::Blacklisted => write!(f, "blacklisted"),
            RejectReason::Ignored => write!(f, "ignored"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject {
        reason: RejectReason,
        source: &'static str,
    },
}

impl FilterDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FilterDecision::Accept)
    }

    fn reject(reason: RejectReason, source: &'static str) -> Self {
        FilterDecision::Reject { reason, source }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl Filters {
    pub fn new(whitelist: Vec<String>, blacklist: Vec<String>) -> Self {
        Self {
            whitelist: normalize(whitelist),
            blacklist: normalize(blacklist),
        }
    }

    pub fn whitelist(&self) -> &[String] {
        &self.whitelist
    }

    pub fn blacklist(&self) -> &[String] {
        &self.blacklist
    }

    /// Decide whether the volume `name` with the given orchestrator labels
    /// should be managed
    pub fn check(&self, name: &str, labels: &BTreeMap<String, String>) -> FilterDecision {
        let runes = name.chars().count();
        if runes == 0 || runes == 64 {
            return FilterDecision::reject(RejectReason::Unnamed, "");
        }
        if name == "lost+found" {
            return FilterDecision::reject(RejectReason::Unnamed, "");
        }
        if name.contains('/') {
            return FilterDecision::reject(RejectReason::Blacklisted, "path");
        }
        if labels.get(IGNORE_LABEL).map(String::as_str) == Some("true") {
            return FilterDecision::reject(RejectReason::Ignored, "volume config");
        }

        if !self.whitelist.is_empty() {
            if self.whitelist.binary_search_by(|w| w.as_str().cmp(name)).is_ok() {
                return FilterDecision::Accept;
            }
            return FilterDecision::reject(RejectReason::Blacklisted, "whitelist config");
        }

        if self.blacklist.binary_search_by(|b| b.as_str().cmp(name)).is_ok()
            || DEFAULT_BLACKLIST.contains(&name)
        {
            return FilterDecision::reject(RejectReason::Blacklisted, "blacklist config");
        }

        FilterDecision::Accept
    }

    /// `check` plus a debug trace of the rejection
    pub fn is_accepted(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        match self.check(name, labels) {
            FilterDecision::Accept => true,
            FilterDecision::Reject { reason, source } => {
                debug!(volume = %name, %reason, source, "Ignoring volume");
                false
            }
        }
    }
}

fn normalize(mut list: Vec<String>) -> Vec<String> {
    list.retain(|s| !s.trim().is_empty());
    for s in list.iter_mut() {
        *s = s.trim().to_string();
    }
    list.sort();
    list.dedup();
    list
}
