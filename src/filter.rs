//! The blocklist/allowlist decision tree. All evaluation happens against an
//! immutable compiled view held in a [concread] CowCell: readers never block
//! and never suspend, reloads build a fresh view and swap it in whole.

use crate::db::filterlist::{FilterData, KIND_ALLOW, KIND_BLOCK};
use crate::db::{filterlist, settings};
use crate::error::HoldfastError;
use concread::cowcell::CowCell;
use log::warn;
use regex::Regex;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;

/// Patterns longer than this are refused at ingestion.
const MAX_PATTERN_LENGTH: usize = 512;

/// Why a name was blocked. Every blocked verdict carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    RegexFilter,
    ClientBlocklist,
    GroupBlocklist,
    Blocklist,
}

impl Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BlockReason::RegexFilter => "regex-filter",
            BlockReason::ClientBlocklist => "client-blocklist",
            BlockReason::GroupBlocklist => "group-blocklist",
            BlockReason::Blocklist => "blocklist",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterVerdict {
    pub blocked: bool,
    pub reason: Option<BlockReason>,
}

impl FilterVerdict {
    pub const ALLOW: FilterVerdict = FilterVerdict {
        blocked: false,
        reason: None,
    };

    fn blocked(reason: BlockReason) -> Self {
        FilterVerdict {
            blocked: true,
            reason: Some(reason),
        }
    }
}

/// One compiled snapshot of the filter state.
#[derive(Clone, Default)]
pub struct FilterView {
    pub blocking_enabled: bool,
    /// unix seconds; blocking is suspended while now < this
    pub disabled_until: Option<i64>,
    global_allow: HashSet<String>,
    global_block: HashSet<String>,
    client_allow: HashMap<String, HashSet<String>>,
    client_block: HashMap<String, HashSet<String>>,
    group_allow: HashMap<String, HashSet<String>>,
    group_block: HashMap<String, HashSet<String>>,
    client_groups: HashMap<String, Vec<String>>,
    clients_blocking_disabled: HashSet<String>,
    groups_blocking_disabled: HashSet<String>,
    allow_regexes: Vec<Regex>,
    block_regexes: Vec<Regex>,
}

impl FilterView {
    pub fn build(data: FilterData, blocking_enabled: bool, disabled_until: Option<i64>) -> Self {
        let mut allow_regexes = vec![];
        let mut block_regexes = vec![];
        for row in &data.regexes {
            if !row.enabled {
                continue;
            }
            // a pattern that fails validation here is silently skipped at
            // evaluation time, it just gets a warning on the way in
            let regex = match validate_pattern(&row.pattern) {
                Ok(regex) => regex,
                Err(err) => {
                    warn!("skipping regex filter {:?}: {err}", row.pattern);
                    continue;
                }
            };
            match row.kind.as_str() {
                KIND_ALLOW => allow_regexes.push(regex),
                KIND_BLOCK => block_regexes.push(regex),
                other => warn!("skipping regex filter with kind {other:?}"),
            }
        }
        FilterView {
            blocking_enabled,
            disabled_until,
            global_allow: data.global_allow,
            global_block: data.global_block,
            client_allow: data.client_allow,
            client_block: data.client_block,
            group_allow: data.group_allow,
            group_block: data.group_block,
            client_groups: data.client_groups,
            clients_blocking_disabled: data.clients_blocking_disabled,
            groups_blocking_disabled: data.groups_blocking_disabled,
            allow_regexes,
            block_regexes,
        }
    }
}

/// Validate a filter pattern at ingestion: bounded length, and an early
/// refusal of nested unbounded quantifiers like `(a+)+` even though the
/// engine underneath is linear-time.
pub fn validate_pattern(pattern: &str) -> Result<Regex, HoldfastError> {
    if pattern.len() > MAX_PATTERN_LENGTH {
        return Err(HoldfastError::Regex(format!(
            "pattern over {MAX_PATTERN_LENGTH} chars"
        )));
    }
    if has_nested_unbounded_quantifier(pattern) {
        return Err(HoldfastError::Regex(
            "nested unbounded quantifiers are not accepted".to_string(),
        ));
    }
    Ok(Regex::new(pattern)?)
}

/// Spot `(...)`-groups carrying an unbounded quantifier that are themselves
/// repeated without bound.
fn has_nested_unbounded_quantifier(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut stack: Vec<(usize, bool)> = vec![]; // (open index, saw unbounded inside)
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'(' => stack.push((i, false)),
            b'+' | b'*' => {
                if let Some(top) = stack.last_mut() {
                    top.1 = true;
                }
            }
            b'{' => {
                // {n,} with no upper bound counts as unbounded
                if let Some(end) = pattern[i..].find('}') {
                    if pattern[i..i + end].ends_with(',') {
                        if let Some(top) = stack.last_mut() {
                            top.1 = true;
                        }
                    }
                    i += end;
                }
            }
            b')' => {
                if let Some((_, inner_unbounded)) = stack.pop() {
                    let next = bytes.get(i + 1);
                    let outer_unbounded = matches!(next, Some(b'+') | Some(b'*'))
                        || matches!(next, Some(b'{')
                            if pattern[i + 1..].find('}').is_some_and(|e| pattern[i + 1..i + 1 + e].ends_with(',')));
                    if inner_unbounded && outer_unbounded {
                        return true;
                    }
                    // the group's unboundedness propagates to its parent
                    if inner_unbounded {
                        if let Some(top) = stack.last_mut() {
                            top.1 = true;
                        }
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// The engine itself. Holds the compiled view, answers "is this blocked for
/// this client", and can reload from storage.
pub struct FilterEngine {
    view: CowCell<FilterView>,
}

impl Default for FilterEngine {
    fn default() -> Self {
        FilterEngine {
            view: CowCell::new(FilterView {
                blocking_enabled: true,
                ..Default::default()
            }),
        }
    }
}

impl FilterEngine {
    pub fn new(view: FilterView) -> Self {
        FilterEngine {
            view: CowCell::new(view),
        }
    }

    /// Rebuild the view from storage and swap it in. Readers see either the
    /// old view or the new one, never a torn mix.
    pub async fn reload(&self, pool: &SqlitePool) -> Result<(), HoldfastError> {
        let data = filterlist::load_filter_state(pool).await?;
        let blocking_enabled = settings::get(pool, "blocking_enabled", "true").await? == "true";
        let disabled_until = settings::get(pool, "blocking_disabled_until", "0")
            .await?
            .parse::<i64>()
            .ok()
            .filter(|v| *v > 0);
        let built = FilterView::build(data, blocking_enabled, disabled_until);
        let mut writer = self.view.write();
        *writer = built;
        writer.commit();
        Ok(())
    }

    /// The decision order, first match wins:
    /// admin disable, client/group disables, allowlists (global, client,
    /// group), allow regexes, block regexes, client blocklist, group
    /// blocklist, then the global blocklist including parent domains.
    pub fn evaluate(&self, name: &str, client_ip: &str, now: i64) -> FilterVerdict {
        let view = self.view.read();

        if !view.blocking_enabled {
            return FilterVerdict::ALLOW;
        }
        if view.disabled_until.is_some_and(|until| now < until) {
            return FilterVerdict::ALLOW;
        }
        if view.clients_blocking_disabled.contains(client_ip) {
            return FilterVerdict::ALLOW;
        }

        let groups = view
            .client_groups
            .get(client_ip)
            .map(|g| g.as_slice())
            .unwrap_or_default();
        if groups
            .iter()
            .any(|g| view.groups_blocking_disabled.contains(g))
        {
            return FilterVerdict::ALLOW;
        }

        if view.global_allow.contains(name) {
            return FilterVerdict::ALLOW;
        }
        if view
            .client_allow
            .get(client_ip)
            .is_some_and(|set| set.contains(name))
        {
            return FilterVerdict::ALLOW;
        }
        if groups
            .iter()
            .any(|g| view.group_allow.get(g).is_some_and(|set| set.contains(name)))
        {
            return FilterVerdict::ALLOW;
        }
        if view.allow_regexes.iter().any(|r| r.is_match(name)) {
            return FilterVerdict::ALLOW;
        }

        if view.block_regexes.iter().any(|r| r.is_match(name)) {
            return FilterVerdict::blocked(BlockReason::RegexFilter);
        }
        if view
            .client_block
            .get(client_ip)
            .is_some_and(|set| set.contains(name))
        {
            return FilterVerdict::blocked(BlockReason::ClientBlocklist);
        }
        if groups
            .iter()
            .any(|g| view.group_block.get(g).is_some_and(|set| set.contains(name)))
        {
            return FilterVerdict::blocked(BlockReason::GroupBlocklist);
        }

        // the global blocklist also catches parent domains:
        // ads.tracker.com is blocked by an entry for tracker.com
        let mut candidate = name;
        loop {
            if view.global_block.contains(candidate) {
                return FilterVerdict::blocked(BlockReason::Blocklist);
            }
            match candidate.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => candidate = rest,
                _ => break,
            }
        }

        FilterVerdict::ALLOW
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::filterlist::RegexFilterRow;

    fn engine(build: impl FnOnce(&mut FilterData)) -> FilterEngine {
        let mut data = FilterData::default();
        build(&mut data);
        FilterEngine::new(FilterView::build(data, true, None))
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_global_blocklist_and_parents() {
        let engine = engine(|data| {
            data.global_block.insert("tracker.com".to_string());
        });
        let verdict = engine.evaluate("ads.tracker.com", "192.0.2.1", NOW);
        assert!(verdict.blocked);
        assert_eq!(verdict.reason, Some(BlockReason::Blocklist));
        assert!(engine.evaluate("tracker.com", "192.0.2.1", NOW).blocked);
        assert!(!engine.evaluate("nottracker.com", "192.0.2.1", NOW).blocked);
    }

    #[test]
    fn test_allow_beats_block() {
        let engine = engine(|data| {
            data.global_block.insert("cdn.example.com".to_string());
            data.global_allow.insert("cdn.example.com".to_string());
        });
        assert!(!engine.evaluate("cdn.example.com", "192.0.2.1", NOW).blocked);
    }

    #[test]
    fn test_client_blocklist_reason() {
        let engine = engine(|data| {
            data.client_block
                .entry("192.0.2.50".to_string())
                .or_default()
                .insert("games.example.com".to_string());
        });
        let verdict = engine.evaluate("games.example.com", "192.0.2.50", NOW);
        assert_eq!(verdict.reason, Some(BlockReason::ClientBlocklist));
        // another client is unaffected
        assert!(!engine.evaluate("games.example.com", "192.0.2.51", NOW).blocked);
    }

    #[test]
    fn test_group_membership_and_disable() {
        let engine1 = engine(|data| {
            data.client_groups
                .insert("192.0.2.60".to_string(), vec!["kids".to_string()]);
            data.group_block
                .entry("kids".to_string())
                .or_default()
                .insert("social.example.com".to_string());
        });
        let verdict = engine1.evaluate("social.example.com", "192.0.2.60", NOW);
        assert_eq!(verdict.reason, Some(BlockReason::GroupBlocklist));

        let engine2 = engine(|data| {
            data.client_groups
                .insert("192.0.2.60".to_string(), vec!["kids".to_string()]);
            data.group_block
                .entry("kids".to_string())
                .or_default()
                .insert("social.example.com".to_string());
            data.groups_blocking_disabled.insert("kids".to_string());
        });
        assert!(!engine2.evaluate("social.example.com", "192.0.2.60", NOW).blocked);
    }

    #[test]
    fn test_regex_filters() {
        let engine = engine(|data| {
            data.regexes.push(RegexFilterRow {
                pattern: r"^ads?\.".to_string(),
                kind: "block".to_string(),
                enabled: true,
            });
            data.regexes.push(RegexFilterRow {
                pattern: r"^ad\.good\.example\.com$".to_string(),
                kind: "allow".to_string(),
                enabled: true,
            });
        });
        let verdict = engine.evaluate("ad.example.com", "192.0.2.1", NOW);
        assert_eq!(verdict.reason, Some(BlockReason::RegexFilter));
        // the allow regex sits in an earlier tier
        assert!(!engine.evaluate("ad.good.example.com", "192.0.2.1", NOW).blocked);
    }

    #[test]
    fn test_disabled_regex_is_ignored() {
        let engine = engine(|data| {
            data.regexes.push(RegexFilterRow {
                pattern: r"^blocked\.".to_string(),
                kind: "block".to_string(),
                enabled: false,
            });
        });
        assert!(!engine.evaluate("blocked.example.com", "192.0.2.1", NOW).blocked);
    }

    #[test]
    fn test_temporary_disable_window() {
        let data = FilterData {
            global_block: ["tracker.com".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let engine = FilterEngine::new(FilterView::build(data, true, Some(NOW + 60)));
        assert!(!engine.evaluate("tracker.com", "192.0.2.1", NOW).blocked);
        // the window has passed
        assert!(engine.evaluate("tracker.com", "192.0.2.1", NOW + 120).blocked);
    }

    #[test]
    fn test_pattern_validation() {
        assert!(validate_pattern(r"^ads\.").is_ok());
        assert!(validate_pattern(&"a".repeat(600)).is_err());
        assert!(validate_pattern(r"(a+)+b").is_err());
        assert!(validate_pattern(r"(a|b)*c").is_ok());
        assert!(validate_pattern(r"((ab)+)*").is_err());
        assert!(validate_pattern(r"[").is_err());
    }
}
