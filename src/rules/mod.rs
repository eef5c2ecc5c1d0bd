//! Detection rules: server-defined `(package matcher, regex, speech template)`
//! triples, and the process-wide cache that serves them to extraction.
//!
//! Rule precedence is list order. The first active rule whose matcher hits the
//! package and whose pattern compiles is the one used; `CompiledRule::rank`
//! records that position so callers never depend on container order.
//!
//! The cache is swapped wholesale (`Arc` replacement under a write lock), so a
//! reader holding a snapshot never observes a half-updated rule set.

pub mod sync;

use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StoreError, SyncError};
use crate::store::session::Session;

/// Compiled program size cap for server-supplied patterns.
pub const PATTERN_SIZE_LIMIT: usize = 256 * 1024;
/// Lazy DFA cache cap per pattern.
pub const PATTERN_DFA_LIMIT: usize = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    #[serde(rename = "package_name")]
    pub source_matcher: String,
    #[serde(rename = "app_name")]
    pub display_name: String,
    #[serde(rename = "regex_pattern")]
    pub pattern: String,
    #[serde(rename = "tts_format")]
    pub speech_template: String,
    #[serde(
        rename = "is_active",
        default = "default_active",
        deserialize_with = "bool_or_int"
    )]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// The config backend is MySQL-backed and sometimes sends `1`/`0` for flags.
fn bool_or_int<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(de)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// Deterministic serialization of a rule list (field order is fixed by the struct).
pub fn canonical_json(rules: &[Rule]) -> Result<String, serde_json::Error> {
    serde_json::to_string(rules)
}

/// Hex sha256 of the canonical JSON.
pub fn fingerprint(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug)]
pub struct CompiledRule {
    pub rank: usize,
    pub rule: Rule,
    matcher: String,
    regex: OnceCell<Option<Regex>>,
}

impl CompiledRule {
    fn new(rank: usize, rule: Rule) -> Self {
        let matcher = rule.source_matcher.trim().to_lowercase();
        Self {
            rank,
            rule,
            matcher,
            regex: OnceCell::new(),
        }
    }

    /// Case-insensitive substring test against a package name.
    /// An empty matcher never matches.
    pub fn matches_package(&self, package_lc: &str) -> bool {
        self.rule.active && !self.matcher.is_empty() && package_lc.contains(&self.matcher)
    }

    /// Compiled pattern, built on first use. `None` means the pattern is
    /// invalid or over the size limits; the rule is then skipped.
    pub fn regex(&self) -> Option<&Regex> {
        self.regex
            .get_or_init(|| {
                match RegexBuilder::new(&self.rule.pattern)
                    .case_insensitive(true)
                    .size_limit(PATTERN_SIZE_LIMIT)
                    .dfa_size_limit(PATTERN_DFA_LIMIT)
                    .build()
                {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(
                            target: "rules",
                            rule_id = self.rule.id,
                            app = %self.rule.display_name,
                            error = %e,
                            "rule pattern rejected; rule skipped"
                        );
                        None
                    }
                }
            })
            .as_ref()
    }
}

/// Immutable view of one rule-set generation.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    rules: Vec<CompiledRule>,
    fingerprint: String,
    generation: u64,
}

impl RuleSnapshot {
    pub fn new(rules: Vec<Rule>, fingerprint: String, generation: u64) -> Self {
        Self {
            rules: rules
                .into_iter()
                .enumerate()
                .map(|(rank, r)| CompiledRule::new(rank, r))
                .collect(),
            fingerprint,
            generation,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Bumped on every cache write; unchanged when a sync is a no-op.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|c| &c.rule)
    }

    /// True if any active rule's matcher hits `package`. Cheap: no regex work.
    pub fn watches(&self, package: &str) -> bool {
        let lc = package.to_lowercase();
        self.rules.iter().any(|c| c.matches_package(&lc))
    }

    /// First rule (by rank) that matches `package` and has a usable pattern.
    pub fn select(&self, package: &str) -> Option<&CompiledRule> {
        let lc = package.to_lowercase();
        self.rules
            .iter()
            .filter(|c| c.matches_package(&lc))
            .find(|c| c.regex().is_some())
    }

    /// Display name for a package, falling back to the package itself.
    pub fn display_name_for<'a>(&'a self, package: &'a str) -> &'a str {
        let lc = package.to_lowercase();
        self.rules
            .iter()
            .find(|c| c.matches_package(&lc))
            .map(|c| c.rule.display_name.as_str())
            .unwrap_or(package)
    }
}

/// Process-wide, persisted last-known-good rule set.
#[derive(Debug)]
pub struct RuleCache {
    current: RwLock<Arc<RuleSnapshot>>,
    session: Session,
}

impl RuleCache {
    /// Restore from the session blob. A missing or unreadable blob yields an
    /// empty cache rather than an error.
    pub fn load(session: Session) -> Result<Self, StoreError> {
        let snapshot = match session.cached_rules()? {
            Some((json, fp)) => match serde_json::from_str::<Vec<Rule>>(&json) {
                Ok(rules) => RuleSnapshot::new(rules, fp, 0),
                Err(e) => {
                    tracing::warn!(target: "rules", error = %e, "cached rule set unreadable; starting empty");
                    RuleSnapshot::default()
                }
            },
            None => RuleSnapshot::default(),
        };
        tracing::info!(target: "rules", count = snapshot.len(), "rule cache loaded");
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            session,
        })
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        match self.current.read() {
            Ok(g) => Arc::clone(&g),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the rule set if its fingerprint differs from the persisted one.
    /// Persists first, then swaps; on a storage error the old set stays live.
    /// A live set whose persisted copy was cleared (sign-out) is written back
    /// without a swap. Returns whether a write happened.
    pub fn replace_if_changed(&self, rules: Vec<Rule>) -> Result<bool, SyncError> {
        let json = canonical_json(&rules)?;
        let fp = fingerprint(&json);

        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let persisted = self.session.cached_rules()?.map(|(_, p)| p);
        if persisted.as_deref() == Some(fp.as_str()) && guard.fingerprint == fp {
            return Ok(false);
        }
        self.session.save_rules(&json, &fp)?;
        if guard.fingerprint != fp {
            let generation = guard.generation + 1;
            *guard = Arc::new(RuleSnapshot::new(rules, fp, generation));
        }
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::Store;

    pub(crate) fn rule(id: i64, matcher: &str, pattern: &str) -> Rule {
        Rule {
            id,
            source_matcher: matcher.into(),
            display_name: format!("App {id}"),
            pattern: pattern.into(),
            speech_template: "Diterima {amount} rupiah dari {app_name}".into(),
            active: true,
        }
    }

    fn cache() -> RuleCache {
        RuleCache::load(Session::new(Arc::new(Store::open_in_memory().unwrap()))).unwrap()
    }

    #[test]
    fn wire_format_matches_config_api() {
        let json = r#"[{"id":3,"package_name":"id.dana","app_name":"DANA",
            "regex_pattern":"Rp\\s?([\\d.]+)","tts_format":"{amount}","is_active":1}]"#;
        let rules: Vec<Rule> = serde_json::from_str(json).unwrap();
        assert_eq!(rules[0].source_matcher, "id.dana");
        assert!(rules[0].active);
    }

    #[test]
    fn first_matching_rule_wins_and_bad_patterns_are_skipped() {
        let snap = RuleSnapshot::new(
            vec![
                rule(1, "dana", "([unclosed"),
                rule(2, "DANA", r"Rp\s?([\d.]+)"),
                rule(3, "id.dana", r"IDR\s?([\d.]+)"),
            ],
            "fp".into(),
            1,
        );
        let sel = snap.select("id.dana").unwrap();
        assert_eq!(sel.rule.id, 2);
        assert_eq!(sel.rank, 1);
    }

    #[test]
    fn inactive_and_empty_matchers_never_match() {
        let mut off = rule(1, "bca", r"(\d+)");
        off.active = false;
        let snap = RuleSnapshot::new(vec![off, rule(2, "  ", r"(\d+)")], "fp".into(), 1);
        assert!(!snap.watches("com.bca"));
        assert!(snap.select("anything").is_none());
    }

    #[test]
    fn oversized_pattern_is_rejected() {
        let snap = RuleSnapshot::new(vec![rule(1, "dana", r"(\w{1000})")], "fp".into(), 1);
        assert!(snap.select("id.dana").is_none());
    }

    #[test]
    fn identical_rule_set_is_not_rewritten() {
        let c = cache();
        let rules = vec![rule(1, "dana", r"Rp\s?([\d.]+)")];
        assert!(c.replace_if_changed(rules.clone()).unwrap());
        let gen = c.snapshot().generation();
        assert!(!c.replace_if_changed(rules).unwrap());
        assert_eq!(c.snapshot().generation(), gen);
    }

    #[test]
    fn cache_survives_reload_from_session() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let c = RuleCache::load(Session::new(store.clone())).unwrap();
        c.replace_if_changed(vec![rule(7, "gojek", r"Rp([\d.]+)")])
            .unwrap();
        let fp = c.snapshot().fingerprint().to_string();

        let again = RuleCache::load(Session::new(store)).unwrap();
        let snap = again.snapshot();
        assert_eq!(snap.fingerprint(), fp);
        assert_eq!(snap.rules().next().map(|r| r.id), Some(7));
    }

    #[test]
    fn cleared_session_copy_is_written_back() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let session = Session::new(store.clone());
        let c = RuleCache::load(session.clone()).unwrap();
        let rules = vec![rule(1, "dana", r"Rp\s?([\d.]+)")];
        assert!(c.replace_if_changed(rules.clone()).unwrap());
        let gen = c.snapshot().generation();

        session.logout().unwrap();
        assert!(c.replace_if_changed(rules.clone()).unwrap());
        assert_eq!(c.snapshot().generation(), gen);
        assert!(!c.replace_if_changed(rules).unwrap());

        let reloaded = RuleCache::load(Session::new(store)).unwrap();
        assert!(reloaded.snapshot().watches("id.dana"));
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = fingerprint("[]");
        assert_eq!(a.len(), 64);
        assert_eq!(a, fingerprint("[]"));
        assert_ne!(a, fingerprint("[ ]"));
    }
}
