// tests/extract_amounts.rs
//
// Extraction properties over generated inputs.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use virtual_soundbox::extract::{parse_amount, ExtractionEngine, InboundEvent};
use virtual_soundbox::rules::{Rule, RuleCache};
use virtual_soundbox::store::session::Session;
use virtual_soundbox::store::Store;

mod common;

fn engine(rules: Vec<Rule>) -> ExtractionEngine {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let cache = Arc::new(RuleCache::load(Session::new(store)).unwrap());
    cache.replace_if_changed(rules).unwrap();
    ExtractionEngine::new(cache)
}

fn group(n: u64, sep: &str) -> String {
    let digits = n.to_string();
    let mut out = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push_str(sep);
        }
        out.push(ch);
    }
    out
}

#[test]
fn thousands_separators_all_normalize_to_same_value() {
    assert_eq!(parse_amount("75.000"), Some(75000));
    assert_eq!(parse_amount("75,000"), Some(75000));
    assert_eq!(parse_amount("75000"), Some(75000));

    let mut rng = rand::rng();
    for _ in 0..500 {
        let n: u64 = rng.random_range(1..10_000_000_000);
        for sep in [".", ",", " ", ""] {
            assert_eq!(parse_amount(&group(n, sep)), Some(n), "{n} with '{sep}'");
        }
    }
}

#[test]
fn dana_notification_yields_75000() {
    let e = engine(vec![common::dana_rule()]);
    let ev = InboundEvent::from_notification(
        "id.dana",
        None,
        Some("Berhasil terima Rp 75.000 dari BUDI"),
        None,
        Utc::now(),
    );
    let x = e.extract(&ev).expect("amount extracted");
    assert_eq!(x.transaction.amount, 75000.0);
    assert!(!x.transaction.raw_message.is_empty());
    assert!(x.transaction.raw_message.chars().count() <= 100);
    assert!(!x.transaction.is_trial_limited);
}

#[test]
fn unmatched_packages_never_extract() {
    let e = engine(vec![common::dana_rule()]);
    let mut rng = rand::rng();
    let alphabet: Vec<char> = "abcefghijklmopqrstuvwxyz.".chars().collect();
    for _ in 0..300 {
        let len = rng.random_range(1..24);
        let pkg: String = (0..len)
            .map(|_| alphabet[rng.random_range(0..alphabet.len())])
            .collect();
        if pkg.to_lowercase().contains("dana") {
            continue;
        }
        let ev = InboundEvent::from_notification(&pkg, None, Some("Rp 10.000"), None, Utc::now());
        assert!(e.extract(&ev).is_none(), "package {pkg}");
    }
}

#[test]
fn bad_rule_does_not_disable_others() {
    let mut broken = common::dana_rule();
    broken.id = 9;
    broken.pattern = "Rp ([0-9".into();
    let mut bca = common::dana_rule();
    bca.id = 2;
    bca.source_matcher = "bca".into();
    let e = engine(vec![broken, bca]);

    let dana = InboundEvent::from_notification("id.dana", None, Some("Rp 1.000"), None, Utc::now());
    assert!(e.extract(&dana).is_none());
    let bca_ev = InboundEvent::from_notification("com.bca", None, Some("Rp 2.500"), None, Utc::now());
    assert_eq!(e.extract(&bca_ev).unwrap().transaction.amount, 2500.0);
}

#[test]
fn huge_text_is_bounded() {
    let e = engine(vec![common::dana_rule()]);
    let mut text = "x".repeat(100_000);
    text.push_str(" Rp 5.000");
    let ev = InboundEvent::from_notification("id.dana", None, Some(&text), None, Utc::now());
    // amount sits past the candidate cap
    assert!(e.extract(&ev).is_none());
}
