//! Volume selection as seen by the drivers

use std::collections::BTreeMap;

use bivac::core::filters::{FilterDecision, Filters, RejectReason};

fn no_labels() -> BTreeMap<String, String> {
    BTreeMap::new()
}

fn reject(reason: RejectReason, source: &'static str) -> FilterDecision {
    FilterDecision::Reject { reason, source }
}

#[test]
fn test_anonymous_volumes_are_unnamed() {
    let filters = Filters::default();
    let anonymous = "a".repeat(64);
    assert_eq!(
        filters.check(&anonymous, &no_labels()),
        reject(RejectReason::Unnamed, "")
    );
    assert_eq!(filters.check("", &no_labels()), reject(RejectReason::Unnamed, ""));
    assert!(filters.check(&"a".repeat(63), &no_labels()).is_accepted());
}

#[test]
fn test_whitelist_wins_over_blacklist() {
    let filters = Filters::new(
        vec!["bar".to_string(), "foo".to_string()],
        vec!["foo".to_string()],
    );
    assert!(filters.check("foo", &no_labels()).is_accepted());
    assert_eq!(
        filters.check("baz", &no_labels()),
        reject(RejectReason::Blacklisted, "whitelist config")
    );
}

#[test]
fn test_cache_volumes_skipped() {
    let filters = Filters::new(vec![], vec!["foo".to_string()]);
    for name in ["restic_cache", "duplicity-cache", "foo"] {
        assert_eq!(
            filters.check(name, &no_labels()),
            reject(RejectReason::Blacklisted, "blacklist config")
        );
    }
    assert!(filters.check("bar", &no_labels()).is_accepted());
}

#[test]
fn test_decisions_are_deterministic() {
    let a = Filters::new(
        vec!["b".into(), "a".into(), "a".into()],
        vec![" c ".into()],
    );
    let b = Filters::new(vec!["a".into(), "b".into()], vec!["c".into()]);
    assert_eq!(a.whitelist(), b.whitelist());
    assert_eq!(a.blacklist(), b.blacklist());

    for name in ["a", "b", "c", "d", "lost+found", "x/y"] {
        assert_eq!(a.check(name, &no_labels()), b.check(name, &no_labels()));
    }
}
