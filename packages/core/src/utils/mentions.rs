//! Mention extraction from node content
//!
//! A mention is an internal reference of the form `nodespace://<node-id>`,
//! typically embedded in a markdown link such as
//! `[Meeting Notes](nodespace://abc-123)`. The mention graph is maintained
//! as a side effect of content writes: the service diffs the references in
//! the old and new content and applies `(added, removed)` to the
//! `node_mentions` table in the same transaction as the content write.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Matches `nodespace://<id>` internal references.
/// IDs are UUIDs or `YYYY-MM-DD` date ids; both are covered by this class.
static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"nodespace://([A-Za-z0-9][A-Za-z0-9_-]*)").unwrap());

/// Extract the set of mentioned node IDs from content, in first-seen order
/// with duplicates removed.
pub fn extract_mentions(content: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for cap in MENTION_RE.captures_iter(content) {
        let id = cap[1].to_string();
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }
    out
}

/// Diff two mention sets, returning `(added, removed)`
pub fn diff_mentions(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let old_set: BTreeSet<&str> = old.iter().map(String::as_str).collect();
    let new_set: BTreeSet<&str> = new.iter().map(String::as_str).collect();

    let added = new
        .iter()
        .filter(|id| !old_set.contains(id.as_str()))
        .cloned()
        .collect();
    let removed = old
        .iter()
        .filter(|id| !new_set.contains(id.as_str()))
        .cloned()
        .collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_single_mention() {
        let mentions = extract_mentions("See [notes](nodespace://abc-123) for details");
        assert_eq!(mentions, vec!["abc-123"]);
    }

    #[test]
    fn test_extracts_date_node_mention() {
        let mentions = extract_mentions("Logged on nodespace://2026-01-26 yesterday");
        assert_eq!(mentions, vec!["2026-01-26"]);
    }

    #[test]
    fn test_deduplicates_repeated_mentions() {
        let mentions =
            extract_mentions("nodespace://a nodespace://b nodespace://a");
        assert_eq!(mentions, vec!["a", "b"]);
    }

    #[test]
    fn test_no_mentions_in_plain_text() {
        assert!(extract_mentions("just some text with a http://link").is_empty());
    }

    #[test]
    fn test_diff_added_and_removed() {
        let old = vec!["a".to_string(), "b".to_string()];
        let new = vec!["b".to_string(), "c".to_string()];
        let (added, removed) = diff_mentions(&old, &new);
        assert_eq!(added, vec!["c"]);
        assert_eq!(removed, vec!["a"]);
    }

    #[test]
    fn test_diff_identical_sets_is_empty() {
        let ids = vec!["a".to_string()];
        let (added, removed) = diff_mentions(&ids, &ids);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
