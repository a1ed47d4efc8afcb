use crate::domain::bundle::Entry;
use crate::error::{BundleError, Result};
use aho_corasick::AhoCorasick;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use tracing::debug;

/// Dependencies between the entries of one Bundle.
///
/// Nodes are entry indices. Entry A depends on entry B when A's resource or
/// request url mentions B's `fullUrl`.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyGraph {
    dependencies: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Entries that must settle before `index` may be dispatched, ascending.
    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Processing order: dependencies first, input order among unrelated entries.
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

/// Builds the [`DependencyGraph`] of a Bundle and rejects cyclic ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceResolver;

impl ReferenceResolver {
    pub fn resolve(&self, entries: &[Entry]) -> Result<DependencyGraph> {
        let owners: Vec<(&str, usize)> = entries
            .iter()
            .filter_map(|entry| entry.full_url.as_deref().map(|url| (url, entry.index)))
            .filter(|(url, _)| !url.is_empty())
            .collect();
        let matcher = AhoCorasick::new(owners.iter().map(|(url, _)| *url)).map_err(|err| {
            BundleError::validation("entry.fullUrl", format!("cannot index fullUrls: {}", err))
        })?;

        let mut dependencies = vec![Vec::new(); entries.len()];
        let mut dependents = vec![Vec::new(); entries.len()];
        for entry in entries {
            let mut found = BTreeSet::new();
            scan_text(&matcher, &entry.request.url, &mut found);
            if let Some(resource) = &entry.resource {
                scan_value(&matcher, resource, &mut found);
            }

            let mut found: Vec<usize> = found
                .into_iter()
                .map(|pattern| owners[pattern].1)
                .filter(|owner| *owner != entry.index)
                .collect();
            found.sort_unstable();
            found.dedup();
            for dependency in &found {
                dependents[*dependency].push(entry.index);
            }
            dependencies[entry.index] = found;
        }

        let order = stable_topological_order(&dependencies, &dependents)?;
        debug!(entries = entries.len(), ?order, "Resolved processing order");

        Ok(DependencyGraph {
            dependencies,
            order,
        })
    }
}

/// Kahn's algorithm, always releasing the lowest ready index first so that
/// unrelated entries keep their input order.
fn stable_topological_order(
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>> {
    let mut pending: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| Reverse(index))
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for dependent in &dependents[index] {
            pending[*dependent] -= 1;
            if pending[*dependent] == 0 {
                ready.push(Reverse(*dependent));
            }
        }
    }

    if order.len() == dependencies.len() {
        Ok(order)
    } else {
        Err(BundleError::CyclicReference {
            indices: find_cycle(dependencies, &pending),
        })
    }
}

/// Walks unreleased dependencies from the lowest blocked entry until a node
/// repeats. Every blocked entry has at least one blocked dependency, so the
/// walk always closes a loop.
fn find_cycle(dependencies: &[Vec<usize>], pending: &[usize]) -> Vec<usize> {
    let blocked = |index: usize| pending[index] > 0;
    let Some(start) = (0..pending.len()).find(|i| blocked(*i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        let Some(next) = dependencies[current].iter().copied().find(|d| blocked(*d)) else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle = path.split_off(at);
            cycle.sort_unstable();
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

/// Records the pattern id of every whole-token fullUrl found in `text`.
fn scan_text(matcher: &AhoCorasick, text: &str, found: &mut BTreeSet<usize>) {
    for hit in matcher.find_overlapping_iter(text) {
        if is_whole_token(text, hit.start(), hit.end()) {
            found.insert(hit.pattern().as_usize());
        }
    }
}

fn scan_value(matcher: &AhoCorasick, value: &Value, found: &mut BTreeSet<usize>) {
    match value {
        Value::String(text) => scan_text(matcher, text, found),
        Value::Array(items) => items.iter().for_each(|item| scan_value(matcher, item, found)),
        Value::Object(fields) => fields
            .values()
            .for_each(|field| scan_value(matcher, field, found)),
        _ => {}
    }
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

/// True when `text[start..end]` is not part of a longer token
/// (so `urn:uuid:1` does not match inside `urn:uuid:10`).
fn is_whole_token(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(is_token_char) && !after.is_some_and(is_token_char)
}

/// Byte offsets of every whole-token occurrence of `reference` in `text`.
fn reference_positions(text: &str, reference: &str) -> Vec<usize> {
    if reference.is_empty() {
        return Vec::new();
    }
    text.match_indices(reference)
        .map(|(at, _)| at)
        .filter(|at| is_whole_token(text, *at, at + reference.len()))
        .collect()
}

/// Replaces every whole-token occurrence of `reference` in `text`.
pub(crate) fn replace_reference(text: &str, reference: &str, replacement: &str) -> String {
    let positions = reference_positions(text, reference);
    if positions.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for at in positions {
        out.push_str(&text[last..at]);
        out.push_str(replacement);
        last = at + reference.len();
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bundle::{EntryRequest, Method};
    use serde_json::json;

    fn entry(index: usize, full_url: &str, resource: Value) -> Entry {
        Entry {
            index,
            full_url: Some(full_url.to_string()),
            resource: Some(resource),
            request: EntryRequest {
                method: Method::Create,
                url: "Observation".to_string(),
            },
        }
    }

    #[test]
    fn test_independent_entries_keep_input_order() {
        let entries = vec![
            entry(0, "urn:uuid:a", json!({"resourceType": "Patient"})),
            entry(1, "urn:uuid:b", json!({"resourceType": "Patient"})),
            entry(2, "urn:uuid:c", json!({"resourceType": "Patient"})),
        ];
        let graph = ReferenceResolver.resolve(&entries).unwrap();
        assert_eq!(graph.order(), &[0, 1, 2]);
        assert!(graph.dependencies_of(1).is_empty());
    }

    #[test]
    fn test_forward_reference_moves_dependency_first() {
        let entries = vec![
            entry(
                0,
                "urn:uuid:obs",
                json!({"resourceType": "Observation", "subject": {"reference": "urn:uuid:pat"}}),
            ),
            entry(1, "urn:uuid:other", json!({"resourceType": "Patient"})),
            entry(2, "urn:uuid:pat", json!({"resourceType": "Patient"})),
        ];
        let graph = ReferenceResolver.resolve(&entries).unwrap();
        assert_eq!(graph.dependencies_of(0), &[2]);
        assert!(graph.dependencies_of(2).is_empty());
        assert_eq!(graph.order(), &[1, 2, 0]);
    }

    #[test]
    fn test_request_url_reference() {
        let mut delete = entry(1, "urn:uuid:del", json!({"resourceType": "Patient"}));
        delete.request = EntryRequest {
            method: Method::Delete,
            url: "urn:uuid:pat".to_string(),
        };
        let entries = vec![entry(0, "urn:uuid:pat", json!({"resourceType": "Patient"})), delete];
        let graph = ReferenceResolver.resolve(&entries).unwrap();
        assert_eq!(graph.dependencies_of(1), &[0]);
    }

    #[test]
    fn test_two_entry_cycle() {
        let entries = vec![
            entry(0, "urn:uuid:a", json!({"link": "urn:uuid:b"})),
            entry(1, "urn:uuid:b", json!({"link": "urn:uuid:a"})),
        ];
        let err = ReferenceResolver.resolve(&entries).unwrap_err();
        match err {
            BundleError::CyclicReference { indices } => assert_eq!(indices, vec![0, 1]),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_cycle_reports_only_cycle_members() {
        let entries = vec![
            entry(0, "urn:uuid:a", json!({"link": "urn:uuid:c"})),
            entry(1, "urn:uuid:b", json!({"link": ["urn:uuid:c"]})),
            entry(2, "urn:uuid:c", json!({"link": "urn:uuid:d"})),
            entry(3, "urn:uuid:d", json!({"nested": {"link": "urn:uuid:c"}})),
        ];
        let err = ReferenceResolver.resolve(&entries).unwrap_err();
        assert!(matches!(err, BundleError::CyclicReference { indices } if indices == vec![2, 3]));
    }

    #[test]
    fn test_self_reference_is_ignored() {
        let entries = vec![entry(0, "urn:uuid:a", json!({"self": "urn:uuid:a"}))];
        let graph = ReferenceResolver.resolve(&entries).unwrap();
        assert_eq!(graph.order(), &[0]);
    }

    #[test]
    fn test_reference_boundaries() {
        assert!(is_whole_token("urn:uuid:1", 0, 10));
        assert!(is_whole_token("see urn:uuid:1, then", 4, 14));
        assert!(!is_whole_token("urn:uuid:10", 0, 10));
        assert!(!is_whole_token("xurn:uuid:1", 1, 11));
        assert_eq!(
            replace_reference("urn:uuid:1 urn:uuid:10 urn:uuid:1", "urn:uuid:1", "Patient/9"),
            "Patient/9 urn:uuid:10 Patient/9"
        );
    }

    #[test]
    fn test_prefix_full_urls_are_told_apart() {
        let entries = vec![
            entry(0, "urn:uuid:1", json!({"resourceType": "Patient"})),
            entry(1, "urn:uuid:10", json!({"resourceType": "Patient"})),
            entry(2, "urn:uuid:2", json!({"subject": "urn:uuid:10"})),
            entry(3, "urn:uuid:3", json!({"a": "urn:uuid:1", "b": ["x urn:uuid:10"]})),
        ];
        let graph = ReferenceResolver.resolve(&entries).unwrap();
        assert_eq!(graph.dependencies_of(2), &[1]);
        assert_eq!(graph.dependencies_of(3), &[0, 1]);
    }

    #[test]
    fn test_long_reference_chain_resolves_quickly() {
        let count = 5_000;
        let entries: Vec<Entry> = (0..count)
            .map(|i| {
                let previous = if i == 0 { "none".to_string() } else { format!("urn:uuid:{}", i - 1) };
                entry(
                    i,
                    &format!("urn:uuid:{}", i),
                    json!({
                        "resourceType": "Observation",
                        "status": "final",
                        "code": {"text": format!("observation number {}", i)},
                        "subject": {"reference": previous},
                    }),
                )
            })
            .collect();

        let started = std::time::Instant::now();
        let graph = ReferenceResolver.resolve(&entries).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(graph.order(), (0..count).collect::<Vec<_>>().as_slice());
        assert_eq!(graph.dependencies_of(count - 1), &[count - 2]);
        assert!(
            elapsed < std::time::Duration::from_secs(5),
            "resolving {} entries took {:?}",
            count,
            elapsed
        );
    }
}
