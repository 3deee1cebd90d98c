//! Multi-parent path resolution
//!
//! Remote entries form a DAG: an entry may have zero, one or several parent
//! folders. [`resolve_paths`] expands that graph upwards from one entry into
//! every absolute remote path the entry is reachable by.
//!
//! The walk is a breadth-first expansion over a frontier of partial paths.
//! Each frontier entry holds the names collected so far (child first) and the
//! id of the next ancestor to resolve:
//!
//! - an unknown ancestor anchors the partial path at the root, with a warning
//! - a parentless ancestor completes the path
//! - otherwise the entry fans out once per parent of the ancestor
//!
//! Every frontier entry also remembers the ids already on its chain. Reaching
//! one of them again means the parent graph has a cycle; the path is then
//! completed at that point and a warning is logged.

use std::collections::VecDeque;

use tracing::warn;

use super::newtypes::RemoteId;
use super::remote_file::RemoteFileRecord;

struct Frontier {
    names: Vec<String>,
    next_id: RemoteId,
    chain: Vec<RemoteId>,
}

/// Resolves every absolute remote path of `record`
///
/// `lookup` returns the cached record for an ancestor id, or `None` if the id
/// is unknown. Paths are returned in discovery order without duplicates.
pub fn resolve_paths<'a, F>(record: &RemoteFileRecord, mut lookup: F) -> Vec<String>
where
    F: FnMut(&RemoteId) -> Option<&'a RemoteFileRecord>,
{
    if record.parent_ids.is_empty() {
        return vec![render(std::slice::from_ref(&record.name))];
    }

    let mut frontier: VecDeque<Frontier> = record
        .parent_ids
        .iter()
        .map(|parent_id| Frontier {
            names: vec![record.name.clone()],
            next_id: parent_id.clone(),
            chain: vec![record.remote_id.clone()],
        })
        .collect();

    let mut paths = Vec::new();
    let mut push = |path: String| {
        if !paths.contains(&path) {
            paths.push(path);
        }
    };

    while let Some(entry) = frontier.pop_front() {
        if entry.chain.contains(&entry.next_id) {
            warn!(
                remote_id = %record.remote_id,
                ancestor = %entry.next_id,
                "Cycle in remote parent graph, anchoring path at root"
            );
            push(render(&entry.names));
            continue;
        }

        let Some(ancestor) = lookup(&entry.next_id) else {
            warn!(
                remote_id = %record.remote_id,
                parent_id = %entry.next_id,
                "Unknown parent, anchoring path at root"
            );
            push(render(&entry.names));
            continue;
        };

        let mut names = entry.names;
        names.push(ancestor.name.clone());

        if ancestor.parent_ids.is_empty() {
            push(render(&names));
            continue;
        }

        let mut chain = entry.chain;
        chain.push(entry.next_id);
        for parent_id in &ancestor.parent_ids {
            frontier.push_back(Frontier {
                names: names.clone(),
                next_id: parent_id.clone(),
                chain: chain.clone(),
            });
        }
    }

    paths
}

/// Renders child-first names as an absolute path
fn render(names: &[String]) -> String {
    let mut path = String::new();
    for name in names.iter().rev() {
        path.push('/');
        path.push_str(name);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn id(s: &str) -> RemoteId {
        RemoteId::new(s.to_string()).unwrap()
    }

    fn record(remote_id: &str, name: &str, parents: &[&str]) -> RemoteFileRecord {
        RemoteFileRecord::new(id(remote_id), name).with_parents(parents.iter().map(|p| id(p)).collect())
    }

    fn graph(records: &[RemoteFileRecord]) -> HashMap<RemoteId, RemoteFileRecord> {
        records
            .iter()
            .map(|r| (r.remote_id.clone(), r.clone()))
            .collect()
    }

    #[test]
    fn test_no_parents() {
        let file = record("f1", "file1", &[]);
        let known = graph(&[]);
        assert_eq!(resolve_paths(&file, |id| known.get(id)), vec!["/file1"]);
    }

    #[test]
    fn test_unknown_parent_is_anchored_at_root() {
        let file = record("f1", "file1", &["missing"]);
        let known = graph(&[]);
        assert_eq!(resolve_paths(&file, |id| known.get(id)), vec!["/file1"]);
    }

    #[test]
    fn test_single_chain() {
        let file = record("f1", "file1", &["p"]);
        let known = graph(&[record("p", "parent", &[])]);
        assert_eq!(resolve_paths(&file, |id| known.get(id)), vec!["/parent/file1"]);
    }

    #[test]
    fn test_unknown_grandparent() {
        let file = record("f1", "file1", &["p"]);
        let known = graph(&[record("p", "parent", &["gp"])]);
        assert_eq!(resolve_paths(&file, |id| known.get(id)), vec!["/parent/file1"]);
    }

    #[test]
    fn test_multi_parent_fan_out() {
        let file = record("f1", "file1", &["p1", "p2"]);
        let known = graph(&[record("p1", "parent1", &[]), record("p2", "parent2", &[])]);
        let mut paths = resolve_paths(&file, |id| known.get(id));
        paths.sort();
        assert_eq!(paths, vec!["/parent1/file1", "/parent2/file1"]);
    }

    #[test]
    fn test_deep_diamond() {
        // a under b and c, both under root folder r
        let file = record("f1", "file1", &["a"]);
        let known = graph(&[
            record("a", "A", &["b", "c"]),
            record("b", "B", &["r"]),
            record("c", "C", &["r"]),
            record("r", "Root", &[]),
        ]);
        let mut paths = resolve_paths(&file, |id| known.get(id));
        paths.sort();
        assert_eq!(paths, vec!["/Root/B/A/file1", "/Root/C/A/file1"]);
    }

    #[test]
    fn test_duplicate_paths_collapsed() {
        let file = record("f1", "file1", &["p", "p"]);
        let known = graph(&[record("p", "parent", &[])]);
        assert_eq!(resolve_paths(&file, |id| known.get(id)), vec!["/parent/file1"]);
    }

    #[test]
    fn test_cycle_terminates() {
        let file = record("f1", "file1", &["a"]);
        let known = graph(&[record("a", "A", &["b"]), record("b", "B", &["a"])]);
        assert_eq!(resolve_paths(&file, |id| known.get(id)), vec!["/B/A/file1"]);
    }

    #[test]
    fn test_self_parent_terminates() {
        let file = record("f1", "file1", &["f1"]);
        let known = graph(&[]);
        assert_eq!(resolve_paths(&file, |id| known.get(id)), vec!["/file1"]);
    }
}
