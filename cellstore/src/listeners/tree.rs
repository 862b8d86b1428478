use super::ListenerId;
use crate::types::Id;
use std::collections::HashMap;

/// Listener ids indexed by an id path in which any component may be a
/// wildcard. Every path stored in one tree has the same depth.
#[derive(Debug)]
pub(crate) enum ListenerTree {
    Leaf(Vec<ListenerId>),
    Branch {
        ids: HashMap<Id, ListenerTree>,
        wildcard: Option<Box<ListenerTree>>,
    },
}

impl ListenerTree {
    pub fn new(depth: usize) -> Self {
        if depth == 0 {
            ListenerTree::Leaf(Vec::new())
        } else {
            ListenerTree::Branch {
                ids: HashMap::new(),
                wildcard: None,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ListenerTree::Leaf(listeners) => listeners.is_empty(),
            ListenerTree::Branch { ids, wildcard } => ids.is_empty() && wildcard.is_none(),
        }
    }

    /// Store `listener` at the node reached by `path`. `None` descends into
    /// the wildcard branch.
    pub fn add(&mut self, path: &[Option<Id>], listener: ListenerId) {
        match self {
            ListenerTree::Leaf(listeners) => listeners.push(listener),
            ListenerTree::Branch { ids, wildcard } => {
                let Some((first, rest)) = path.split_first() else {
                    return;
                };
                let child = match first {
                    Some(id) => ids
                        .entry(id.clone())
                        .or_insert_with(|| ListenerTree::new(rest.len())),
                    None => wildcard
                        .get_or_insert_with(|| Box::new(ListenerTree::new(rest.len())))
                        .as_mut(),
                };
                child.add(rest, listener);
            }
        }
    }

    /// Remove `listener` from the node at exactly `path`, pruning branches
    /// left empty.
    pub fn remove(&mut self, path: &[Option<Id>], listener: ListenerId) {
        match self {
            ListenerTree::Leaf(listeners) => listeners.retain(|id| *id != listener),
            ListenerTree::Branch { ids, wildcard } => {
                let Some((first, rest)) = path.split_first() else {
                    return;
                };
                match first {
                    Some(id) => {
                        if let Some(child) = ids.get_mut(id) {
                            child.remove(rest, listener);
                            if child.is_empty() {
                                ids.remove(id);
                            }
                        }
                    }
                    None => {
                        if let Some(child) = wildcard {
                            child.remove(rest, listener);
                            if child.is_empty() {
                                *wildcard = None;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Append every listener whose stored path matches the concrete `path`.
    /// At each depth the concrete branch is visited before the wildcard one.
    /// A `None` component only matches wildcard registrations.
    pub fn collect(&self, path: &[Option<&str>], out: &mut Vec<ListenerId>) {
        match self {
            ListenerTree::Leaf(listeners) => out.extend_from_slice(listeners),
            ListenerTree::Branch { ids, wildcard } => {
                let Some((first, rest)) = path.split_first() else {
                    return;
                };
                if let Some(child) = first.and_then(|id| ids.get(id)) {
                    child.collect(rest, out);
                }
                if let Some(child) = wildcard {
                    child.collect(rest, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(ids: &[Option<&str>]) -> Vec<Option<Id>> {
        ids.iter().map(|id| id.map(str::to_string)).collect()
    }

    fn collected(tree: &ListenerTree, ids: &[Option<&str>]) -> Vec<u64> {
        let mut out = Vec::new();
        tree.collect(ids, &mut out);
        out.into_iter().map(|id| id.0).collect()
    }

    #[test]
    fn test_depth_zero_tree() {
        let mut tree = ListenerTree::new(0);
        tree.add(&[], ListenerId(3));
        tree.add(&[], ListenerId(1));
        assert_eq!(collected(&tree, &[]), vec![3, 1]);
    }

    #[test]
    fn test_wildcard_fan_out() {
        let mut tree = ListenerTree::new(3);
        tree.add(&path(&[Some("t"), Some("r"), Some("c")]), ListenerId(0));
        tree.add(&path(&[Some("t"), Some("r"), None]), ListenerId(1));
        tree.add(&path(&[Some("t"), None, Some("c")]), ListenerId(2));
        tree.add(&path(&[None, None, None]), ListenerId(3));
        tree.add(&path(&[Some("t"), Some("other"), None]), ListenerId(4));

        assert_eq!(collected(&tree, &[Some("t"), Some("r"), Some("c")]), vec![0, 1, 2, 3]);
        assert_eq!(collected(&tree, &[Some("t"), Some("r"), Some("d")]), vec![1, 3]);
        assert_eq!(collected(&tree, &[Some("u"), Some("r"), Some("c")]), vec![3]);
    }

    #[test]
    fn test_none_component_matches_only_wildcards() {
        let mut tree = ListenerTree::new(1);
        tree.add(&path(&[Some("v")]), ListenerId(0));
        tree.add(&path(&[None]), ListenerId(1));
        assert_eq!(collected(&tree, &[None]), vec![1]);
    }

    #[test]
    fn test_remove_prunes_empty_branches() {
        let mut tree = ListenerTree::new(2);
        let specific = path(&[Some("t"), Some("r")]);
        let wildcard = path(&[None, Some("r")]);
        tree.add(&specific, ListenerId(0));
        tree.add(&wildcard, ListenerId(1));

        tree.remove(&specific, ListenerId(0));
        assert_eq!(collected(&tree, &[Some("t"), Some("r")]), vec![1]);
        tree.remove(&wildcard, ListenerId(1));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_remove_only_touches_exact_path() {
        let mut tree = ListenerTree::new(1);
        tree.add(&path(&[Some("a")]), ListenerId(0));
        tree.remove(&path(&[None]), ListenerId(0));
        assert_eq!(collected(&tree, &[Some("a")]), vec![0]);
    }
}
