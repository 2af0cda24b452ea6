//! Path-pattern trie used to register lock providers against path subtrees.
//!
//! Patterns are sequences of literal segment tokens and/or the reserved
//! wildcard token `*`, which matches exactly one segment. Lookup walks the
//! path resolving exact children before wildcard children at each depth; an
//! exact match always wins over a wildcard at the same depth, with
//! backtracking when the exact branch dead-ends deeper down.

use std::collections::HashMap;

/// Reserved pattern token matching any single path segment.
pub const WILDCARD: &str = "*";

struct Node<T> {
    children: HashMap<String, Node<T>>,
    wildcard: Option<Box<Node<T>>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            wildcard: None,
            value: None,
        }
    }
}

/// A trie mapping path patterns to values.
pub struct PathTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for PathTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PathTrie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a value under a pattern, replacing and returning any value
    /// previously registered under the same pattern.
    pub fn insert<S: AsRef<str>>(&mut self, pattern: &[S], value: T) -> Option<T> {
        let mut node = &mut self.root;
        for token in pattern {
            let token = token.as_ref();
            node = if token == WILDCARD {
                node.wildcard.get_or_insert_with(|| Box::new(Node::new()))
            } else {
                node.children
                    .entry(token.to_string())
                    .or_insert_with(Node::new)
            };
        }
        let previous = node.value.replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Resolve the value registered for a concrete path.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Option<&T> {
        Self::lookup(&self.root, path)
    }

    /// Resolve a mutable reference to the value registered for a path.
    pub fn get_mut<S: AsRef<str>>(&mut self, path: &[S]) -> Option<&mut T> {
        Self::lookup_mut(&mut self.root, path)
    }

    /// Visit every registered value mutably.
    pub fn for_each_mut(&mut self, f: &mut impl FnMut(&mut T)) {
        Self::visit_mut(&mut self.root, f);
    }

    fn lookup<'a, S: AsRef<str>>(node: &'a Node<T>, path: &[S]) -> Option<&'a T> {
        let Some((head, rest)) = path.split_first() else {
            return node.value.as_ref();
        };
        if let Some(child) = node.children.get(head.as_ref())
            && let Some(value) = Self::lookup(child, rest)
        {
            return Some(value);
        }
        node.wildcard
            .as_deref()
            .and_then(|child| Self::lookup(child, rest))
    }

    fn lookup_mut<'a, S: AsRef<str>>(node: &'a mut Node<T>, path: &[S]) -> Option<&'a mut T> {
        let Some((head, rest)) = path.split_first() else {
            return node.value.as_mut();
        };
        // Resolve the branch immutably first so the exact child can win
        // without holding two mutable borrows.
        let take_exact = node
            .children
            .get(head.as_ref())
            .is_some_and(|child| Self::lookup(child, rest).is_some());
        if take_exact {
            return node
                .children
                .get_mut(head.as_ref())
                .and_then(|child| Self::lookup_mut(child, rest));
        }
        node.wildcard
            .as_deref_mut()
            .and_then(|child| Self::lookup_mut(child, rest))
    }

    fn visit_mut(node: &mut Node<T>, f: &mut impl FnMut(&mut T)) {
        if let Some(value) = node.value.as_mut() {
            f(value);
        }
        for child in node.children.values_mut() {
            Self::visit_mut(child, f);
        }
        if let Some(child) = node.wildcard.as_deref_mut() {
            Self::visit_mut(child, f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let mut trie = PathTrie::new();
        trie.insert(&["meta", "rows"], 1);
        trie.insert(&["blocks"], 2);

        assert_eq!(trie.get(&["meta", "rows"]), Some(&1));
        assert_eq!(trie.get(&["blocks"]), Some(&2));
        assert_eq!(trie.get(&["meta"]), None);
        assert_eq!(trie.get(&["meta", "rows", "extra"]), None);
    }

    #[test]
    fn test_wildcard_matches_any_single_segment() {
        let mut trie = PathTrie::new();
        trie.insert(&["volumes", "*"], 7);

        assert_eq!(trie.get(&["volumes", "v1"]), Some(&7));
        assert_eq!(trie.get(&["volumes", "v2"]), Some(&7));
        assert_eq!(trie.get(&["volumes"]), None);
        assert_eq!(trie.get(&["volumes", "v1", "part"]), None);
    }

    #[test]
    fn test_exact_wins_over_wildcard_at_same_depth() {
        let mut trie = PathTrie::new();
        trie.insert(&["obj", "*"], "wild");
        trie.insert(&["obj", "special"], "exact");

        assert_eq!(trie.get(&["obj", "special"]), Some(&"exact"));
        assert_eq!(trie.get(&["obj", "other"]), Some(&"wild"));
    }

    #[test]
    fn test_backtracks_to_wildcard_when_exact_branch_dead_ends() {
        let mut trie = PathTrie::new();
        trie.insert(&["a", "*", "c"], 1);
        trie.insert(&["a", "b"], 2);

        // "a/b" exists as an exact branch but has no "/c" child; the
        // wildcard branch does.
        assert_eq!(trie.get(&["a", "b", "c"]), Some(&1));
        assert_eq!(trie.get(&["a", "b"]), Some(&2));
    }

    #[test]
    fn test_insert_replaces_existing_pattern() {
        let mut trie = PathTrie::new();
        assert_eq!(trie.insert(&["x"], 1), None);
        assert_eq!(trie.insert(&["x"], 2), Some(1));
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.get(&["x"]), Some(&2));
    }

    #[test]
    fn test_root_pattern() {
        let mut trie = PathTrie::new();
        trie.insert::<&str>(&[], 0);
        assert_eq!(trie.get::<&str>(&[]), Some(&0));
    }

    #[test]
    fn test_get_mut_and_for_each_mut() {
        let mut trie = PathTrie::new();
        trie.insert(&["a"], 1);
        trie.insert(&["b", "*"], 2);

        if let Some(v) = trie.get_mut(&["b", "anything"]) {
            *v = 20;
        }
        assert_eq!(trie.get(&["b", "x"]), Some(&20));

        let mut sum = 0;
        trie.for_each_mut(&mut |v| sum += *v);
        assert_eq!(sum, 21);
    }
}
