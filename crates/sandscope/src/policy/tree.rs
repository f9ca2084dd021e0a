//! Frozen scope trie and policy resolution.

use std::fmt::Write as _;

use super::bits::PolicyBits;
use super::path::{self, PathCase, PathError};

/// Index of a node in the tree arena.
pub(crate) type NodeId = u32;

/// Index of the root node.
pub(crate) const ROOT: NodeId = 0;

/// One path-component level of the scope tree.
#[derive(Debug, Clone)]
pub struct ScopeNode {
    pub(super) name: Box<str>,
    pub(super) mask: PolicyBits,
    pub(super) policy: PolicyBits,
    pub(super) explicit: bool,
    pub(super) exact_only: bool,
    /// Sorted by lookup key.
    pub(super) children: Vec<(Box<str>, NodeId)>,
}

impl ScopeNode {
    /// A pass-through node that leaves the inherited policy untouched.
    pub(super) fn routing(name: &str) -> Self {
        Self {
            name: name.into(),
            mask: PolicyBits::MASK_NONE,
            policy: PolicyBits::empty(),
            explicit: false,
            exact_only: false,
            children: Vec::new(),
        }
    }

    /// The component as first written in the manifest.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bits kept from the inherited value.
    pub fn mask(&self) -> PolicyBits {
        self.mask
    }

    /// Bits added on top of the masked inherited value.
    pub fn policy(&self) -> PolicyBits {
        self.policy
    }

    /// Whether a directive was applied here.
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// Whether the rule only applies to queries ending exactly here.
    pub fn is_exact_only(&self) -> bool {
        self.exact_only
    }

    /// Whether deeper queries inherit this node's rule.
    fn shapes_cone(&self) -> bool {
        self.explicit && !self.exact_only
    }

    fn apply(&self, inherited: PolicyBits) -> PolicyBits {
        PolicyBits::combine(inherited, self.mask, self.policy)
    }
}

/// Resumable position of a policy search.
///
/// Resolving `suffix` from the cursor of `prefix` is equivalent to resolving
/// `prefix/suffix` from the root, without walking `prefix` again. Once a
/// search ran off the bottom of the tree the cursor is truncated and every
/// further search from it yields the same cone policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeCursor {
    node: NodeId,
    level: u16,
    cone: PolicyBits,
    cone_depth: u16,
    truncated: bool,
}

impl ScopeCursor {
    /// Number of path components consumed in the tree.
    pub fn level(&self) -> u16 {
        self.level
    }

    /// Whether the search ran off the bottom of the tree.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Outcome of resolving one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Effective policy for the queried path.
    pub policy: PolicyBits,
    /// Policy inherited by paths below the queried one.
    pub cone: PolicyBits,
    /// Depth of the deepest rule that contributed (root is 0).
    pub matched_depth: u16,
    /// Whether the walk ended before consuming the whole path.
    pub truncated: bool,
    /// Cursor for resuming the search below this path.
    pub cursor: ScopeCursor,
}

/// Immutable trie of scope rules keyed by path component.
///
/// Built once by [`ManifestBuilder`](super::ManifestBuilder) and shared
/// read-only afterwards; there is no API to mutate a built tree, so
/// concurrent resolution needs no locking.
#[derive(Debug, Clone)]
pub struct PathScopeTree {
    pub(super) nodes: Vec<ScopeNode>,
    pub(super) case: PathCase,
}

impl PathScopeTree {
    /// Component comparison used by this tree.
    pub fn case(&self) -> PathCase {
        self.case
    }

    /// Total number of nodes, including routing nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes carrying an explicit rule.
    pub fn explicit_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.explicit).count()
    }

    /// The root node.
    pub fn root(&self) -> &ScopeNode {
        &self.nodes[ROOT as usize]
    }

    fn node(&self, id: NodeId) -> &ScopeNode {
        &self.nodes[id as usize]
    }

    fn child(&self, id: NodeId, component: &str) -> Option<NodeId> {
        let key = self.case.key(component);
        let children = &self.node(id).children;
        children
            .binary_search_by(|(k, _)| k.as_ref().cmp(key.as_ref()))
            .ok()
            .map(|pos| children[pos].1)
    }

    /// Cursor positioned at the root, before any component.
    pub fn root_cursor(&self) -> ScopeCursor {
        let root = self.root();
        let cone = if root.shapes_cone() {
            root.apply(PolicyBits::empty())
        } else {
            PolicyBits::empty()
        };
        ScopeCursor {
            node: ROOT,
            level: 0,
            cone,
            cone_depth: 0,
            truncated: false,
        }
    }

    /// Resolve an absolute path string.
    pub fn resolve(&self, path: &str) -> Result<Resolution, PathError> {
        let components = path::split(path)?;
        Ok(self.walk(&self.root_cursor(), components, |_, _| {}))
    }

    /// Resolve an already split path.
    pub fn resolve_components<S: AsRef<str>>(&self, components: &[S]) -> Resolution {
        self.resolve_from(&self.root_cursor(), components)
    }

    /// Resume a search from `cursor` with further path components.
    pub fn resolve_from<S: AsRef<str>>(&self, cursor: &ScopeCursor, suffix: &[S]) -> Resolution {
        self.walk(cursor, suffix, |_, _| {})
    }

    /// Shallowest depth from which every contributing rule on the walk to
    /// `components` kept all of `bits` set.
    ///
    /// Returns `None` when the effective policy lacks `bits`.
    pub fn lowest_consecutive_depth<S: AsRef<str>>(
        &self,
        components: &[S],
        bits: PolicyBits,
    ) -> Option<u16> {
        let start = self.root_cursor();
        let mut chain: Vec<(u16, PolicyBits)> = Vec::new();
        if self.root().shapes_cone() {
            chain.push((0, start.cone));
        }
        let resolution = self.walk(&start, components, |depth, effective| {
            chain.push((depth, effective));
        });
        if !resolution.policy.contains(bits) {
            return None;
        }

        let mut lowest = None;
        for (depth, effective) in chain.iter().rev() {
            if !effective.contains(bits) {
                break;
            }
            lowest = Some(*depth);
        }
        lowest
    }

    /// Core walk. `visit` sees `(depth, effective)` for every rule applied
    /// below the cursor, in root-to-leaf order.
    fn walk<I, F>(&self, cursor: &ScopeCursor, suffix: I, mut visit: F) -> Resolution
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: FnMut(u16, PolicyBits),
    {
        let mut node = cursor.node;
        let mut level = cursor.level;
        let mut cone = cursor.cone;
        let mut cone_depth = cursor.cone_depth;
        let mut truncated = cursor.truncated;

        if !truncated {
            for component in suffix {
                let Some(child) = self.child(node, component.as_ref()) else {
                    truncated = true;
                    break;
                };
                node = child;
                level = level.saturating_add(1);

                let current = self.node(node);
                if current.shapes_cone() {
                    cone = current.apply(cone);
                    cone_depth = level;
                    visit(level, cone);
                }
            }
        }

        let terminal = self.node(node);
        let (policy, matched_depth) = if !truncated && terminal.explicit && terminal.exact_only {
            let exact = terminal.apply(cone);
            visit(level, exact);
            (exact, level)
        } else {
            (cone, cone_depth)
        };

        Resolution {
            policy,
            cone,
            matched_depth,
            truncated,
            cursor: ScopeCursor {
                node,
                level,
                cone,
                cone_depth,
                truncated,
            },
        }
    }

    /// Render the tree for debugging, one node per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut stack: Vec<(NodeId, usize)> = vec![(ROOT, 0)];
        while let Some((id, indent)) = stack.pop() {
            let node = self.node(id);
            let name = if id == ROOT { "<root>" } else { node.name() };
            let _ = write!(out, "{:width$}{}", "", name, width = indent * 2);
            if node.explicit {
                let _ = write!(
                    out,
                    " [{}] mask={:#010x} policy={:#010x}",
                    if node.exact_only { "exact" } else { "scope" },
                    node.mask.bits(),
                    node.policy.bits()
                );
            }
            out.push('\n');
            for (_, child) in node.children.iter().rev() {
                stack.push((*child, indent + 1));
            }
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::policy::{Directive, DirectiveKind, ManifestBuilder, build_manifest};

    fn builder() -> ManifestBuilder {
        ManifestBuilder::with_case(PathCase::Sensitive)
    }

    // ==================== Override Tests ====================

    #[test]
    fn test_deeper_scope_vetoes_ancestor_grant() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_ALL, PolicyBits::empty())
            .add_scope("/a", PolicyBits::MASK_ALL, PolicyBits::ALLOW_ALL)
            .add_scope("/a/b", PolicyBits::MASK_ALL, PolicyBits::DENY)
            .build()
            .unwrap();

        let denied = tree.resolve("/a/b/c").unwrap();
        assert_eq!(denied.policy, PolicyBits::DENY);
        assert!(!denied.policy.covers(PolicyBits::ALLOW_READ));
        assert_eq!(denied.matched_depth, 2);
        assert!(denied.truncated);

        let allowed = tree.resolve("/a/x").unwrap();
        assert_eq!(allowed.policy, PolicyBits::ALLOW_ALL);
        assert_eq!(allowed.matched_depth, 1);
    }

    #[test]
    fn test_exact_rule_does_not_leak_to_siblings() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_ALL, PolicyBits::empty())
            .add_scope("/root", PolicyBits::MASK_ALL, PolicyBits::ALLOW_ALL)
            .add_path("/root/tool.exe", PolicyBits::MASK_ALL, PolicyBits::ALLOW_READ)
            .build()
            .unwrap();

        let exact = tree.resolve("/root/tool.exe").unwrap();
        assert_eq!(exact.policy, PolicyBits::ALLOW_READ);
        assert_eq!(exact.cone, PolicyBits::ALLOW_ALL);
        assert_eq!(exact.matched_depth, 2);

        assert_eq!(
            tree.resolve("/root/other.txt").unwrap().policy,
            PolicyBits::ALLOW_ALL
        );
    }

    #[test]
    fn test_inheriting_mask_keeps_parent_bits() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_ALL, PolicyBits::empty())
            .add_scope("/a", PolicyBits::MASK_ALL, PolicyBits::ALLOW_READ)
            .add_scope("/a/b", PolicyBits::MASK_NONE, PolicyBits::ALLOW_WRITE)
            .add_scope("/a/c", PolicyBits::MASK_ALL, PolicyBits::ALLOW_WRITE)
            .build()
            .unwrap();

        assert_eq!(
            tree.resolve("/a/b/x").unwrap().policy,
            PolicyBits::ALLOW_READ | PolicyBits::ALLOW_WRITE
        );
        assert_eq!(tree.resolve("/a/c/x").unwrap().policy, PolicyBits::ALLOW_WRITE);
    }

    #[test]
    fn test_exact_rule_is_a_leaf_for_deeper_queries() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_NONE, PolicyBits::ALLOW_READ)
            .add_path("/pkg", PolicyBits::empty(), PolicyBits::DENY)
            .add_scope("/pkg/lib", PolicyBits::MASK_NONE, PolicyBits::ALLOW_WRITE)
            .build()
            .unwrap();

        assert_eq!(tree.resolve("/pkg").unwrap().policy, PolicyBits::DENY);
        // Deeper queries skip the exact rule but still see rules below it.
        assert_eq!(tree.resolve("/pkg/readme").unwrap().policy, PolicyBits::ALLOW_READ);
        assert_eq!(
            tree.resolve("/pkg/lib/a.so").unwrap().policy,
            PolicyBits::ALLOW_READ | PolicyBits::ALLOW_WRITE
        );
    }

    #[test]
    fn test_exact_root_rule() {
        let tree = builder()
            .add_path("/", PolicyBits::MASK_NONE, PolicyBits::ALLOW_ENUMERATE)
            .build()
            .unwrap();
        assert_eq!(tree.resolve("/").unwrap().policy, PolicyBits::ALLOW_ENUMERATE);
        assert_eq!(tree.resolve("/etc").unwrap().policy, PolicyBits::empty());
    }

    #[test]
    fn test_routing_node_at_end_of_path() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_NONE, PolicyBits::ALLOW_READ)
            .add_scope("/a/b", PolicyBits::empty(), PolicyBits::empty())
            .build()
            .unwrap();
        let resolution = tree.resolve("/a").unwrap();
        assert_eq!(resolution.policy, PolicyBits::ALLOW_READ);
        assert!(!resolution.truncated);
        assert_eq!(resolution.matched_depth, 0);
    }

    // ==================== Cursor Tests ====================

    #[test]
    fn test_resume_matches_full_search() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_NONE, PolicyBits::empty())
            .add_scope("/ws", PolicyBits::MASK_NONE, PolicyBits::ALLOW_READ)
            .add_scope("/ws/out", PolicyBits::MASK_NONE, PolicyBits::ALLOW_WRITE)
            .add_path("/ws/out/obj", PolicyBits::empty(), PolicyBits::DENY)
            .build()
            .unwrap();

        let prefix = tree.resolve("/ws").unwrap();
        let suffixes: [&[&str]; 5] = [&["out"], &["out", "obj"], &["out", "obj", "x"], &["src"], &[]];
        for suffix in suffixes {
            let mut full = vec!["ws"];
            full.extend_from_slice(suffix);
            assert_eq!(
                tree.resolve_from(&prefix.cursor, suffix),
                tree.resolve_components(&full),
                "suffix {suffix:?}"
            );
        }
    }

    #[test]
    fn test_truncated_cursor_stays_truncated() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_NONE, PolicyBits::ALLOW_READ)
            .add_scope("/a/x", PolicyBits::MASK_NONE, PolicyBits::ALLOW_WRITE)
            .build()
            .unwrap();

        let first = tree.resolve("/a/missing").unwrap();
        assert!(first.cursor.is_truncated());
        // A real child named "x" exists under /a but must not be matched.
        let resumed = tree.resolve_from(&first.cursor, &["x"]);
        assert!(resumed.truncated);
        assert_eq!(resumed.policy, PolicyBits::ALLOW_READ);
        assert_eq!(resumed.cursor.level(), 1);
    }

    // ==================== Diagnostics Tests ====================

    #[test]
    fn test_lowest_consecutive_depth() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_NONE, PolicyBits::REPORT_ACCESS)
            .add_scope("/a", PolicyBits::empty(), PolicyBits::ALLOW_READ)
            .add_scope("/a/b", PolicyBits::MASK_NONE, PolicyBits::REPORT_ACCESS)
            .add_scope("/a/b/c", PolicyBits::MASK_NONE, PolicyBits::ALLOW_WRITE)
            .build()
            .unwrap();

        // REPORT_ACCESS was cleared at /a and set again at /a/b.
        assert_eq!(
            tree.lowest_consecutive_depth(&["a", "b", "c", "d"], PolicyBits::REPORT_ACCESS),
            Some(2)
        );
        assert_eq!(
            tree.lowest_consecutive_depth(&["a", "b"], PolicyBits::ALLOW_READ),
            Some(1)
        );
        assert_eq!(tree.lowest_consecutive_depth(&["a"], PolicyBits::REPORT_ACCESS), None);
        assert_eq!(
            tree.lowest_consecutive_depth(&["z"], PolicyBits::REPORT_ACCESS),
            Some(0)
        );
    }

    #[test]
    fn test_dump_lists_rules() {
        let tree = builder()
            .add_scope("/", PolicyBits::MASK_NONE, PolicyBits::empty())
            .add_path("/bin/cc", PolicyBits::MASK_NONE, PolicyBits::ALLOW_READ)
            .build()
            .unwrap();
        let dump = tree.dump();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("<root> [scope]"));
        assert_eq!(lines[1], "  bin");
        assert!(lines[2].starts_with("    cc [exact]"));
    }

    #[test]
    fn test_tree_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PathScopeTree>();
    }

    // ==================== Reference Walker Property ====================

    /// Resolves by scanning the directive list instead of walking the tree.
    ///
    /// For each prefix of the query the last directive naming that prefix
    /// wins; exact directives only count for the full query.
    fn reference_resolve(directives: &[Directive], query: &[String]) -> PolicyBits {
        let rule_for = |prefix: &[String]| {
            directives.iter().rev().find(|d| {
                let parts: Vec<&str> = d.path.split('/').filter(|s| !s.is_empty()).collect();
                parts == prefix.iter().map(String::as_str).collect::<Vec<_>>()
            })
        };

        let mut effective = PolicyBits::empty();
        for len in 0..=query.len() {
            if let Some(rule) = rule_for(&query[..len]) {
                let exact = rule.kind == DirectiveKind::Exact;
                if !exact || len == query.len() {
                    effective = PolicyBits::combine(effective, rule.mask, rule.policy);
                }
            }
        }
        effective
    }

    fn bits_strategy() -> impl Strategy<Value = PolicyBits> {
        (0u32..256).prop_map(PolicyBits::from_bits_retain)
    }

    fn path_strategy() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c"]), 0..4)
            .prop_map(|parts| parts.into_iter().map(String::from).collect())
    }

    fn directive_strategy() -> impl Strategy<Value = Directive> {
        (path_strategy(), bits_strategy(), bits_strategy(), any::<bool>()).prop_map(
            |(parts, mask, policy, exact)| Directive {
                path: format!("/{}", parts.join("/")),
                mask,
                policy,
                kind: if exact {
                    DirectiveKind::Exact
                } else {
                    DirectiveKind::Scope
                },
            },
        )
    }

    proptest! {
        #[test]
        fn prop_resolve_matches_reference_walker(
            root in (bits_strategy(), bits_strategy()),
            rest in prop::collection::vec(directive_strategy(), 0..12),
            query in path_strategy(),
        ) {
            let mut directives = vec![Directive::scope("/", root.0, root.1)];
            directives.extend(rest);
            let tree = build_manifest(&directives, PathCase::Sensitive).unwrap();

            let resolved = tree.resolve_components(&query).policy;
            prop_assert_eq!(resolved, reference_resolve(&directives, &query));

            // The string form walks the borrowed component iterator.
            let text = format!("/{}", query.join("\\"));
            prop_assert_eq!(tree.resolve(&text).unwrap(), tree.resolve_components(&query));
        }

        #[test]
        fn prop_resume_matches_full_search(
            rest in prop::collection::vec(directive_strategy(), 0..12),
            prefix in path_strategy(),
            suffix in path_strategy(),
        ) {
            let mut directives = vec![Directive::scope("/", PolicyBits::MASK_NONE, PolicyBits::ALLOW_READ)];
            directives.extend(rest);
            let tree = build_manifest(&directives, PathCase::Sensitive).unwrap();

            let head = tree.resolve_components(&prefix);
            let mut full = prefix.clone();
            full.extend(suffix.iter().cloned());
            prop_assert_eq!(
                tree.resolve_from(&head.cursor, &suffix).policy,
                tree.resolve_components(&full).policy
            );
        }
    }
}
