//! Path-scoped access policy.
//!
//! A manifest is an ordered list of directives, each binding a pair of
//! `(mask, policy)` bit sets to a path. Directives are accumulated by a
//! [`ManifestBuilder`] into a [`PathScopeTree`], which is then frozen and
//! shared read-only with every thread that arbitrates accesses.
//!
//! ## Resolution
//!
//! The effective policy of a path is computed root to leaf:
//!
//! ```text
//! effective(node) = (effective(parent) & node.mask) | node.policy
//! ```
//!
//! [`PolicyBits::MASK_ALL`] clears everything inherited so the node's policy
//! replaces it, while [`PolicyBits::MASK_NONE`] keeps it all. Nodes that exist
//! only to route to deeper rules use `mask = MASK_NONE` and `policy = 0`, so
//! they never change what is inherited. When the walk runs
//! out of tree the last effective value applies to the rest of the path.
//!
//! A deeper scope can therefore veto a broader grant (clear bits through its
//! mask, or set [`PolicyBits::DENY`]) and add bits of its own, but it never
//! widens access beyond what its own policy adds.
//!
//! ## Example
//!
//! ```rust
//! use sandscope::policy::{ManifestBuilder, PathCase, PolicyBits};
//!
//! let tree = ManifestBuilder::with_case(PathCase::Sensitive)
//!     .add_scope("/", PolicyBits::MASK_ALL, PolicyBits::empty())
//!     .add_scope("/a", PolicyBits::MASK_ALL, PolicyBits::ALLOW_ALL)
//!     .add_scope("/a/b", PolicyBits::MASK_ALL, PolicyBits::DENY)
//!     .build()
//!     .unwrap();
//!
//! assert!(tree.resolve("/a/x").unwrap().policy.covers(PolicyBits::ALLOW_READ));
//! assert_eq!(tree.resolve("/a/b/c").unwrap().policy, PolicyBits::DENY);
//! ```

mod bits;
mod builder;
mod path;
mod tree;

pub use bits::PolicyBits;
pub use builder::{ConfigError, Directive, DirectiveKind, ManifestBuilder, build_manifest};
pub use path::{Components, MAX_DEPTH, PathCase, PathError, components, split};
pub use tree::{PathScopeTree, Resolution, ScopeCursor, ScopeNode};
