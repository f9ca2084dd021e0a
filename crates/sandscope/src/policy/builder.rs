//! Manifest construction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bits::PolicyBits;
use super::path::{self, PathCase, PathError};
use super::tree::{NodeId, PathScopeTree, ROOT, ScopeNode};

/// Errors that prevent a manifest from being used.
///
/// A job whose manifest fails to build must not start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No directive applied a rule to the root.
    #[error("manifest root has no explicit rule")]
    MissingRootRule,
    /// A directive named a path that cannot be split into components.
    #[error("directive {index} has a malformed path: {source}")]
    MalformedPath {
        /// Position of the directive in application order.
        index: usize,
        /// Why the path was rejected.
        #[source]
        source: PathError,
    },
    /// The manifest needs more nodes than the arena can address.
    #[error("manifest exceeds {max} scope nodes")]
    TooManyNodes {
        /// Arena capacity.
        max: usize,
    },
}

/// Whether a directive's rule is inherited below its path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectiveKind {
    /// The rule covers the path and everything below it.
    #[default]
    Scope,
    /// The rule covers the literal path only.
    Exact,
}

fn mask_none() -> PolicyBits {
    PolicyBits::MASK_NONE
}

/// One entry of a manifest's ordered directive list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    /// Absolute, canonical path the rule is bound to.
    pub path: String,
    /// Bits kept from the inherited policy.
    #[serde(default = "mask_none")]
    pub mask: PolicyBits,
    /// Bits added on top.
    #[serde(default)]
    pub policy: PolicyBits,
    /// Scope or exact rule.
    #[serde(default)]
    pub kind: DirectiveKind,
}

impl Directive {
    /// A rule inherited by everything below `path`.
    pub fn scope(path: impl Into<String>, mask: PolicyBits, policy: PolicyBits) -> Self {
        Self {
            path: path.into(),
            mask,
            policy,
            kind: DirectiveKind::Scope,
        }
    }

    /// A rule bound to `path` alone.
    pub fn exact(path: impl Into<String>, mask: PolicyBits, policy: PolicyBits) -> Self {
        Self {
            path: path.into(),
            mask,
            policy,
            kind: DirectiveKind::Exact,
        }
    }
}

/// Single-threaded builder for a [`PathScopeTree`].
///
/// Directives are applied in call order. A malformed directive does not
/// abort the chain; the first error is kept and reported by [`build`].
///
/// # Example
///
/// ```rust
/// use sandscope::policy::{ManifestBuilder, PolicyBits};
///
/// let tree = ManifestBuilder::new()
///     .add_scope("/", PolicyBits::MASK_NONE, PolicyBits::empty())
///     .add_scope("/src", PolicyBits::MASK_NONE, PolicyBits::ALLOW_READ)
///     .add_path("/src/gen.rs", PolicyBits::MASK_NONE, PolicyBits::ALLOW_WRITE)
///     .build()
///     .unwrap();
///
/// let resolution = tree.resolve("/src/gen.rs").unwrap();
/// assert_eq!(resolution.policy, PolicyBits::ALLOW_READ | PolicyBits::ALLOW_WRITE);
/// ```
///
/// [`build`]: ManifestBuilder::build
#[derive(Debug)]
pub struct ManifestBuilder {
    nodes: Vec<ScopeNode>,
    case: PathCase,
    applied: usize,
    error: Option<ConfigError>,
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestBuilder {
    /// Create a builder using the platform's path case convention.
    pub fn new() -> Self {
        Self::with_case(PathCase::platform())
    }

    /// Create a builder with an explicit path case convention.
    pub fn with_case(case: PathCase) -> Self {
        Self {
            nodes: vec![ScopeNode::routing("")],
            case,
            applied: 0,
            error: None,
        }
    }

    /// Apply a scope rule to `path` and, by accumulation, everything below it.
    pub fn add_scope(self, path: &str, mask: PolicyBits, policy: PolicyBits) -> Self {
        self.apply_rule(path, mask, policy, false)
    }

    /// Apply a rule to the literal `path` only.
    pub fn add_path(self, path: &str, mask: PolicyBits, policy: PolicyBits) -> Self {
        self.apply_rule(path, mask, policy, true)
    }

    /// Apply one manifest directive.
    pub fn directive(self, directive: &Directive) -> Self {
        match directive.kind {
            DirectiveKind::Scope => self.add_scope(&directive.path, directive.mask, directive.policy),
            DirectiveKind::Exact => self.add_path(&directive.path, directive.mask, directive.policy),
        }
    }

    /// Apply directives in order.
    pub fn directives<'a>(self, directives: impl IntoIterator<Item = &'a Directive>) -> Self {
        directives.into_iter().fold(self, |builder, d| builder.directive(d))
    }

    /// Validate and freeze the tree.
    pub fn build(self) -> Result<PathScopeTree, ConfigError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if !self.nodes[ROOT as usize].explicit {
            return Err(ConfigError::MissingRootRule);
        }

        tracing::debug!(
            directives = self.applied,
            nodes = self.nodes.len(),
            "built access manifest"
        );

        Ok(PathScopeTree {
            nodes: self.nodes,
            case: self.case,
        })
    }

    fn apply_rule(mut self, path: &str, mask: PolicyBits, policy: PolicyBits, exact_only: bool) -> Self {
        let index = self.applied;
        self.applied += 1;
        if self.error.is_some() {
            return self;
        }

        let components = match path::components(path) {
            Ok(components) => components,
            Err(source) => {
                self.error = Some(ConfigError::MalformedPath { index, source });
                return self;
            }
        };

        match self.materialize(&components) {
            Ok(id) => {
                let node = &mut self.nodes[id as usize];
                node.mask = mask;
                node.policy = policy;
                node.explicit = true;
                node.exact_only = exact_only;
            }
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Walk or create the node chain for `components`.
    fn materialize(&mut self, components: &[&str]) -> Result<NodeId, ConfigError> {
        let mut current = ROOT;
        for component in components {
            let key = self.case.key(component);
            let lookup = self.nodes[current as usize]
                .children
                .binary_search_by(|(k, _)| k.as_ref().cmp(key.as_ref()));
            current = match lookup {
                Ok(pos) => self.nodes[current as usize].children[pos].1,
                Err(pos) => {
                    let id = NodeId::try_from(self.nodes.len()).map_err(|_| ConfigError::TooManyNodes {
                        max: NodeId::MAX as usize,
                    })?;
                    let key: Box<str> = key.into();
                    self.nodes.push(ScopeNode::routing(component));
                    self.nodes[current as usize].children.insert(pos, (key, id));
                    id
                }
            };
        }
        Ok(current)
    }
}

/// Build a tree from an ordered directive list.
pub fn build_manifest<'a>(
    directives: impl IntoIterator<Item = &'a Directive>,
    case: PathCase,
) -> Result<PathScopeTree, ConfigError> {
    ManifestBuilder::with_case(case).directives(directives).build()
}
