//! Role inheritance graph and dependency ordering
//!
//! Uses Kahn's algorithm to order roles so that every parent precedes every
//! child, and to detect inheritance cycles.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{AuthzError, Result};
use crate::types::{RoleDefinition, RoleId};

/// Node in the inheritance graph
#[derive(Debug, Clone, Default)]
struct RoleNode {
    /// Immediate parents
    parents: BTreeSet<RoleId>,

    /// Immediate children (roles inheriting from this one)
    children: BTreeSet<RoleId>,
}

/// Inheritance graph over roles
///
/// Ordering is deterministic: among roles that become ready at the same
/// time, names are taken in lexical order.
///
/// # Examples
///
/// ```rust
/// use rulepack_authz::graph::RoleGraph;
///
/// let mut graph = RoleGraph::new();
/// graph.add_parent("user", "admin");
///
/// let order = graph.roles_in_dependency_order().unwrap();
/// assert_eq!(order, vec!["admin".to_string(), "user".to_string()]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RoleGraph {
    nodes: BTreeMap<RoleId, RoleNode>,
}

impl RoleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from loaded role definitions.
    ///
    /// Every parent must itself be one of the definitions; a dangling
    /// reference fails with `UnknownRole`.
    pub fn from_definitions(roles: &[RoleDefinition]) -> Result<Self> {
        let mut graph = Self::new();
        for role in roles {
            role.validate()?;
            graph.add_role(role.name.clone());
        }
        for role in roles {
            for parent in &role.parents {
                if !graph.contains(parent) {
                    return Err(AuthzError::UnknownRole(parent.clone()));
                }
                graph.add_parent(role.name.clone(), parent.clone());
            }
        }
        Ok(graph)
    }

    /// Adds a role with no edges; no-op when already present
    pub fn add_role(&mut self, role: impl Into<RoleId>) {
        self.nodes.entry(role.into()).or_default();
    }

    /// Records that `child` inherits from `parent`, adding either as needed
    pub fn add_parent(&mut self, child: impl Into<RoleId>, parent: impl Into<RoleId>) {
        let child = child.into();
        let parent = parent.into();

        self.nodes
            .entry(child.clone())
            .or_default()
            .parents
            .insert(parent.clone());
        self.nodes.entry(parent).or_default().children.insert(child);
    }

    /// Immediate parents of a role (empty for roots and unknown roles)
    pub fn parents_of(&self, role: &str) -> BTreeSet<RoleId> {
        self.nodes
            .get(role)
            .map(|n| n.parents.clone())
            .unwrap_or_default()
    }

    /// Immediate children of a role
    pub fn children_of(&self, role: &str) -> BTreeSet<RoleId> {
        self.nodes
            .get(role)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Returns roles with every parent ahead of its children.
    ///
    /// Fails with `CycleDetected` listing the roles left unordered when the
    /// parent relation contains a cycle.
    pub fn roles_in_dependency_order(&self) -> Result<Vec<RoleId>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.parents.len()))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(role) = queue.pop_front() {
            sorted.push(role.to_string());

            if let Some(node) = self.nodes.get(role) {
                for child in &node.children {
                    if let Some(degree) = in_degree.get_mut(child.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(child.as_str());
                        }
                    }
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let cycle: Vec<RoleId> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            return Err(AuthzError::CycleDetected { cycle });
        }

        Ok(sorted)
    }

    pub fn has_cycle(&self) -> bool {
        self.roles_in_dependency_order().is_err()
    }

    pub fn contains(&self, role: &str) -> bool {
        self.nodes.contains_key(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleId> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
