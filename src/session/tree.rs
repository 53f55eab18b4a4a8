use std::collections::HashMap;

use super::{Branch, BranchStatus, Session};
use crate::error::{HelmError, HelmResult};

/// In-memory arena of a session's branches, rooted at `main`.
///
/// Branches are stored flat and addressed by id; the parent/child shape is
/// recomputed from `parent_id` back-references, so the tree view never
/// holds owning pointers. Structural invariants enforced here:
///
/// * the set of branches forms a tree rooted at the main branch,
/// * at most one child of any parent is `active` at a time,
/// * status transitions follow `active → saved → active`,
///   `active → {closed, merged}`, `saved → closed`; `closed` and
///   `merged` are terminal.
#[derive(Debug, Clone)]
pub struct BranchTree {
    branches: Vec<Branch>,
    index: HashMap<String, usize>,
}

impl BranchTree {
    pub fn new(main: Branch) -> Self {
        let mut tree = Self {
            branches: Vec::new(),
            index: HashMap::new(),
        };
        tree.index.insert(main.id.clone(), 0);
        tree.branches.push(main);
        tree
    }

    /// Rebuilds the tree from a persisted session (main + forks).
    pub fn from_session(session: &Session) -> Self {
        let mut tree = Self::new(session.main.clone());
        for fork in &session.forks {
            tree.index.insert(fork.id.clone(), tree.branches.len());
            tree.branches.push(fork.clone());
        }
        tree
    }

    pub fn main(&self) -> &Branch {
        &self.branches[0]
    }

    pub fn main_mut(&mut self) -> &mut Branch {
        &mut self.branches[0]
    }

    pub fn get(&self, branch_id: &str) -> Option<&Branch> {
        self.index.get(branch_id).map(|&i| &self.branches[i])
    }

    pub fn get_mut(&mut self, branch_id: &str) -> Option<&mut Branch> {
        match self.index.get(branch_id) {
            Some(&i) => Some(&mut self.branches[i]),
            None => None,
        }
    }

    /// Resolves a branch by id or by name (`"main"`, fork names).
    pub fn resolve(&self, id_or_name: &str) -> Option<&Branch> {
        self.get(id_or_name)
            .or_else(|| self.branches.iter().find(|b| b.name == id_or_name))
    }

    pub fn forks(&self) -> &[Branch] {
        &self.branches[1..]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.branches.iter()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// The active child of a parent, if any.
    pub fn active_child_of(&self, parent_id: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| {
            b.parent_id.as_deref() == Some(parent_id) && b.status == BranchStatus::Active
        })
    }

    /// Adds a fork under `parent_id`.
    ///
    /// Fails with `Conflict` when the parent already has an active child
    /// (the wrapped AI CLI supports a single live fork per thread), and
    /// with `NotFound`/`Validation` on structural mistakes.
    pub fn add_child(&mut self, parent_id: &str, child: Branch) -> HelmResult<()> {
        let parent = self
            .get(parent_id)
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", parent_id)))?;
        if parent.status.is_terminal() {
            return Err(HelmError::conflict(format!(
                "parent branch '{}' is {}",
                parent.name, parent.status
            )));
        }
        if child.parent_id.as_deref() != Some(parent_id) {
            return Err(HelmError::validation("child does not reference parent"));
        }
        if self.index.contains_key(&child.id) {
            return Err(HelmError::AlreadyExists(format!("branch '{}'", child.id)));
        }
        if child.status == BranchStatus::Active && self.active_child_of(parent_id).is_some() {
            return Err(HelmError::conflict(format!(
                "parent branch '{}' already has an active fork",
                parent.name
            )));
        }

        self.index.insert(child.id.clone(), self.branches.len());
        self.branches.push(child);
        Ok(())
    }

    /// Applies a status transition, enforcing the allowed edges and the
    /// single-active-child rule on re-activation. Same-status calls are
    /// no-ops so reconcile stays idempotent.
    pub fn set_status(&mut self, branch_id: &str, status: BranchStatus) -> HelmResult<()> {
        let current = self
            .get(branch_id)
            .ok_or_else(|| HelmError::not_found(format!("branch '{}'", branch_id)))?
            .status;

        if current == status {
            return Ok(());
        }

        let allowed = matches!(
            (current, status),
            (BranchStatus::Active, BranchStatus::Saved)
                | (BranchStatus::Saved, BranchStatus::Active)
                | (BranchStatus::Active, BranchStatus::Closed)
                | (BranchStatus::Active, BranchStatus::Merged)
                | (BranchStatus::Saved, BranchStatus::Closed)
        );
        if !allowed {
            return Err(HelmError::conflict(format!(
                "branch transition {} -> {} not allowed",
                current, status
            )));
        }

        if status == BranchStatus::Active {
            let parent_id = self
                .get(branch_id)
                .and_then(|b| b.parent_id.clone());
            if let Some(parent_id) = parent_id {
                if let Some(sibling) = self.active_child_of(&parent_id) {
                    if sibling.id != branch_id {
                        return Err(HelmError::conflict(format!(
                            "parent already has active fork '{}'",
                            sibling.name
                        )));
                    }
                }
            }
        }

        if let Some(branch) = self.get_mut(branch_id) {
            branch.status = status;
            branch.touch();
        }
        Ok(())
    }

    /// Depth-first traversal from main, children in creation order.
    pub fn walk(&self) -> Vec<&Branch> {
        let mut children: HashMap<&str, Vec<&Branch>> = HashMap::new();
        for branch in &self.branches[1..] {
            if let Some(parent) = branch.parent_id.as_deref() {
                children.entry(parent).or_default().push(branch);
            }
        }
        for list in children.values_mut() {
            list.sort_by_key(|b| b.created_at);
        }

        let mut out = Vec::with_capacity(self.branches.len());
        let mut stack = vec![self.main()];
        while let Some(branch) = stack.pop() {
            out.push(branch);
            if let Some(kids) = children.get(branch.id.as_str()) {
                for kid in kids.iter().rev() {
                    stack.push(kid);
                }
            }
        }
        out
    }

    /// Serializes back to the persisted shape.
    pub fn to_parts(&self) -> (Branch, Vec<Branch>) {
        (self.branches[0].clone(), self.branches[1..].to_vec())
    }
}
