//! Parent/child resolution over flat requirement collections
//!
//! Catalog data links nodes two ways: `parentId` on the child and an advisory
//! `children` list on the parent. The two can disagree, be empty, be stale,
//! or form cycles. Everything here is a pure function of its inputs.

use std::collections::{HashSet, VecDeque};

use crate::models::{ids_match, normalize_id, Requirement};

/// Normalized lookup set for removed identifiers
struct RemovedSet<'a>(HashSet<&'a str>);

impl<'a> RemovedSet<'a> {
    fn new(removed: &'a [String]) -> Self {
        Self(removed.iter().map(|id| normalize_id(id)).collect())
    }

    fn contains(&self, id: &str) -> bool {
        self.0.contains(normalize_id(id))
    }
}

/// Returns true if `id` is in `removed`
pub fn is_removed(removed: &[String], id: &str) -> bool {
    removed.iter().any(|r| ids_match(r, id))
}

/// Requirements with no resolvable parent among the other entries of
/// `collection`, minus anything in `removed`.
pub fn top_level<'a>(collection: &'a [Requirement], removed: &[String]) -> Vec<&'a Requirement> {
    let removed = RemovedSet::new(removed);
    collection
        .iter()
        .enumerate()
        .filter(|(_, req)| !removed.contains(&req.id))
        .filter(|(i, req)| match req.parent_id.as_deref() {
            None => true,
            Some(parent) => !collection
                .iter()
                .enumerate()
                .any(|(j, other)| j != *i && ids_match(&other.id, parent)),
        })
        .map(|(_, req)| req)
        .collect()
}

/// Live children of `node`.
///
/// Resolves through `node.children` first; only when that yields nothing
/// does it scan `collection` for entries whose `parentId` points at `node`.
pub fn children_of<'a>(
    node: &Requirement,
    collection: &'a [Requirement],
    removed: &[String],
) -> Vec<&'a Requirement> {
    let removed = RemovedSet::new(removed);

    let mut found: Vec<&'a Requirement> = Vec::new();
    if let Some(children) = node.children.as_deref() {
        for child_id in children {
            let hit = collection.iter().find(|r| {
                r.is(child_id) && !std::ptr::eq(*r, node) && !r.is(&node.id)
            });
            if let Some(child) = hit {
                if !removed.contains(&child.id) && !found.iter().any(|f| std::ptr::eq(*f, child))
                {
                    found.push(child);
                }
            }
        }
    }

    if found.is_empty() {
        found = collection
            .iter()
            .filter(|r| !std::ptr::eq(*r, node) && !r.is(&node.id))
            .filter(|r| r.parent_id.as_deref().is_some_and(|p| ids_match(p, &node.id)))
            .filter(|r| !removed.contains(&r.id))
            .collect();
    }

    found
}

/// Every descendant of `id`, breadth first, excluding `id` itself.
///
/// Follows both the `children` lists and `parentId` references so a removal
/// never strands a child that only one of the two links knows about.
/// Terminates on cyclic or self-referential links.
pub fn descendants(id: &str, collection: &[Requirement]) -> Vec<String> {
    let mut visited: HashSet<&str> = HashSet::new();
    visited.insert(normalize_id(id));

    let mut out = Vec::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(id);

    while let Some(current) = queue.pop_front() {
        let mut next: Vec<&Requirement> = collection
            .iter()
            .filter(|r| {
                r.parent_id
                    .as_deref()
                    .is_some_and(|p| ids_match(p, current))
            })
            .collect();
        if let Some(node) = collection.iter().find(|r| r.is(current)) {
            next.extend(children_of(node, collection, &[]));
        }

        for child in next {
            if visited.insert(normalize_id(&child.id)) {
                out.push(child.id.clone());
                queue.push_back(&child.id);
            }
        }
    }

    out
}

/// Depth-first `(node, depth)` walk of the visible tree.
///
/// Entries whose parent is removed surface at the top. Nodes unreachable from
/// any root (a parent cycle) are appended as extra roots so nothing visible
/// disappears from the listing.
pub fn flatten_tree<'a>(
    collection: &'a [Requirement],
    removed: &[String],
) -> Vec<(&'a Requirement, usize)> {
    let removed_set = RemovedSet::new(removed);
    let visible: Vec<&'a Requirement> = collection
        .iter()
        .filter(|r| !removed_set.contains(&r.id))
        .collect();
    let visible_owned: Vec<Requirement> = visible.iter().map(|r| (*r).clone()).collect();

    let mut visited: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    let roots: Vec<usize> = top_level(&visible_owned, &[])
        .into_iter()
        .filter_map(|root| visible_owned.iter().position(|r| std::ptr::eq(r, root)))
        .collect();
    for index in roots {
        walk(index, 0, &visible, &visible_owned, &mut visited, &mut out);
    }
    for index in 0..visible.len() {
        if !visited.contains(normalize_id(&visible[index].id)) {
            walk(index, 0, &visible, &visible_owned, &mut visited, &mut out);
        }
    }

    out
}

fn walk<'a>(
    index: usize,
    depth: usize,
    visible: &[&'a Requirement],
    owned: &[Requirement],
    visited: &mut HashSet<String>,
    out: &mut Vec<(&'a Requirement, usize)>,
) {
    if !visited.insert(normalize_id(&owned[index].id).to_string()) {
        return;
    }
    out.push((visible[index], depth));
    let child_indexes: Vec<usize> = children_of(&owned[index], owned, &[])
        .into_iter()
        .filter_map(|child| owned.iter().position(|r| std::ptr::eq(r, child)))
        .collect();
    for child in child_indexes {
        walk(child, depth + 1, visible, owned, visited, out);
    }
}
