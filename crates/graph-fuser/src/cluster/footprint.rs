use std::fmt;

use crate::graph::{GraphAdapter, NodeId, SectionRange, TensorId};

/// Whether a persistent tensor enters or leaves the cluster through a member node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub enum Role {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
struct Entry {
    tensor: TensorId,
    role: Role,
    range: SectionRange,
}

/// Persistent memory touched by a cluster, split into input (`IN`) and output (`OUT`) ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentFootprint {
    entries: Vec<Entry>,
}

/// Reason two clusters may not share a kernel because of their persistent buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapConflict {
    pub first: TensorId,
    pub second: TensorId,
    /// `true` when the ranges are identical rather than partially overlapping.
    pub exact: bool,
    pub same_role: bool,
}

impl fmt::Display for OverlapConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = if self.exact { "duplicate" } else { "partial" };
        let roles = if self.same_role {
            "same-role"
        } else {
            "input/output"
        };
        write!(
            f,
            "{shape} {roles} overlap between tensors {:?} and {:?}",
            self.first, self.second
        )
    }
}

/// Persistent range of `tensor`, following alias links to the tensor that owns the storage.
pub fn persistent_range<G: GraphAdapter + ?Sized>(
    graph: &G,
    tensor: TensorId,
) -> Option<SectionRange> {
    let mut current = graph.tensor(tensor)?;
    let mut hops = 0;
    loop {
        if let Some(range) = current.persistent_range() {
            return Some(range);
        }
        let target = current.alias_of?;
        hops += 1;
        if hops > 64 {
            return None;
        }
        current = graph.tensor(target)?;
    }
}

impl PersistentFootprint {
    /// Footprint of a single node.
    pub fn of_node<G: GraphAdapter + ?Sized>(graph: &G, node: NodeId) -> Self {
        let mut footprint = Self::default();
        let Some(n) = graph.node(node) else {
            return footprint;
        };
        for tensor in &n.inputs {
            if let Some(range) = persistent_range(graph, *tensor) {
                footprint.insert(*tensor, Role::Input, range);
            }
        }
        for tensor in &n.outputs {
            if let Some(range) = persistent_range(graph, *tensor) {
                footprint.insert(*tensor, Role::Output, range);
            }
        }
        footprint
    }

    fn insert(&mut self, tensor: TensorId, role: Role, range: SectionRange) {
        let entry = Entry {
            tensor,
            role,
            range,
        };
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ranges(&self, role: Role) -> impl Iterator<Item = SectionRange> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.role == role)
            .map(|e| e.range)
    }

    /// Checks whether two clusters can share a kernel.
    ///
    /// Entries for the same tensor never conflict. An input range of one side that exactly matches
    /// an output range of the other side is an in-place pass-through and is allowed; any partial
    /// input/output overlap is not. Two distinct tensors of the same role may not touch the same
    /// bytes at all.
    pub fn conflict_with(&self, other: &PersistentFootprint) -> Option<OverlapConflict> {
        let mut same_role = None;
        for a in &self.entries {
            for b in &other.entries {
                if a.tensor == b.tensor || !a.range.intersects(&b.range) {
                    continue;
                }
                let conflict = OverlapConflict {
                    first: a.tensor,
                    second: b.tensor,
                    exact: a.range == b.range,
                    same_role: a.role == b.role,
                };
                if !conflict.same_role {
                    if !conflict.exact {
                        return Some(conflict);
                    }
                } else if same_role.is_none() {
                    same_role = Some(conflict);
                }
            }
        }
        same_role
    }

    pub fn merge(&mut self, other: PersistentFootprint) {
        for entry in other.entries {
            self.insert(entry.tensor, entry.role, entry.range);
        }
    }
}
