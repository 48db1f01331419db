//! Composite keys for execution state.
//!
//! Loop and parallel regions execute one static body subgraph N times
//! without N copies of the graph. Each iteration's instance of a body block
//! is a *virtual block*, keyed here as a structured value rather than an
//! encoded string, so lookups never depend on parsing and ids containing
//! underscores cannot collide. The flat
//! `{node}_parallel_{region}_iteration_{i}` form survives only in
//! `Display`, for logs and serialized block records.

use std::fmt;

/// Which kind of region a virtual instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubflowKind {
    Loop,
    Parallel,
}

impl SubflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubflowKind::Loop => "loop",
            SubflowKind::Parallel => "parallel",
        }
    }
}

/// Key identifying one executable unit in a run: a real block, or one
/// iteration's virtual instance of a subflow body block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockRef {
    Real(String),
    Virtual {
        /// Id of the body block this instance was synthesized from.
        node: String,
        kind: SubflowKind,
        /// Id of the loop/parallel block owning the region.
        region: String,
        /// 0-based iteration index.
        iteration: usize,
    },
}

impl BlockRef {
    pub fn real(id: impl Into<String>) -> Self {
        BlockRef::Real(id.into())
    }

    pub fn virtual_instance(
        node: impl Into<String>,
        kind: SubflowKind,
        region: impl Into<String>,
        iteration: usize,
    ) -> Self {
        BlockRef::Virtual {
            node: node.into(),
            kind,
            region: region.into(),
            iteration,
        }
    }

    /// The underlying graph block id (the body block id for virtual
    /// instances).
    pub fn node_id(&self) -> &str {
        match self {
            BlockRef::Real(id) => id,
            BlockRef::Virtual { node, .. } => node,
        }
    }

    pub fn iteration(&self) -> Option<usize> {
        match self {
            BlockRef::Real(_) => None,
            BlockRef::Virtual { iteration, .. } => Some(*iteration),
        }
    }

    pub fn region_id(&self) -> Option<&str> {
        match self {
            BlockRef::Real(_) => None,
            BlockRef::Virtual { region, .. } => Some(region),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, BlockRef::Virtual { .. })
    }

    /// The sibling instance of another body node in the same region and
    /// iteration. `None` when `self` is a real block.
    pub fn sibling(&self, node: &str) -> Option<BlockRef> {
        match self {
            BlockRef::Real(_) => None,
            BlockRef::Virtual {
                kind,
                region,
                iteration,
                ..
            } => Some(BlockRef::Virtual {
                node: node.to_string(),
                kind: *kind,
                region: region.clone(),
                iteration: *iteration,
            }),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Real(id) => f.write_str(id),
            BlockRef::Virtual {
                node,
                kind,
                region,
                iteration,
            } => write!(
                f,
                "{}_{}_{}_iteration_{}",
                node,
                kind.as_str(),
                region,
                iteration
            ),
        }
    }
}

impl From<&str> for BlockRef {
    fn from(id: &str) -> Self {
        BlockRef::Real(id.to_string())
    }
}

impl From<String> for BlockRef {
    fn from(id: String) -> Self {
        BlockRef::Real(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_display_forms() {
        assert_eq!(BlockRef::real("agent1").to_string(), "agent1");
        assert_eq!(
            BlockRef::virtual_instance("worker", SubflowKind::Parallel, "p1", 2).to_string(),
            "worker_parallel_p1_iteration_2"
        );
        assert_eq!(
            BlockRef::virtual_instance("body", SubflowKind::Loop, "loop1", 0).to_string(),
            "body_loop_loop1_iteration_0"
        );
    }

    #[test]
    fn test_no_collision_with_underscored_ids() {
        // A real block whose id happens to look like a flattened virtual id
        // stays distinct from the actual virtual instance.
        let real = BlockRef::real("worker_parallel_p1_iteration_0");
        let synthesized = BlockRef::virtual_instance("worker", SubflowKind::Parallel, "p1", 0);
        assert_ne!(real, synthesized);

        let mut set = HashSet::new();
        set.insert(real);
        assert!(!set.contains(&synthesized));
    }

    #[test]
    fn test_accessors() {
        let v = BlockRef::virtual_instance("worker", SubflowKind::Parallel, "p1", 3);
        assert_eq!(v.node_id(), "worker");
        assert_eq!(v.region_id(), Some("p1"));
        assert_eq!(v.iteration(), Some(3));
        assert!(v.is_virtual());

        let r = BlockRef::real("b1");
        assert_eq!(r.node_id(), "b1");
        assert_eq!(r.iteration(), None);
        assert!(!r.is_virtual());
    }

    #[test]
    fn test_sibling_instance() {
        let v = BlockRef::virtual_instance("a", SubflowKind::Loop, "loop1", 2);
        let s = v.sibling("b").unwrap();
        assert_eq!(s, BlockRef::virtual_instance("b", SubflowKind::Loop, "loop1", 2));
        assert!(BlockRef::real("a").sibling("b").is_none());
    }
}
