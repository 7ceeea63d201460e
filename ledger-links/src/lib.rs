//! Typed, directed, cycle-free graph of [`EconomicLink`]s between
//! artifacts (events, journal entries). Grounded on the parent/child
//! linkage `finance_kernel/services/reversal_service.py` builds between a
//! journal entry and its reversal, generalized into a standing structure
//! that also carries `Settles` and `Corrects` edges.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::Utc;
use ledger_types::{ArtifactRef, EconomicLink, EventId, LinkId, LinkType};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LinkGraphError {
    #[error("a link cannot connect an artifact to itself")]
    SelfLink,
    #[error("link ({link_type:?}, {parent:?}, {child:?}) already exists")]
    AlreadyExists {
        link_type: LinkType,
        parent: ArtifactRef,
        child: ArtifactRef,
    },
    #[error("{parent:?} already has the maximum of {max} outgoing {link_type:?} link(s)")]
    MaxChildrenExceeded {
        link_type: LinkType,
        parent: ArtifactRef,
        max: usize,
    },
    #[error("establishing this link would create a cycle among {link_type:?} links")]
    WouldCreateCycle { link_type: LinkType },
    #[error("{child:?} may not be linked as a {link_type:?} child of a JournalEntry other artifact kinds aren't valid for")]
    InvalidCombination { link_type: LinkType, child: ArtifactRef },
}

/// All currently-supported link types connect two journal entries; this is
/// the only combination `reversal_service.py` and its callers ever produce.
fn is_valid_combination(link_type: LinkType, parent: &ArtifactRef, child: &ArtifactRef) -> bool {
    let _ = link_type;
    matches!(
        (parent, child),
        (ArtifactRef::JournalEntry(_), ArtifactRef::JournalEntry(_))
    )
}

#[derive(Debug, Default)]
pub struct LinkGraph {
    links: Mutex<Vec<EconomicLink>>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn establish(
        &self,
        link_type: LinkType,
        parent_ref: ArtifactRef,
        child_ref: ArtifactRef,
        creating_event_id: EventId,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<EconomicLink, LinkGraphError> {
        if parent_ref == child_ref {
            return Err(LinkGraphError::SelfLink);
        }
        if !is_valid_combination(link_type, &parent_ref, &child_ref) {
            return Err(LinkGraphError::InvalidCombination { link_type, child: child_ref });
        }

        let mut links = self.links.lock().await;

        if links
            .iter()
            .any(|l| l.link_type == link_type && l.parent_ref == parent_ref && l.child_ref == child_ref)
        {
            return Err(LinkGraphError::AlreadyExists {
                link_type,
                parent: parent_ref,
                child: child_ref,
            });
        }

        let existing_children = links
            .iter()
            .filter(|l| l.link_type == link_type && l.parent_ref == parent_ref)
            .count();
        let max = link_type.max_children();
        if existing_children >= max {
            return Err(LinkGraphError::MaxChildrenExceeded { link_type, parent: parent_ref, max });
        }

        if Self::reachable(&links, link_type, child_ref, parent_ref) {
            return Err(LinkGraphError::WouldCreateCycle { link_type });
        }

        let link = EconomicLink {
            link_id: Uuid::new_v4(),
            link_type,
            parent_ref,
            child_ref,
            creating_event_id,
            created_at: Utc::now(),
            metadata,
        };
        links.push(link.clone());
        Ok(link)
    }

    /// BFS over same-type edges: is `target` reachable by following edges
    /// forward (parent -> child) starting at `from`?
    fn reachable(links: &[EconomicLink], link_type: LinkType, from: ArtifactRef, target: ArtifactRef) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for link in links.iter().filter(|l| l.link_type == link_type && l.parent_ref == current) {
                queue.push_back(link.child_ref);
            }
        }
        false
    }

    pub async fn children_of(&self, link_type: LinkType, parent: ArtifactRef) -> Vec<ArtifactRef> {
        self.links
            .lock()
            .await
            .iter()
            .filter(|l| l.link_type == link_type && l.parent_ref == parent)
            .map(|l| l.child_ref)
            .collect()
    }

    pub async fn transitive_closure(&self, link_type: LinkType, root: ArtifactRef) -> Vec<ArtifactRef> {
        let links = self.links.lock().await;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([root]);
        let mut result = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            for link in links.iter().filter(|l| l.link_type == link_type && l.parent_ref == current) {
                result.push(link.child_ref);
                queue.push_back(link.child_ref);
            }
        }
        result
    }

    pub async fn shortest_path(
        &self,
        link_type: LinkType,
        from: ArtifactRef,
        to: ArtifactRef,
    ) -> Option<Vec<ArtifactRef>> {
        let links = self.links.lock().await;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([vec![from]]);
        while let Some(path) = queue.pop_front() {
            let Some(&current) = path.last() else {
                continue;
            };
            if current == to {
                return Some(path);
            }
            if !visited.insert(current) {
                continue;
            }
            for link in links.iter().filter(|l| l.link_type == link_type && l.parent_ref == current) {
                let mut next_path = path.clone();
                next_path.push(link.child_ref);
                queue.push_back(next_path);
            }
        }
        None
    }
}
