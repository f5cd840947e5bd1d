//! Group service: cached reads and cycle-guarded writes

use super::repository::GroupRepository;
use crate::error::{Error, Result};
use crate::models::Group;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Cached group hierarchy. Writes serialize on a gate so the cycle check
/// always runs against the state it will commit over; persistence only
/// happens when the check passes.
pub struct GroupService {
    repo: Arc<dyn GroupRepository>,
    cache: RwLock<HashMap<i64, Group>>,
    /// Cold-start latch: emptiness is only ambiguous before the first
    /// refresh, afterwards an empty result is authoritative
    primed: AtomicBool,
    write_gate: Mutex<()>,
}

impl GroupService {
    pub fn new(repo: Arc<dyn GroupRepository>) -> Self {
        Self {
            repo,
            cache: RwLock::new(HashMap::new()),
            primed: AtomicBool::new(false),
            write_gate: Mutex::new(()),
        }
    }

    /// Reload the cache from storage
    pub async fn refresh(&self) -> Result<()> {
        let groups = self.repo.fetch_all().await?;
        let mut cache = self.cache.write().await;
        cache.clear();
        for group in groups {
            cache.insert(group.id, group);
        }
        self.primed.store(true, Ordering::SeqCst);
        tracing::info!(count = cache.len(), "Group cache refreshed");
        Ok(())
    }

    pub async fn get_by_id(&self, id: i64) -> Option<Group> {
        self.cache.read().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.cache.read().await.values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        groups
    }

    /// All known group ids. A first empty read triggers a one-shot
    /// refresh from storage; later empty reads are returned as-is.
    pub async fn all_ids(&self) -> Result<HashSet<i64>> {
        {
            let cache = self.cache.read().await;
            if !cache.is_empty() || self.primed.load(Ordering::SeqCst) {
                return Ok(cache.keys().copied().collect());
            }
        }
        self.refresh().await?;
        Ok(self.cache.read().await.keys().copied().collect())
    }

    /// Create a group, rejecting any parent chain that loops
    pub async fn add(&self, group: Group) -> Result<Group> {
        let _gate = self.write_gate.lock().await;
        {
            let cache = self.cache.read().await;
            Self::check_cycles(&cache, &group)?;
        }
        let id = self.repo.insert(&group).await?;
        let stored = Group { id, ..group };
        self.cache.write().await.insert(id, stored.clone());
        Ok(stored)
    }

    /// Update a group, rejecting any parent chain that loops
    pub async fn update(&self, group: Group) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        {
            let cache = self.cache.read().await;
            Self::check_cycles(&cache, &group)?;
        }
        self.repo.update(&group).await?;
        self.cache.write().await.insert(group.id, group);
        Ok(())
    }

    /// Walk parent pointers into a visited set seeded with the candidate.
    /// A revisit means the write would close a loop. The walk terminates
    /// at a missing parent or an unknown id.
    fn check_cycles(cache: &HashMap<i64, Group>, candidate: &Group) -> Result<()> {
        let mut visited = HashSet::new();
        visited.insert(candidate.id);
        let mut parent_id = candidate.group_id;
        while let Some(id) = parent_id {
            if !visited.insert(id) {
                return Err(Error::Validation("Cycle in group hierarchy".to_string()));
            }
            parent_id = cache.get(&id).and_then(|parent| parent.group_id);
        }
        Ok(())
    }
}
