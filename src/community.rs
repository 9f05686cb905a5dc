//! Connected-components plus greedy modularity split over the entity graph.
//! Grounded on `graph::knowledge_graph::KnowledgeGraph`'s BFS traversal idiom,
//! generalized from a transient in-memory graph to one rebuilt from `Store`
//! on every call and persisted back through `replace_communities`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::llm::{ChatModel, ChatRequest};
use crate::store::Store;
use crate::types::{CommunityLevel, Entity, EntityId, Relationship};

const MIN_COMPONENT_SPLIT: usize = 6;
const MAX_MODULARITY_NODES: usize = 200;
const MAX_PASSES: u32 = 20;
const SUMMARY_CONCURRENCY: usize = 8;

pub struct CommunityEngine<'a> {
    store: &'a Store,
    chat: Arc<dyn ChatModel>,
}

/// Undirected weighted adjacency built from relationships; parallel edges
/// between the same pair are summed.
struct Graph {
    neighbors: HashMap<EntityId, HashMap<EntityId, f32>>,
}

impl Graph {
    fn build(entities: &[Entity], relationships: &[Relationship]) -> Self {
        let mut neighbors: HashMap<EntityId, HashMap<EntityId, f32>> = HashMap::new();
        for e in entities {
            neighbors.entry(e.id).or_default();
        }
        for r in relationships {
            *neighbors.entry(r.source_entity_id).or_default().entry(r.target_entity_id).or_insert(0.0) += r.weight;
            if r.source_entity_id != r.target_entity_id {
                *neighbors.entry(r.target_entity_id).or_default().entry(r.source_entity_id).or_insert(0.0) += r.weight;
            }
        }
        Self { neighbors }
    }

    fn nodes(&self) -> impl Iterator<Item = &EntityId> {
        self.neighbors.keys()
    }

    fn degree(&self, node: EntityId) -> f32 {
        self.neighbors.get(&node).map(|n| n.values().sum()).unwrap_or(0.0)
    }

    fn connected_components(&self) -> Vec<Vec<EntityId>> {
        let mut visited = HashSet::new();
        let mut components = Vec::new();

        for &start in self.neighbors.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut component = Vec::new();
            let mut queue = VecDeque::new();
            queue.push_back(start);
            visited.insert(start);

            while let Some(node) = queue.pop_front() {
                component.push(node);
                if let Some(edges) = self.neighbors.get(&node) {
                    for &neighbor in edges.keys() {
                        if visited.insert(neighbor) {
                            queue.push_back(neighbor);
                        }
                    }
                }
            }
            components.push(component);
        }
        components
    }
}

impl<'a> CommunityEngine<'a> {
    pub fn new(store: &'a Store, chat: Arc<dyn ChatModel>) -> Self {
        Self { store, chat }
    }

    /// Rebuilds the full two-level community set and replaces it atomically.
    pub async fn rebuild(&self) -> Result<()> {
        let entities = self.store.all_entities().await?;
        let relationships = self.store.all_relationships().await?;
        let graph = Graph::build(&entities, &relationships);

        let components = graph.connected_components();
        let mut communities: Vec<(CommunityLevel, Vec<EntityId>, Option<String>)> = Vec::new();

        for component in &components {
            communities.push((CommunityLevel::L0, component.clone(), None));
        }

        for component in &components {
            if component.len() < MIN_COMPONENT_SPLIT || component.len() > MAX_MODULARITY_NODES {
                continue;
            }
            let groups = greedy_modularity_split(&graph, component);
            if groups.len() >= 2 {
                for g in groups {
                    communities.push((CommunityLevel::L1, g, None));
                }
            }
        }

        let by_id: HashMap<EntityId, &Entity> = entities.iter().map(|e| (e.id, e)).collect();
        let summaries = self.summarize_all(&communities, &by_id).await;

        let final_set: Vec<(CommunityLevel, Vec<EntityId>, Option<String>)> = communities
            .into_iter()
            .zip(summaries)
            .map(|((level, ids, _), summary)| (level, ids, summary))
            .collect();

        self.store.replace_communities(&final_set).await
    }

    async fn summarize_all(
        &self,
        communities: &[(CommunityLevel, Vec<EntityId>, Option<String>)],
        by_id: &HashMap<EntityId, &Entity>,
    ) -> Vec<Option<String>> {
        let semaphore = Arc::new(Semaphore::new(SUMMARY_CONCURRENCY));
        let mut tasks = Vec::with_capacity(communities.len());

        for (_, ids, _) in communities {
            let semaphore = semaphore.clone();
            let chat = self.chat.clone();
            let members: Vec<(String, String, String)> = ids
                .iter()
                .filter_map(|id| by_id.get(id))
                .map(|e| (e.name.clone(), e.entity_type.as_str().to_string(), e.description.clone()))
                .collect();

            tasks.push(async move {
                let Ok(_permit) = semaphore.acquire().await else { return None };
                match summarize_community(chat.as_ref(), &members).await {
                    Ok(summary) => Some(summary),
                    Err(e) => {
                        warn!(error = %e, "community summarization failed, leaving summary unset");
                        None
                    }
                }
            });
        }

        futures::future::join_all(tasks).await
    }
}

async fn summarize_community(chat: &dyn ChatModel, members: &[(String, String, String)]) -> Result<String> {
    let system = "Summarize what this group of related entities from a technical document collection has in common, in 2-3 sentences.";
    let listing: String = members.iter().map(|(name, ty, desc)| format!("- {name} ({ty}): {desc}")).collect::<Vec<_>>().join("\n");
    let req = ChatRequest::new(system, &listing, 0.3);
    let resp = chat.chat(&req).await?;
    Ok(resp.content.trim().to_string())
}

/// Greedy modularity optimization capped at `MAX_PASSES`. Each pass, every
/// node considers moving to any neighboring community that strictly
/// increases modularity; accepted moves mutate the assignment in place.
fn greedy_modularity_split(graph: &Graph, component: &[EntityId]) -> Vec<Vec<EntityId>> {
    let m: f32 = component.iter().map(|&n| graph.degree(n)).sum::<f32>() * 0.5;
    if m <= 0.0 {
        return Vec::new();
    }
    let two_m = 2.0 * m;

    let mut assignment: HashMap<EntityId, usize> = component.iter().enumerate().map(|(i, &n)| (n, i)).collect();
    let node_set: HashSet<EntityId> = component.iter().copied().collect();

    for _ in 0..MAX_PASSES {
        let mut moved = false;

        for &node in component {
            let k_i = graph.degree(node);
            let current_community = assignment[&node];

            let edges = match graph.neighbors.get(&node) {
                Some(e) => e,
                None => continue,
            };

            let mut candidate_communities: HashSet<usize> = HashSet::new();
            for &neighbor in edges.keys() {
                if node_set.contains(&neighbor) {
                    candidate_communities.insert(assignment[&neighbor]);
                }
            }
            candidate_communities.remove(&current_community);
            if candidate_communities.is_empty() {
                continue;
            }

            let community_strength = |community: usize, exclude: EntityId| -> f32 {
                component
                    .iter()
                    .filter(|&&n| n != exclude && assignment.get(&n) == Some(&community))
                    .map(|&n| graph.degree(n))
                    .sum()
            };

            let weight_to = |community: usize| -> f32 {
                edges
                    .iter()
                    .filter(|(&neighbor, _)| node_set.contains(&neighbor) && assignment.get(&neighbor) == Some(&community))
                    .map(|(_, &w)| w)
                    .sum()
            };

            let sigma_current = community_strength(current_community, node);
            let w_i_current = weight_to(current_community);
            let base_gain = w_i_current / m - sigma_current * k_i / (two_m * m);

            let mut best_candidate = None;
            let mut best_gain = 0.0f32;

            for &candidate in &candidate_communities {
                let sigma_candidate = community_strength(candidate, node);
                let w_i_candidate = weight_to(candidate);
                let delta_q = (w_i_candidate / m - sigma_candidate * k_i / (two_m * m)) - base_gain;
                if delta_q > best_gain {
                    best_gain = delta_q;
                    best_candidate = Some(candidate);
                }
            }

            if let Some(target) = best_candidate {
                assignment.insert(node, target);
                moved = true;
            }
        }

        if !moved {
            break;
        }
    }

    let mut groups: HashMap<usize, Vec<EntityId>> = HashMap::new();
    for &node in component {
        groups.entry(assignment[&node]).or_default().push(node);
    }
    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relationship(source: EntityId, target: EntityId, weight: f32) -> Relationship {
        Relationship {
            id: 0,
            source_entity_id: source,
            target_entity_id: target,
            relation_type: crate::types::RelationType::References,
            weight,
            source_chunk_id: None,
            description: String::new(),
        }
    }

    #[test]
    fn connected_components_splits_disjoint_clusters() {
        let entities = vec![];
        let relationships = vec![relationship(1, 2, 1.0), relationship(3, 4, 1.0)];
        let graph = Graph::build(&entities, &relationships);
        let components = graph.connected_components();
        assert_eq!(components.len(), 2);
    }

    #[test]
    fn dense_bridge_splits_into_two_communities() {
        let entities = vec![];
        let relationships = vec![
            relationship(1, 2, 1.0),
            relationship(2, 3, 1.0),
            relationship(1, 3, 1.0),
            relationship(4, 5, 1.0),
            relationship(5, 6, 1.0),
            relationship(4, 6, 1.0),
            relationship(1, 4, 0.1),
        ];
        let graph = Graph::build(&entities, &relationships);
        let component: Vec<EntityId> = vec![1, 2, 3, 4, 5, 6];
        let groups = greedy_modularity_split(&graph, &component);
        assert!(groups.len() >= 2);
    }
}
