use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::connectors::Connector;
use crate::error::SourceError;
use crate::ids::{self, PaperId, Source};
use crate::model::{CitationEdge, CitationGraph, Direction, EdgeDirection, PaperMetadata};
use crate::retry::RetryExecutor;
use crate::search::Aggregator;

pub const DEFAULT_CITATION_LIMIT: usize = 20;

/// Breadth-first citation traversal over the configured connectors.
///
/// Each level's expansions run concurrently and are folded into the graph in a
/// fixed order once all of them have finished, so the graph does not depend on
/// which call returned first.
pub struct CitationGraphBuilder {
    connectors: HashMap<Source, Arc<dyn Connector>>,
    executor: Arc<RetryExecutor>,
    deadline: Duration,
    per_node_limit: usize,
    hydrate: bool,
}

impl CitationGraphBuilder {
    pub fn new(
        connectors: HashMap<Source, Arc<dyn Connector>>,
        executor: Arc<RetryExecutor>,
        deadline: Duration,
    ) -> Self {
        Self {
            connectors,
            executor,
            deadline,
            per_node_limit: DEFAULT_CITATION_LIMIT,
            hydrate: false,
        }
    }

    /// Share the aggregator's connectors, executor and deadline.
    pub fn from_aggregator(aggregator: &Aggregator) -> Self {
        Self::new(
            aggregator.connectors().clone(),
            Arc::clone(aggregator.executor()),
            aggregator.deadline(),
        )
    }

    /// Citations requested per node and direction.
    pub fn with_per_node_limit(mut self, limit: usize) -> Self {
        self.per_node_limit = limit;
        self
    }

    /// Also fetch one metadata record per node once traversal is done.
    pub fn with_hydration(mut self, hydrate: bool) -> Self {
        self.hydrate = hydrate;
        self
    }

    pub async fn build(
        &self,
        seeds: &[PaperId],
        depth: usize,
        direction: Direction,
        max_nodes: usize,
    ) -> CitationGraph {
        let mut graph = CitationGraph::default();
        let mut visited: HashSet<PaperId> = HashSet::new();
        let mut frontier: Vec<PaperId> = Vec::new();

        for seed in seeds {
            if graph.nodes.contains(seed) {
                continue;
            }
            if graph.nodes.len() >= max_nodes {
                graph.truncated = true;
                break;
            }
            graph.nodes.insert(seed.clone());
            frontier.push(seed.clone());
        }

        for level in 0..depth {
            let expanding: Vec<PaperId> = frontier
                .drain(..)
                .filter(|id| visited.insert(id.clone()))
                .collect();
            if expanding.is_empty() {
                break;
            }
            tracing::info!(
                "Citation graph level {}: expanding {} node(s), {} known",
                level,
                expanding.len(),
                graph.nodes.len()
            );

            let calls = expanding.iter().flat_map(|id| {
                direction
                    .edges()
                    .iter()
                    .map(move |edge| async move { (id, *edge, self.expand(id, *edge).await) })
            });
            let outcomes = join_all(calls).await;

            let mut next = Vec::new();
            for (from, edge, outcome) in outcomes {
                let found = match outcome {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::warn!("Expanding {} ({:?}) failed: {}", from, edge, e);
                        record_error(&mut graph, from, &e);
                        continue;
                    }
                };
                for to in found {
                    if to == *from {
                        continue;
                    }
                    if !graph.nodes.contains(&to) {
                        if graph.nodes.len() >= max_nodes {
                            graph.truncated = true;
                            continue;
                        }
                        graph.nodes.insert(to.clone());
                        next.push(to.clone());
                    }
                    graph.edges.insert(CitationEdge {
                        from: from.clone(),
                        to,
                        direction: edge,
                    });
                }
            }
            frontier = next;
        }

        // Discovered but never expanded: the depth bound cut the traversal short.
        if frontier.iter().any(|id| !visited.contains(id)) {
            graph.truncated = true;
        }

        if self.hydrate {
            self.hydrate_nodes(&mut graph).await;
        }
        tracing::info!(
            "Citation graph done: {} node(s), {} edge(s), truncated={}",
            graph.nodes.len(),
            graph.edges.len(),
            graph.truncated
        );
        graph
    }

    /// Build from caller-supplied identifier strings (canonical form or URLs). Entries that
    /// do not resolve are reported in `errors`; the call fails only if none resolve.
    pub async fn build_from_raw(
        &self,
        raw_seeds: &[String],
        depth: usize,
        direction: Direction,
        max_nodes: usize,
    ) -> Result<CitationGraph, SourceError> {
        let mut seeds = Vec::new();
        let mut rejected = Vec::new();
        for raw in raw_seeds {
            match ids::resolve(raw) {
                Ok(id) => seeds.push(id),
                Err(e) => rejected.push((raw.clone(), e.to_string())),
            }
        }
        if seeds.is_empty() {
            return Err(SourceError::invalid(format!(
                "no valid seed identifier in [{}]",
                raw_seeds.join(", ")
            )));
        }

        let mut graph = self.build(&seeds, depth, direction, max_nodes).await;
        graph.errors.extend(rejected);
        Ok(graph)
    }

    async fn expand(&self, id: &PaperId, edge: EdgeDirection) -> Result<Vec<PaperId>, SourceError> {
        let connector = self.connector_for(id.source())?;
        self.executor
            .execute(id.source(), self.deadline, || {
                connector.fetch_citations(id, Direction::from(edge), self.per_node_limit)
            })
            .await
    }

    async fn lookup(&self, id: &PaperId) -> Result<PaperMetadata, SourceError> {
        let connector = self.connector_for(id.source())?;
        self.executor
            .execute(id.source(), self.deadline, || connector.fetch_metadata(id))
            .await
    }

    async fn hydrate_nodes(&self, graph: &mut CitationGraph) {
        let nodes: Vec<PaperId> = graph.nodes.iter().cloned().collect();
        let lookups = nodes.iter().map(|id| async move { (id, self.lookup(id).await) });
        for (id, outcome) in join_all(lookups).await {
            match outcome {
                Ok(meta) => {
                    graph.metadata.insert(id.clone(), meta);
                }
                Err(e) => {
                    tracing::debug!("No metadata for {}: {}", id, e);
                    record_error(graph, id, &e);
                }
            }
        }
    }

    fn connector_for(&self, source: Source) -> Result<&Arc<dyn Connector>, SourceError> {
        self.connectors
            .get(&source)
            .ok_or_else(|| SourceError::invalid(format!("source '{}' is not enabled", source)))
    }
}

fn record_error(graph: &mut CitationGraph, id: &PaperId, err: &SourceError) {
    let message = err.to_string();
    graph
        .errors
        .entry(id.to_string())
        .and_modify(|existing| {
            if !existing.contains(&message) {
                existing.push_str("; ");
                existing.push_str(&message);
            }
        })
        .or_insert(message);
}
