//! Risk graph: dependency edges, per-resource scores and wave ordering.
//!
//! Edges point from a resource to each of its dependents. A cycle anywhere in the
//! feed fails construction with a configuration error instead of stalling the
//! scheduler later.

use std::collections::HashMap;
use std::path::PathBuf;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{info, warn};

use crate::feed::DependencyFeed;
use crate::score::{classify, risk_score, RiskInputs};
use shepherd_core::config::{ConcurrencyCaps, RiskConfig, WaveOrder};
use shepherd_core::{Error, Resource, ResourceId, ResourceState, ResourceStates, Result, RiskTier};

/// One admission bucket: every resource of a single tier.
#[derive(Debug, Clone, PartialEq)]
pub struct Wave {
    pub index: usize,
    pub tier: RiskTier,
    /// Descending risk, ties broken by path.
    pub resources: Vec<ResourceId>,
}

/// Scored resources in wave order, with the caps that bound each wave.
#[derive(Debug, Clone)]
pub struct RiskGraph {
    resources: Vec<Resource>,
    index: HashMap<ResourceId, usize>,
    waves: Vec<Wave>,
    caps: ConcurrencyCaps,
}

impl RiskGraph {
    /// Build the graph from a loaded feed.
    pub fn build(feed: &DependencyFeed, config: &RiskConfig) -> Result<Self> {
        config.validate()?;

        let mut graph: DiGraph<ResourceId, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for entry in &feed.resources {
            if nodes.contains_key(entry.path.as_str()) {
                return Err(Error::Configuration(format!(
                    "resource '{}' listed more than once",
                    entry.path
                )));
            }
            let node = graph.add_node(ResourceId::new(entry.path.clone()));
            nodes.insert(entry.path.as_str(), node);
        }

        for entry in &feed.resources {
            let source = nodes[entry.path.as_str()];
            for dependent in &entry.dependents {
                match nodes.get(dependent.as_str()) {
                    Some(&target) => {
                        graph.update_edge(source, target, ());
                    }
                    None => warn!(
                        "Ignoring unknown dependent '{}' of '{}'",
                        dependent, entry.path
                    ),
                }
            }
        }

        detect_cycles(&graph)?;

        let mut resources = Vec::with_capacity(feed.resources.len());
        for entry in &feed.resources {
            let node = nodes[entry.path.as_str()];
            let mut dependents: Vec<ResourceId> = graph
                .neighbors(node)
                .map(|n| graph[n].clone())
                .collect();
            dependents.sort();

            let inputs = RiskInputs {
                dependents: dependents.len(),
                complexity: entry.complexity,
                criticality: entry.criticality,
            };
            let risk = risk_score(&inputs, &config.weights);
            if !risk.is_finite() {
                return Err(Error::Configuration(format!(
                    "risk score of '{}' is not finite (complexity {}, criticality {})",
                    entry.path, entry.complexity, entry.criticality
                )));
            }
            resources.push(Resource {
                id: graph[node].clone(),
                path: PathBuf::from(&entry.path),
                risk,
                tier: classify(risk, &config.thresholds),
                wave: 0,
                dependents,
                complexity: entry.complexity,
                criticality: entry.criticality,
            });
        }

        Ok(Self::from_resources(resources, config))
    }

    /// Arrange already-scored resources into waves. Each resource keeps its tier;
    /// used to rebuild the graph of a resumed session from its recorded items.
    pub fn from_resources(mut resources: Vec<Resource>, config: &RiskConfig) -> Self {
        let mut tiers: Vec<RiskTier> = RiskTier::all()
            .iter()
            .copied()
            .filter(|tier| resources.iter().any(|r| r.tier == *tier))
            .collect();
        if config.wave_order == WaveOrder::HighestRiskFirst {
            tiers.reverse();
        }

        for resource in &mut resources {
            resource.wave = tiers
                .iter()
                .position(|t| *t == resource.tier)
                .unwrap_or_default();
        }
        resources.sort_by(|a, b| {
            a.wave
                .cmp(&b.wave)
                .then(b.risk.total_cmp(&a.risk))
                .then_with(|| a.path.cmp(&b.path))
        });

        let waves = tiers
            .iter()
            .enumerate()
            .map(|(index, tier)| Wave {
                index,
                tier: *tier,
                resources: resources
                    .iter()
                    .filter(|r| r.wave == index)
                    .map(|r| r.id.clone())
                    .collect(),
            })
            .collect::<Vec<_>>();

        let index = resources
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();

        for wave in &waves {
            info!(
                "Wave {} ({}): {} resources, cap {}",
                wave.index,
                wave.tier,
                wave.resources.len(),
                tier_cap(&config.caps, wave.tier).map_or("pool".to_string(), |c| c.to_string())
            );
        }

        Self {
            resources,
            index,
            waves,
            caps: config.caps,
        }
    }

    /// The first pending resource that may start now.
    ///
    /// Waves are walked in order; a wave whose active count has reached its cap is
    /// skipped, but a critical wave with any outstanding resource stops the walk.
    pub fn next_eligible(&self, states: &ResourceStates) -> Option<&Resource> {
        for wave in &self.waves {
            let mut outstanding = false;
            let mut active = 0;
            let mut candidate = None;
            for id in &wave.resources {
                let state = states.get(id);
                outstanding |= state.is_outstanding();
                if state.is_active() {
                    active += 1;
                }
                if candidate.is_none() && state == ResourceState::Pending {
                    candidate = Some(id);
                }
            }
            if !outstanding {
                continue;
            }
            let under_cap = self.concurrency_cap(wave.index).map_or(true, |cap| active < cap);
            if under_cap {
                if let Some(id) = candidate {
                    return self.get(id);
                }
            }
            if wave.tier.is_critical() {
                return None;
            }
        }
        None
    }

    /// Maximum simultaneous active resources of a wave; `None` means bounded only by
    /// the worker pool.
    pub fn concurrency_cap(&self, wave: usize) -> Option<usize> {
        self.waves
            .get(wave)
            .and_then(|w| tier_cap(&self.caps, w.tier))
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    /// All resources, in wave order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

fn tier_cap(caps: &ConcurrencyCaps, tier: RiskTier) -> Option<usize> {
    match tier {
        RiskTier::Critical => Some(1),
        RiskTier::High => Some(caps.high),
        RiskTier::Medium => caps.medium,
        RiskTier::Low => caps.low,
    }
}

fn detect_cycles(graph: &DiGraph<ResourceId, ()>) -> Result<()> {
    for component in tarjan_scc(graph) {
        let cyclic = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.contains_edge(n, n));
        if cyclic {
            let mut members: Vec<&str> = component.iter().map(|&n| graph[n].as_str()).collect();
            members.sort_unstable();
            return Err(Error::Configuration(format!(
                "dependency cycle between: {}",
                members.join(", ")
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEntry;

    fn entry(path: &str, dependents: &[&str], criticality: f64) -> FeedEntry {
        FeedEntry {
            path: path.into(),
            dependents: dependents.iter().map(|d| d.to_string()).collect(),
            complexity: 0.0,
            criticality,
        }
    }

    /// core.rs critical (3 dependents + criticality 10), api.rs high, rest low.
    fn sample_feed() -> DependencyFeed {
        DependencyFeed::new(vec![
            entry("core.rs", &["a.rs", "b.rs", "c.rs"], 10.0),
            entry("api.rs", &[], 6.0),
            entry("a.rs", &[], 0.0),
            entry("b.rs", &[], 0.0),
            entry("c.rs", &[], 0.0),
        ])
    }

    fn id(s: &str) -> ResourceId {
        ResourceId::from(s)
    }

    #[test]
    fn test_waves_follow_tiers() {
        let graph = RiskGraph::build(&sample_feed(), &RiskConfig::default()).unwrap();
        assert_eq!(graph.wave_count(), 3);
        assert_eq!(graph.waves()[0].tier, RiskTier::Critical);
        assert_eq!(graph.waves()[1].tier, RiskTier::High);
        assert_eq!(graph.waves()[2].tier, RiskTier::Low);

        let core = graph.get(&id("core.rs")).unwrap();
        assert_eq!(core.risk, 23.0);
        assert_eq!(core.wave, 0);
        assert_eq!(core.dependents, vec![id("a.rs"), id("b.rs"), id("c.rs")]);
        assert_eq!(graph.resources()[0].id, id("core.rs"));
    }

    #[test]
    fn test_lowest_risk_first_reverses_waves() {
        let config = RiskConfig {
            wave_order: WaveOrder::LowestRiskFirst,
            ..RiskConfig::default()
        };
        let graph = RiskGraph::build(&sample_feed(), &config).unwrap();
        assert_eq!(graph.waves()[0].tier, RiskTier::Low);
        assert_eq!(graph.waves()[2].tier, RiskTier::Critical);
    }

    #[test]
    fn test_cycle_fails_fast() {
        let feed = DependencyFeed::new(vec![
            entry("a.rs", &["b.rs"], 0.0),
            entry("b.rs", &["c.rs"], 0.0),
            entry("c.rs", &["a.rs"], 0.0),
        ]);
        let err = RiskGraph::build(&feed, &RiskConfig::default()).unwrap_err();
        match err {
            Error::Configuration(msg) => assert!(msg.contains("a.rs, b.rs, c.rs")),
            other => panic!("expected configuration error, got {other:?}"),
        }

        let self_loop = DependencyFeed::new(vec![entry("a.rs", &["a.rs"], 0.0)]);
        assert!(matches!(
            RiskGraph::build(&self_loop, &RiskConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_malformed_weights_rejected() {
        let mut config = RiskConfig::default();
        config.weights.dependents = f64::NAN;
        assert!(matches!(
            RiskGraph::build(&sample_feed(), &config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_dependents_ignored() {
        let feed = DependencyFeed::new(vec![entry("a.rs", &["ghost.rs"], 0.0)]);
        let graph = RiskGraph::build(&feed, &RiskConfig::default()).unwrap();
        assert!(graph.get(&id("a.rs")).unwrap().dependents.is_empty());
    }

    #[test]
    fn test_critical_wave_is_a_barrier() {
        let graph = RiskGraph::build(&sample_feed(), &RiskConfig::default()).unwrap();
        let mut states = ResourceStates::pending(graph.resources().iter().map(|r| &r.id));

        assert_eq!(graph.next_eligible(&states).unwrap().id, id("core.rs"));
        states.set(&id("core.rs"), ResourceState::InProgress);
        assert!(graph.next_eligible(&states).is_none());

        states.set(&id("core.rs"), ResourceState::Deferred);
        assert!(graph.next_eligible(&states).is_none());

        states.set(&id("core.rs"), ResourceState::Failed);
        assert_eq!(graph.next_eligible(&states).unwrap().id, id("api.rs"));
    }

    #[test]
    fn test_non_critical_waves_overlap_under_caps() {
        let mut config = RiskConfig::default();
        config.caps.low = Some(2);
        let feed = DependencyFeed::new(vec![
            entry("api.rs", &[], 6.0),
            entry("a.rs", &[], 0.0),
            entry("b.rs", &[], 0.0),
            entry("c.rs", &[], 0.0),
        ]);
        let graph = RiskGraph::build(&feed, &config).unwrap();
        assert_eq!(graph.concurrency_cap(0), Some(2));
        assert_eq!(graph.concurrency_cap(1), Some(2));

        let mut states = ResourceStates::pending(graph.resources().iter().map(|r| &r.id));
        states.set(&id("api.rs"), ResourceState::InProgress);
        assert_eq!(graph.next_eligible(&states).unwrap().id, id("a.rs"));

        states.set(&id("a.rs"), ResourceState::Locked);
        states.set(&id("b.rs"), ResourceState::InProgress);
        assert!(graph.next_eligible(&states).is_none());

        states.set(&id("a.rs"), ResourceState::Completed);
        assert_eq!(graph.next_eligible(&states).unwrap().id, id("c.rs"));
    }

    #[test]
    fn test_from_resources_keeps_recorded_tiers() {
        let built = RiskGraph::build(&sample_feed(), &RiskConfig::default()).unwrap();
        let mut recorded: Vec<Resource> = built.resources().to_vec();
        recorded.reverse();
        let rebuilt = RiskGraph::from_resources(recorded, &RiskConfig::default());
        assert_eq!(rebuilt.waves(), built.waves());
        assert_eq!(rebuilt.get(&id("api.rs")).unwrap().tier, RiskTier::High);
    }

    #[test]
    fn test_uncapped_tiers_and_exhaustion() {
        let graph = RiskGraph::build(&sample_feed(), &RiskConfig::default()).unwrap();
        assert_eq!(graph.concurrency_cap(0), Some(1));
        assert_eq!(graph.concurrency_cap(2), None);
        assert_eq!(graph.concurrency_cap(9), None);

        let mut states = ResourceStates::new();
        for r in graph.resources() {
            states.set(&r.id, ResourceState::Completed);
        }
        assert!(graph.next_eligible(&states).is_none());
    }
}
