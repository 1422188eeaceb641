use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::error::{ConflateError, Result};
use crate::geometry::{ReachId, ReferenceReach};

// Reach node in the reference network
#[derive(Debug, Clone)]
pub struct NetworkNode {
    pub id: ReachId,
    pub downstream_id: Option<ReachId>,
    pub upstream_ids: Vec<ReachId>,
}

impl NetworkNode {
    pub fn new(id: ReachId, downstream_id: Option<ReachId>) -> Self {
        NetworkNode {
            id,
            downstream_id,
            upstream_ids: Vec::new(),
        }
    }

    pub fn is_confluence(&self) -> bool {
        self.upstream_ids.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEnd {
    ReachedStop,
    Outlet,
    /// The last reach points at a reach outside the loaded network.
    DanglingLink(ReachId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Walk {
    pub path: Vec<ReachId>,
    pub end: WalkEnd,
}

// Directed reference network
#[derive(Debug, Clone, Default)]
pub struct ReferenceNetwork {
    pub nodes: HashMap<ReachId, NetworkNode>,
}

impl ReferenceNetwork {
    pub fn new() -> Self {
        ReferenceNetwork {
            nodes: HashMap::new(),
        }
    }

    /// Builds the network and rejects it if the downstream links form a cycle.
    pub fn from_reaches<'a>(reaches: impl IntoIterator<Item = &'a ReferenceReach>) -> Result<Self> {
        let mut network = ReferenceNetwork::new();
        for reach in reaches {
            network.add_node(reach.id, reach.to_id);
        }
        network.build_upstream_connections();
        network.headwater_order()?;
        Ok(network)
    }

    pub fn add_node(&mut self, id: ReachId, downstream_id: Option<ReachId>) {
        self.nodes.insert(id, NetworkNode::new(id, downstream_id));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn downstream_of(&self, id: ReachId) -> Option<ReachId> {
        self.nodes.get(&id).and_then(|n| n.downstream_id)
    }

    pub fn build_upstream_connections(&mut self) {
        let mut upstream_map: HashMap<ReachId, Vec<ReachId>> = HashMap::new();

        for (id, node) in &self.nodes {
            if let Some(downstream) = node.downstream_id {
                upstream_map.entry(downstream).or_default().push(*id);
            }
        }

        for node in self.nodes.values_mut() {
            node.upstream_ids.clear();
        }
        for (id, mut upstreams) in upstream_map {
            if let Some(node) = self.nodes.get_mut(&id) {
                upstreams.sort_unstable();
                node.upstream_ids = upstreams;
            }
        }
    }

    /// Kahn ordering, headwaters first. Fails if some reaches sit on a cycle.
    pub fn headwater_order(&self) -> Result<Vec<ReachId>> {
        let mut in_degree: HashMap<ReachId, usize> =
            self.nodes.keys().map(|id| (*id, 0)).collect();

        for node in self.nodes.values() {
            if let Some(downstream) = node.downstream_id {
                if let Some(degree) = in_degree.get_mut(&downstream) {
                    *degree += 1;
                }
            }
        }

        let mut headwaters: Vec<ReachId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        headwaters.sort_unstable();
        let mut queue: VecDeque<ReachId> = headwaters.into();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = queue.pop_front() {
            order.push(current);
            if let Some(downstream) = self.downstream_of(current) {
                if let Some(degree) = in_degree.get_mut(&downstream) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(downstream);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let seen: HashSet<ReachId> = order.iter().copied().collect();
            let stuck = self
                .nodes
                .keys()
                .filter(|id| !seen.contains(id))
                .min()
                .copied()
                .unwrap_or_default();
            return Err(ConflateError::CycleDetected(stuck));
        }

        Ok(order)
    }

    /// Follows downstream links from `start` until `stop`.
    ///
    /// A missing `stop` is not an error: the walk ends at the outlet or at the
    /// first link leaving the network and the partial path is returned. At
    /// most one step per reach is taken; revisiting a reach is a cycle.
    pub fn walk(&self, start: ReachId, stop: ReachId) -> Result<Walk> {
        if !self.nodes.contains_key(&start) {
            warn!(reach_id = start, "walk start is not in the reference network");
            return Ok(Walk {
                path: Vec::new(),
                end: WalkEnd::DanglingLink(start),
            });
        }

        let mut path = vec![start];
        let mut visited = HashSet::from([start]);
        let mut current = start;

        while current != stop {
            let Some(next) = self.downstream_of(current) else {
                debug!(reach_id = current, stop, "walk reached an outlet before the stop reach");
                return Ok(Walk {
                    path,
                    end: WalkEnd::Outlet,
                });
            };
            if !self.nodes.contains_key(&next) {
                warn!(
                    reach_id = current,
                    to_id = next,
                    "downstream link leaves the reference network, walk cut short"
                );
                return Ok(Walk {
                    path,
                    end: WalkEnd::DanglingLink(next),
                });
            }
            if !visited.insert(next) || path.len() > self.nodes.len() {
                return Err(ConflateError::CycleDetected(next));
            }
            path.push(next);
            current = next;
        }

        Ok(Walk {
            path,
            end: WalkEnd::ReachedStop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::LineString;

    fn network(links: &[(ReachId, Option<ReachId>)]) -> ReferenceNetwork {
        let mut network = ReferenceNetwork::new();
        for (id, to) in links {
            network.add_node(*id, *to);
        }
        network.build_upstream_connections();
        network
    }

    #[test]
    fn walks_a_to_c() {
        let net = network(&[(1, Some(2)), (2, Some(3)), (3, None)]);
        let walk = net.walk(1, 3).unwrap();
        assert_eq!(walk.path, vec![1, 2, 3]);
        assert_eq!(walk.end, WalkEnd::ReachedStop);
    }

    #[test]
    fn consecutive_path_elements_follow_links() {
        let net = network(&[
            (10, Some(30)),
            (20, Some(30)),
            (30, Some(40)),
            (40, Some(50)),
            (50, None),
        ]);
        let walk = net.walk(20, 50).unwrap();
        assert!(walk.path.len() <= net.len());
        for pair in walk.path.windows(2) {
            assert_eq!(net.downstream_of(pair[0]), Some(pair[1]));
        }
        assert!(net.nodes[&30].is_confluence());
    }

    #[test]
    fn start_equal_to_stop() {
        let net = network(&[(1, Some(2)), (2, None)]);
        assert_eq!(net.walk(2, 2).unwrap().path, vec![2]);
    }

    #[test]
    fn dangling_link_returns_partial_path() {
        let net = network(&[(1, Some(2)), (2, Some(99))]);
        let walk = net.walk(1, 3).unwrap();
        assert_eq!(walk.path, vec![1, 2]);
        assert_eq!(walk.end, WalkEnd::DanglingLink(99));
    }

    #[test]
    fn outlet_before_stop() {
        let net = network(&[(1, Some(2)), (2, None), (3, None)]);
        let walk = net.walk(1, 3).unwrap();
        assert_eq!(walk.path, vec![1, 2]);
        assert_eq!(walk.end, WalkEnd::Outlet);
    }

    #[test]
    fn cycle_is_an_error() {
        let net = network(&[(1, Some(2)), (2, Some(3)), (3, Some(1))]);
        assert!(matches!(net.walk(1, 4), Err(ConflateError::CycleDetected(1))));
        assert!(matches!(net.headwater_order(), Err(ConflateError::CycleDetected(1))));
    }

    #[test]
    fn cyclic_reaches_are_rejected_on_build() {
        let line = LineString::from(vec![(0.0, 0.0), (1.0, 0.0)]);
        let reach = |id, to_id| ReferenceReach {
            id,
            geometry: line.clone(),
            to_id: Some(to_id),
            flows: Default::default(),
            stream_order: None,
            gage: None,
        };
        let reaches = vec![reach(5, 6), reach(6, 7), reach(7, 6)];
        assert!(matches!(
            ReferenceNetwork::from_reaches(&reaches),
            Err(ConflateError::CycleDetected(6))
        ));
    }

    #[test]
    fn headwater_order_puts_upstream_first() {
        let net = network(&[(3, None), (2, Some(3)), (1, Some(2)), (4, Some(3))]);
        let order = net.headwater_order().unwrap();
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(2) < pos(3));
        assert!(pos(4) < pos(3));
        assert_eq!(net.nodes[&3].upstream_ids, vec![2, 4]);
    }
}
