//! The topology graph and the routing tables derived from it. The graph is
//! read-only after load; all-pairs shortest-latency paths are computed once
//! at bootstrap and cached.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;

use log::*;
use petgraph::graph::{DiGraph, NodeIndex};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use umbra_shim_helper::simulation_time::SimulationTime;

use crate::core::configuration::GraphOptions;

type NetGraphError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A graph node: an attachment point for hosts.
#[derive(Debug, PartialEq, Eq)]
pub struct NetworkNode {
    pub id: u32,
    pub bandwidth_down: Option<u64>,
    pub bandwidth_up: Option<u64>,
}

/// A graph edge: a directed link with latency, jitter and loss.
#[derive(Debug, PartialEq)]
pub struct NetworkEdge {
    pub source: u32,
    pub target: u32,
    pub latency: SimulationTime,
    pub jitter: SimulationTime,
    pub packet_loss: f32,
}

/// The network graph, plus a map from configured node ids to petgraph node
/// indexes.
#[derive(Debug)]
pub struct NetworkGraph {
    graph: DiGraph<NetworkNode, NetworkEdge>,
    node_id_to_index_map: HashMap<u32, NodeIndex>,
}

impl NetworkGraph {
    pub fn node_id_to_index(&self, id: u32) -> Option<&NodeIndex> {
        self.node_id_to_index_map.get(&id)
    }

    pub fn node_index_to_id(&self, index: NodeIndex) -> Option<u32> {
        self.graph.node_weight(index).map(|w| w.id)
    }

    /// Build the graph from the configuration. An undirected configuration
    /// adds each edge in both directions.
    pub fn build(options: &GraphOptions) -> Result<Self, NetGraphError> {
        let mut graph = DiGraph::with_capacity(options.nodes.len(), options.edges.len());

        // map from configured id to petgraph id
        let mut id_map = HashMap::new();

        for node in &options.nodes {
            let petgraph_id = graph.add_node(NetworkNode {
                id: node.id,
                bandwidth_down: node.host_bandwidth_down,
                bandwidth_up: node.host_bandwidth_up,
            });
            if id_map.insert(node.id, petgraph_id).is_some() {
                return Err(format!("Duplicate node id {}", node.id).into());
            }
        }

        for edge in &options.edges {
            if edge.latency_ns == 0 {
                return Err("Edge 'latency_ns' must not be 0".into());
            }
            if !(0f32..=1f32).contains(&edge.packet_loss) {
                return Err("Edge 'packet_loss' is not in the range [0,1]".into());
            }

            let source = *id_map
                .get(&edge.source)
                .ok_or(format!("Edge source {} doesn't exist", edge.source))?;
            let target = *id_map
                .get(&edge.target)
                .ok_or(format!("Edge target {} doesn't exist", edge.target))?;

            let weight = |src, dst| NetworkEdge {
                source: src,
                target: dst,
                latency: SimulationTime::from_nanos(edge.latency_ns),
                jitter: SimulationTime::from_nanos(edge.jitter_ns),
                packet_loss: edge.packet_loss,
            };

            graph.add_edge(source, target, weight(edge.source, edge.target));
            if !options.directed && source != target {
                graph.add_edge(target, source, weight(edge.target, edge.source));
            }
        }

        Ok(Self {
            graph,
            node_id_to_index_map: id_map,
        })
    }

    /// All-pairs shortest-latency paths over the nodes in use. Paths from a
    /// node to itself come from the node's self-loop edge, which must exist
    /// if two hosts attached to that node are to communicate.
    pub fn compute_shortest_paths(
        &self,
        nodes: &[NodeIndex],
    ) -> Result<HashMap<(NodeIndex, NodeIndex), PathProperties>, NetGraphError> {
        let start = std::time::Instant::now();

        let mut paths: HashMap<(_, _), PathProperties> = nodes
            .into_par_iter()
            .flat_map(|src| {
                petgraph::algo::dijkstra(&self.graph, *src, None, |e| e.weight().into())
                    .into_iter()
                    // ignore nodes that aren't in use
                    .filter(|(dst, _)| nodes.contains(dst))
                    .map(|(dst, path)| ((*src, dst), path))
                    .collect::<HashMap<(_, _), _>>()
            })
            .collect();

        // use the self-loop for paths from a node to itself
        for node in nodes {
            // the dijkstra shortest path from node -> node will always be 0
            assert_eq!(paths[&(*node, *node)], PathProperties::default());

            paths.insert((*node, *node), self.get_edge_weight(node, node)?.into());
        }

        assert_eq!(paths.len(), nodes.len().pow(2));

        debug!(
            "Finished computing shortest paths: {} ms, {} entries",
            start.elapsed().as_millis(),
            paths.len()
        );

        Ok(paths)
    }

    /// Get the weight for the edge between two nodes. Returns an error if there
    /// is not exactly one edge between them.
    fn get_edge_weight(
        &self,
        src: &NodeIndex,
        dst: &NodeIndex,
    ) -> Result<&NetworkEdge, NetGraphError> {
        let src_id = self.node_index_to_id(*src).unwrap();
        let dst_id = self.node_index_to_id(*dst).unwrap();

        let mut edges = self.graph.edges_connecting(*src, *dst);
        let edge = edges
            .next()
            .ok_or(format!("No edge connecting node {src_id} to {dst_id}"))?;
        if edges.count() != 0 {
            return Err(format!("More than one edge connecting node {src_id} to {dst_id}").into());
        }
        Ok(edge.weight())
    }

    /// The smallest edge latency anywhere in the graph: the global lower
    /// bound on the round window.
    pub fn min_edge_latency(&self) -> Option<SimulationTime> {
        self.graph
            .edge_weights()
            .map(|e| e.latency)
            .min()
    }
}

/// Network characteristics for a path between two nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathProperties {
    /// Latency in nanoseconds.
    pub latency_ns: u64,
    /// Packet loss as fraction.
    pub packet_loss: f32,
}

impl PartialOrd for PathProperties {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        // order by lowest latency first, then by lowest packet loss
        match self.latency_ns.cmp(&other.latency_ns) {
            std::cmp::Ordering::Equal => self.packet_loss.partial_cmp(&other.packet_loss),
            x => Some(x),
        }
    }
}

impl PartialEq for PathProperties {
    fn eq(&self, other: &Self) -> bool {
        // PartialEq must be consistent with PartialOrd
        self.partial_cmp(other) == Some(std::cmp::Ordering::Equal)
    }
}

impl core::ops::Add for PathProperties {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self {
            latency_ns: self.latency_ns + other.latency_ns,
            packet_loss: 1f32 - (1f32 - self.packet_loss) * (1f32 - other.packet_loss),
        }
    }
}

impl std::convert::From<&NetworkEdge> for PathProperties {
    fn from(e: &NetworkEdge) -> Self {
        Self {
            latency_ns: e.latency.as_nanos() as u64,
            packet_loss: e.packet_loss,
        }
    }
}

#[derive(Debug)]
pub struct IpPreviouslyAssignedError;
impl std::error::Error for IpPreviouslyAssignedError {}

impl std::fmt::Display for IpPreviouslyAssignedError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "IP address has already been assigned")
    }
}

/// Tool for assigning IP addresses to graph nodes.
#[derive(Debug)]
pub struct IpAssignment<T: Copy + Eq + Hash + std::fmt::Display> {
    /// A map of host IP addresses to node ids.
    map: HashMap<std::net::IpAddr, T>,
    /// The last dynamically assigned address.
    last_assigned_addr: std::net::IpAddr,
}

impl<T: Copy + Eq + Hash + std::fmt::Display> IpAssignment<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            last_assigned_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::new(11, 0, 0, 0)),
        }
    }

    /// Get an unused address and assign it to a node.
    pub fn assign(&mut self, node_id: T) -> std::net::IpAddr {
        // loop until we find an unused address
        loop {
            let ip_addr = Self::increment_address(&self.last_assigned_addr);
            self.last_assigned_addr = ip_addr;
            if let Entry::Vacant(e) = self.map.entry(ip_addr) {
                e.insert(node_id);
                break ip_addr;
            }
        }
    }

    /// Assign an address to a node.
    pub fn assign_ip(
        &mut self,
        node_id: T,
        ip_addr: std::net::IpAddr,
    ) -> Result<(), IpPreviouslyAssignedError> {
        let entry = self.map.entry(ip_addr);
        if let Entry::Occupied(_) = &entry {
            return Err(IpPreviouslyAssignedError);
        }
        entry.or_insert(node_id);
        Ok(())
    }

    /// Get the node that an address is assigned to.
    pub fn get_node(&self, ip_addr: std::net::IpAddr) -> Option<T> {
        self.map.get(&ip_addr).copied()
    }

    /// Get all nodes with assigned addresses.
    pub fn get_nodes(&self) -> std::collections::HashSet<T> {
        self.map.values().copied().collect()
    }

    fn increment_address(addr: &std::net::IpAddr) -> std::net::IpAddr {
        match addr {
            std::net::IpAddr::V4(x) => {
                let addr_bits = u32::from(*x);
                let mut increment = 1;
                loop {
                    // increment the address
                    let next_addr = std::net::Ipv4Addr::from(addr_bits + increment);
                    match next_addr.octets()[3] {
                        // if the address ends in ".0" or ".255" (broadcast), try the next
                        0 | 255 => increment += 1,
                        _ => break std::net::IpAddr::V4(next_addr),
                    }
                }
            }
            std::net::IpAddr::V6(_) => unimplemented!(),
        }
    }
}

impl<T: Copy + Eq + Hash + std::fmt::Display> Default for IpAssignment<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Routing information for paths between nodes.
#[derive(Debug)]
pub struct RoutingInfo<T: Eq + Hash + std::fmt::Display + Clone + Copy> {
    paths: HashMap<(T, T), PathProperties>,
    packet_counters: std::sync::RwLock<HashMap<(T, T), u64>>,
}

impl<T: Eq + Hash + std::fmt::Display + Clone + Copy> RoutingInfo<T> {
    pub fn new(paths: HashMap<(T, T), PathProperties>) -> Self {
        Self {
            paths,
            packet_counters: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Get properties for the path from one node to another.
    pub fn path(&self, start: T, end: T) -> Option<PathProperties> {
        self.paths.get(&(start, end)).copied()
    }

    /// Increment the number of packets sent from one node to another.
    pub fn increment_packet_count(&self, start: T, end: T) {
        let key = (start, end);
        let mut packet_counters = self.packet_counters.write().unwrap();
        match packet_counters.get_mut(&key) {
            Some(x) => *x = x.saturating_add(1),
            None => assert!(packet_counters.insert(key, 1).is_none()),
        }
    }

    /// Log the number of packets sent between nodes.
    pub fn log_packet_counts(&self) {
        // only logs paths that have transmitted at least one packet
        for ((start, end), count) in self.packet_counters.read().unwrap().iter() {
            let path = self.paths.get(&(*start, *end)).unwrap();
            debug!(
                "Found path {}->{}: latency={}ns, packet_loss={}, packet_count={}",
                start, end, path.latency_ns, path.packet_loss, count,
            );
        }
    }

    pub fn get_smallest_latency_ns(&self) -> Option<u64> {
        self.paths.values().map(|x| x.latency_ns).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::configuration::{EdgeOptions, NodeOptions};

    fn options(
        nodes: &[u32],
        edges: &[(u32, u32, u64)],
        directed: bool,
    ) -> GraphOptions {
        GraphOptions {
            nodes: nodes
                .iter()
                .map(|id| NodeOptions {
                    id: *id,
                    host_bandwidth_down: None,
                    host_bandwidth_up: None,
                })
                .collect(),
            edges: edges
                .iter()
                .map(|(source, target, latency_ns)| EdgeOptions {
                    source: *source,
                    target: *target,
                    latency_ns: *latency_ns,
                    jitter_ns: 0,
                    packet_loss: 0.0,
                })
                .collect(),
            directed,
        }
    }

    #[test]
    fn test_path_add() {
        let p1 = PathProperties {
            latency_ns: 23,
            packet_loss: 0.35,
        };
        let p2 = PathProperties {
            latency_ns: 11,
            packet_loss: 0.85,
        };

        let p3 = p1 + p2;
        assert_eq!(p3.latency_ns, 34);
        assert!((p3.packet_loss - 0.9025).abs() < 0.01);
    }

    #[test]
    fn test_nonexistent_edge_endpoint() {
        let opts = options(&[1], &[(1, 2, 1)], true);
        assert!(NetworkGraph::build(&opts).is_err());
    }

    #[test]
    fn test_zero_latency_rejected() {
        let opts = options(&[1, 2], &[(1, 2, 0)], true);
        assert!(NetworkGraph::build(&opts).is_err());
    }

    // disabled under miri due to rayon
    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_shortest_path() {
        for directed in [true, false] {
            let opts = options(
                &[0, 1, 2],
                &[
                    (0, 0, 3333),
                    (1, 1, 5555),
                    (2, 2, 7777),
                    (0, 1, 3),
                    (1, 0, 5),
                    (0, 2, 7),
                    (2, 1, 11),
                ],
                directed,
            );
            let graph = NetworkGraph::build(&opts).unwrap();
            let node_0 = *graph.node_id_to_index(0).unwrap();
            let node_1 = *graph.node_id_to_index(1).unwrap();
            let node_2 = *graph.node_id_to_index(2).unwrap();

            let shortest_paths = graph
                .compute_shortest_paths(&[node_0, node_1, node_2])
                .unwrap();

            let lookup_latency = |a, b| shortest_paths.get(&(a, b)).unwrap().latency_ns;

            if directed {
                assert_eq!(lookup_latency(node_0, node_0), 3333);
                assert_eq!(lookup_latency(node_0, node_1), 3);
                assert_eq!(lookup_latency(node_0, node_2), 7);
                assert_eq!(lookup_latency(node_1, node_0), 5);
                assert_eq!(lookup_latency(node_1, node_2), 12);
                assert_eq!(lookup_latency(node_2, node_1), 11);
                assert_eq!(lookup_latency(node_2, node_0), 16);
            } else {
                assert_eq!(lookup_latency(node_0, node_1), 3);
                assert_eq!(lookup_latency(node_1, node_0), 3);
                assert_eq!(lookup_latency(node_1, node_2), 10);
                assert_eq!(lookup_latency(node_2, node_0), 7);
            }
        }
    }

    #[test]
    fn test_min_edge_latency() {
        let opts = options(&[0, 1], &[(0, 1, 500), (1, 0, 900)], true);
        let graph = NetworkGraph::build(&opts).unwrap();
        assert_eq!(
            graph.min_edge_latency(),
            Some(SimulationTime::from_nanos(500))
        );
    }

    #[test]
    fn test_increment_address_skip_broadcast() {
        let addr = std::net::IpAddr::V4(std::net::Ipv4Addr::new(11, 0, 0, 254));
        let incremented = IpAssignment::<i32>::increment_address(&addr);
        assert!(incremented > addr);
        assert_ne!(
            incremented,
            std::net::IpAddr::V4(std::net::Ipv4Addr::new(11, 0, 0, 255))
        );
    }
}
