//! Static route topology derived from stop sequences.

use std::collections::{HashMap, HashSet};

use crate::stats::quantile;

/// Mapping from (route_id, direction_id) to its ordered station list.
pub type RouteMap = HashMap<(String, u8), Vec<String>>;

/// Read-only station graph built once from the route map.
///
/// Each station is linked to its immediate predecessor and successor in
/// every stop sequence it appears in; a station shared by several routes
/// accumulates neighbours from all of them.
#[derive(Debug, Clone)]
pub struct RouteTopology {
    node_degree: HashMap<String, usize>,
    hub_flag: HashMap<String, bool>,
}

impl RouteTopology {
    /// Builds the topology. Empty input yields an empty topology; there are
    /// no other failure modes.
    pub fn from_route_map(route_map: &RouteMap) -> Self {
        let mut adjacency: HashMap<&str, HashSet<&str>> = HashMap::new();
        for stops in route_map.values() {
            for (i, stop) in stops.iter().enumerate() {
                let entry = adjacency.entry(stop).or_default();
                if i > 0 {
                    entry.insert(&stops[i - 1]);
                }
                if i + 1 < stops.len() {
                    entry.insert(&stops[i + 1]);
                }
            }
        }

        let node_degree: HashMap<String, usize> = adjacency
            .iter()
            .map(|(stop, neighbours)| (stop.to_string(), neighbours.len()))
            .collect();

        let degrees: Vec<f64> = node_degree.values().map(|d| *d as f64).collect();
        let p90 = if degrees.is_empty() {
            0.0
        } else {
            quantile(&degrees, 0.9)
        };
        let hub_flag = node_degree
            .iter()
            .map(|(stop, degree)| (stop.clone(), *degree as f64 >= p90))
            .collect();

        Self {
            node_degree,
            hub_flag,
        }
    }

    /// Count of distinct adjacent stations; 0 for unknown stations.
    pub fn node_degree(&self, stop_id: &str) -> usize {
        self.node_degree.get(stop_id).copied().unwrap_or(0)
    }

    /// Whether the station's degree is at or above the 90th percentile of
    /// all known degrees; false for unknown stations.
    pub fn is_hub(&self, stop_id: &str) -> bool {
        self.hub_flag.get(stop_id).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_map(entries: &[((&str, u8), &[&str])]) -> RouteMap {
        entries
            .iter()
            .map(|((r, d), stops)| {
                (
                    (r.to_string(), *d),
                    stops.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_line_route_degrees() {
        let topo = RouteTopology::from_route_map(&route_map(&[(("R", 0), &["A", "B", "C"])]));
        assert_eq!(topo.node_degree("A"), 1);
        assert_eq!(topo.node_degree("B"), 2);
        assert_eq!(topo.node_degree("C"), 1);
        assert_eq!(topo.node_degree("unknown"), 0);
    }

    #[test]
    fn test_hub_is_top_decile() {
        // p90 of degrees [1, 2, 1] interpolates to 1.8, so only B qualifies.
        let topo = RouteTopology::from_route_map(&route_map(&[(("R", 0), &["A", "B", "C"])]));
        assert!(topo.is_hub("B"));
        assert!(!topo.is_hub("A"));
        assert!(!topo.is_hub("unknown"));
    }

    #[test]
    fn test_shared_station_accumulates_neighbours() {
        let topo = RouteTopology::from_route_map(&route_map(&[
            (("R1", 0), &["A", "X", "B"]),
            (("R2", 0), &["C", "X", "D"]),
        ]));
        assert_eq!(topo.node_degree("X"), 4);
    }

    #[test]
    fn test_empty_route_map_is_empty_topology() {
        let topo = RouteTopology::from_route_map(&RouteMap::new());
        assert_eq!(topo.node_degree("A"), 0);
        assert!(!topo.is_hub("A"));
    }
}
