//! Track partitioning via union-find over the undirected projection of the
//! dependency graph. Phases in different tracks share no ancestors or
//! descendants and are always safe to run in parallel.

use std::collections::HashMap;

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Partition phase indices into connected components given an undirected
/// adjacency list. Returns components keyed by an arbitrary but stable
/// representative index, each listing member indices in ascending order.
pub fn partition(adjacency: &[Vec<usize>]) -> HashMap<usize, Vec<usize>> {
    let n = adjacency.len();
    let mut uf = UnionFind::new(n);

    for (i, neighbors) in adjacency.iter().enumerate() {
        for &j in neighbors {
            uf.union(i, j);
        }
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..n {
        let root = uf.find(i);
        components.entry(root).or_default().push(i);
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_graph_has_no_tracks() {
        assert!(partition(&[]).is_empty());
    }

    #[test]
    fn isolated_nodes_are_their_own_track() {
        let adjacency = vec![Vec::new(), Vec::new()];
        let tracks = partition(&adjacency);
        assert_eq!(tracks.len(), 2);
    }

    #[test]
    fn connected_component_forms_a_single_track() {
        // 0-1, 1-2 undirected: one track of three nodes.
        let adjacency = vec![vec![1], vec![0, 2], vec![1]];
        let tracks = partition(&adjacency);
        assert_eq!(tracks.len(), 1);
        let members = tracks.values().next().unwrap();
        assert_eq!(members.len(), 3);
    }

    #[test]
    fn disjoint_pairs_form_separate_tracks() {
        // 0-1 and 2-3: two tracks, no cross-ancestry.
        let adjacency = vec![vec![1], vec![0], vec![3], vec![2]];
        let tracks = partition(&adjacency);
        assert_eq!(tracks.len(), 2);
        for members in tracks.values() {
            assert_eq!(members.len(), 2);
        }
    }
}
