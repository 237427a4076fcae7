use std::collections::{BTreeSet, HashMap, HashSet};
use core::hash::Hash;




/**
 * A minimal directed graph structure that stores only edges. Vertices are
 * implied by the edges, plus whatever vertex list is given to the
 * topological sort.
 */
pub struct AdjacencyList<K> {
    outgoing: HashMap<K, Vec<K>>,
    incoming: HashMap<K, Vec<K>>,
}




// ============================================================================
impl<K> AdjacencyList<K> where K: Hash + Eq + Clone {


    pub fn new() -> Self {
        Self::default()
    }


    /**
     * Return the number of edges in the graph.
     */
    pub fn len(&self) -> usize {
        self.incoming.iter().map(|(_, edges)| edges.len()).sum()
    }


    /**
     * Determine whether there are any edges in the graph.
     */
    pub fn is_empty(&self) -> bool {
        self.incoming.iter().all(|(_, edges)| edges.is_empty())
    }


    /**
     * Insert an edge from a -> b, unless it is already present. Circular
     * edges are allowed.
     */
    pub fn insert(&mut self, a0: K, b0: K) {
        if self.contains(&a0, &b0) {
            return;
        }
        let a1 = a0.clone();
        let b1 = b0.clone();
        self.outgoing.entry(a0).or_default().push(b0);
        self.incoming.entry(b1).or_default().push(a1);
    }


    /**
     * Determine whether the given edge exists.
     */
    pub fn contains(&self, a: &K, b: &K) -> bool {
        self.outgoing
            .get(a)
            .map(|edges| edges.contains(b))
            .unwrap_or(false)
    }


    /**
     * Remove an edge if it exists.
     */
    pub fn remove(&mut self, a0: K, b0: K) {
        let a1 = a0.clone();
        let b1 = b0.clone();
        self.outgoing.entry(a0).and_modify(|edges| edges.retain(|k| k != &b0));
        self.incoming.entry(b1).and_modify(|edges| edges.retain(|k| k != &a1));
    }


    /**
     * Return an iterator over the vertices with edges emanating from the given
     * vertex.
     */
    pub fn outgoing_edges(&self, a: &K) -> impl Iterator<Item = &K> {
        self.outgoing.get(a).into_iter().flat_map(|edges| edges.iter())
    }


    /**
     * Return an iterator over the vertices with edges pointing to the given
     * vertex.
     */
    pub fn incoming_edges(&self, b: &K) -> impl Iterator<Item = &K> {
        self.incoming.get(b).into_iter().flat_map(|edges| edges.iter())
    }
}

impl<K> AdjacencyList<K> where K: Hash + Ord + Clone {


    /**
     * Order the given vertices so that every edge points forward. Among the
     * vertices that are ready at any point, the smallest goes first, so the
     * result is deterministic. If the edges contain a cycle, the vertices
     * that could not be ordered are returned as the error.
     */
    pub fn topological_sort<I>(&self, vertices: I) -> Result<Vec<K>, Vec<K>>
    where
        I: IntoIterator<Item = K>,
    {
        let vertices: Vec<K> = vertices.into_iter().collect();
        let known: HashSet<&K> = vertices.iter().collect();
        let mut pending: HashMap<&K, usize> = vertices
            .iter()
            .map(|v| (v, self.incoming_edges(v).filter(|u| known.contains(u)).count()))
            .collect();

        let mut ready: BTreeSet<&K> = pending
            .iter()
            .filter(|(_, &n)| n == 0)
            .map(|(&v, _)| v)
            .collect();
        let mut order = Vec::with_capacity(vertices.len());

        while let Some(v) = ready.iter().next().copied() {
            ready.remove(v);
            pending.remove(v);
            order.push(v.clone());

            for w in self.outgoing_edges(v) {
                if let Some(n) = pending.get_mut(w) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(w);
                    }
                }
            }
        }
        if pending.is_empty() {
            Ok(order)
        } else {
            let mut stuck: Vec<K> = pending.into_iter().map(|(v, _)| v.clone()).collect();
            stuck.sort();
            Err(stuck)
        }
    }
}

impl<K> Default for AdjacencyList<K> {
    fn default() -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::AdjacencyList;


    #[test]
    fn graph_contained_works() {
        let mut edges = AdjacencyList::new();
        edges.insert(0, 1);
        assert!(edges.contains(&0, &1));
        assert!(!edges.contains(&1, &0));
    }


    #[test]
    fn graph_ignores_duplicate_edges() {
        let mut edges = AdjacencyList::new();
        edges.insert(0, 1);
        edges.insert(0, 1);
        edges.insert(1, 1);
        assert_eq!(edges.len(), 2);
    }


    #[test]
    fn graph_can_remove_edge() {
        let mut edges = AdjacencyList::new();
        edges.insert(0, 1);
        edges.insert(1, 0);
        edges.remove(1, 0);
        assert!(edges.contains(&0, &1));
        assert!(!edges.contains(&1, &0));
        assert_eq!(edges.len(), 1);
    }


    #[test]
    fn topological_sort_respects_edges_and_breaks_ties_by_order() {
        let mut edges = AdjacencyList::new();
        edges.insert(3, 1);
        edges.insert(1, 0);
        edges.insert(2, 0);
        assert_eq!(edges.topological_sort(0..5), Ok(vec![2, 3, 1, 0, 4]));
    }


    #[test]
    fn topological_sort_reports_the_vertices_on_a_cycle() {
        let mut edges = AdjacencyList::new();
        edges.insert(0, 1);
        edges.insert(1, 2);
        edges.insert(2, 1);
        edges.insert(2, 3);
        assert_eq!(edges.topological_sort(0..4), Err(vec![1, 2, 3]));
    }
}
