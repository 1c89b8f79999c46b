//! Depth-first topological sort.
//!
//! An edge `a -> b` means `a` depends on `b` (`a` holds a non-nullable
//! reference to `b`). A vertex is emitted when its depth-first visit
//! finishes, so every vertex comes after all vertices it depends on.
//! Roots are visited in insertion order and neighbours in edge order, which
//! makes the output a pure function of the input.

use std::fmt;

/// A vertex handle returned by [`Graph::add_vertex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexId(usize);

#[derive(Debug)]
struct Vertex<R> {
    representation: R,
    neighbours: Vec<usize>,
    start: Option<usize>,
    end: Option<usize>,
}

/// Sorting failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortError<R> {
    /// A back edge was found; the vertices on the cycle in edge order.
    Cycle(Vec<R>),
}

impl<R: fmt::Debug> fmt::Display for SortError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle(vertices) => write!(f, "dependency cycle through {vertices:?}"),
        }
    }
}

impl<R: fmt::Debug> std::error::Error for SortError<R> {}

/// A dependency graph built for one sort.
#[derive(Debug)]
pub struct Graph<R> {
    vertices: Vec<Vertex<R>>,
}

impl<R> Default for Graph<R> {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
        }
    }
}

impl<R> Graph<R> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a vertex.
    pub fn add_vertex(&mut self, representation: R) -> VertexId {
        self.vertices.push(Vertex {
            representation,
            neighbours: Vec::new(),
            start: None,
            end: None,
        });
        VertexId(self.vertices.len() - 1)
    }

    /// Records that `from` depends on `to`.
    pub fn add_edge(&mut self, from: VertexId, to: VertexId) {
        self.vertices[from.0].neighbours.push(to.0);
    }

    /// Returns the number of vertices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Returns true if the graph has no vertices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Orders the vertices so that each follows everything it depends on.
    ///
    /// # Errors
    ///
    /// Returns `SortError::Cycle` if the dependencies form a cycle.
    pub fn sort(mut self) -> Result<Vec<R>, SortError<R>> {
        let mut clock = 0usize;
        let mut finished: Vec<usize> = Vec::with_capacity(self.vertices.len());

        for root in 0..self.vertices.len() {
            if self.vertices[root].start.is_some() {
                continue;
            }
            self.vertices[root].start = Some(clock);
            clock += 1;
            // (vertex, index of the next neighbour to explore)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

            while let Some(top) = stack.last_mut() {
                let v = top.0;
                match self.vertices[v].neighbours.get(top.1).copied() {
                    Some(w) => {
                        top.1 += 1;
                        let next = &mut self.vertices[w];
                        if next.start.is_none() {
                            next.start = Some(clock);
                            clock += 1;
                            stack.push((w, 0));
                        } else if next.end.is_none() {
                            let from = stack.iter().position(|(u, _)| *u == w).unwrap_or(0);
                            let path: Vec<usize> = stack[from..].iter().map(|(u, _)| *u).collect();
                            return Err(SortError::Cycle(self.take(&path)));
                        }
                    }
                    None => {
                        self.vertices[v].end = Some(clock);
                        clock += 1;
                        finished.push(v);
                        stack.pop();
                    }
                }
            }
        }

        Ok(self.take(&finished))
    }

    fn take(self, order: &[usize]) -> Vec<R> {
        let mut slots: Vec<Option<R>> = self
            .vertices
            .into_iter()
            .map(|v| Some(v.representation))
            .collect();
        order.iter().filter_map(|&i| slots[i].take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn graph(names: &[&'static str], edges: &[(usize, usize)]) -> Graph<&'static str> {
        let mut g = Graph::new();
        let ids: Vec<_> = names.iter().map(|n| g.add_vertex(*n)).collect();
        for (a, b) in edges {
            g.add_edge(ids[*a], ids[*b]);
        }
        g
    }

    #[test]
    fn six_entity_graph() {
        // B -> C, B -> D, D -> E, F -> G; vertices in persist order.
        let g = graph(
            &["B", "C", "D", "E", "F", "G"],
            &[(0, 1), (0, 2), (2, 3), (4, 5)],
        );
        assert_eq!(g.sort().unwrap(), ["C", "E", "D", "B", "G", "F"]);
    }

    #[test]
    fn independent_vertices_keep_insertion_order() {
        let g = graph(&["x", "y", "z"], &[]);
        assert_eq!(g.sort().unwrap(), ["x", "y", "z"]);
    }

    #[test]
    fn shared_dependency_is_emitted_once() {
        let g = graph(&["a", "b", "c"], &[(0, 2), (1, 2)]);
        assert_eq!(g.sort().unwrap(), ["c", "a", "b"]);
    }

    #[test]
    fn two_cycle_is_rejected() {
        let g = graph(&["a", "b"], &[(0, 1), (1, 0)]);
        assert_eq!(g.sort(), Err(SortError::Cycle(vec!["a", "b"])));
    }

    #[test]
    fn long_cycle_reports_its_members() {
        let g = graph(&["x", "a", "b", "c"], &[(0, 1), (1, 2), (2, 3), (3, 1)]);
        assert_eq!(g.sort(), Err(SortError::Cycle(vec!["a", "b", "c"])));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(&["a"], &[(0, 0)]);
        assert_eq!(g.sort(), Err(SortError::Cycle(vec!["a"])));
    }

    fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (1usize..24).prop_flat_map(|n| {
            let edges = proptest::collection::vec((0..n, 0..n), 0..n * 2).prop_map(|raw| {
                raw.into_iter()
                    .filter(|(a, b)| a != b)
                    // orient every edge from the higher index to the lower one
                    .map(|(a, b)| (a.max(b), a.min(b)))
                    .collect::<Vec<_>>()
            });
            (Just(n), edges)
        })
    }

    fn sort_indices(n: usize, edges: &[(usize, usize)], shuffle: &[usize]) -> Vec<usize> {
        let mut g = Graph::new();
        let ids: Vec<_> = shuffle.iter().map(|&v| (v, g.add_vertex(v))).collect();
        let handle = |v: usize| ids.iter().find(|(x, _)| *x == v).map(|(_, id)| *id);
        for &(a, b) in edges {
            if let (Some(a), Some(b)) = (handle(a), handle(b)) {
                g.add_edge(a, b);
            }
        }
        let out = g.sort().unwrap();
        assert_eq!(out.len(), n);
        out
    }

    proptest! {
        #[test]
        fn output_respects_every_edge((n, edges) in dag(), seed in any::<u64>()) {
            let mut order: Vec<usize> = (0..n).collect();
            // deterministic permutation of the insertion order
            order.sort_by_key(|v| (*v as u64).wrapping_mul(seed | 1).rotate_left(17));
            let out = sort_indices(n, &edges, &order);
            let pos = |v: usize| out.iter().position(|x| *x == v).unwrap();
            for (a, b) in &edges {
                prop_assert!(pos(*b) < pos(*a), "{b} must precede {a} in {out:?}");
            }
        }

        #[test]
        fn sort_is_deterministic((n, edges) in dag()) {
            let order: Vec<usize> = (0..n).collect();
            prop_assert_eq!(sort_indices(n, &edges, &order), sort_indices(n, &edges, &order));
        }
    }
}
