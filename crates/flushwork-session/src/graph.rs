//! Dependency graph over change-set nodes.
//!
//! Nodes are dense integer indices. An edge `from -> to` means `from` must
//! be written before `to`. Edges are tagged nullable when the foreign key
//! behind them may be NULL, which is what lets a cycle be broken in two
//! phases.

/// A single dependency between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub nullable: bool,
    /// Caller-defined tag, e.g. the referring property.
    pub label: usize,
}

impl Edge {
    pub const fn is_self_loop(&self) -> bool {
        self.from == self.to
    }
}

/// Directed graph with per-node outgoing edge lists.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new(nodes: usize) -> Self {
        Self {
            edges: Vec::new(),
            outgoing: vec![Vec::new(); nodes],
        }
    }

    pub fn node_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Add `from -> to`. Returns the edge index.
    pub fn add_edge(&mut self, from: usize, to: usize, nullable: bool, label: usize) -> usize {
        let id = self.edges.len();
        self.edges.push(Edge {
            from,
            to,
            nullable,
            label,
        });
        self.outgoing[from].push(id);
        id
    }

    /// Strongly connected components (iterative Tarjan), restricted to the
    /// edges `include` accepts. Members of each component are sorted.
    pub fn strongly_connected_components(
        &self,
        include: impl Fn(usize, &Edge) -> bool,
    ) -> Vec<Vec<usize>> {
        const UNVISITED: usize = usize::MAX;
        let n = self.node_count();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut frames: Vec<(usize, usize)> = Vec::new();
        let mut next_index = 0usize;
        let mut components = Vec::new();

        for root in 0..n {
            if index[root] != UNVISITED {
                continue;
            }
            index[root] = next_index;
            lowlink[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;
            frames.push((root, 0));

            while let Some(frame) = frames.last_mut() {
                let v = frame.0;
                if frame.1 < self.outgoing[v].len() {
                    let edge_id = self.outgoing[v][frame.1];
                    frame.1 += 1;
                    let edge = &self.edges[edge_id];
                    if !include(edge_id, edge) {
                        continue;
                    }
                    let w = edge.to;
                    if index[w] == UNVISITED {
                        index[w] = next_index;
                        lowlink[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        frames.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                } else {
                    frames.pop();
                    if let Some(&(parent, _)) = frames.last() {
                        lowlink[parent] = lowlink[parent].min(lowlink[v]);
                    }
                    if lowlink[v] == index[v] {
                        let mut component = Vec::new();
                        while let Some(w) = stack.pop() {
                            on_stack[w] = false;
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        component.sort_unstable();
                        components.push(component);
                    }
                }
            }
        }
        components
    }

    /// Is `component` an actual cycle under `include` (more than one node,
    /// or a single node with a self-loop)?
    pub fn is_cycle(&self, component: &[usize], include: impl Fn(usize, &Edge) -> bool) -> bool {
        match component {
            [] => false,
            [single] => self.outgoing[*single]
                .iter()
                .any(|&e| include(e, &self.edges[e]) && self.edges[e].is_self_loop()),
            _ => true,
        }
    }

    /// Kahn's algorithm, layered: every node of layer `k` depends only on
    /// nodes of earlier layers. Nodes inside a layer are in ascending order.
    ///
    /// On failure returns the nodes that could not be ordered.
    pub fn layers(
        &self,
        include: impl Fn(usize, &Edge) -> bool,
    ) -> Result<Vec<Vec<usize>>, Vec<usize>> {
        let n = self.node_count();
        let mut in_degree = vec![0usize; n];
        for (id, edge) in self.edges.iter().enumerate() {
            if include(id, edge) {
                in_degree[edge.to] += 1;
            }
        }

        let mut current: Vec<usize> = (0..n).filter(|&v| in_degree[v] == 0).collect();
        let mut layers = Vec::new();
        let mut ordered = 0usize;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &v in &current {
                for &id in &self.outgoing[v] {
                    let edge = &self.edges[id];
                    if !include(id, edge) {
                        continue;
                    }
                    in_degree[edge.to] -= 1;
                    if in_degree[edge.to] == 0 {
                        next.push(edge.to);
                    }
                }
            }
            next.sort_unstable();
            ordered += current.len();
            layers.push(current);
            current = next;
        }

        if ordered == n {
            Ok(layers)
        } else {
            Err((0..n).filter(|&v| in_degree[v] > 0).collect())
        }
    }
}
