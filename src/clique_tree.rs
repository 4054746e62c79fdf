use std::collections::{BTreeMap, BTreeSet, HashMap};

use bitflags::bitflags;
use tracing::trace;

use crate::concat_vector::ConcatVector;
use crate::error::{Error, Result};
use crate::model::GraphicalModel;
use crate::nd_array::NDArray;
use crate::table_factor::{Reduce, TableFactor};

bitflags! {
    /// What a message passing run has to produce
    #[derive(Default)]
    pub(crate) struct Flag: u32 {
        /// Per variable marginals
        const MARGINALS = 0x01;
        /// Per factor joint marginals
        const JOINT_MARGINALS = 0x02;
        /// Max-product instead of sum-product
        const MAP = 0x04;
    }
}

/// Output of sum-product inference.
#[derive(Debug, Clone)]
pub struct MarginalResult {
    /// Sum of the unnormalized scores of every joint assignment.
    ///
    /// Becomes `f64::INFINITY` when it overflows, never NaN.
    pub partition_function: f64,
    /// Natural log of the partition function, finite in most overflow cases
    pub log_partition_function: f64,
    /// Probability vector of every variable, keyed by variable id
    pub marginals: BTreeMap<usize, Vec<f64>>,
    /// Joint distribution over each factor's neighbors, in factor order.
    ///
    /// Empty when only singleton marginals were requested.
    pub joint_marginals: Vec<NDArray<f64>>,
}

impl MarginalResult {
    /// Joint marginal of the factor at `factor_index`, if it was computed
    pub fn joint_marginal(&self, factor_index: usize) -> Option<&NDArray<f64>> {
        self.joint_marginals.get(factor_index)
    }
}

/// Cliques of a variable elimination run, indexed by elimination step.
///
/// Clique `i` holds the variable eliminated at step `i` first, followed by
/// its neighbors at that time. Its parent is the clique of the neighbor
/// eliminated earliest, so parents always come later than their children.
#[derive(Debug)]
struct EliminationTree {
    cliques: Vec<Vec<usize>>,
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    /// Clique index of each variable's elimination step
    clique_of: HashMap<usize, usize>,
}

impl EliminationTree {
    /// Greedy min-fill elimination, ties broken by smaller variable id
    fn build(model: &GraphicalModel, sizes: &BTreeMap<usize, usize>) -> Self {
        let mut graph: BTreeMap<usize, BTreeSet<usize>> =
            sizes.keys().map(|&v| (v, BTreeSet::new())).collect();
        for factor in model.factors() {
            for &a in &factor.neighbor_indices {
                for &b in &factor.neighbor_indices {
                    if a != b {
                        graph.entry(a).or_default().insert(b);
                    }
                }
            }
        }

        let mut cliques = Vec::with_capacity(graph.len());
        let mut clique_of = HashMap::with_capacity(graph.len());
        while !graph.is_empty() {
            let mut best: Option<(usize, usize)> = None;
            for (&v, neighbors) in &graph {
                let fill = fill_in(&graph, neighbors);
                if best.map_or(true, |(_, best_fill)| fill < best_fill) {
                    best = Some((v, fill));
                }
            }
            let v = match best {
                Some((v, _)) => v,
                None => break,
            };
            let neighbors = graph.remove(&v).unwrap_or_default();
            for &a in &neighbors {
                if let Some(adjacent) = graph.get_mut(&a) {
                    adjacent.remove(&v);
                    adjacent.extend(neighbors.iter().copied().filter(|&b| b != a));
                }
            }
            clique_of.insert(v, cliques.len());
            let mut clique = vec![v];
            clique.extend(neighbors);
            cliques.push(clique);
        }

        let parent: Vec<Option<usize>> = cliques
            .iter()
            .map(|clique| clique[1..].iter().map(|v| clique_of[v]).min())
            .collect();
        let mut children = vec![Vec::new(); cliques.len()];
        for (i, p) in parent.iter().enumerate() {
            if let Some(p) = p {
                children[*p].push(i);
            }
        }
        Self {
            cliques,
            parent,
            children,
            clique_of,
        }
    }

    fn len(&self) -> usize {
        self.cliques.len()
    }

    fn separator(&self, clique: usize) -> &[usize] {
        &self.cliques[clique][1..]
    }

    /// Root clique of every clique's connected component
    fn roots(&self) -> Vec<usize> {
        let mut root: Vec<usize> = (0..self.len()).collect();
        for i in (0..self.len()).rev() {
            if let Some(p) = self.parent[i] {
                root[i] = root[p];
            }
        }
        root
    }
}

/// Edges missing between the members of `neighbors`
fn fill_in(graph: &BTreeMap<usize, BTreeSet<usize>>, neighbors: &BTreeSet<usize>) -> usize {
    let mut missing = 0;
    for (i, a) in neighbors.iter().enumerate() {
        let adjacent = &graph[a];
        missing += neighbors
            .iter()
            .skip(i + 1)
            .filter(|b| !adjacent.contains(b))
            .count();
    }
    missing
}

/// Clique potentials ready for message passing
struct Prepared {
    tree: EliminationTree,
    potentials: Vec<TableFactor>,
    /// Summed log potential of factors without neighbors
    constant: f64,
    /// Clique each factor was multiplied into, `None` for factors without neighbors
    factor_clique: Vec<Option<usize>>,
}

/// Result of an upward pass
struct Upward {
    /// Clique potential times every child message
    beliefs: Vec<TableFactor>,
    /// Message from each non-root clique to its parent, over its separator
    messages: Vec<Option<TableFactor>>,
}

/// Exact inference over a [`GraphicalModel`] under fixed weights.
///
/// Every call builds an elimination tree over the factor interaction graph
/// and runs log-space message passing on it. Variables carrying a
/// [`VARIABLE_OBSERVED_VALUE`](crate::VARIABLE_OBSERVED_VALUE) entry are
/// clamped to that value.
#[derive(Debug, Clone, Copy)]
pub struct CliqueTree<'a> {
    model: &'a GraphicalModel,
    weights: &'a ConcatVector,
}

impl<'a> CliqueTree<'a> {
    pub fn new(model: &'a GraphicalModel, weights: &'a ConcatVector) -> Self {
        Self { model, weights }
    }

    /// Partition function, per variable marginals and per factor joint marginals
    pub fn calculate_marginals(&self) -> Result<MarginalResult> {
        self.marginals(Flag::MARGINALS | Flag::JOINT_MARGINALS)
    }

    /// Like [`calculate_marginals`](Self::calculate_marginals) without the joint tables.
    ///
    /// Message passing is the same. Only the per-factor marginalization and
    /// the joint table allocations are skipped.
    pub fn calculate_marginals_just_singletons(&self) -> Result<MarginalResult> {
        self.marginals(Flag::MARGINALS)
    }

    /// Value of every variable in the highest scoring joint assignment.
    ///
    /// Ties are broken deterministically, towards lower values.
    pub fn calculate_map(&self) -> Result<BTreeMap<usize, usize>> {
        let prepared = self.prepare()?;
        let upward = Self::upward(&prepared, Flag::MAP);
        let tree = &prepared.tree;

        let mut assignment = HashMap::with_capacity(tree.len());
        for i in (0..tree.len()).rev() {
            let best = upward.beliefs[i].argmax(&assignment);
            for (&variable, value) in tree.cliques[i].iter().zip(best) {
                assignment.insert(variable, value);
            }
        }
        Ok(assignment.into_iter().collect())
    }

    fn prepare(&self) -> Result<Prepared> {
        let sizes = self.model.variable_sizes()?;
        let mut observed = HashMap::new();
        for (&variable, &size) in &sizes {
            if let Some(value) = self.model.observed_value(variable)? {
                if value >= size {
                    return Err(Error::invalid_input(format!(
                        "variable {} observed as {} but has only {} values",
                        variable, value, size
                    )));
                }
                observed.insert(variable, value);
            }
        }

        let tree = EliminationTree::build(self.model, &sizes);
        let mut potentials: Vec<TableFactor> = tree
            .cliques
            .iter()
            .map(|clique| {
                let dimensions: Vec<usize> = clique.iter().map(|v| sizes[v]).collect();
                TableFactor::ones(clique.clone(), &dimensions)
            })
            .collect();

        let mut constant = 0.0;
        let mut factor_clique = Vec::with_capacity(self.model.factors().len());
        for factor in self.model.factors() {
            let potential = TableFactor::from_factor(factor, self.weights, &observed);
            let target = factor
                .neighbor_indices
                .iter()
                .map(|v| tree.clique_of[v])
                .min();
            match target {
                Some(clique) => potentials[clique].multiply_in(&potential),
                None => constant += *potential.values.get_assignment_value(&[]),
            }
            factor_clique.push(target);
        }

        trace!(
            cliques = tree.len(),
            largest = tree.cliques.iter().map(Vec::len).max().unwrap_or(0),
            "built elimination tree"
        );
        Ok(Prepared {
            tree,
            potentials,
            constant,
            factor_clique,
        })
    }

    fn upward(prepared: &Prepared, flag: Flag) -> Upward {
        let reduce = if flag.contains(Flag::MAP) {
            Reduce::Max
        } else {
            Reduce::Sum
        };
        let tree = &prepared.tree;
        let mut beliefs = Vec::with_capacity(tree.len());
        let mut messages: Vec<Option<TableFactor>> = Vec::with_capacity(tree.len());
        for i in 0..tree.len() {
            let mut belief = prepared.potentials[i].clone();
            for &child in &tree.children[i] {
                if let Some(message) = &messages[child] {
                    belief.multiply_in(message);
                }
            }
            let message = tree.parent[i].map(|_| belief.marginalize_onto(tree.separator(i), reduce));
            messages.push(message);
            beliefs.push(belief);
        }
        Upward { beliefs, messages }
    }

    /// Full clique beliefs, computed top-down without dividing messages out
    fn downward(prepared: &Prepared, upward: &Upward) -> Vec<TableFactor> {
        let tree = &prepared.tree;
        let mut incoming: Vec<Option<TableFactor>> = vec![None; tree.len()];
        let mut beliefs = upward.beliefs.clone();
        for p in (0..tree.len()).rev() {
            let mut base = prepared.potentials[p].clone();
            if let Some(message) = &incoming[p] {
                base.multiply_in(message);
                beliefs[p].multiply_in(message);
            }
            for &child in &tree.children[p] {
                let mut outgoing = base.clone();
                for &sibling in &tree.children[p] {
                    if sibling == child {
                        continue;
                    }
                    if let Some(message) = &upward.messages[sibling] {
                        outgoing.multiply_in(message);
                    }
                }
                incoming[child] =
                    Some(outgoing.marginalize_onto(tree.separator(child), Reduce::Sum));
            }
        }
        beliefs
    }

    fn marginals(&self, flag: Flag) -> Result<MarginalResult> {
        let prepared = self.prepare()?;
        let upward = Self::upward(&prepared, flag);
        let tree = &prepared.tree;

        let roots = tree.roots();
        let mut component_log_z = HashMap::new();
        let mut log_z = prepared.constant;
        for (i, &root) in roots.iter().enumerate() {
            if i == root {
                let z = upward.beliefs[i].log_sum();
                component_log_z.insert(root, z);
                log_z += z;
            }
        }

        let beliefs = Self::downward(&prepared, &upward);

        let mut marginals = BTreeMap::new();
        if flag.contains(Flag::MARGINALS) {
            for (&variable, &clique) in &tree.clique_of {
                let table = beliefs[clique].marginalize_onto(&[variable], Reduce::Sum);
                let probabilities = table.normalized(component_log_z[&roots[clique]]);
                marginals.insert(variable, probabilities.values().copied().collect());
            }
        }

        let mut joint_marginals = Vec::new();
        if flag.contains(Flag::JOINT_MARGINALS) {
            joint_marginals.reserve(self.model.factors().len());
            for (factor, clique) in self.model.factors().iter().zip(&prepared.factor_clique) {
                let joint = match clique {
                    Some(clique) => beliefs[*clique]
                        .marginalize_onto(&factor.neighbor_indices, Reduce::Sum)
                        .normalized(component_log_z[&roots[*clique]]),
                    None => NDArray::from_elem(&[], 1.0),
                };
                joint_marginals.push(joint);
            }
        }

        Ok(MarginalResult {
            partition_function: log_z.exp(),
            log_partition_function: log_z,
            marginals,
            joint_marginals,
        })
    }
}
