//! Deterministic per-block operation ordering.
//!
//! Pool states go first since everything else resolves against them. Beyond that, every
//! operation declares the keys it provides and the keys it depends on, and the block is laid
//! out as a stable topological sort: among the operations whose dependencies are already
//! placed, the one with the lowest (rank, original index) goes next. Dependencies on keys no
//! operation in the block provides are already satisfied by earlier blocks and are ignored.

use crate::operation::{DependencyKey, Operation};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};
use tracing::warn;

fn rank(operation: &Operation) -> u8 {
    match operation {
        Operation::PoolState(_) => 0,
        _ => 1,
    }
}

/// Order one block's operations
pub fn order(operations: Vec<Operation>) -> Vec<Operation> {
    let count = operations.len();

    let mut providers: HashMap<DependencyKey, Vec<usize>> = HashMap::new();
    for (index, operation) in operations.iter().enumerate() {
        for key in operation.provides() {
            providers.entry(key).or_default().push(index);
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut pending = vec![0usize; count];
    for (index, operation) in operations.iter().enumerate() {
        let mut edges: Vec<usize> = operation
            .depends_on()
            .iter()
            .filter_map(|key| providers.get(key))
            .flatten()
            .copied()
            .filter(|provider| *provider != index)
            .collect();
        edges.sort_unstable();
        edges.dedup();

        pending[index] = edges.len();
        for provider in edges {
            dependents[provider].push(index);
        }
    }

    let mut ready: BinaryHeap<Reverse<(u8, usize)>> = operations
        .iter()
        .enumerate()
        .filter(|(index, _)| pending[*index] == 0)
        .map(|(index, operation)| Reverse((rank(operation), index)))
        .collect();

    let mut sequence = Vec::with_capacity(count);
    let mut placed = vec![false; count];
    while let Some(Reverse((_, index))) = ready.pop() {
        sequence.push(index);
        placed[index] = true;
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse((rank(&operations[dependent]), dependent)));
            }
        }
    }

    if sequence.len() < count {
        warn!("Dependency cycle among {} operations", count - sequence.len());
        let mut rest: Vec<usize> = (0..count).filter(|index| !placed[*index]).collect();
        rest.sort_by_key(|index| (rank(&operations[*index]), *index));
        sequence.extend(rest);
    }

    let mut slots: Vec<Option<Operation>> = operations.into_iter().map(Some).collect();
    sequence.into_iter().filter_map(|index| slots[index].take()).collect()
}
