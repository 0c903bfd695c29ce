//! Protocol analyzer seam and the per-block fan-out

use crate::dex::{genius_yield::GeniusYield, minswap::Minswap, sundaeswap::SundaeSwapV3};
use crate::operation::Operation;
use dexwatch_common::{Dex, DexTransaction, Slot};
use rayon::prelude::*;

/// Turns one transaction into the operations a protocol recognises in it. Implementations are
/// pure: no I/O and no shared mutable state.
pub trait Analyzer: Send + Sync {
    fn dex(&self) -> Dex;

    /// Blocks below this slot are never shown to the analyzer
    fn start_slot(&self) -> Slot;

    fn analyze(&self, tx: &DexTransaction, slot: Slot) -> Vec<Operation>;
}

/// Instantiate the analyzers for the enabled protocols
pub fn build_analyzers(enabled: &[(Dex, Slot)]) -> Vec<Box<dyn Analyzer>> {
    enabled
        .iter()
        .map(|(dex, start_slot)| -> Box<dyn Analyzer> {
            match dex {
                Dex::Minswap => Box::new(Minswap::new(*start_slot)),
                Dex::SundaeSwapV3 => Box::new(SundaeSwapV3::new(*start_slot)),
                Dex::GeniusYield => Box::new(GeniusYield::new(*start_slot)),
            }
        })
        .collect()
}

/// Run every applicable analyzer over the valid transactions of a block. The result keeps
/// transaction order, then analyzer order within a transaction.
pub fn analyze_block(
    analyzers: &[Box<dyn Analyzer>],
    txs: &[DexTransaction],
    slot: Slot,
) -> Vec<Operation> {
    let active: Vec<&dyn Analyzer> = analyzers
        .iter()
        .map(|analyzer| analyzer.as_ref())
        .filter(|analyzer| analyzer.start_slot() <= slot)
        .collect();
    if active.is_empty() {
        return Vec::new();
    }

    txs.par_iter()
        .filter(|tx| tx.valid)
        .flat_map_iter(|tx| {
            active.iter().flat_map(|analyzer| analyzer.analyze(tx, slot)).collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OrderCancellationOp, CancelTarget, Position};
    use dexwatch_common::{TxHash, UTxOIdentifier};

    struct Echo {
        dex: Dex,
        start_slot: Slot,
    }

    impl Analyzer for Echo {
        fn dex(&self) -> Dex {
            self.dex
        }

        fn start_slot(&self) -> Slot {
            self.start_slot
        }

        fn analyze(&self, tx: &DexTransaction, slot: Slot) -> Vec<Operation> {
            vec![Operation::OrderCancellation(OrderCancellationOp {
                dex: self.dex,
                target: CancelTarget::AmmOrder(UTxOIdentifier::new(tx.hash, 0)),
                position: Position {
                    slot,
                    tx_hash: tx.hash,
                    output_index: 0,
                },
            })]
        }
    }

    fn tx(byte: u8, valid: bool) -> DexTransaction {
        DexTransaction {
            hash: TxHash::new([byte; 32]),
            valid,
            ..Default::default()
        }
    }

    #[test]
    fn respects_start_slots_validity_and_order() {
        let analyzers: Vec<Box<dyn Analyzer>> = vec![
            Box::new(Echo {
                dex: Dex::Minswap,
                start_slot: 0,
            }),
            Box::new(Echo {
                dex: Dex::GeniusYield,
                start_slot: 500,
            }),
        ];
        let txs: Vec<_> = (1..=20).map(|i| tx(i, i != 5)).collect();

        let operations = analyze_block(&analyzers, &txs, 100);
        assert_eq!(operations.len(), 19);
        assert!(operations.iter().all(|op| op.dex() == Dex::Minswap));
        let order: Vec<u8> = operations.iter().map(|op| op.position().tx_hash[0]).collect();
        let expected: Vec<u8> = (1..=20).filter(|i| *i != 5).collect();
        assert_eq!(order, expected);

        let operations = analyze_block(&analyzers, &txs, 500);
        assert_eq!(operations.len(), 38);
        assert_eq!(operations[0].dex(), Dex::Minswap);
        assert_eq!(operations[1].dex(), Dex::GeniusYield);
    }

    #[test]
    fn builds_enabled_analyzers() {
        let analyzers = build_analyzers(&[(Dex::Minswap, 10), (Dex::GeniusYield, 20)]);
        let dexes: Vec<_> = analyzers.iter().map(|a| (a.dex(), a.start_slot())).collect();
        assert_eq!(dexes, vec![(Dex::Minswap, 10), (Dex::GeniusYield, 20)]);
    }
}
