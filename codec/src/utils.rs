use dexwatch_common::hash::Hash;

/// Convert a Pallas Hash reference to a DexWatch Hash (owned)
/// Works for any hash size N
pub fn to_hash<const N: usize>(pallas_hash: &pallas_primitives::Hash<N>) -> Hash<N> {
    Hash::new(**pallas_hash)
}
