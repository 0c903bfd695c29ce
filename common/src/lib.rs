// DexWatch common library - main library exports

pub mod commands;
pub mod datum;
pub mod dex;
pub mod hash;
pub mod messages;
pub mod tx;
pub mod types;

// Flattened re-exports
pub use self::datum::Datum;
pub use self::dex::*;
pub use self::hash::*;
pub use self::tx::*;
pub use self::types::*;
