mod address;
mod error;
mod plutus;
mod tx;
mod utils;
mod value;

pub use address::*;
pub use error::*;
pub use plutus::*;
pub use tx::*;
pub use utils::*;
pub use value::*;
