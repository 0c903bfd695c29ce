//! Plutus data attached to outputs and redeemers, as an owned tree

use serde::{Deserialize, Serialize};
use std::fmt;

/// Contract datum node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datum {
    /// Tagged constructor with positional fields
    Constr { tag: u64, fields: Vec<Datum> },

    /// Byte string
    Bytes(Vec<u8>),

    /// Integer (big integers beyond i128 are rejected by the codec)
    Int(i128),

    /// Ordered heterogeneous list
    List(Vec<Datum>),

    /// Key/value pairs
    Map(Vec<(Datum, Datum)>),
}

/// Discriminant of a datum node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatumKind {
    Constr,
    Bytes,
    Int,
    List,
    Map,
}

impl fmt::Display for DatumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DatumKind::Constr => "constructor",
            DatumKind::Bytes => "bytes",
            DatumKind::Int => "int",
            DatumKind::List => "list",
            DatumKind::Map => "map",
        })
    }
}

impl Datum {
    pub fn constr(tag: u64, fields: Vec<Datum>) -> Self {
        Datum::Constr { tag, fields }
    }

    pub fn bytes(bytes: impl AsRef<[u8]>) -> Self {
        Datum::Bytes(bytes.as_ref().to_vec())
    }

    pub fn int(value: impl Into<i128>) -> Self {
        Datum::Int(value.into())
    }

    pub fn kind(&self) -> DatumKind {
        match self {
            Datum::Constr { .. } => DatumKind::Constr,
            Datum::Bytes(_) => DatumKind::Bytes,
            Datum::Int(_) => DatumKind::Int,
            Datum::List(_) => DatumKind::List,
            Datum::Map(_) => DatumKind::Map,
        }
    }
}
