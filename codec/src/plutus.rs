//! Plutus data to `Datum` conversion

use crate::error::CodecError;
use dexwatch_common::Datum;
use pallas::codec::minicbor;
use pallas_primitives::{BigInt, PlutusData};

/// Map a constructor's CBOR tag to its constructor index.
/// Tags 121..=127 encode 0..=6, 1280..=1400 encode 7..=127, and 102 carries the index
/// explicitly.
pub fn constructor_index(tag: u64, any_constructor: Option<u64>) -> Result<u64, CodecError> {
    match tag {
        121..=127 => Ok(tag - 121),
        1280..=1400 => Ok(tag - 1280 + 7),
        102 => any_constructor
            .ok_or_else(|| CodecError::PlutusData("general constructor without index".into())),
        _ => Err(CodecError::PlutusData(format!("unknown constructor tag {tag}"))),
    }
}

fn unsigned_from_be(bytes: &[u8]) -> Result<i128, CodecError> {
    let digits = match bytes.iter().position(|b| *b != 0) {
        Some(start) => &bytes[start..],
        None => return Ok(0),
    };
    // Keep one bit spare for the sign
    if digits.len() > 16 || (digits.len() == 16 && digits[0] & 0x80 != 0) {
        return Err(CodecError::IntegerOverflow(digits.len()));
    }
    Ok(digits.iter().fold(0i128, |acc, b| (acc << 8) | i128::from(*b)))
}

pub fn map_plutus_data(data: &PlutusData) -> Result<Datum, CodecError> {
    Ok(match data {
        PlutusData::Constr(constr) => Datum::Constr {
            tag: constructor_index(constr.tag, constr.any_constructor)?,
            fields: constr.fields.iter().map(map_plutus_data).collect::<Result<_, _>>()?,
        },
        PlutusData::Map(pairs) => Datum::Map(
            pairs
                .iter()
                .map(|(k, v)| Ok((map_plutus_data(k)?, map_plutus_data(v)?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        PlutusData::BigInt(BigInt::Int(pallas_primitives::Int(int))) => {
            Datum::Int(i128::from(*int))
        }
        PlutusData::BigInt(BigInt::BigUInt(bytes)) => Datum::Int(unsigned_from_be(bytes)?),
        PlutusData::BigInt(BigInt::BigNInt(bytes)) => Datum::Int(-1 - unsigned_from_be(bytes)?),
        PlutusData::BoundedBytes(bytes) => Datum::Bytes(bytes.to_vec()),
        PlutusData::Array(items) => {
            Datum::List(items.iter().map(map_plutus_data).collect::<Result<_, _>>()?)
        }
    })
}

/// Decode raw datum CBOR
pub fn decode_datum(raw: &[u8]) -> Result<Datum, CodecError> {
    let data: PlutusData =
        minicbor::decode(raw).map_err(|e| CodecError::PlutusData(e.to_string()))?;
    map_plutus_data(&data)
}
