//! Declarative decoder for contract datums.
//!
//! A [`Schema`] describes the shape of a datum tree and names the leaves that matter. Decoding
//! walks the schema and the datum together and collects the named leaves into a
//! [`ParameterMap`]. Only the nodes the schema visits are inspected, so the work done is
//! bounded by the size of the schema rather than the datum.
//!
//! Decoding fails with [`SchemaMismatch`] as soon as the datum disagrees with the schema. That
//! is the routine "this output is not of this shape" answer for the analyzers, not an error
//! worth reporting.

use dexwatch_common::{
    datum::{Datum, DatumKind},
    KeyHash, Token,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// Names of the parameters the protocol schemas bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Param {
    PoolIdentifier,
    TokenAPolicy,
    TokenAName,
    TokenBPolicy,
    TokenBName,
    LpTokens,
    BidFee,
    AskFee,
    ProtocolFees,

    SenderPubKeyHash,
    SenderStakeKeyHash,
    OrderStep,
    BatcherFee,
    Deposit,

    InPolicy,
    InName,
    InAmount,
    OutPolicy,
    OutName,
    MinReceive,
    AmountA,
    AmountB,
    MinLpReceive,
    MinReceiveA,
    MinReceiveB,
    LpAmount,

    OfferedPolicy,
    OfferedName,
    OriginalOffer,
    OfferedAmount,
    AskedPolicy,
    AskedName,
    PriceNumerator,
    PriceDenominator,
    OrderNft,
    PartialFills,
    FillAmount,
}

/// Decoded leaf value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bytes(Vec<u8>),
    Int(i128),

    /// Present in the schema but deliberately left unset, e.g. an absent optional field
    Unknown,
}

/// Escape hatch for shapes the declarative grammar can't express
pub type Extractor = fn(&Datum, &mut ParameterMap) -> Result<(), SchemaMismatch>;

/// Declarative datum shape
#[derive(Debug, Clone)]
pub enum Schema {
    /// Constructor with the given tag and exactly these fields
    Constr { tag: u64, fields: Vec<Schema> },

    /// List with exactly these items
    List(Vec<Schema>),

    /// Byte string bound to a parameter
    Bytes(Param),

    /// Integer bound to a parameter
    Int(Param),

    /// Matches any node and binds nothing
    Any,

    /// Alternatives tried in order, the first match wins
    OneOf(Vec<Schema>),

    /// Custom extractor
    Custom(Extractor),
}

impl Schema {
    pub fn constr(tag: u64, fields: impl Into<Vec<Schema>>) -> Self {
        Schema::Constr {
            tag,
            fields: fields.into(),
        }
    }

    pub fn list(items: impl Into<Vec<Schema>>) -> Self {
        Schema::List(items.into())
    }

    pub fn one_of(alternatives: impl Into<Vec<Schema>>) -> Self {
        Schema::OneOf(alternatives.into())
    }
}

/// Ways a datum can disagree with a schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaMismatch {
    #[error("expected constructor {expected}, found {found}")]
    Tag { expected: u64, found: u64 },

    #[error("constructor {tag} expects {expected} fields, found {found}")]
    Arity {
        tag: u64,
        expected: usize,
        found: usize,
    },

    #[error("list expects {expected} items, found {found}")]
    Length { expected: usize, found: usize },

    #[error("expected {expected}, found {found}")]
    Kind {
        expected: DatumKind,
        found: DatumKind,
    },

    #[error("no alternative matched")]
    NoAlternative,

    #[error("{0}")]
    Rejected(&'static str),
}

/// Parameters collected by one decode call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap(BTreeMap<Param, ParamValue>);

impl ParameterMap {
    pub fn insert(&mut self, param: Param, value: ParamValue) {
        self.0.insert(param, value);
    }

    pub fn get(&self, param: Param) -> Option<&ParamValue> {
        self.0.get(&param)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn bytes(&self, param: Param) -> Option<&[u8]> {
        match self.0.get(&param) {
            Some(ParamValue::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn int(&self, param: Param) -> Option<i128> {
        match self.0.get(&param) {
            Some(ParamValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Integer parameter that must fit an on-chain quantity
    pub fn amount(&self, param: Param) -> Option<u64> {
        self.int(param).and_then(|value| u64::try_from(value).ok())
    }

    pub fn key_hash(&self, param: Param) -> Option<KeyHash> {
        self.bytes(param).and_then(|bytes| KeyHash::try_from(bytes).ok())
    }

    pub fn hex(&self, param: Param) -> Option<String> {
        self.bytes(param).map(hex::encode)
    }

    /// Token from a policy/name parameter pair; an empty policy is ada
    pub fn token(&self, policy: Param, name: Param) -> Option<Token> {
        Token::from_parts(self.bytes(policy)?, self.bytes(name)?)
    }
}

/// Decode `datum` against `schema`. The map is only returned when the whole schema matched.
pub fn decode(schema: &Schema, datum: &Datum) -> Result<ParameterMap, SchemaMismatch> {
    let mut params = ParameterMap::default();
    decode_into(schema, datum, &mut params)?;
    Ok(params)
}

/// Match `datum` against `schema`, binding into an existing map. Used by extractors to
/// descend into sub-schemas.
pub fn decode_into(
    schema: &Schema,
    datum: &Datum,
    params: &mut ParameterMap,
) -> Result<(), SchemaMismatch> {
    match (schema, datum) {
        (
            Schema::Constr { tag, fields },
            Datum::Constr {
                tag: found,
                fields: values,
            },
        ) => {
            if tag != found {
                return Err(SchemaMismatch::Tag {
                    expected: *tag,
                    found: *found,
                });
            }
            if fields.len() != values.len() {
                return Err(SchemaMismatch::Arity {
                    tag: *tag,
                    expected: fields.len(),
                    found: values.len(),
                });
            }
            fields
                .iter()
                .zip(values)
                .try_for_each(|(field, value)| decode_into(field, value, params))
        }

        (Schema::List(items), Datum::List(values)) => {
            if items.len() != values.len() {
                return Err(SchemaMismatch::Length {
                    expected: items.len(),
                    found: values.len(),
                });
            }
            items.iter().zip(values).try_for_each(|(item, value)| decode_into(item, value, params))
        }

        (Schema::Bytes(param), Datum::Bytes(bytes)) => {
            params.insert(*param, ParamValue::Bytes(bytes.clone()));
            Ok(())
        }

        (Schema::Int(param), Datum::Int(value)) => {
            params.insert(*param, ParamValue::Int(*value));
            Ok(())
        }

        (Schema::Any, _) => Ok(()),

        (Schema::OneOf(alternatives), _) => {
            for alternative in alternatives {
                // Failed alternatives must leave no bindings behind
                let mut attempt = params.clone();
                if decode_into(alternative, datum, &mut attempt).is_ok() {
                    *params = attempt;
                    return Ok(());
                }
            }
            Err(SchemaMismatch::NoAlternative)
        }

        (Schema::Custom(extract), _) => extract(datum, params),

        (schema, datum) => Err(SchemaMismatch::Kind {
            expected: expected_kind(schema),
            found: datum.kind(),
        }),
    }
}

fn expected_kind(schema: &Schema) -> DatumKind {
    match schema {
        Schema::Constr { .. } => DatumKind::Constr,
        Schema::List(_) => DatumKind::List,
        Schema::Int(_) => DatumKind::Int,
        // Any, OneOf and Custom never reach the mismatch arm
        _ => DatumKind::Bytes,
    }
}

// Shared shapes used by more than one protocol

/// `Constr 0 [policy, name]` asset class
pub fn asset_class(policy: Param, name: Param) -> Schema {
    Schema::constr(0, [Schema::Bytes(policy), Schema::Bytes(name)])
}

/// Payment or stake credential: `Constr 0 [key hash]` or `Constr 1 [script hash]`
pub fn credential(param: Param) -> Schema {
    Schema::one_of([
        Schema::constr(0, [Schema::Bytes(param)]),
        Schema::constr(1, [Schema::Bytes(param)]),
    ])
}

fn no_stake_credential(datum: &Datum, params: &mut ParameterMap) -> Result<(), SchemaMismatch> {
    match datum {
        Datum::Constr { tag: 1, fields } if fields.is_empty() => {
            params.insert(Param::SenderStakeKeyHash, ParamValue::Unknown);
            Ok(())
        }
        _ => Err(SchemaMismatch::Rejected("not an absent stake credential")),
    }
}

fn stake_credential() -> Schema {
    Schema::one_of([
        // Inline stake credential
        Schema::constr(0, [Schema::constr(0, [credential(Param::SenderStakeKeyHash)])]),
        // Stake pointer
        Schema::constr(0, [Schema::constr(1, [Schema::Any, Schema::Any, Schema::Any])]),
        Schema::Custom(no_stake_credential),
    ])
}

/// Plutus address binding the sender's payment and stake hashes
pub fn sender_address() -> Schema {
    Schema::constr(0, [credential(Param::SenderPubKeyHash), stake_credential()])
}

/// Plutus address binding only the stake hash
pub fn stake_address() -> Schema {
    Schema::constr(0, [Schema::Any, stake_credential()])
}
