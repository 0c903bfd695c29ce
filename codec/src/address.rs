use crate::{error::CodecError, utils::to_hash};
use dexwatch_common::{Address, Credential};
use pallas::ledger::addresses as pallas_addresses;

/// Derive our Address from a Pallas address, keeping only the credentials
pub fn map_address(address: &pallas_addresses::Address) -> Result<Address, CodecError> {
    match address {
        pallas_addresses::Address::Byron(_) => Ok(Address {
            bech32: address.to_string(),
            payment: None,
            stake: None,
        }),

        pallas_addresses::Address::Shelley(shelley_address) => Ok(Address {
            bech32: address.to_string(),

            payment: Some(match shelley_address.payment() {
                pallas_addresses::ShelleyPaymentPart::Key(hash) => Credential::Key(to_hash(hash)),
                pallas_addresses::ShelleyPaymentPart::Script(hash) => {
                    Credential::Script(to_hash(hash))
                }
            }),

            stake: match shelley_address.delegation() {
                pallas_addresses::ShelleyDelegationPart::Key(hash) => {
                    Some(Credential::Key(to_hash(hash)))
                }
                pallas_addresses::ShelleyDelegationPart::Script(hash) => {
                    Some(Credential::Script(to_hash(hash)))
                }
                pallas_addresses::ShelleyDelegationPart::Pointer(_)
                | pallas_addresses::ShelleyDelegationPart::Null => None,
            },
        }),

        // Reward addresses never hold outputs
        pallas_addresses::Address::Stake(_) => Err(CodecError::Address(address.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_script_base_address() {
        // Minswap v1 order address: script payment part, key stake part
        let pallas = pallas_addresses::Address::from_bech32(
            "addr1zxn9efv2f6w82hagxqtn62ju4m293tqvw0uhmdl64ch8uw6j2c79gy9l76sdg0xwhd7r0c0kna0tycz4y5s6mlenh8pq6s3z70",
        )
        .unwrap();

        let address = map_address(&pallas).unwrap();
        assert!(matches!(address.payment, Some(Credential::Script(_))));
        assert_eq!(
            address.payment_script().unwrap().to_string(),
            "a65ca58a4e9c755fa830173d2a5caed458ac0c73f97db7faae2e7e3b"
        );
        assert!(matches!(address.stake, Some(Credential::Key(_))));
        assert!(address.bech32.starts_with("addr1z"));
    }
}
