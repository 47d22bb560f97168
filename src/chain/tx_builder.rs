use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, U256};
use rust_decimal::Decimal;
use tracing::trace;

use crate::domain::Asset;
use crate::error::{BatchError, Result};

/// `transfer(address,uint256)`
pub const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

/// Destination, value and calldata of a transfer before nonce and gas are attached
#[derive(Debug, Clone, PartialEq)]
pub struct TransferCall {
    pub to: Address,
    pub value: Decimal,
    pub data: Bytes,
}

/// Build a native send or an ERC-20 `transfer` call
pub fn build_transfer_call(asset: &Asset, recipient: Address, amount: Decimal) -> Result<TransferCall> {
    match asset {
        Asset::Native { .. } => Ok(TransferCall {
            to: recipient,
            value: amount,
            data: Bytes::default(),
        }),
        Asset::Erc20 {
            address, decimals, ..
        } => {
            let base_units = to_base_units(amount, *decimals)?;
            let data = erc20_transfer_calldata(recipient, base_units);
            trace!(token = ?address, calldata = %hex::encode(&data), "built erc20 transfer");
            Ok(TransferCall {
                to: *address,
                value: Decimal::ZERO,
                data,
            })
        }
    }
}

pub fn erc20_transfer_calldata(recipient: Address, amount: U256) -> Bytes {
    let mut data = ERC20_TRANSFER_SELECTOR.to_vec();
    data.extend(encode(&[Token::Address(recipient), Token::Uint(amount)]));
    Bytes::from(data)
}

/// Scale a whole-unit amount to the token's integer base units
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<U256> {
    if amount.is_sign_negative() {
        return Err(BatchError::Validation(format!(
            "amount {} must not be negative",
            amount
        )));
    }

    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > u32::from(decimals) {
        return Err(BatchError::Validation(format!(
            "amount {} has more than {} decimal places",
            amount, decimals
        )));
    }

    let mantissa = u128::try_from(normalized.mantissa())
        .map_err(|_| BatchError::Validation(format!("amount {} is out of range", amount)))?;
    let factor = U256::exp10((u32::from(decimals) - scale) as usize);

    U256::from(mantissa)
        .checked_mul(factor)
        .ok_or_else(|| BatchError::Validation(format!("amount {} overflows uint256", amount)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_to_base_units_scales_by_decimals() {
        assert_eq!(to_base_units(dec!(1.5), 6).unwrap(), U256::from(1_500_000u64));
        assert_eq!(
            to_base_units(dec!(2), 18).unwrap(),
            U256::from(2_000_000_000_000_000_000u128)
        );
        assert_eq!(to_base_units(dec!(0), 18).unwrap(), U256::zero());
    }

    #[test]
    fn test_to_base_units_rejects_excess_precision() {
        assert!(to_base_units(dec!(0.0000001), 6).is_err());
        assert!(to_base_units(dec!(-1), 6).is_err());
        // Trailing zeros beyond the token precision are fine
        assert_eq!(to_base_units(dec!(1.2500000), 2).unwrap(), U256::from(125u64));
    }

    #[test]
    fn test_erc20_calldata_layout() {
        let recipient = Address::repeat_byte(0x11);
        let data = erc20_transfer_calldata(recipient, U256::from(42u64));

        assert_eq!(data.len(), 4 + 32 + 32);
        assert_eq!(&data[..4], &ERC20_TRANSFER_SELECTOR);
        assert_eq!(&data[16..36], recipient.as_bytes());
        assert_eq!(data[67], 42);
    }

    #[test]
    fn test_native_transfer_carries_value() {
        let recipient = Address::repeat_byte(0x22);
        let call = build_transfer_call(&Asset::native(), recipient, dec!(0.25)).unwrap();
        assert_eq!(call.to, recipient);
        assert_eq!(call.value, dec!(0.25));
        assert!(call.data.is_empty());
    }

    #[test]
    fn test_token_transfer_targets_contract() {
        let token = Address::repeat_byte(0x33);
        let asset = Asset::erc20(token, "USDC", 6);
        let call = build_transfer_call(&asset, Address::repeat_byte(0x44), dec!(10)).unwrap();
        assert_eq!(call.to, token);
        assert_eq!(call.value, Decimal::ZERO);
        assert_eq!(call.data.len(), 68);
    }
}
