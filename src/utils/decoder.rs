//! ERC-20 approval codec
//! Encodes allowance queries and revoke calls, decodes Approval log topics

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall};

use crate::models::{AppError, AppResult, ErrorCode};

sol! {
    function allowance(address owner, address spender) external view returns (uint256);

    function approve(address spender, uint256 amount) external returns (bool);
}

/// Calldata for `allowance(owner, spender)`
pub fn encode_allowance(owner: Address, spender: Address) -> Bytes {
    allowanceCall { owner, spender }.abi_encode().into()
}

/// Decode the hex result of an `allowance` eth_call
pub fn decode_allowance(result_hex: &str) -> AppResult<U256> {
    let bytes = hex::decode(result_hex.trim_start_matches("0x")).map_err(|e| {
        AppError::new(
            ErrorCode::RpcInvalidResponse,
            format!("allowance result is not hex: {}", e),
        )
    })?;
    allowanceCall::abi_decode_returns(&bytes, false)
        .map(|ret| ret._0)
        .map_err(|e| {
            AppError::new(
                ErrorCode::RpcInvalidResponse,
                format!("allowance result malformed: {}", e),
            )
        })
}

/// Calldata for `approve(spender, 0)`
pub fn encode_revoke(spender: Address) -> Bytes {
    approveCall {
        spender,
        amount: U256::ZERO,
    }
    .abi_encode()
    .into()
}

/// Spender and amount from `approve` calldata
pub fn decode_approve(data: &[u8]) -> Option<(Address, U256)> {
    if data.len() < 4 || data[..4] != approveCall::SELECTOR {
        return None;
    }
    approveCall::abi_decode(data, false)
        .ok()
        .map(|call| (call.spender, call.amount))
}

/// 32-byte topic for an indexed address
pub fn address_topic(address: Address) -> String {
    format!("0x{}", hex::encode(address.into_word()))
}

/// Indexed address from a 32-byte log topic
pub fn topic_to_address(topic: &str) -> Option<Address> {
    topic
        .parse::<B256>()
        .ok()
        .map(Address::from_word)
}

/// Parse a 0x-prefixed 20-byte address from user input
pub fn parse_address(raw: &str) -> AppResult<Address> {
    let trimmed = raw.trim();
    if !trimmed.starts_with("0x") || trimmed.len() != 42 {
        return Err(AppError::invalid_address(format!(
            "Expected a 0x-prefixed 20-byte address, got {:?}",
            raw
        )));
    }
    trimmed
        .parse::<Address>()
        .map_err(|e| AppError::invalid_address(format!("Invalid address {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr = parse_address(" 0x4242424242424242424242424242424242424242 ").unwrap();
        assert_eq!(addr, Address::repeat_byte(0x42));
        assert_eq!(
            parse_address("4242").unwrap_err().code,
            ErrorCode::TokenInvalidAddress
        );
        assert!(parse_address("0xzz42424242424242424242424242424242424242").is_err());
    }

    #[test]
    fn test_revoke_calldata() {
        let spender = Address::repeat_byte(0x42);
        let data = encode_revoke(spender);
        assert_eq!(&data[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(decode_approve(&data), Some((spender, U256::ZERO)));
    }

    #[test]
    fn test_allowance_round_trip_hex() {
        let encoded = format!("0x{}", hex::encode(U256::MAX.to_be_bytes::<32>()));
        assert_eq!(decode_allowance(&encoded).unwrap(), U256::MAX);
        assert!(decode_allowance("0x12").is_err());
    }

    #[test]
    fn test_topic_address() {
        let owner = Address::repeat_byte(0xaa);
        let topic = address_topic(owner);
        assert_eq!(topic.len(), 66);
        assert_eq!(topic_to_address(&topic), Some(owner));
    }

    #[test]
    fn test_allowance_selector() {
        let data = encode_allowance(Address::ZERO, Address::ZERO);
        assert_eq!(&data[..4], &[0xdd, 0x62, 0xed, 0x3e]);
        assert_eq!(data.len(), 68);
    }
}
