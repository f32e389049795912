//! ERC-20 event and call definitions.
//!
//! Transfer logs are decoded by hand from topics/data so malformed logs from
//! non-conforming contracts can be skipped instead of failing a whole query.

use crate::onchain::types::TransferLog;
use alloy::primitives::{b256, Address, B256, U256};
use alloy::sol;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

sol! {
    #[sol(rpc)]
    interface IERC20Metadata {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
    }
}

/// Transfer(address indexed from, address indexed to, uint256 value)
///
/// Topics: [sig, from, to]; data: [value(32)].
pub fn decode_transfer(
    contract: Address,
    topics: &[B256],
    data: &[u8],
    transaction_hash: Option<B256>,
    block_number: Option<u64>,
) -> Option<TransferLog> {
    if topics.len() != 3 || topics[0] != TRANSFER_TOPIC || data.len() < 32 {
        return None;
    }
    let from = Address::from_slice(&topics[1].0[12..]);
    let to = Address::from_slice(&topics[2].0[12..]);
    let bytes: [u8; 32] = data[0..32].try_into().ok()?;

    Some(TransferLog {
        contract,
        transaction_hash: transaction_hash?,
        block_number: block_number?,
        from,
        to,
        value: U256::from_be_bytes(bytes),
    })
}
