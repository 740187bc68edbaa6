//! Raw log decoding for the event topics the core watches.
//!
//! Topic hashes are the keccak-256 of the canonical Solidity signatures,
//! hard-coded as 32-byte constants. Data words are decoded by fixed ABI
//! offset with two's-complement handling for the signed fields.

use crate::errors::CoreError;
use crate::rpc::Log;
use alloy::primitives::{b256, Address, B256, I256, U256};

/// keccak256("Sync(uint112,uint112)") — V2 reserve change.
pub const SYNC_TOPIC: B256 =
    b256!("1c411e9a96e071241c2f21f7726b17ae89e3cab4c78be50e062b03a9fffbbad1");

/// keccak256("Swap(address,address,int256,int256,uint160,uint128,int24)")
/// — V3 concentrated-liquidity swap.
pub const SWAP_TOPIC: B256 =
    b256!("c42079f94a6350d7e6235f29174924f928cc2ac818eb64fed8004e115fbcca67");

/// keccak256("LiquidationCall(address,address,address,uint256,uint256,address,bool)")
/// — Aave-V3-style liquidation.
pub const AAVE_LIQUIDATION_TOPIC: B256 =
    b256!("e413a321e8681d831f4dbccbca790d2952b56f977908e45be37335533e005286");

/// keccak256("AbsorbCollateral(address,address,address,uint256,uint256)")
/// — Compound-V3 (Comet) collateral absorption.
pub const COMET_ABSORB_TOPIC: B256 =
    b256!("9850ab1af75177e4a9201c65a2cf7976d5d28e40ef63494b44366f86b2f9412e");

/// Lending protocol family a liquidation event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LendingProtocol {
    AaveV3,
    CompoundV3,
}

/// Decoded V2 Sync payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFields {
    pub reserve0: U256,
    pub reserve1: U256,
}

/// Decoded V3 Swap payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapFields {
    pub sender: Address,
    pub recipient: Address,
    pub amount0: I256,
    pub amount1: I256,
    pub sqrt_price_x96: U256,
    pub liquidity: u128,
    pub tick: i32,
}

/// Decoded liquidation payload (either protocol family).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidationFields {
    pub protocol: LendingProtocol,
    pub user: Address,
    pub collateral_asset: Address,
    pub debt_asset: Option<Address>,
    pub collateral_amount: U256,
    pub debt_amount: U256,
}

fn word(data: &[u8], index: usize) -> Result<&[u8], CoreError> {
    let start = index * 32;
    data.get(start..start + 32)
        .ok_or_else(|| CoreError::Decode(format!("data word {} out of range ({} bytes)", index, data.len())))
}

fn word_u256(data: &[u8], index: usize) -> Result<U256, CoreError> {
    Ok(U256::from_be_slice(word(data, index)?))
}

fn word_i256(data: &[u8], index: usize) -> Result<I256, CoreError> {
    Ok(I256::from_raw(word_u256(data, index)?))
}

fn word_u128(data: &[u8], index: usize) -> Result<u128, CoreError> {
    let v = word_u256(data, index)?;
    v.try_into()
        .map_err(|_| CoreError::Decode(format!("word {} exceeds uint128", index)))
}

/// ABI sign-extends int24 to a full word; the low 4 bytes carry a valid
/// two's-complement i32 for any in-range tick.
fn word_i24(data: &[u8], index: usize) -> Result<i32, CoreError> {
    let w = word(data, index)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&w[28..32]);
    Ok(i32::from_be_bytes(buf))
}

fn topic_address(log: &Log, index: usize) -> Result<Address, CoreError> {
    let topic = log
        .topics
        .get(index)
        .ok_or_else(|| CoreError::Decode(format!("missing topic {}", index)))?;
    Ok(Address::from_slice(&topic.as_slice()[12..]))
}

/// Decode a V2 `Sync` log into packed reserves.
pub fn decode_sync(log: &Log) -> Result<SyncFields, CoreError> {
    let reserve0 = word_u256(&log.data, 0)?;
    let reserve1 = word_u256(&log.data, 1)?;
    Ok(SyncFields { reserve0, reserve1 })
}

/// Decode a V3 `Swap` log. Sender/recipient are indexed; the five data
/// words are amount0, amount1, sqrtPriceX96, liquidity, tick.
pub fn decode_swap(log: &Log) -> Result<SwapFields, CoreError> {
    Ok(SwapFields {
        sender: topic_address(log, 1)?,
        recipient: topic_address(log, 2)?,
        amount0: word_i256(&log.data, 0)?,
        amount1: word_i256(&log.data, 1)?,
        sqrt_price_x96: word_u256(&log.data, 2)?,
        liquidity: word_u128(&log.data, 3)?,
        tick: word_i24(&log.data, 4)?,
    })
}

/// Decode a liquidation log from either lending family, dispatching on
/// topic0.
pub fn decode_liquidation(log: &Log) -> Result<LiquidationFields, CoreError> {
    let topic0 = log
        .topics
        .first()
        .ok_or_else(|| CoreError::Decode("log has no topics".into()))?;

    if *topic0 == AAVE_LIQUIDATION_TOPIC {
        // topics: collateralAsset, debtAsset, user
        // data: debtToCover, liquidatedCollateralAmount, liquidator, receiveAToken
        Ok(LiquidationFields {
            protocol: LendingProtocol::AaveV3,
            collateral_asset: topic_address(log, 1)?,
            debt_asset: Some(topic_address(log, 2)?),
            user: topic_address(log, 3)?,
            debt_amount: word_u256(&log.data, 0)?,
            collateral_amount: word_u256(&log.data, 1)?,
        })
    } else if *topic0 == COMET_ABSORB_TOPIC {
        // topics: absorber, borrower, asset
        // data: collateralAbsorbed, usdValue
        Ok(LiquidationFields {
            protocol: LendingProtocol::CompoundV3,
            user: topic_address(log, 2)?,
            collateral_asset: topic_address(log, 3)?,
            debt_asset: None,
            collateral_amount: word_u256(&log.data, 0)?,
            debt_amount: word_u256(&log.data, 1)?,
        })
    } else {
        Err(CoreError::Decode(format!("unknown liquidation topic {topic0}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{keccak256, Bytes};

    fn mk_log(topics: Vec<B256>, data: Vec<u8>) -> Log {
        Log {
            address: Address::ZERO,
            topics,
            data: Bytes::from(data),
            block_number: 100,
            tx_hash: B256::ZERO,
            log_index: 0,
        }
    }

    fn be_word(v: U256) -> [u8; 32] {
        v.to_be_bytes::<32>()
    }

    #[test]
    fn test_topic_constants_match_signatures() {
        assert_eq!(keccak256(b"Sync(uint112,uint112)"), SYNC_TOPIC);
        assert_eq!(
            keccak256(b"Swap(address,address,int256,int256,uint160,uint128,int24)"),
            SWAP_TOPIC
        );
        assert_eq!(
            keccak256(b"LiquidationCall(address,address,address,uint256,uint256,address,bool)"),
            AAVE_LIQUIDATION_TOPIC
        );
    }

    #[test]
    fn test_decode_sync() {
        let mut data = Vec::new();
        data.extend_from_slice(&be_word(U256::from(1_000_000u64)));
        data.extend_from_slice(&be_word(U256::from(3_500_000u64)));
        let log = mk_log(vec![SYNC_TOPIC], data);

        let fields = decode_sync(&log).unwrap();
        assert_eq!(fields.reserve0, U256::from(1_000_000u64));
        assert_eq!(fields.reserve1, U256::from(3_500_000u64));
    }

    #[test]
    fn test_decode_sync_short_data() {
        let log = mk_log(vec![SYNC_TOPIC], vec![0u8; 32]);
        assert!(matches!(decode_sync(&log), Err(CoreError::Decode(_))));
    }

    #[test]
    fn test_decode_swap_negative_amounts_and_tick() {
        let sender = Address::repeat_byte(0x11);
        let recipient = Address::repeat_byte(0x22);
        let mut topics = vec![SWAP_TOPIC];
        topics.push(B256::left_padding_from(sender.as_slice()));
        topics.push(B256::left_padding_from(recipient.as_slice()));

        // amount0 = -5000 (seller side), amount1 = +4990
        let amount0 = I256::try_from(-5000i64).unwrap();
        let amount1 = I256::try_from(4990i64).unwrap();
        let sqrt_price = U256::from(1u8) << 96;
        let tick: i32 = -887_220; // near min tick, exercises sign extension

        let mut data = Vec::new();
        data.extend_from_slice(&be_word(amount0.into_raw()));
        data.extend_from_slice(&be_word(amount1.into_raw()));
        data.extend_from_slice(&be_word(sqrt_price));
        data.extend_from_slice(&be_word(U256::from(777u64)));
        data.extend_from_slice(&be_word(I256::try_from(tick).unwrap().into_raw()));

        let fields = decode_swap(&mk_log(topics, data)).unwrap();
        assert_eq!(fields.sender, sender);
        assert_eq!(fields.recipient, recipient);
        assert_eq!(fields.amount0, amount0);
        assert_eq!(fields.amount1, amount1);
        assert_eq!(fields.sqrt_price_x96, sqrt_price);
        assert_eq!(fields.liquidity, 777);
        assert_eq!(fields.tick, tick);
    }

    #[test]
    fn test_decode_aave_liquidation() {
        let collateral = Address::repeat_byte(0xaa);
        let debt = Address::repeat_byte(0xbb);
        let user = Address::repeat_byte(0xcc);
        let topics = vec![
            AAVE_LIQUIDATION_TOPIC,
            B256::left_padding_from(collateral.as_slice()),
            B256::left_padding_from(debt.as_slice()),
            B256::left_padding_from(user.as_slice()),
        ];
        let mut data = Vec::new();
        data.extend_from_slice(&be_word(U256::from(9_000u64))); // debtToCover
        data.extend_from_slice(&be_word(U256::from(5_500u64))); // collateral seized
        data.extend_from_slice(&be_word(U256::ZERO)); // liquidator
        data.extend_from_slice(&be_word(U256::ZERO)); // receiveAToken

        let fields = decode_liquidation(&mk_log(topics, data)).unwrap();
        assert_eq!(fields.protocol, LendingProtocol::AaveV3);
        assert_eq!(fields.user, user);
        assert_eq!(fields.collateral_asset, collateral);
        assert_eq!(fields.debt_asset, Some(debt));
        assert_eq!(fields.collateral_amount, U256::from(5_500u64));
        assert_eq!(fields.debt_amount, U256::from(9_000u64));
    }

    #[test]
    fn test_decode_comet_absorb() {
        let absorber = Address::repeat_byte(0x01);
        let borrower = Address::repeat_byte(0x02);
        let asset = Address::repeat_byte(0x03);
        let topics = vec![
            COMET_ABSORB_TOPIC,
            B256::left_padding_from(absorber.as_slice()),
            B256::left_padding_from(borrower.as_slice()),
            B256::left_padding_from(asset.as_slice()),
        ];
        let mut data = Vec::new();
        data.extend_from_slice(&be_word(U256::from(42u64)));
        data.extend_from_slice(&be_word(U256::from(1_234u64)));

        let fields = decode_liquidation(&mk_log(topics, data)).unwrap();
        assert_eq!(fields.protocol, LendingProtocol::CompoundV3);
        assert_eq!(fields.user, borrower);
        assert_eq!(fields.collateral_asset, asset);
        assert_eq!(fields.debt_asset, None);
    }

    #[test]
    fn test_unknown_topic_rejected() {
        let log = mk_log(vec![B256::repeat_byte(0xff)], vec![]);
        assert!(decode_liquidation(&log).is_err());
    }
}
