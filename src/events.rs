//! Event Extractor: raw agent-contract logs into typed domain events.
//!
//! Two event signatures matter to the bridge. `SwapStarted` comes in two
//! wire layouts depending on the emitting agent variant: forward agents put
//! the token and sender in indexed topics and ABI-encode amount/fee in the
//! data section, reverse agents put destination chain id, sender and amount
//! all in indexed topics with an empty data section. `SwapPairRegister`
//! indexes sponsor and both token addresses and ABI-encodes name, symbol
//! and decimals. Extraction never panics; a log that does not unpack
//! against the expected schema yields `None` and the caller drops it.

use alloy::primitives::{b256, Address, B256, U256};
use alloy::rpc::types::Log;

use crate::types::FillVariant;

/// Topic0 of `SwapStarted`, shared by both agent variants.
pub const SWAP_STARTED_TOPIC: B256 =
    b256!("7b2b39fe8cb99baf3c533665217a130daefeee1af6329eca59c5bf06a53999ac");

/// Topic0 of the pair-registration event.
pub const PAIR_REGISTER_TOPIC: B256 =
    b256!("06101386f3a9dd45570dce2027311173d0e136955e5b912edece89cca5bb526d");

/// A decoded swap-start event. `token` and `dest_chain_id` are each present
/// in exactly one of the two layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapStartedEvent {
    pub token: Option<Address>,
    pub from: Address,
    pub dest_chain_id: Option<U256>,
    pub amount: U256,
    pub fee: U256,
}

/// A decoded pair-registration event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRegisteredEvent {
    pub sponsor: Address,
    pub src_token: Address,
    pub dst_token: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Tagged union over the agent's event kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    SwapStarted(SwapStartedEvent),
    PairRegistered(PairRegisteredEvent),
}

/// Decode a raw log into a domain event, or `None` when the log is not one
/// of ours or its payload is malformed.
pub fn extract(variant: FillVariant, log: &Log) -> Option<AgentEvent> {
    let topics = log.topics();
    let topic0 = topics.first()?;

    if *topic0 == SWAP_STARTED_TOPIC {
        let event = if variant.emits_forward_layout() {
            parse_forward_swap_started(log)?
        } else {
            parse_reverse_swap_started(log)?
        };
        return Some(AgentEvent::SwapStarted(event));
    }

    if *topic0 == PAIR_REGISTER_TOPIC {
        return Some(AgentEvent::PairRegistered(parse_pair_registered(log)?));
    }

    None
}

/// Forward layout: token = topic1, sender = topic2, amount and fee in data.
fn parse_forward_swap_started(log: &Log) -> Option<SwapStartedEvent> {
    let topics = log.topics();
    if topics.len() < 3 {
        return None;
    }

    let data = log.data().data.as_ref();
    let amount = U256::from_be_slice(abi_word(data, 0)?);
    let fee = U256::from_be_slice(abi_word(data, 1)?);

    Some(SwapStartedEvent {
        token: Some(topic_address(&topics[1])),
        from: topic_address(&topics[2]),
        dest_chain_id: None,
        amount,
        fee,
    })
}

/// Reverse layout: destination chain id = topic1, sender = topic2,
/// amount = topic3. No data decoding; fee is not emitted.
fn parse_reverse_swap_started(log: &Log) -> Option<SwapStartedEvent> {
    let topics = log.topics();
    if topics.len() < 4 {
        return None;
    }

    Some(SwapStartedEvent {
        token: None,
        from: topic_address(&topics[2]),
        dest_chain_id: Some(U256::from_be_bytes(topics[1].0)),
        amount: U256::from_be_bytes(topics[3].0),
        fee: U256::ZERO,
    })
}

/// Sponsor and token addresses in topics; name, symbol and decimals
/// ABI-encoded in data.
fn parse_pair_registered(log: &Log) -> Option<PairRegisteredEvent> {
    let topics = log.topics();
    if topics.len() < 4 {
        return None;
    }

    let data = log.data().data.as_ref();
    let name_offset = abi_offset(data, 0)?;
    let symbol_offset = abi_offset(data, 1)?;
    let decimals = abi_u8(abi_word(data, 2)?)?;
    let name = abi_string(data, name_offset)?;
    let symbol = abi_string(data, symbol_offset)?;

    Some(PairRegisteredEvent {
        sponsor: topic_address(&topics[1]),
        src_token: topic_address(&topics[2]),
        dst_token: topic_address(&topics[3]),
        name,
        symbol,
        decimals,
    })
}

fn topic_address(topic: &B256) -> Address {
    Address::from_slice(&topic.as_slice()[12..])
}

fn abi_word(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * 32..(index + 1) * 32)
}

/// A dynamic-type head word interpreted as a byte offset into the data.
fn abi_offset(data: &[u8], index: usize) -> Option<usize> {
    let word = abi_word(data, index)?;
    if word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let offset = u64::from_be_bytes(word[24..].try_into().ok()?) as usize;
    if offset % 32 != 0 || offset >= data.len() {
        return None;
    }
    Some(offset)
}

fn abi_u8(word: &[u8]) -> Option<u8> {
    if word[..31].iter().any(|b| *b != 0) {
        return None;
    }
    Some(word[31])
}

/// Decode a length-prefixed UTF-8 string at `offset`.
fn abi_string(data: &[u8], offset: usize) -> Option<String> {
    let len_word = data.get(offset..offset + 32)?;
    if len_word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let len = u64::from_be_bytes(len_word[24..].try_into().ok()?) as usize;
    let bytes = data.get(offset + 32..offset + 32 + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};

    fn make_log(topics: Vec<B256>, data: Vec<u8>) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0xaa),
                data: LogData::new_unchecked(topics, Bytes::from(data)),
            },
            block_hash: Some(B256::repeat_byte(0x01)),
            block_number: Some(100),
            block_timestamp: None,
            transaction_hash: Some(B256::repeat_byte(0x02)),
            transaction_index: Some(0),
            log_index: Some(0),
            removed: false,
        }
    }

    fn address_topic(addr: Address) -> B256 {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(addr.as_slice());
        B256::from(word)
    }

    fn u256_topic(value: u64) -> B256 {
        B256::from(U256::from(value).to_be_bytes::<32>())
    }

    fn u256_word(value: u64) -> [u8; 32] {
        U256::from(value).to_be_bytes::<32>()
    }

    #[test]
    fn forward_swap_start_decodes_topics_and_data() {
        let token = Address::repeat_byte(0x11);
        let sender = Address::repeat_byte(0x22);
        let mut data = Vec::new();
        data.extend_from_slice(&u256_word(5000));
        data.extend_from_slice(&u256_word(30));

        let log = make_log(
            vec![
                SWAP_STARTED_TOPIC,
                address_topic(token),
                address_topic(sender),
            ],
            data,
        );

        let event = extract(FillVariant::Eth2Bsc, &log).unwrap();
        match event {
            AgentEvent::SwapStarted(ev) => {
                assert_eq!(ev.token, Some(token));
                assert_eq!(ev.from, sender);
                assert_eq!(ev.dest_chain_id, None);
                assert_eq!(ev.amount, U256::from(5000u64));
                assert_eq!(ev.fee, U256::from(30u64));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn reverse_swap_start_decodes_topics_only() {
        let sender = Address::repeat_byte(0x33);
        let log = make_log(
            vec![
                SWAP_STARTED_TOPIC,
                u256_topic(56),
                address_topic(sender),
                u256_topic(123456),
            ],
            Vec::new(),
        );

        let event = extract(FillVariant::Generic, &log).unwrap();
        match event {
            AgentEvent::SwapStarted(ev) => {
                assert_eq!(ev.token, None);
                assert_eq!(ev.from, sender);
                assert_eq!(ev.dest_chain_id, Some(U256::from(56u64)));
                assert_eq!(ev.amount, U256::from(123456u64));
                assert_eq!(ev.fee, U256::ZERO);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn pair_register_decodes_metadata() {
        let sponsor = Address::repeat_byte(0x44);
        let src_token = Address::repeat_byte(0x55);
        let dst_token = Address::repeat_byte(0x66);

        // abi.encode("Wrapped Test", "WTST", uint8(18))
        let mut data = Vec::new();
        data.extend_from_slice(&u256_word(0x60)); // name offset
        data.extend_from_slice(&u256_word(0xa0)); // symbol offset
        data.extend_from_slice(&u256_word(18)); // decimals
        data.extend_from_slice(&u256_word(12)); // name length
        let mut name = b"Wrapped Test".to_vec();
        name.resize(32, 0);
        data.extend_from_slice(&name);
        data.extend_from_slice(&u256_word(4)); // symbol length
        let mut symbol = b"WTST".to_vec();
        symbol.resize(32, 0);
        data.extend_from_slice(&symbol);

        let log = make_log(
            vec![
                PAIR_REGISTER_TOPIC,
                address_topic(sponsor),
                address_topic(src_token),
                address_topic(dst_token),
            ],
            data,
        );

        let event = extract(FillVariant::Eth2Bsc, &log).unwrap();
        match event {
            AgentEvent::PairRegistered(ev) => {
                assert_eq!(ev.sponsor, sponsor);
                assert_eq!(ev.src_token, src_token);
                assert_eq!(ev.dst_token, dst_token);
                assert_eq!(ev.name, "Wrapped Test");
                assert_eq!(ev.symbol, "WTST");
                assert_eq!(ev.decimals, 18);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn malformed_data_is_dropped_not_panicked() {
        // Forward layout with truncated data.
        let log = make_log(
            vec![
                SWAP_STARTED_TOPIC,
                address_topic(Address::repeat_byte(0x11)),
                address_topic(Address::repeat_byte(0x22)),
            ],
            vec![0u8; 16],
        );
        assert_eq!(extract(FillVariant::Eth2Bsc, &log), None);

        // Reverse layout missing the amount topic.
        let log = make_log(
            vec![
                SWAP_STARTED_TOPIC,
                u256_topic(56),
                address_topic(Address::repeat_byte(0x33)),
            ],
            Vec::new(),
        );
        assert_eq!(extract(FillVariant::Generic, &log), None);

        // Pair registration with a bogus string offset.
        let mut data = Vec::new();
        data.extend_from_slice(&u256_word(0x600)); // out of range
        data.extend_from_slice(&u256_word(0xa0));
        data.extend_from_slice(&u256_word(18));
        let log = make_log(
            vec![
                PAIR_REGISTER_TOPIC,
                address_topic(Address::repeat_byte(0x44)),
                address_topic(Address::repeat_byte(0x55)),
                address_topic(Address::repeat_byte(0x66)),
            ],
            data,
        );
        assert_eq!(extract(FillVariant::Eth2Bsc, &log), None);
    }

    #[test]
    fn unknown_topic_is_ignored() {
        let log = make_log(vec![B256::repeat_byte(0x99)], Vec::new());
        assert_eq!(extract(FillVariant::Eth2Bsc, &log), None);

        let empty = make_log(Vec::new(), Vec::new());
        assert_eq!(extract(FillVariant::Eth2Bsc, &empty), None);
    }
}
