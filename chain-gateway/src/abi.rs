//! Contract ABI encoding and event decoding.
//!
//! Covers exactly the surface the three PODx contracts use: static value
//! types, `bytes`/`string` dynamics, and statically-sized tuples (the
//! approval structs). Head/tail layout per the Solidity ABI spec.

use crate::error::{GatewayError, Result};
use attestation_core::{keccak256, Address};
use primitive_types::U256;

/// One encodable argument.
#[derive(Debug, Clone)]
pub enum Token {
    Address(Address),
    Uint(U256),
    FixedBytes([u8; 32]),
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::Str(_) => true,
            Token::Tuple(inner) => inner.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    /// Head width in bytes when the token is static.
    fn static_size(&self) -> usize {
        match self {
            Token::Tuple(inner) => inner.iter().map(Token::static_size).sum(),
            _ => 32,
        }
    }
}

/// First four bytes of `keccak256(signature)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// `keccak256(signature)` — the `topic0` of an event.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

/// Selector plus encoded arguments.
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut out = selector(signature).to_vec();
    out.extend_from_slice(&encode(args));
    out
}

/// Standard head/tail ABI encoding of an argument list.
pub fn encode(args: &[Token]) -> Vec<u8> {
    let head_size: usize = args
        .iter()
        .map(|t| if t.is_dynamic() { 32 } else { t.static_size() })
        .sum();

    let mut head = Vec::with_capacity(head_size);
    let mut tail = Vec::new();
    for token in args {
        if token.is_dynamic() {
            head.extend_from_slice(&uint_word(U256::from(head_size + tail.len())));
            tail.extend_from_slice(&encode_tail(token));
        } else {
            head.extend_from_slice(&encode_static(token));
        }
    }
    head.extend_from_slice(&tail);
    head
}

fn encode_static(token: &Token) -> Vec<u8> {
    match token {
        Token::Address(a) => {
            let mut word = [0u8; 32];
            word[12..].copy_from_slice(a.as_bytes());
            word.to_vec()
        }
        Token::Uint(v) => uint_word(*v).to_vec(),
        Token::FixedBytes(b) => b.to_vec(),
        Token::Tuple(inner) => inner.iter().flat_map(encode_static).collect(),
        // Dynamic tokens never reach here; encode() routes them to the tail.
        Token::Bytes(_) | Token::Str(_) => Vec::new(),
    }
}

fn encode_tail(token: &Token) -> Vec<u8> {
    match token {
        Token::Bytes(data) => encode_len_prefixed(data),
        Token::Str(s) => encode_len_prefixed(s.as_bytes()),
        Token::Tuple(inner) => encode(inner),
        _ => Vec::new(),
    }
}

fn encode_len_prefixed(data: &[u8]) -> Vec<u8> {
    let mut out = uint_word(U256::from(data.len())).to_vec();
    out.extend_from_slice(data);
    let padding = (32 - data.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(padding));
    out
}

fn uint_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// Split return data into 32-byte words.
pub fn words(data: &[u8]) -> Result<Vec<[u8; 32]>> {
    if data.len() % 32 != 0 {
        return Err(GatewayError::Abi(format!(
            "return data length {} not word-aligned",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

pub fn word_to_u256(word: &[u8; 32]) -> U256 {
    U256::from_big_endian(word)
}

pub fn word_to_address(word: &[u8; 32]) -> Result<Address> {
    Address::from_slice(&word[12..]).map_err(|e| GatewayError::Abi(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_selector() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("approve(address,uint256)")), "095ea7b3");
    }

    #[test]
    fn test_erc1271_selector_equals_magic_value() {
        // The standard's magic value is the selector itself.
        assert_eq!(
            selector("isValidSignature(bytes32,bytes)"),
            attestation_core::ERC1271_MAGIC_VALUE
        );
    }

    #[test]
    fn test_static_encoding() {
        let addr: Address = "0x00000000000000000000000000000000000000ff".parse().unwrap();
        let encoded = encode(&[Token::Address(addr), Token::Uint(U256::from(258))]);
        assert_eq!(encoded.len(), 64);
        assert_eq!(encoded[31], 0xff);
        assert_eq!(&encoded[62..64], &[0x01, 0x02]);
    }

    #[test]
    fn test_dynamic_offset_layout() {
        // f(uint256, bytes): head = value ‖ offset(0x40), tail = len ‖ data.
        let encoded = encode(&[Token::Uint(U256::one()), Token::Bytes(vec![0x12, 0x34])]);
        assert_eq!(encoded.len(), 32 * 4);
        assert_eq!(word_to_u256(&encoded[32..64].try_into().unwrap()), U256::from(0x40));
        assert_eq!(word_to_u256(&encoded[64..96].try_into().unwrap()), U256::from(2));
        assert_eq!(&encoded[96..98], &[0x12, 0x34]);
        assert!(encoded[98..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_static_tuple_inlined() {
        // confirmPickup's approval tuple is static: four words inline.
        let approval = Token::Tuple(vec![
            Token::FixedBytes([1u8; 32]),
            Token::Uint(U256::from(7)),
            Token::FixedBytes([2u8; 32]),
            Token::Uint(U256::from(9)),
        ]);
        let encoded = encode(&[approval, Token::Bytes(vec![0xaa])]);
        // 4 words tuple + 1 word offset + len word + 1 padded data word.
        assert_eq!(encoded.len(), 32 * 7);
        // Offset to the bytes tail is 5 words.
        assert_eq!(
            word_to_u256(&encoded[128..160].try_into().unwrap()),
            U256::from(160)
        );
    }

    #[test]
    fn test_string_padding() {
        let encoded = encode(&[Token::Str("ab".to_string())]);
        assert_eq!(encoded.len(), 96);
        assert_eq!(word_to_u256(&encoded[32..64].try_into().unwrap()), U256::from(2));
        assert_eq!(&encoded[64..66], b"ab");
    }

    #[test]
    fn test_words_rejects_misaligned() {
        assert!(words(&[0u8; 31]).is_err());
        assert_eq!(words(&[0u8; 64]).unwrap().len(), 2);
    }
}
