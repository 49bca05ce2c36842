//! The signed-transaction byte layout (spec §4.1 "Transaction encoding").
//!
//! `[nonce:8 BE][instruction][pubkey:32][signature:64]`, where the
//! signature covers `[varint(ns.len)][ns][nonce][instruction]`. Building
//! and verifying the actual Ed25519 signature lives in the gateway crate
//! (it needs a concrete key type); this module only assembles/parses the
//! surrounding byte layout, which has no crypto dependency.

use super::cursor::Cursor;
use super::varint::encode_varint;

/// Domain-separation namespace prepended to every signed payload.
pub const NAMESPACE: &[u8] = b"_NULLSPACE_TX";

/// Tag prefixing a wire submission (one or more transactions).
pub const SUBMISSION_TAG: u8 = 1;

const PUBKEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
const NONCE_LEN: usize = 8;

/// Builds the bytes that get signed: `varint(ns.len) ‖ ns ‖ nonce ‖ instruction`.
pub fn build_signature_payload(nonce: u64, instruction: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + NAMESPACE.len() + NONCE_LEN + instruction.len());
    out.extend(encode_varint(NAMESPACE.len() as u64));
    out.extend_from_slice(NAMESPACE);
    out.extend_from_slice(&nonce.to_be_bytes());
    out.extend_from_slice(instruction);
    out
}

/// Concatenates an already-signed transaction's parts into wire form.
pub fn assemble_transaction(
    nonce: u64,
    instruction: &[u8],
    pubkey: &[u8; PUBKEY_LEN],
    signature: &[u8; SIGNATURE_LEN],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(NONCE_LEN + instruction.len() + PUBKEY_LEN + SIGNATURE_LEN);
    out.extend_from_slice(&nonce.to_be_bytes());
    out.extend_from_slice(instruction);
    out.extend_from_slice(pubkey);
    out.extend_from_slice(signature);
    out
}

/// A transaction split back into its constituent fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTransaction {
    pub nonce: u64,
    pub instruction: Vec<u8>,
    pub pubkey: [u8; PUBKEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

/// Splits a single transaction buffer back into its fields. Returns `None`
/// if the buffer is shorter than the fixed-size fields require.
pub fn parse_transaction(bytes: &[u8]) -> Option<ParsedTransaction> {
    if bytes.len() < NONCE_LEN + PUBKEY_LEN + SIGNATURE_LEN {
        return None;
    }
    let instruction_len = bytes.len() - NONCE_LEN - PUBKEY_LEN - SIGNATURE_LEN;
    let mut cursor = Cursor::new(bytes);
    let nonce = cursor.read_u64_be()?;
    let instruction = cursor.read_bytes(instruction_len)?.to_vec();
    let pubkey = cursor.read_array::<PUBKEY_LEN>()?;
    let signature = cursor.read_array::<SIGNATURE_LEN>()?;
    Some(ParsedTransaction {
        nonce,
        instruction,
        pubkey,
        signature,
    })
}

/// Wraps one or more already-built transactions as a wire submission:
/// `[tag=1][varint(count)][tx_1]…[tx_n]`.
pub fn encode_submission(transactions: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(SUBMISSION_TAG);
    out.extend(encode_varint(transactions.len() as u64));
    for tx in transactions {
        out.extend_from_slice(tx);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_then_parse_round_trips() {
        let pubkey = [7u8; PUBKEY_LEN];
        let signature = [9u8; SIGNATURE_LEN];
        let instruction = b"deal:100".to_vec();
        let tx = assemble_transaction(42, &instruction, &pubkey, &signature);
        let parsed = parse_transaction(&tx).unwrap();
        assert_eq!(parsed.nonce, 42);
        assert_eq!(parsed.instruction, instruction);
        assert_eq!(parsed.pubkey, pubkey);
        assert_eq!(parsed.signature, signature);
    }

    #[test]
    fn tampering_any_byte_changes_parsed_fields() {
        let pubkey = [1u8; PUBKEY_LEN];
        let signature = [2u8; SIGNATURE_LEN];
        let mut tx = assemble_transaction(5, b"x", &pubkey, &signature);
        let original = tx.clone();
        *tx.last_mut().unwrap() ^= 0xFF;
        assert_ne!(tx, original);
        let parsed = parse_transaction(&tx).unwrap();
        assert_ne!(parsed.signature, signature);
    }

    #[test]
    fn submission_wraps_multiple_transactions_with_count_prefix() {
        let tx_a = assemble_transaction(1, b"a", &[0; PUBKEY_LEN], &[0; SIGNATURE_LEN]);
        let tx_b = assemble_transaction(2, b"bb", &[0; PUBKEY_LEN], &[0; SIGNATURE_LEN]);
        let submission = encode_submission(&[tx_a.clone(), tx_b.clone()]);
        assert_eq!(submission[0], SUBMISSION_TAG);
        assert_eq!(submission.len(), 1 + 1 + tx_a.len() + tx_b.len());
    }
}
