//! Decoding of the backend's length-framed update stream (spec §4.4).
//!
//! `Progress ‖ Certificate ‖ Proof ‖ varint(N) ‖ Op_1 … Op_N`, where each
//! `Op` is `{context:u8, outputTag:u8, eventBody}`. Decoding is best-effort
//! and total: a truncated or unrecognized op stops decoding at that point
//! (the ops already decoded are still returned) rather than erroring.

use super::cursor::Cursor;
use super::primitives::{read_string_u32, read_varint_prefixed_bytes};
use super::varint::decode_varint;

/// First byte of an "update" message.
pub const UPDATE_TAG_SEED: u8 = 0x00;
pub const UPDATE_TAG_EVENTS: u8 = 0x01;
pub const UPDATE_TAG_FILTERED_EVENTS: u8 = 0x02;

const EVENT_TAG_GAME_STARTED: u8 = 21;
const EVENT_TAG_GAME_MOVE: u8 = 22;
const EVENT_TAG_GAME_RESULT: u8 = 23;
const EVENT_TAG_BALANCE_SNAPSHOT: u8 = 30;
const EVENT_TAG_ROUND_OPENED: u8 = 60;
const EVENT_TAG_LOCKED: u8 = 61;
const EVENT_TAG_OUTCOME: u8 = 62;
const EVENT_TAG_PLAYER_SETTLED: u8 = 63;
const EVENT_TAG_FINALIZED: u8 = 64;
const EVENT_TAG_BET_ACCEPTED: u8 = 65;
const EVENT_TAG_BET_REJECTED: u8 = 66;

/// A decoded backend event, tagged over the variants named in spec §3.
#[derive(Debug, Clone, PartialEq)]
pub enum CasinoEvent {
    GameStarted {
        session_id: u64,
        server_game_id: u64,
        bet: u64,
    },
    GameMove {
        session_id: u64,
        move_number: u32,
    },
    GameResult {
        session_id: u64,
        payout: i64,
        final_chips: u64,
        won: bool,
    },
    BalanceSnapshot {
        session_id: u64,
        balance: u64,
        registered: bool,
        has_balance: bool,
    },
    RoundOpened {
        round_id: u64,
        phase: u8,
    },
    Locked {
        round_id: u64,
    },
    Outcome {
        round_id: u64,
        values: Vec<u8>,
    },
    PlayerSettled {
        session_id: u64,
        payout: i64,
    },
    Finalized {
        round_id: u64,
    },
    BetAccepted {
        session_id: u64,
        bet_id: u64,
    },
    BetRejected {
        session_id: u64,
        reason: String,
    },
}

/// One decoded op: the raw `context` byte alongside its event body.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOp {
    pub context: u8,
    pub event: CasinoEvent,
}

fn decode_event_body(tag: u8, cursor: &mut Cursor) -> Option<CasinoEvent> {
    match tag {
        EVENT_TAG_GAME_STARTED => Some(CasinoEvent::GameStarted {
            session_id: cursor.read_u64_be()?,
            server_game_id: cursor.read_u64_be()?,
            bet: cursor.read_u64_be()?,
        }),
        EVENT_TAG_GAME_MOVE => Some(CasinoEvent::GameMove {
            session_id: cursor.read_u64_be()?,
            move_number: cursor.read_u32_be()?,
        }),
        EVENT_TAG_GAME_RESULT => {
            let session_id = cursor.read_u64_be()?;
            let payout = cursor.read_i64_be()?;
            let final_chips = cursor.read_u64_be()?;
            let won = cursor.read_u8()? != 0;
            Some(CasinoEvent::GameResult {
                session_id,
                payout,
                final_chips,
                won,
            })
        }
        EVENT_TAG_BALANCE_SNAPSHOT => {
            let session_id = cursor.read_u64_be()?;
            let balance = cursor.read_u64_be()?;
            let registered = cursor.read_u8()? != 0;
            let has_balance = cursor.read_u8()? != 0;
            Some(CasinoEvent::BalanceSnapshot {
                session_id,
                balance,
                registered,
                has_balance,
            })
        }
        EVENT_TAG_ROUND_OPENED => Some(CasinoEvent::RoundOpened {
            round_id: cursor.read_u64_be()?,
            phase: cursor.read_u8()?,
        }),
        EVENT_TAG_LOCKED => Some(CasinoEvent::Locked {
            round_id: cursor.read_u64_be()?,
        }),
        EVENT_TAG_OUTCOME => {
            let round_id = cursor.read_u64_be()?;
            let values = read_varint_prefixed_bytes(cursor)?.to_vec();
            Some(CasinoEvent::Outcome { round_id, values })
        }
        EVENT_TAG_PLAYER_SETTLED => Some(CasinoEvent::PlayerSettled {
            session_id: cursor.read_u64_be()?,
            payout: cursor.read_i64_be()?,
        }),
        EVENT_TAG_FINALIZED => Some(CasinoEvent::Finalized {
            round_id: cursor.read_u64_be()?,
        }),
        EVENT_TAG_BET_ACCEPTED => Some(CasinoEvent::BetAccepted {
            session_id: cursor.read_u64_be()?,
            bet_id: cursor.read_u64_be()?,
        }),
        EVENT_TAG_BET_REJECTED => {
            let session_id = cursor.read_u64_be()?;
            let reason = read_string_u32(cursor)?;
            Some(CasinoEvent::BetRejected {
                session_id,
                reason,
            })
        }
        _ => None, // Unknown output tag: this op (and the remainder) is abandoned.
    }
}

/// Skips the `Progress ‖ Certificate ‖ Proof` header common to both the
/// events update and the round-lookup response.
fn skip_header(cursor: &mut Cursor) -> Option<()> {
    let _progress = cursor.read_u64_be()?;
    let _certificate = read_varint_prefixed_bytes(cursor)?;
    let _proof = read_varint_prefixed_bytes(cursor)?;
    Some(())
}

/// Decodes every op out of a backend "update" message.
///
/// - Tag `0x00` (Seed) and any unrecognized tag are ignored, yielding no
///   events (not an error).
/// - Tag `0x01`/`0x02` (Events / FilteredEvents) decode `Progress ‖
///   Certificate ‖ Proof ‖ varint(N) ‖ Op_1…Op_N`. The first op that fails
///   to parse — truncated body or unknown output tag — stops decoding;
///   everything decoded up to that point is still returned. Trailing
///   bytes after a fully-decoded update are ignored.
pub fn extract_casino_events(bytes: &[u8]) -> Vec<EventOp> {
    let mut cursor = Cursor::new(bytes);
    let Some(tag) = cursor.read_u8() else {
        return Vec::new();
    };
    if tag != UPDATE_TAG_EVENTS && tag != UPDATE_TAG_FILTERED_EVENTS {
        return Vec::new();
    }
    if skip_header(&mut cursor).is_none() {
        return Vec::new();
    }
    let Some(count) = decode_varint(&mut cursor) else {
        return Vec::new();
    };
    let mut ops = Vec::new();
    for _ in 0..count {
        let Some(context) = cursor.read_u8() else {
            break;
        };
        let Some(output_tag) = cursor.read_u8() else {
            break;
        };
        let Some(event) = decode_event_body(output_tag, &mut cursor) else {
            break;
        };
        ops.push(EventOp { context, event });
    }
    ops
}

/// State-op byte preceding the digest in a round-lookup response.
pub const ROUND_LOOKUP_STATE_OP: u8 = 0xD2;
/// The only value tag a round-lookup response is accepted under.
pub const ROUND_LOOKUP_VALUE_TAG: u8 = 0x01;

/// A single round's snapshot, as returned by the round-lookup decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundBody {
    pub round_id: u64,
    pub phase: u8,
    pub pot: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundLookupResult {
    pub location: u64,
    pub digest: [u8; 32],
    pub round: RoundBody,
}

/// Decodes `Progress ‖ Certificate ‖ Proof ‖ u64_be(location) ‖
/// u8(stateOp=0xD2) ‖ digest:32 ‖ u8(valueTag) ‖ RoundBody`. Returns `None`
/// unless both the state-op byte and the value tag match their expected
/// constants, or the input is truncated/malformed.
pub fn decode_round_lookup(bytes: &[u8]) -> Option<RoundLookupResult> {
    let mut cursor = Cursor::new(bytes);
    skip_header(&mut cursor)?;
    let location = cursor.read_u64_be()?;
    let state_op = cursor.read_u8()?;
    if state_op != ROUND_LOOKUP_STATE_OP {
        return None;
    }
    let digest = cursor.read_array::<32>()?;
    let value_tag = cursor.read_u8()?;
    if value_tag != ROUND_LOOKUP_VALUE_TAG {
        return None;
    }
    let round_id = cursor.read_u64_be()?;
    let phase = cursor.read_u8()?;
    let pot = cursor.read_u64_be()?;
    Some(RoundLookupResult {
        location,
        digest,
        round: RoundBody {
            round_id,
            phase,
            pot,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::varint::encode_varint;

    fn header(progress: u64, certificate: &[u8], proof: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&progress.to_be_bytes());
        out.extend(encode_varint(certificate.len() as u64));
        out.extend_from_slice(certificate);
        out.extend(encode_varint(proof.len() as u64));
        out.extend_from_slice(proof);
        out
    }

    fn game_started_op(context: u8, session_id: u64, game_id: u64, bet: u64) -> Vec<u8> {
        let mut out = vec![context, EVENT_TAG_GAME_STARTED];
        out.extend_from_slice(&session_id.to_be_bytes());
        out.extend_from_slice(&game_id.to_be_bytes());
        out.extend_from_slice(&bet.to_be_bytes());
        out
    }

    #[test]
    fn seed_tag_is_ignored() {
        let bytes = [UPDATE_TAG_SEED, 1, 2, 3];
        assert!(extract_casino_events(&bytes).is_empty());
    }

    #[test]
    fn unrecognized_top_level_tag_is_ignored_not_an_error() {
        let bytes = [0xEE, 1, 2, 3];
        assert!(extract_casino_events(&bytes).is_empty());
    }

    #[test]
    fn decodes_a_single_game_started_event() {
        let mut msg = vec![UPDATE_TAG_EVENTS];
        msg.extend(header(10, b"cert", b"proof"));
        msg.extend(encode_varint(1));
        msg.extend(game_started_op(0, 99999, 99999, 100));

        let ops = extract_casino_events(&msg);
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0].event,
            CasinoEvent::GameStarted {
                session_id: 99999,
                server_game_id: 99999,
                bet: 100
            }
        );
    }

    #[test]
    fn truncation_at_any_offset_never_panics_and_returns_partial_results() {
        let mut msg = vec![UPDATE_TAG_EVENTS];
        msg.extend(header(10, b"cert", b"proof"));
        msg.extend(encode_varint(2));
        msg.extend(game_started_op(0, 1, 1, 50));
        msg.extend(game_started_op(0, 2, 2, 75));

        for cut in 0..msg.len() {
            let ops = extract_casino_events(&msg[..cut]);
            assert!(ops.len() <= 2);
        }
        // A full message decodes both ops.
        assert_eq!(extract_casino_events(&msg).len(), 2);
    }

    #[test]
    fn unknown_op_tag_abandons_only_the_remainder() {
        let mut msg = vec![UPDATE_TAG_EVENTS];
        msg.extend(header(1, b"", b""));
        msg.extend(encode_varint(2));
        msg.extend(game_started_op(0, 7, 7, 10));
        msg.push(0); // context
        msg.push(0xF0); // unknown output tag
        msg.extend_from_slice(b"garbage-that-would-otherwise-parse");

        let ops = extract_casino_events(&msg);
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0].event,
            CasinoEvent::GameStarted {
                session_id: 7,
                server_game_id: 7,
                bet: 10
            }
        );
    }

    #[test]
    fn trailing_garbage_does_not_break_a_prior_valid_update() {
        let mut msg = vec![UPDATE_TAG_EVENTS];
        msg.extend(header(1, b"", b""));
        msg.extend(encode_varint(1));
        msg.extend(game_started_op(0, 3, 3, 40));
        msg.extend_from_slice(b"\xFF\xFF\xFF trailing junk");

        let ops = extract_casino_events(&msg);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn ops_count_varint_attack_yields_no_events_and_does_not_hang() {
        let mut msg = vec![UPDATE_TAG_EVENTS];
        msg.extend(header(1, b"", b""));
        msg.extend(vec![0x80u8; 10]); // malicious count varint
        assert!(extract_casino_events(&msg).is_empty());
    }

    #[test]
    fn round_lookup_requires_matching_state_op_and_value_tag() {
        let mut msg = header(1, b"", b"");
        msg.extend_from_slice(&7u64.to_be_bytes()); // location
        msg.push(ROUND_LOOKUP_STATE_OP);
        msg.extend_from_slice(&[9u8; 32]); // digest
        msg.push(ROUND_LOOKUP_VALUE_TAG);
        msg.extend_from_slice(&55u64.to_be_bytes()); // round_id
        msg.push(2); // phase
        msg.extend_from_slice(&1000u64.to_be_bytes()); // pot

        let result = decode_round_lookup(&msg).unwrap();
        assert_eq!(result.location, 7);
        assert_eq!(result.round.round_id, 55);
        assert_eq!(result.round.pot, 1000);

        // Flip the value tag: must now return None.
        let mut wrong_tag = msg.clone();
        let tag_pos = msg.len() - (8 + 1 + 8); // value_tag precedes round_id(8)+phase(1)+pot(8)
        wrong_tag[tag_pos] = 0xFF;
        assert_eq!(decode_round_lookup(&wrong_tag), None);
    }
}
