//! Binary wire format: the custodial transaction layout (spec §4.1) and the
//! length-delimited, tag-dispatched backend event stream (spec §4.4).
//!
//! Every decoder in this module is total: on truncated, malformed, or
//! adversarial input it returns an empty/`None` result rather than
//! panicking, per spec §8 invariant 3. Signing itself (which needs a key
//! type) lives in the gateway crate; this module only assembles/parses the
//! byte layout around a signature.

mod cursor;
mod events;
mod primitives;
mod tx;
mod varint;

pub use cursor::Cursor;
pub use primitives::{read_string_u32, read_varint_prefixed_bytes};
pub use events::{
    decode_round_lookup, extract_casino_events, CasinoEvent, EventOp, RoundBody,
    RoundLookupResult, ROUND_LOOKUP_STATE_OP, ROUND_LOOKUP_VALUE_TAG, UPDATE_TAG_EVENTS,
    UPDATE_TAG_FILTERED_EVENTS, UPDATE_TAG_SEED,
};
pub use tx::{
    assemble_transaction, build_signature_payload, encode_submission, parse_transaction,
    ParsedTransaction, NAMESPACE, SUBMISSION_TAG,
};
pub use varint::{decode_varint, encode_varint};
