//! The inbound/outbound JSON envelope (spec §6, §9 "Dynamic JSON in, tagged
//! variants out"). Inbound messages are validated by a schema keyed on a
//! `type` discriminator; handlers dispatch on the resulting closed sum
//! type, no reflection needed.

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;

/// A single bet entry used by multi-bet games (roulette, craps, baccarat,
/// sic bo). `amount` is validated at the handler boundary (finite,
/// non-negative, ≤ `Number.MAX_SAFE_INTEGER`) before being turned into a
/// chip amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    #[serde(rename = "type")]
    pub bet_type: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Every inbound client message, keyed by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Ping,
    GetBalance,
    SubmitRaw {
        submission: String, // base64
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idempotency_key: Option<String>,
    },
    FaucetClaim {
        #[serde(default)]
        amount: Option<f64>,
    },
    BlackjackDeal {
        amount: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        side_bet_21_plus_3: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        side_bet_perfect_pairs: Option<f64>,
    },
    BlackjackHit,
    BlackjackStand,
    BlackjackDouble,
    BlackjackSplit,
    RouletteSpin {
        bets: Vec<Bet>,
    },
    CrapsRoll {
        bets: Vec<Bet>,
    },
    BaccaratDeal {
        bets: Vec<Bet>,
    },
    SicboRoll {
        bets: Vec<Bet>,
    },
    ThreecardDeal {
        amount: f64,
    },
    UltimatetxDeal {
        amount: f64,
    },
    VideopokerDeal {
        amount: f64,
    },
    CasinowarDeal {
        amount: f64,
    },
    HiloDeal {
        amount: f64,
    },
    HiloHigher,
    HiloLower,
    HiloCashout,
    SubscribeGame {
        game_id: String,
    },
    UnsubscribeGame {
        game_id: String,
    },
    ListSubscriptions,
}

/// Every outbound message pushed to a client, keyed by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    SessionReady {
        session_id: String,
        public_key: String,
    },
    Balance {
        balance: String,
        registered: bool,
        has_balance: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    GameStarted {
        session_id: String,
        bet: String,
        balance: String,
    },
    GameMove {
        session_id: String,
        move_number: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        balance: Option<String>,
    },
    GameResult {
        session_id: String,
        payout: String,
        final_chips: String,
        won: bool,
    },
    ClockSync {
        server_time: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    Presence {
        online_count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active_games: Option<u64>,
    },
    Pong,
    Subscriptions {
        topics: Vec<String>,
    },
    Error {
        code: &'static str,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl OutboundMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            code: code.as_str(),
            message: message.into(),
            retry_after: None,
            details: None,
        }
    }

    pub fn error_with_retry(code: ErrorCode, message: impl Into<String>, retry_after: u64) -> Self {
        OutboundMessage::Error {
            code: code.as_str(),
            message: message.into(),
            retry_after: Some(retry_after),
            details: None,
        }
    }
}

/// An RFC 7807 "problem details" document, used for handshake-time
/// rejections (CORS, admission caps) per spec §4.3/§6.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: &'static str,
    pub title: &'static str,
    pub status: u16,
    pub code: &'static str,
    pub detail: String,
}

impl ProblemDetails {
    pub fn new(status: u16, code: ErrorCode, detail: impl Into<String>) -> Self {
        ProblemDetails {
            problem_type: "about:blank",
            title: code.as_str(),
            status,
            code: code.as_str(),
            detail: detail.into(),
        }
    }
}
