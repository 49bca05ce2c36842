//! Dispatch registry (spec §4.8 C8): validates and routes one decoded
//! `InboundMessage` per socket. A handler context bundles everything a
//! handler needs, per spec §9 "a handler receives a context
//! `{session, limiter, forwarder, broadcast, ...}`". Session is always
//! obtained by socket lookup, never from a client-supplied field.

use std::sync::Arc;
use std::time::Duration;

use protocol::errors::{is_nonce_mismatch_message, map_backend_error_code};
use protocol::game::resolve_game_topic;
use protocol::messages::{Bet, InboundMessage, OutboundMessage};
use protocol::ErrorCode;

use crate::backend_client::{BackendClient, SubmitRequest};
use crate::broadcast::BroadcastManager;
use crate::error::GatewayError;
use crate::forwarder::{ForwardError, Forwarder};
use crate::presence::PresenceTracker;
use crate::session::Session;
use crate::signing::{self, KeyRegistry};
use crate::updates_subscriber::EventWaiter;

use protocol::wire::{encode_submission, CasinoEvent};

pub struct HandlerContext<B: BackendClient> {
    pub keys: Arc<KeyRegistry>,
    pub backend: Arc<B>,
    pub forwarder: Arc<Forwarder<B>>,
    pub broadcast: Arc<BroadcastManager>,
    pub presence: Arc<PresenceTracker>,
    pub waiter: Arc<EventWaiter>,
    pub event_timeout: Duration,
}

/// Caps any single amount field per spec §4.8 "finite, non-negative, ≤
/// `Number.MAX_SAFE_INTEGER`".
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn validate_amount(amount: f64) -> Result<u64, GatewayError> {
    if !amount.is_finite() || amount < 0.0 || amount.fract() != 0.0 || amount > MAX_SAFE_INTEGER {
        return Err(GatewayError::validation(
            ErrorCode::InvalidBet,
            "amount must be a finite, non-negative whole number",
        ));
    }
    Ok(amount as u64)
}

fn validate_blackjack_deal(
    amount: f64,
    side_bet_21_plus_3: Option<f64>,
    side_bet_perfect_pairs: Option<f64>,
) -> Result<(u64, u64, u64), GatewayError> {
    let amount = validate_amount(amount)?;
    let side_21_3 = side_bet_21_plus_3.map(validate_amount).transpose()?.unwrap_or(0);
    let side_pp = side_bet_perfect_pairs.map(validate_amount).transpose()?.unwrap_or(0);
    Ok((amount, side_21_3, side_pp))
}

fn encode_bets(bets: &[Bet]) -> Result<String, GatewayError> {
    let mut parts = Vec::with_capacity(bets.len());
    for bet in bets {
        let amount = validate_amount(bet.amount)?;
        match &bet.target {
            Some(target) => parts.push(format!("{}:{}:{}", bet.bet_type, amount, target)),
            None => parts.push(format!("{}:{}", bet.bet_type, amount)),
        }
    }
    Ok(parts.join(";"))
}

/// Handles one inbound message for `session`, returning the reply to send
/// back over that socket (never `None`: every branch answers, even if only
/// with an `error`).
pub async fn dispatch<B: BackendClient>(
    ctx: &HandlerContext<B>,
    session: &Arc<Session>,
    msg: InboundMessage,
) -> OutboundMessage {
    session.touch().await;
    let result = match msg {
        InboundMessage::Ping => Ok(OutboundMessage::Pong),
        InboundMessage::GetBalance => handle_get_balance(ctx, session).await,
        InboundMessage::SubmitRaw {
            submission,
            idempotency_key,
        } => handle_submit_raw(ctx, session, submission, idempotency_key).await,
        InboundMessage::FaucetClaim { amount } => match validate_amount(amount.unwrap_or(100.0)) {
            Ok(amount) => handle_game_action(ctx, session, format!("faucet_claim:{}", amount)).await,
            Err(e) => Err(e),
        },
        InboundMessage::BlackjackDeal {
            amount,
            side_bet_21_plus_3,
            side_bet_perfect_pairs,
        } => match validate_blackjack_deal(amount, side_bet_21_plus_3, side_bet_perfect_pairs) {
            Ok((amount, side_21_3, side_pp)) => {
                handle_game_action(
                    ctx,
                    session,
                    format!("blackjack_deal:{}:{}:{}", amount, side_21_3, side_pp),
                )
                .await
            }
            Err(e) => Err(e),
        },
        InboundMessage::BlackjackHit => handle_game_action(ctx, session, "blackjack_hit".to_string()).await,
        InboundMessage::BlackjackStand => handle_game_action(ctx, session, "blackjack_stand".to_string()).await,
        InboundMessage::BlackjackDouble => handle_game_action(ctx, session, "blackjack_double".to_string()).await,
        InboundMessage::BlackjackSplit => handle_game_action(ctx, session, "blackjack_split".to_string()).await,
        InboundMessage::RouletteSpin { bets } => handle_bet_action(ctx, session, "roulette_spin", bets).await,
        InboundMessage::CrapsRoll { bets } => handle_bet_action(ctx, session, "craps_roll", bets).await,
        InboundMessage::BaccaratDeal { bets } => handle_bet_action(ctx, session, "baccarat_deal", bets).await,
        InboundMessage::SicboRoll { bets } => handle_bet_action(ctx, session, "sicbo_roll", bets).await,
        InboundMessage::ThreecardDeal { amount } => match validate_amount(amount) {
            Ok(amount) => handle_game_action(ctx, session, format!("threecard_deal:{}", amount)).await,
            Err(e) => Err(e),
        },
        InboundMessage::UltimatetxDeal { amount } => match validate_amount(amount) {
            Ok(amount) => handle_game_action(ctx, session, format!("ultimatetx_deal:{}", amount)).await,
            Err(e) => Err(e),
        },
        InboundMessage::VideopokerDeal { amount } => match validate_amount(amount) {
            Ok(amount) => handle_game_action(ctx, session, format!("videopoker_deal:{}", amount)).await,
            Err(e) => Err(e),
        },
        InboundMessage::CasinowarDeal { amount } => match validate_amount(amount) {
            Ok(amount) => handle_game_action(ctx, session, format!("casinowar_deal:{}", amount)).await,
            Err(e) => Err(e),
        },
        InboundMessage::HiloDeal { amount } => match validate_amount(amount) {
            Ok(amount) => handle_game_action(ctx, session, format!("hilo_deal:{}", amount)).await,
            Err(e) => Err(e),
        },
        InboundMessage::HiloHigher => handle_game_action(ctx, session, "hilo_higher".to_string()).await,
        InboundMessage::HiloLower => handle_game_action(ctx, session, "hilo_lower".to_string()).await,
        InboundMessage::HiloCashout => handle_game_action(ctx, session, "hilo_cashout".to_string()).await,
        InboundMessage::SubscribeGame { game_id } => handle_subscribe(ctx, session, &game_id, true).await,
        InboundMessage::UnsubscribeGame { game_id } => handle_subscribe(ctx, session, &game_id, false).await,
        InboundMessage::ListSubscriptions => Ok(OutboundMessage::Subscriptions {
            topics: ctx.broadcast.get_subscriptions(&session.id).await,
        }),
    };

    result.unwrap_or_else(|err| err.to_outbound())
}

async fn handle_bet_action<B: BackendClient>(
    ctx: &HandlerContext<B>,
    session: &Arc<Session>,
    action: &str,
    bets: Vec<Bet>,
) -> Result<OutboundMessage, GatewayError> {
    if bets.is_empty() {
        return Err(GatewayError::validation(ErrorCode::InvalidBet, "at least one bet is required"));
    }
    let encoded = encode_bets(&bets)?;
    handle_game_action(ctx, session, format!("{}:{}", action, encoded)).await
}

async fn handle_get_balance<B: BackendClient>(
    ctx: &HandlerContext<B>,
    session: &Arc<Session>,
) -> Result<OutboundMessage, GatewayError> {
    let account = ctx.backend.get_account(&session.public_key_hex).await?;
    session
        .set_balance(account.balance, account.registered, account.balance > 0)
        .await;
    if let Some(key) = ctx.keys.get(&session.id).await {
        signing::sync_nonce_from_backend(&key, account.nonce).await;
    }
    Ok(OutboundMessage::Balance {
        balance: account.balance.to_string(),
        registered: account.registered,
        has_balance: account.balance > 0,
        message: None,
    })
}

async fn handle_submit_raw<B: BackendClient>(
    ctx: &HandlerContext<B>,
    session: &Arc<Session>,
    submission_b64: String,
    idempotency_key: Option<String>,
) -> Result<OutboundMessage, GatewayError> {
    use base64::Engine;
    let payload = base64::engine::general_purpose::STANDARD
        .decode(submission_b64)
        .map_err(|_| GatewayError::validation(ErrorCode::InvalidMessage, "submission is not valid base64"))?;
    let key = idempotency_key
        .unwrap_or_else(|| format!("{}:raw:{}", session.id, uuid::Uuid::new_v4()));
    submit_and_reply(ctx, session, payload, key, None, false).await
}

/// Builds, signs, and forwards a single textual instruction, then awaits
/// the matching backend event (spec §9 "Handlers that submit on-chain").
async fn handle_game_action<B: BackendClient>(
    ctx: &HandlerContext<B>,
    session: &Arc<Session>,
    instruction: String,
) -> Result<OutboundMessage, GatewayError> {
    let key = ctx
        .keys
        .get(&session.id)
        .await
        .ok_or_else(|| GatewayError::validation(ErrorCode::NotRegistered, "session has no signing key"))?;

    let (tx, nonce) = signing::build_signed_transaction(&key, instruction.as_bytes()).await;
    let submission = encode_submission(&[tx]);
    let idempotency_key = format!("{}:{}", session.id, nonce);

    submit_and_reply(ctx, session, submission, idempotency_key, Some(nonce), false).await
}

async fn submit_and_reply<B: BackendClient>(
    ctx: &HandlerContext<B>,
    session: &Arc<Session>,
    submission: Vec<u8>,
    idempotency_key: String,
    nonce: Option<u64>,
    skip_retries: bool,
) -> Result<OutboundMessage, GatewayError> {
    let forward_result = ctx
        .forwarder
        .forward(&session.id, &idempotency_key, submission, skip_retries)
        .await;

    let response = match forward_result {
        Ok(result) => result.response,
        Err(ForwardError::FingerprintConflict) => {
            return Err(GatewayError::validation(
                ErrorCode::InvalidMessage,
                "idempotency key already used with a different payload",
            ))
        }
        Err(ForwardError::InFlight) => return Err(GatewayError::rate_limited(1)),
        Err(ForwardError::Backend(_)) => {
            return Err(GatewayError::validation(
                ErrorCode::BackendUnavailable,
                "backend unavailable after retries",
            ))
        }
    };

    if !response.accepted {
        let message = response.error_message.unwrap_or_default();
        if nonce.is_some() && is_nonce_mismatch_message(&message) {
            if let Some(key) = ctx.keys.get(&session.id).await {
                signing::clear_pending_on_mismatch(&key).await;
            }
            return Err(GatewayError::validation(ErrorCode::NonceMismatch, message));
        }
        let code = response.error_code.map(map_backend_error_code).unwrap_or(ErrorCode::TransactionRejected);
        return Err(GatewayError::validation(code, message));
    }

    if let Some(nonce) = nonce {
        if let Some(key) = ctx.keys.get(&session.id).await {
            signing::confirm_nonce(&key, nonce).await;
        }
    }

    let backend_session_id = signing::derive_backend_session_id(&session.public_key_hex);
    match ctx.waiter.wait_for(backend_session_id, ctx.event_timeout).await {
        Some(event) => Ok(event_to_outbound(session, event).await),
        None => Ok(OutboundMessage::error(
            ErrorCode::InternalError,
            "submission accepted but no confirmation arrived before the timeout",
        )),
    }
}

/// Renders a decoded backend event as the outbound envelope, reading the
/// session's current balance for events that don't carry one of their own
/// (`game_started`, `player_settled` — spec §8 worked example expects the
/// post-transaction balance, not a placeholder).
async fn event_to_outbound(session: &Arc<Session>, event: CasinoEvent) -> OutboundMessage {
    let session_id = session.id.clone();
    match event {
        CasinoEvent::GameStarted { bet, .. } => {
            let balance = session.snapshot().await.balance;
            OutboundMessage::GameStarted {
                session_id,
                bet: bet.to_string(),
                balance: balance.to_string(),
            }
        }
        CasinoEvent::GameMove { move_number, .. } => OutboundMessage::GameMove {
            session_id,
            move_number,
            balance: None,
        },
        CasinoEvent::GameResult {
            payout,
            final_chips,
            won,
            ..
        } => OutboundMessage::GameResult {
            session_id,
            payout: payout.to_string(),
            final_chips: final_chips.to_string(),
            won,
        },
        CasinoEvent::BalanceSnapshot {
            balance,
            registered,
            has_balance,
            ..
        } => OutboundMessage::Balance {
            balance: balance.to_string(),
            registered,
            has_balance,
            message: None,
        },
        CasinoEvent::BetAccepted { .. } => OutboundMessage::GameMove {
            session_id,
            move_number: 0,
            balance: None,
        },
        CasinoEvent::BetRejected { reason, .. } => {
            OutboundMessage::error(ErrorCode::TransactionRejected, reason)
        }
        CasinoEvent::PlayerSettled { payout, .. } => {
            let balance = session.snapshot().await.balance;
            OutboundMessage::GameResult {
                session_id,
                payout: payout.to_string(),
                final_chips: balance.to_string(),
                won: payout > 0,
            }
        }
        CasinoEvent::RoundOpened { .. } | CasinoEvent::Locked { .. } | CasinoEvent::Outcome { .. } | CasinoEvent::Finalized { .. } => {
            OutboundMessage::Pong
        }
    }
}

async fn handle_subscribe<B: BackendClient>(
    ctx: &HandlerContext<B>,
    session: &Arc<Session>,
    game_id: &str,
    subscribe: bool,
) -> Result<OutboundMessage, GatewayError> {
    let topic = resolve_game_topic(game_id)
        .ok_or_else(|| GatewayError::validation(ErrorCode::InvalidGameType, "unknown game id"))?;
    if subscribe {
        ctx.broadcast.subscribe(&session.id, &[topic]).await;
    } else {
        ctx.broadcast.unsubscribe_from_topic(&session.id, &topic).await;
    }
    Ok(OutboundMessage::Subscriptions {
        topics: ctx.broadcast.get_subscriptions(&session.id).await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::mock::MockBackendClient;
    use crate::backend_client::SubmitResponse;
    use crate::session::SessionManager;
    use crate::signing::KeyRegistry;
    use std::time::Duration;

    async fn make_ctx() -> (HandlerContext<MockBackendClient>, Arc<Session>) {
        let backend = Arc::new(MockBackendClient::new());
        let keys = Arc::new(KeyRegistry::new());
        let forwarder = Arc::new(Forwarder::new(backend.clone(), Duration::from_secs(60), 0));
        let broadcast = Arc::new(BroadcastManager::new());
        let presence = Arc::new(PresenceTracker::new());
        let waiter = Arc::new(EventWaiter::new());

        let session = Arc::new(Session::new("deadbeef".into(), "127.0.0.1".into()));
        keys.create(&session.id).await;

        let ctx = HandlerContext {
            keys,
            backend,
            forwarder,
            broadcast,
            presence,
            waiter,
            event_timeout: Duration::from_millis(50),
        };
        (ctx, session)
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let (ctx, session) = make_ctx().await;
        let reply = dispatch(&ctx, &session, InboundMessage::Ping).await;
        assert!(matches!(reply, OutboundMessage::Pong));
    }

    #[tokio::test]
    async fn negative_amount_is_rejected_without_reaching_the_backend() {
        let (ctx, session) = make_ctx().await;
        let reply = dispatch(
            &ctx,
            &session,
            InboundMessage::BlackjackDeal {
                amount: -5.0,
                side_bet_21_plus_3: None,
                side_bet_perfect_pairs: None,
            },
        )
        .await;
        match reply {
            OutboundMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidBet.as_str()),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(ctx.backend.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deal_times_out_when_no_event_arrives() {
        let (ctx, session) = make_ctx().await;
        let reply = dispatch(
            &ctx,
            &session,
            InboundMessage::BlackjackDeal {
                amount: 100.0,
                side_bet_21_plus_3: None,
                side_bet_perfect_pairs: None,
            },
        )
        .await;
        match reply {
            OutboundMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InternalError.as_str()),
            other => panic!("expected timeout error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_submission_surfaces_mapped_backend_code() {
        let (ctx, session) = make_ctx().await;
        ctx.backend.set_next_response(Ok(SubmitResponse {
            accepted: false,
            error_code: Some(3),
            error_message: Some("insufficient balance".to_string()),
        }));
        let reply = dispatch(
            &ctx,
            &session,
            InboundMessage::BlackjackDeal {
                amount: 100.0,
                side_bet_21_plus_3: None,
                side_bet_perfect_pairs: None,
            },
        )
        .await;
        match reply {
            OutboundMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InsufficientBalance.as_str()),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_game_id_fails_subscription() {
        let (ctx, session) = make_ctx().await;
        let reply = dispatch(
            &ctx,
            &session,
            InboundMessage::SubscribeGame {
                game_id: "dominoes".to_string(),
            },
        )
        .await;
        match reply {
            OutboundMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidGameType.as_str()),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
