//! Canonical game identifiers and the `game:<name>` topic mapping used by
//! the broadcast router (spec §4.5).

use serde::{Deserialize, Serialize};

/// All games the gateway knows how to validate bets for and subscribe
/// clients to. The backend owns the actual rules; the gateway only needs
/// enough of a model to validate shape and route topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    Blackjack,
    Roulette,
    Craps,
    Baccarat,
    Sicbo,
    ThreeCard,
    UltimateTexasHoldem,
    VideoPoker,
    CasinoWar,
    HiLo,
}

impl GameKind {
    /// Maps a numeric id (0-9, as a client might send for compactness) to
    /// its `GameKind`. Returns `None` for any id outside the known range.
    pub fn from_id(id: u8) -> Option<Self> {
        use GameKind::*;
        Some(match id {
            0 => Blackjack,
            1 => Roulette,
            2 => Craps,
            3 => Baccarat,
            4 => Sicbo,
            5 => ThreeCard,
            6 => UltimateTexasHoldem,
            7 => VideoPoker,
            8 => CasinoWar,
            9 => HiLo,
            _ => return None,
        })
    }

    /// Maps a known string alias (as used in `subscribe_game`/message
    /// handler routing) to its `GameKind`. Unknown aliases return `None`
    /// so the caller can fail validation per spec §4.5.
    pub fn from_alias(alias: &str) -> Option<Self> {
        use GameKind::*;
        Some(match alias {
            "blackjack" => Blackjack,
            "roulette" => Roulette,
            "craps" => Craps,
            "baccarat" => Baccarat,
            "sicbo" => Sicbo,
            "threecard" | "three_card" => ThreeCard,
            "ultimatetx" | "ultimate_texas_holdem" => UltimateTexasHoldem,
            "videopoker" | "video_poker" => VideoPoker,
            "casinowar" | "casino_war" => CasinoWar,
            "hilo" | "hi_lo" => HiLo,
            _ => return None,
        })
    }

    /// The canonical name used inside `game:<name>` topics.
    pub fn canonical_name(self) -> &'static str {
        use GameKind::*;
        match self {
            Blackjack => "blackjack",
            Roulette => "roulette",
            Craps => "craps",
            Baccarat => "baccarat",
            Sicbo => "sicbo",
            ThreeCard => "threecard",
            UltimateTexasHoldem => "ultimatetx",
            VideoPoker => "videopoker",
            CasinoWar => "casinowar",
            HiLo => "hilo",
        }
    }

    /// The canonical `game:<name>` topic string for this game.
    pub fn topic(self) -> String {
        format!("game:{}", self.canonical_name())
    }
}

/// Resolves either a numeric id or a known string alias to a topic,
/// failing validation (returning `None`) for anything unrecognized.
pub fn resolve_game_topic(game_id: &str) -> Option<String> {
    if let Ok(numeric) = game_id.parse::<u8>() {
        return GameKind::from_id(numeric).map(GameKind::topic);
    }
    GameKind::from_alias(game_id).map(GameKind::topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_and_alias_round_trip_to_the_same_topic() {
        for id in 0u8..=9 {
            let kind = GameKind::from_id(id).unwrap();
            let alias = kind.canonical_name();
            assert_eq!(GameKind::from_alias(alias), Some(kind));
        }
    }

    #[test]
    fn unknown_game_id_fails_validation() {
        assert_eq!(GameKind::from_id(10), None);
        assert_eq!(GameKind::from_alias("dominoes"), None);
        assert_eq!(resolve_game_topic("99"), None);
        assert_eq!(resolve_game_topic("dominoes"), None);
    }

    #[test]
    fn numeric_and_alias_agree_on_topic() {
        assert_eq!(resolve_game_topic("0").as_deref(), Some("game:blackjack"));
        assert_eq!(
            resolve_game_topic("blackjack").as_deref(),
            Some("game:blackjack")
        );
    }
}
