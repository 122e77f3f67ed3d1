//! Game phase enumeration and raw-phase mapping

/// Discrete stage of a tracked match lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GamePhase {
    #[default]
    None,
    Lobby,
    Matchmaking,
    ChampionSelect,
    GameStart,
    InGame,
    PostGame,
}

impl GamePhase {
    /// Map a raw gameflow phase string onto the closed enumeration. Any
    /// unrecognized string maps to [`GamePhase::None`].
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "HomeScreen" => GamePhase::None,
            "Lobby" => GamePhase::Lobby,
            "Matchmaking" => GamePhase::Matchmaking,
            "ChampSelect" => GamePhase::ChampionSelect,
            "GameStart" => GamePhase::GameStart,
            "InProgress" => GamePhase::InGame,
            "WaitingForStats" | "PreEndOfGame" | "EndOfGame" => GamePhase::PostGame,
            _ => GamePhase::None,
        }
    }
}
