//! Built-in player catalog used when a card's metadata document is unreachable

use std::collections::HashMap;

/// Display fields for one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerProfile {
    pub name: String,
    pub position: String,
    pub team: String,
    pub rating: u32,
}

const UNKNOWN: &str = "Unknown";
const DEFAULT_RATING: u32 = 70;

/// Player id -> profile lookup.
#[derive(Debug, Clone, Default)]
pub struct PlayerCatalog {
    players: HashMap<String, PlayerProfile>,
}

impl PlayerCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog seeded with the launch roster.
    pub fn builtin() -> Self {
        let roster: [(&str, &str, &str, &str, u32); 10] = [
            ("1", "Patrick Mahomes", "QB", "Kansas City Chiefs", 99),
            ("2", "Josh Allen", "QB", "Buffalo Bills", 95),
            ("3", "Lamar Jackson", "QB", "Baltimore Ravens", 94),
            ("4", "Aaron Donald", "DT", "Los Angeles Rams", 98),
            ("5", "Travis Kelce", "TE", "Kansas City Chiefs", 97),
            ("6", "Tyreek Hill", "WR", "Miami Dolphins", 96),
            ("7", "Christian McCaffrey", "RB", "San Francisco 49ers", 95),
            ("8", "Myles Garrett", "DE", "Cleveland Browns", 96),
            ("9", "Justin Jefferson", "WR", "Minnesota Vikings", 97),
            ("10", "T.J. Watt", "OLB", "Pittsburgh Steelers", 95),
        ];

        let mut catalog = Self::empty();
        for (id, name, position, team, rating) in roster {
            catalog.insert(
                id,
                PlayerProfile {
                    name: name.to_string(),
                    position: position.to_string(),
                    team: team.to_string(),
                    rating,
                },
            );
        }
        catalog
    }

    pub fn insert(&mut self, player_id: impl Into<String>, profile: PlayerProfile) {
        self.players.insert(player_id.into(), profile);
    }

    /// Profile for `player_id`, or a placeholder for unknown players.
    pub fn lookup(&self, player_id: &str) -> PlayerProfile {
        self.players
            .get(player_id)
            .cloned()
            .unwrap_or_else(|| PlayerProfile {
                name: format!("Player #{}", player_id),
                position: UNKNOWN.to_string(),
                team: UNKNOWN.to_string(),
                rating: DEFAULT_RATING,
            })
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
