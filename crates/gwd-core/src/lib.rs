//! Core domain model for gameweek digests: stored entity rows, typed
//! submission records and the read-side gameweek graph.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gwd-core";

/// Factor carried by a captain's composition link.
pub const CAPTAIN_FACTOR: i32 = 2;
/// Factor carried by every other rostered player.
pub const DEFAULT_FACTOR: i32 = 1;
/// Largest absolute points value accepted for a player, contender or standing.
/// Doubled captain points and match totals stay well inside `i32`.
pub const POINTS_LIMIT: i32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameweekKind {
    Classic,
    #[serde(rename = "h2h")]
    HeadToHead,
}

impl GameweekKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameweekKind::Classic => "classic",
            GameweekKind::HeadToHead => "h2h",
        }
    }

    /// Whether team snapshot points are overwritten on re-submission. In
    /// head-to-head mode the standing row holds the authoritative score.
    pub fn team_points_authoritative(&self) -> bool {
        matches!(self, GameweekKind::Classic)
    }
}

impl fmt::Display for GameweekKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameweekKind {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classic" => Ok(GameweekKind::Classic),
            "h2h" | "head_to_head" | "head-to-head" | "headtohead" => Ok(GameweekKind::HeadToHead),
            other => Err(DigestError::Validation(format!(
                "unknown gameweek mode `{other}` (expected `classic` or `h2h`)"
            ))),
        }
    }
}

/// One scoring period of a league. Unique per (league_id, number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gameweek {
    pub id: Uuid,
    pub league_id: i64,
    pub number: i32,
    pub kind: GameweekKind,
    pub created_at: DateTime<Utc>,
}

/// A contender's state in one gameweek. Unique per (team_id, gameweek_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSnapshot {
    pub id: Uuid,
    pub team_id: i64,
    pub gameweek_id: Uuid,
    pub name: String,
    pub leader: String,
    pub points: i32,
    pub position: i32,
}

/// Unique per (player_id, team_label, gameweek_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub id: Uuid,
    pub player_id: i64,
    pub gameweek_id: Uuid,
    pub name: String,
    pub team_label: String,
    pub points: i32,
}

/// Roster membership of a player in a team snapshot; `factor` is the only
/// field that changes on re-submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionLink {
    pub team_snapshot_id: Uuid,
    pub player_snapshot_id: Uuid,
    pub factor: i32,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub gameweek_id: Uuid,
    pub first_team_id: Uuid,
    pub second_team_id: Uuid,
    pub position: i32,
}

/// Authoritative head-to-head score. Unique per (gameweek_id, team_snapshot_id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    pub gameweek_id: Uuid,
    pub team_snapshot_id: Uuid,
    pub points: i32,
    pub position: i32,
}

/// Validated roster entry of an incoming contender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub player_id: i64,
    pub name: String,
    pub team: String,
    pub points: i32,
    pub factor: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContenderEntry {
    pub team_id: i64,
    pub name: String,
    pub leader: String,
    pub score: i32,
    pub composition: Vec<PlayerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPair {
    pub first_contender_id: i64,
    pub second_contender_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandingEntry {
    pub contender_id: i64,
    pub points: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassicSubmission {
    pub league_id: i64,
    pub gameweek: i32,
    pub contenders: Vec<ContenderEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadToHeadSubmission {
    pub league_id: i64,
    pub gameweek: i32,
    pub contenders: Vec<ContenderEntry>,
    pub matches: Vec<MatchPair>,
    pub standings: Vec<StandingEntry>,
}

/// A validated snapshot, tagged by mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Submission {
    Classic(ClassicSubmission),
    #[serde(rename = "h2h")]
    HeadToHead(HeadToHeadSubmission),
}

impl Submission {
    pub fn kind(&self) -> GameweekKind {
        match self {
            Submission::Classic(_) => GameweekKind::Classic,
            Submission::HeadToHead(_) => GameweekKind::HeadToHead,
        }
    }

    pub fn league_id(&self) -> i64 {
        match self {
            Submission::Classic(s) => s.league_id,
            Submission::HeadToHead(s) => s.league_id,
        }
    }

    pub fn gameweek(&self) -> i32 {
        match self {
            Submission::Classic(s) => s.gameweek,
            Submission::HeadToHead(s) => s.gameweek,
        }
    }

    pub fn contenders(&self) -> &[ContenderEntry] {
        match self {
            Submission::Classic(s) => &s.contenders,
            Submission::HeadToHead(s) => &s.contenders,
        }
    }
}

/// A player as seen from one contender's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSlot {
    pub player: PlayerSnapshot,
    pub factor: i32,
}

impl RosterSlot {
    pub fn effective_points(&self) -> i32 {
        self.player.points * self.factor
    }

    pub fn is_captain(&self) -> bool {
        self.factor == CAPTAIN_FACTOR
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contender {
    pub team: TeamSnapshot,
    pub composition: Vec<RosterSlot>,
}

impl Contender {
    /// The single captain of this roster, if exactly one link carries the
    /// captain factor.
    pub fn sole_captain(&self) -> Option<&RosterSlot> {
        let mut captains = self.composition.iter().filter(|slot| slot.is_captain());
        match (captains.next(), captains.next()) {
            (Some(captain), None) => Some(captain),
            _ => None,
        }
    }
}

/// Fully resolved gameweek as loaded for reporting. Contenders, matches and
/// standings are in stored submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameweekGraph {
    pub gameweek: Gameweek,
    pub contenders: Vec<Contender>,
    pub matches: Vec<MatchRecord>,
    pub standings: Vec<Standing>,
}

impl GameweekGraph {
    pub fn contender(&self, team_snapshot_id: Uuid) -> Option<&Contender> {
        self.contenders.iter().find(|c| c.team.id == team_snapshot_id)
    }
}

/// Failure kinds surfaced by ingestion, reporting and delivery.
#[derive(Debug, Error)]
pub enum DigestError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("resolution failed: {0}")]
    Resolution(String),
    #[error("{0}")]
    NotFound(String),
    #[error("external delivery failed: {0}")]
    ExternalDelivery(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl DigestError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DigestError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DigestError::NotFound(msg.into())
    }
}

pub type DigestResult<T> = Result<T, DigestError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(player_id: i64, points: i32, factor: i32) -> RosterSlot {
        RosterSlot {
            player: PlayerSnapshot {
                id: Uuid::new_v4(),
                player_id,
                gameweek_id: Uuid::nil(),
                name: format!("P{player_id}"),
                team_label: "ARS".into(),
                points,
            },
            factor,
        }
    }

    fn contender(slots: Vec<RosterSlot>) -> Contender {
        Contender {
            team: TeamSnapshot {
                id: Uuid::new_v4(),
                team_id: 1,
                gameweek_id: Uuid::nil(),
                name: "Team".into(),
                leader: "Lead".into(),
                points: 0,
                position: 0,
            },
            composition: slots,
        }
    }

    #[test]
    fn mode_parses_aliases_and_rejects_unknown() {
        assert_eq!("classic".parse::<GameweekKind>().unwrap(), GameweekKind::Classic);
        assert_eq!(" H2H ".parse::<GameweekKind>().unwrap(), GameweekKind::HeadToHead);
        assert_eq!(
            "head-to-head".parse::<GameweekKind>().unwrap(),
            GameweekKind::HeadToHead
        );
        assert!(matches!(
            "draft".parse::<GameweekKind>(),
            Err(DigestError::Validation(_))
        ));
    }

    #[test]
    fn captain_doubles_effective_points() {
        assert_eq!(slot(1, 6, CAPTAIN_FACTOR).effective_points(), 12);
        assert_eq!(slot(1, 6, DEFAULT_FACTOR).effective_points(), 6);
    }

    #[test]
    fn sole_captain_requires_exactly_one() {
        let none = contender(vec![slot(1, 3, 1), slot(2, 4, 1)]);
        assert!(none.sole_captain().is_none());

        let one = contender(vec![slot(1, 3, 1), slot(2, 4, 2)]);
        assert_eq!(one.sole_captain().map(|s| s.player.player_id), Some(2));

        let two = contender(vec![slot(1, 3, 2), slot(2, 4, 2)]);
        assert!(two.sole_captain().is_none());
    }

    #[test]
    fn submission_serializes_with_mode_tag() {
        let submission = Submission::HeadToHead(HeadToHeadSubmission {
            league_id: 7,
            gameweek: 3,
            contenders: vec![],
            matches: vec![],
            standings: vec![],
        });
        let value = serde_json::to_value(&submission).unwrap();
        assert_eq!(value["type"], "h2h");
        assert_eq!(submission.kind(), GameweekKind::HeadToHead);
        assert!(!submission.kind().team_points_authoritative());
    }
}
