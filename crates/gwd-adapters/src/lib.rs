//! Payload adapters: validate raw gameweek snapshots into typed submissions
//! before anything is written.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use gwd_core::{
    ClassicSubmission, ContenderEntry, DigestError, DigestResult, GameweekKind,
    HeadToHeadSubmission, MatchPair, PlayerEntry, StandingEntry, Submission, CAPTAIN_FACTOR,
    DEFAULT_FACTOR, POINTS_LIMIT,
};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "gwd-adapters";

/// Header carrying the payload mode on queue events.
pub const MODE_HEADER: &str = "type";

pub trait PayloadAdapter: Send + Sync {
    fn mode(&self) -> GameweekKind;

    fn parse(&self, raw: &JsonValue) -> DigestResult<Submission>;
}

pub struct ClassicPayloadAdapter;

pub struct HeadToHeadPayloadAdapter;

pub fn adapter_for_mode(mode: GameweekKind) -> Box<dyn PayloadAdapter> {
    match mode {
        GameweekKind::Classic => Box::new(ClassicPayloadAdapter),
        GameweekKind::HeadToHead => Box::new(HeadToHeadPayloadAdapter),
    }
}

/// Validate a raw payload whose mode was chosen out-of-band.
pub fn parse_submission(mode: GameweekKind, raw: &JsonValue) -> DigestResult<Submission> {
    adapter_for_mode(mode).parse(raw)
}

pub fn parse_submission_slice(mode: GameweekKind, bytes: &[u8]) -> DigestResult<Submission> {
    let raw: JsonValue = serde_json::from_slice(bytes)
        .map_err(|err| DigestError::validation(format!("payload is not valid JSON: {err}")))?;
    parse_submission(mode, &raw)
}

pub fn load_submission_file(mode: GameweekKind, path: impl AsRef<Path>) -> DigestResult<Submission> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_submission_slice(mode, &data)
}

/// Queue message shape: the payload plus transport headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub payload: JsonValue,
    #[serde(default)]
    pub headers: BTreeMap<String, JsonValue>,
}

impl EventEnvelope {
    pub fn mode(&self) -> DigestResult<GameweekKind> {
        let header = self.headers.get(MODE_HEADER).ok_or_else(|| {
            DigestError::validation(format!("event is missing the `{MODE_HEADER}` header"))
        })?;
        match header {
            JsonValue::String(s) => s.parse(),
            other => Err(DigestError::validation(format!(
                "`{MODE_HEADER}` header must be a string, got {other}"
            ))),
        }
    }

    pub fn into_submission(self) -> DigestResult<Submission> {
        let mode = self.mode()?;
        parse_submission(mode, &self.payload)
    }
}

pub fn decode_event(bytes: &[u8]) -> DigestResult<Submission> {
    let envelope: EventEnvelope = serde_json::from_slice(bytes)
        .map_err(|err| DigestError::validation(format!("malformed event envelope: {err}")))?;
    envelope.into_submission()
}

impl PayloadAdapter for ClassicPayloadAdapter {
    fn mode(&self) -> GameweekKind {
        GameweekKind::Classic
    }

    fn parse(&self, raw: &JsonValue) -> DigestResult<Submission> {
        let payload: RawClassic = from_raw(raw)?;
        let contenders = contenders_from_raw(payload.contenders)?;
        Ok(Submission::Classic(ClassicSubmission {
            league_id: payload.league_id,
            gameweek: payload.gameweek,
            contenders,
        }))
    }
}

impl PayloadAdapter for HeadToHeadPayloadAdapter {
    fn mode(&self) -> GameweekKind {
        GameweekKind::HeadToHead
    }

    fn parse(&self, raw: &JsonValue) -> DigestResult<Submission> {
        let payload: RawHeadToHead = from_raw(raw)?;
        let contenders = contenders_from_raw(payload.contenders)?;

        let matches = payload
            .matches
            .into_iter()
            .map(|m| MatchPair {
                first_contender_id: m.first_contender_id,
                second_contender_id: m.second_contender_id,
            })
            .collect();

        let standings = match payload.standings {
            Some(rows) => rows
                .into_iter()
                .map(|row| -> DigestResult<StandingEntry> {
                    check_points(row.points, || {
                        format!("standing for contender {}", row.contender_id)
                    })?;
                    Ok(StandingEntry {
                        contender_id: row.contender_id,
                        points: row.points,
                    })
                })
                .collect::<DigestResult<Vec<_>>>()?,
            None => contenders
                .iter()
                .map(|c| StandingEntry {
                    contender_id: c.team_id,
                    points: c.score,
                })
                .collect(),
        };

        Ok(Submission::HeadToHead(HeadToHeadSubmission {
            league_id: payload.league_id,
            gameweek: payload.gameweek,
            contenders,
            matches,
            standings,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct RawClassic {
    #[serde(deserialize_with = "lenient_i64")]
    league_id: i64,
    #[serde(deserialize_with = "lenient_i32")]
    gameweek: i32,
    contenders: Vec<RawContender>,
}

#[derive(Debug, Deserialize)]
struct RawHeadToHead {
    #[serde(deserialize_with = "lenient_i64")]
    league_id: i64,
    #[serde(deserialize_with = "lenient_i32")]
    gameweek: i32,
    contenders: Vec<RawContender>,
    matches: Vec<RawMatch>,
    #[serde(default)]
    standings: Option<Vec<RawStanding>>,
}

#[derive(Debug, Deserialize)]
struct RawContender {
    #[serde(deserialize_with = "lenient_i64")]
    team_id: i64,
    name: String,
    leader: String,
    #[serde(deserialize_with = "lenient_i32")]
    score: i32,
    #[serde(default)]
    composition: Vec<RawPlayer>,
}

#[derive(Debug, Deserialize)]
struct RawPlayer {
    #[serde(deserialize_with = "lenient_i64")]
    player_id: i64,
    name: String,
    team: String,
    #[serde(deserialize_with = "lenient_i32")]
    points: i32,
    #[serde(default = "default_factor", deserialize_with = "lenient_i32")]
    factor: i32,
}

#[derive(Debug, Deserialize)]
struct RawMatch {
    #[serde(deserialize_with = "lenient_i64")]
    first_contender_id: i64,
    #[serde(deserialize_with = "lenient_i64")]
    second_contender_id: i64,
}

#[derive(Debug, Deserialize)]
struct RawStanding {
    #[serde(deserialize_with = "lenient_i64")]
    contender_id: i64,
    #[serde(deserialize_with = "lenient_i32")]
    points: i32,
}

fn default_factor() -> i32 {
    DEFAULT_FACTOR
}

fn from_raw<T: for<'de> Deserialize<'de>>(raw: &JsonValue) -> DigestResult<T> {
    if !raw.is_object() {
        return Err(DigestError::validation("payload must be a JSON object"));
    }
    T::deserialize(raw).map_err(|err| DigestError::validation(err.to_string()))
}

fn check_points(points: i32, what: impl FnOnce() -> String) -> DigestResult<()> {
    if !(-POINTS_LIMIT..=POINTS_LIMIT).contains(&points) {
        return Err(DigestError::validation(format!(
            "{} has points {points} (limit is {POINTS_LIMIT})",
            what()
        )));
    }
    Ok(())
}

fn contenders_from_raw(raw: Vec<RawContender>) -> DigestResult<Vec<ContenderEntry>> {
    let mut out = Vec::with_capacity(raw.len());
    for contender in raw {
        check_points(contender.score, || format!("team {}", contender.team_id))?;
        let mut composition = Vec::with_capacity(contender.composition.len());
        for player in contender.composition {
            if player.factor != DEFAULT_FACTOR && player.factor != CAPTAIN_FACTOR {
                return Err(DigestError::validation(format!(
                    "player {} in team {} has factor {} (expected {DEFAULT_FACTOR} or {CAPTAIN_FACTOR})",
                    player.player_id, contender.team_id, player.factor
                )));
            }
            check_points(player.points, || {
                format!("player {} in team {}", player.player_id, contender.team_id)
            })?;
            composition.push(PlayerEntry {
                player_id: player.player_id,
                name: player.name,
                team: player.team,
                points: player.points,
                factor: player.factor,
            });
        }

        out.push(ContenderEntry {
            team_id: contender.team_id,
            name: contender.name,
            leader: contender.leader,
            score: contender.score,
            composition,
        });
    }
    Ok(out)
}

fn coerce_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .filter(|f| *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = JsonValue::deserialize(deserializer)?;
    coerce_i64(&value)
        .ok_or_else(|| de::Error::custom(format!("expected an integer, got {value}")))
}

fn lenient_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    let value = JsonValue::deserialize(deserializer)?;
    coerce_i64(&value)
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| de::Error::custom(format!("expected a 32-bit integer, got {value}")))
}
