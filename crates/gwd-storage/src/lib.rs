//! Conflict-resolving graph storage (Postgres + in-memory) and the outbound
//! webhook client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gwd_core::{
    CompositionLink, Contender, Gameweek, GameweekGraph, GameweekKind, MatchRecord,
    PlayerSnapshot, RosterSlot, Standing, TeamSnapshot,
};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gwd-storage";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerUpsert {
    pub player_id: i64,
    pub name: String,
    pub team_label: String,
    pub points: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamUpsert {
    pub team_id: i64,
    pub name: String,
    pub leader: String,
    pub points: i32,
    pub position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkUpsert {
    pub team_snapshot_id: Uuid,
    pub player_snapshot_id: Uuid,
    pub factor: i32,
    pub position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandingUpsert {
    pub team_snapshot_id: Uuid,
    pub points: i32,
    pub position: i32,
}

/// Read access plus the entry point for one submission's write transaction.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn SubmissionTx>>;

    /// Load a gameweek by number, or the league's latest when `number` is `None`.
    async fn load_gameweek(&self, league_id: i64, number: Option<i32>)
        -> Result<Option<GameweekGraph>>;

    async fn list_gameweeks(&self, league_id: i64) -> Result<Vec<Gameweek>>;
}

/// Conflict-resolving writes for one submission. Nothing is visible to
/// readers until `commit`; dropping the transaction discards it.
#[async_trait]
pub trait SubmissionTx: Send {
    /// Insert-or-touch the gameweek row; `None` means no id came back.
    async fn upsert_gameweek(
        &mut self,
        league_id: i64,
        number: i32,
        kind: GameweekKind,
    ) -> Result<Option<Uuid>>;

    /// Keyed by (player_id, team_label, gameweek); overwrites points and name.
    /// Returns external player id -> snapshot id.
    async fn upsert_players(
        &mut self,
        gameweek_id: Uuid,
        players: &[PlayerUpsert],
    ) -> Result<HashMap<i64, Uuid>>;

    /// Keyed by (team_id, gameweek); overwrites name and leader, and points
    /// only when `overwrite_points` is set. Returns external team id -> snapshot id.
    async fn upsert_teams(
        &mut self,
        gameweek_id: Uuid,
        teams: &[TeamUpsert],
        overwrite_points: bool,
    ) -> Result<HashMap<i64, Uuid>>;

    /// Keyed by (team snapshot, player snapshot); overwrites factor only.
    async fn upsert_links(&mut self, links: &[LinkUpsert]) -> Result<u64>;

    /// Delete every match of the gameweek, then insert `pairs` in order.
    async fn replace_matches(&mut self, gameweek_id: Uuid, pairs: &[(Uuid, Uuid)]) -> Result<u64>;

    /// Keyed by (gameweek, team snapshot); overwrites points.
    async fn upsert_standings(&mut self, gameweek_id: Uuid, rows: &[StandingUpsert])
        -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    gameweeks: Vec<Gameweek>,
    teams: Vec<TeamSnapshot>,
    players: Vec<PlayerSnapshot>,
    links: Vec<CompositionLink>,
    matches: Vec<MatchRecord>,
    standings: Vec<Standing>,
}

impl GraphState {
    fn graph_for(&self, gameweek: &Gameweek) -> GameweekGraph {
        let players: HashMap<Uuid, &PlayerSnapshot> =
            self.players.iter().map(|p| (p.id, p)).collect();

        let mut teams: Vec<&TeamSnapshot> = self
            .teams
            .iter()
            .filter(|t| t.gameweek_id == gameweek.id)
            .collect();
        teams.sort_by_key(|t| (t.position, t.team_id));

        let contenders = teams
            .into_iter()
            .map(|team| {
                let mut links: Vec<&CompositionLink> = self
                    .links
                    .iter()
                    .filter(|l| l.team_snapshot_id == team.id)
                    .collect();
                links.sort_by_key(|l| l.position);
                let composition = links
                    .into_iter()
                    .filter_map(|l| {
                        players.get(&l.player_snapshot_id).map(|p| RosterSlot {
                            player: (*p).clone(),
                            factor: l.factor,
                        })
                    })
                    .collect();
                Contender {
                    team: team.clone(),
                    composition,
                }
            })
            .collect();

        let mut matches: Vec<MatchRecord> = self
            .matches
            .iter()
            .filter(|m| m.gameweek_id == gameweek.id)
            .cloned()
            .collect();
        matches.sort_by_key(|m| m.position);

        let mut standings: Vec<Standing> = self
            .standings
            .iter()
            .filter(|s| s.gameweek_id == gameweek.id)
            .cloned()
            .collect();
        standings.sort_by_key(|s| s.position);

        GameweekGraph {
            gameweek: gameweek.clone(),
            contenders,
            matches,
            standings,
        }
    }
}

/// Row counts per entity, for inspecting a `MemoryStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphCounts {
    pub gameweeks: usize,
    pub teams: usize,
    pub players: usize,
    pub links: usize,
    pub matches: usize,
    pub standings: usize,
}

/// In-process store with the same conflict semantics as `PgStore`.
/// Transactions are serialised: each holds the state lock until commit or drop.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<GraphState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn counts(&self) -> GraphCounts {
        let state = self.state.lock().await;
        GraphCounts {
            gameweeks: state.gameweeks.len(),
            teams: state.teams.len(),
            players: state.players.len(),
            links: state.links.len(),
            matches: state.matches.len(),
            standings: state.standings.len(),
        }
    }

    pub async fn team_snapshots(&self) -> Vec<TeamSnapshot> {
        self.state.lock().await.teams.clone()
    }

    pub async fn player_snapshots(&self) -> Vec<PlayerSnapshot> {
        self.state.lock().await.players.clone()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn SubmissionTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn load_gameweek(
        &self,
        league_id: i64,
        number: Option<i32>,
    ) -> Result<Option<GameweekGraph>> {
        let state = self.state.lock().await;
        let gameweek = state
            .gameweeks
            .iter()
            .filter(|g| g.league_id == league_id)
            .filter(|g| number.map_or(true, |n| g.number == n))
            .max_by_key(|g| g.number);
        Ok(gameweek.map(|g| state.graph_for(g)))
    }

    async fn list_gameweeks(&self, league_id: i64) -> Result<Vec<Gameweek>> {
        let state = self.state.lock().await;
        let mut out: Vec<Gameweek> = state
            .gameweeks
            .iter()
            .filter(|g| g.league_id == league_id)
            .cloned()
            .collect();
        out.sort_by_key(|g| std::cmp::Reverse(g.number));
        Ok(out)
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<GraphState>,
    working: GraphState,
}

#[async_trait]
impl SubmissionTx for MemoryTx {
    async fn upsert_gameweek(
        &mut self,
        league_id: i64,
        number: i32,
        kind: GameweekKind,
    ) -> Result<Option<Uuid>> {
        if let Some(existing) = self
            .working
            .gameweeks
            .iter_mut()
            .find(|g| g.league_id == league_id && g.number == number)
        {
            existing.kind = kind;
            return Ok(Some(existing.id));
        }
        let id = Uuid::new_v4();
        self.working.gameweeks.push(Gameweek {
            id,
            league_id,
            number,
            kind,
            created_at: Utc::now(),
        });
        Ok(Some(id))
    }

    async fn upsert_players(
        &mut self,
        gameweek_id: Uuid,
        players: &[PlayerUpsert],
    ) -> Result<HashMap<i64, Uuid>> {
        let mut ids = HashMap::with_capacity(players.len());
        for row in players {
            let existing = self.working.players.iter_mut().find(|p| {
                p.player_id == row.player_id
                    && p.team_label == row.team_label
                    && p.gameweek_id == gameweek_id
            });
            let id = match existing {
                Some(p) => {
                    p.points = row.points;
                    p.name = row.name.clone();
                    p.id
                }
                None => {
                    let id = Uuid::new_v4();
                    self.working.players.push(PlayerSnapshot {
                        id,
                        player_id: row.player_id,
                        gameweek_id,
                        name: row.name.clone(),
                        team_label: row.team_label.clone(),
                        points: row.points,
                    });
                    id
                }
            };
            ids.insert(row.player_id, id);
        }
        Ok(ids)
    }

    async fn upsert_teams(
        &mut self,
        gameweek_id: Uuid,
        teams: &[TeamUpsert],
        overwrite_points: bool,
    ) -> Result<HashMap<i64, Uuid>> {
        let mut ids = HashMap::with_capacity(teams.len());
        for row in teams {
            let existing = self
                .working
                .teams
                .iter_mut()
                .find(|t| t.team_id == row.team_id && t.gameweek_id == gameweek_id);
            let id = match existing {
                Some(t) => {
                    t.name = row.name.clone();
                    t.leader = row.leader.clone();
                    t.position = row.position;
                    if overwrite_points {
                        t.points = row.points;
                    }
                    t.id
                }
                None => {
                    let id = Uuid::new_v4();
                    self.working.teams.push(TeamSnapshot {
                        id,
                        team_id: row.team_id,
                        gameweek_id,
                        name: row.name.clone(),
                        leader: row.leader.clone(),
                        points: row.points,
                        position: row.position,
                    });
                    id
                }
            };
            ids.insert(row.team_id, id);
        }
        Ok(ids)
    }

    async fn upsert_links(&mut self, links: &[LinkUpsert]) -> Result<u64> {
        for row in links {
            let existing = self.working.links.iter_mut().find(|l| {
                l.team_snapshot_id == row.team_snapshot_id
                    && l.player_snapshot_id == row.player_snapshot_id
            });
            match existing {
                Some(l) => {
                    l.factor = row.factor;
                    l.position = row.position;
                }
                None => self.working.links.push(CompositionLink {
                    team_snapshot_id: row.team_snapshot_id,
                    player_snapshot_id: row.player_snapshot_id,
                    factor: row.factor,
                    position: row.position,
                }),
            }
        }
        Ok(links.len() as u64)
    }

    async fn replace_matches(&mut self, gameweek_id: Uuid, pairs: &[(Uuid, Uuid)]) -> Result<u64> {
        self.working.matches.retain(|m| m.gameweek_id != gameweek_id);
        for (idx, (first, second)) in pairs.iter().enumerate() {
            self.working.matches.push(MatchRecord {
                id: Uuid::new_v4(),
                gameweek_id,
                first_team_id: *first,
                second_team_id: *second,
                position: idx as i32,
            });
        }
        Ok(pairs.len() as u64)
    }

    async fn upsert_standings(
        &mut self,
        gameweek_id: Uuid,
        rows: &[StandingUpsert],
    ) -> Result<u64> {
        for row in rows {
            let existing = self
                .working
                .standings
                .iter_mut()
                .find(|s| s.gameweek_id == gameweek_id && s.team_snapshot_id == row.team_snapshot_id);
            match existing {
                Some(s) => {
                    s.points = row.points;
                    s.position = row.position;
                }
                None => self.working.standings.push(Standing {
                    gameweek_id,
                    team_snapshot_id: row.team_snapshot_id,
                    points: row.points,
                    position: row.position,
                }),
            }
        }
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

/// Postgres-backed store. The pool is owned by the caller's bootstrap and
/// handed in; each submission borrows one connection for its transaction.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn gameweek_from_row(row: &PgRow) -> Result<Gameweek> {
    let kind: String = row.try_get("kind")?;
    Ok(Gameweek {
        id: row.try_get("id")?,
        league_id: row.try_get("league_id")?,
        number: row.try_get("number")?,
        kind: kind
            .parse()
            .with_context(|| format!("decoding gameweek kind `{kind}`"))?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl GraphStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn SubmissionTx>> {
        let tx = self.pool.begin().await.context("opening transaction")?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn load_gameweek(
        &self,
        league_id: i64,
        number: Option<i32>,
    ) -> Result<Option<GameweekGraph>> {
        let row = sqlx::query(
            r#"
            SELECT id, league_id, number, kind, created_at
              FROM gameweeks
             WHERE league_id = $1
               AND ($2::int4 IS NULL OR number = $2)
             ORDER BY number DESC
             LIMIT 1
            "#,
        )
        .bind(league_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await
        .context("loading gameweek")?;
        let Some(row) = row else { return Ok(None) };
        let gameweek = gameweek_from_row(&row)?;

        let team_rows = sqlx::query(
            r#"
            SELECT id, team_id, name, leader, points, position
              FROM team_snapshots
             WHERE gameweek_id = $1
             ORDER BY position, team_id
            "#,
        )
        .bind(gameweek.id)
        .fetch_all(&self.pool)
        .await
        .context("loading team snapshots")?;

        let mut contenders = Vec::with_capacity(team_rows.len());
        for row in team_rows {
            contenders.push(Contender {
                team: TeamSnapshot {
                    id: row.try_get("id")?,
                    team_id: row.try_get("team_id")?,
                    gameweek_id: gameweek.id,
                    name: row.try_get("name")?,
                    leader: row.try_get("leader")?,
                    points: row.try_get("points")?,
                    position: row.try_get("position")?,
                },
                composition: Vec::new(),
            });
        }

        let roster_rows = sqlx::query(
            r#"
            SELECT l.team_snapshot_id, l.factor,
                   p.id, p.player_id, p.name, p.team_label, p.points
              FROM composition_links l
              JOIN player_snapshots p ON p.id = l.player_snapshot_id
              JOIN team_snapshots t ON t.id = l.team_snapshot_id
             WHERE t.gameweek_id = $1
             ORDER BY l.position, p.player_id
            "#,
        )
        .bind(gameweek.id)
        .fetch_all(&self.pool)
        .await
        .context("loading composition links")?;

        let slot_index: HashMap<Uuid, usize> = contenders
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.team.id, idx))
            .collect();
        for row in roster_rows {
            let team_snapshot_id: Uuid = row.try_get("team_snapshot_id")?;
            let Some(idx) = slot_index.get(&team_snapshot_id) else {
                continue;
            };
            contenders[*idx].composition.push(RosterSlot {
                player: PlayerSnapshot {
                    id: row.try_get("id")?,
                    player_id: row.try_get("player_id")?,
                    gameweek_id: gameweek.id,
                    name: row.try_get("name")?,
                    team_label: row.try_get("team_label")?,
                    points: row.try_get("points")?,
                },
                factor: row.try_get("factor")?,
            });
        }

        let matches = sqlx::query(
            r#"
            SELECT id, first_team_id, second_team_id, position
              FROM matches
             WHERE gameweek_id = $1
             ORDER BY position
            "#,
        )
        .bind(gameweek.id)
        .fetch_all(&self.pool)
        .await
        .context("loading matches")?
        .into_iter()
        .map(|row| -> Result<MatchRecord> {
            Ok(MatchRecord {
                id: row.try_get("id")?,
                gameweek_id: gameweek.id,
                first_team_id: row.try_get("first_team_id")?,
                second_team_id: row.try_get("second_team_id")?,
                position: row.try_get("position")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let standings = sqlx::query(
            r#"
            SELECT team_snapshot_id, points, position
              FROM standings
             WHERE gameweek_id = $1
             ORDER BY position
            "#,
        )
        .bind(gameweek.id)
        .fetch_all(&self.pool)
        .await
        .context("loading standings")?
        .into_iter()
        .map(|row| -> Result<Standing> {
            Ok(Standing {
                gameweek_id: gameweek.id,
                team_snapshot_id: row.try_get("team_snapshot_id")?,
                points: row.try_get("points")?,
                position: row.try_get("position")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(GameweekGraph {
            gameweek,
            contenders,
            matches,
            standings,
        }))
    }

    async fn list_gameweeks(&self, league_id: i64) -> Result<Vec<Gameweek>> {
        let rows = sqlx::query(
            r#"
            SELECT id, league_id, number, kind, created_at
              FROM gameweeks
             WHERE league_id = $1
             ORDER BY number DESC
            "#,
        )
        .bind(league_id)
        .fetch_all(&self.pool)
        .await
        .context("listing gameweeks")?;
        rows.iter().map(gameweek_from_row).collect()
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SubmissionTx for PgTx {
    async fn upsert_gameweek(
        &mut self,
        league_id: i64,
        number: i32,
        kind: GameweekKind,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
            INSERT INTO gameweeks (id, league_id, number, kind, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (league_id, number) DO UPDATE
               SET kind = EXCLUDED.kind
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(league_id)
        .bind(number)
        .bind(kind.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .context("upserting gameweek")?;
        row.map(|r| r.try_get("id").map_err(anyhow::Error::from))
            .transpose()
    }

    async fn upsert_players(
        &mut self,
        gameweek_id: Uuid,
        players: &[PlayerUpsert],
    ) -> Result<HashMap<i64, Uuid>> {
        if players.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<Uuid> = players.iter().map(|_| Uuid::new_v4()).collect();
        let player_ids: Vec<i64> = players.iter().map(|p| p.player_id).collect();
        let names: Vec<String> = players.iter().map(|p| p.name.clone()).collect();
        let labels: Vec<String> = players.iter().map(|p| p.team_label.clone()).collect();
        let points: Vec<i32> = players.iter().map(|p| p.points).collect();

        let rows = sqlx::query(
            r#"
            INSERT INTO player_snapshots (id, player_id, name, team_label, points, gameweek_id)
            SELECT t.id, t.player_id, t.name, t.team_label, t.points, $6
              FROM UNNEST($1::uuid[], $2::int8[], $3::text[], $4::text[], $5::int4[])
                   AS t(id, player_id, name, team_label, points)
            ON CONFLICT (player_id, team_label, gameweek_id) DO UPDATE
               SET points = EXCLUDED.points,
                   name = EXCLUDED.name
            RETURNING id, player_id
            "#,
        )
        .bind(&ids)
        .bind(&player_ids)
        .bind(&names)
        .bind(&labels)
        .bind(&points)
        .bind(gameweek_id)
        .fetch_all(&mut *self.tx)
        .await
        .context("upserting player snapshots")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("player_id")?, row.try_get("id")?);
        }
        debug!(%gameweek_id, count = out.len(), "upserted player snapshots");
        Ok(out)
    }

    async fn upsert_teams(
        &mut self,
        gameweek_id: Uuid,
        teams: &[TeamUpsert],
        overwrite_points: bool,
    ) -> Result<HashMap<i64, Uuid>> {
        if teams.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<Uuid> = teams.iter().map(|_| Uuid::new_v4()).collect();
        let team_ids: Vec<i64> = teams.iter().map(|t| t.team_id).collect();
        let names: Vec<String> = teams.iter().map(|t| t.name.clone()).collect();
        let leaders: Vec<String> = teams.iter().map(|t| t.leader.clone()).collect();
        let points: Vec<i32> = teams.iter().map(|t| t.points).collect();
        let positions: Vec<i32> = teams.iter().map(|t| t.position).collect();

        let rows = sqlx::query(
            r#"
            INSERT INTO team_snapshots (id, team_id, name, leader, points, position, gameweek_id)
            SELECT t.id, t.team_id, t.name, t.leader, t.points, t.position, $7
              FROM UNNEST($1::uuid[], $2::int8[], $3::text[], $4::text[], $5::int4[], $6::int4[])
                   AS t(id, team_id, name, leader, points, position)
            ON CONFLICT (team_id, gameweek_id) DO UPDATE
               SET name = EXCLUDED.name,
                   leader = EXCLUDED.leader,
                   position = EXCLUDED.position,
                   points = CASE WHEN $8 THEN EXCLUDED.points ELSE team_snapshots.points END
            RETURNING id, team_id
            "#,
        )
        .bind(&ids)
        .bind(&team_ids)
        .bind(&names)
        .bind(&leaders)
        .bind(&points)
        .bind(&positions)
        .bind(gameweek_id)
        .bind(overwrite_points)
        .fetch_all(&mut *self.tx)
        .await
        .context("upserting team snapshots")?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("team_id")?, row.try_get("id")?);
        }
        debug!(%gameweek_id, count = out.len(), overwrite_points, "upserted team snapshots");
        Ok(out)
    }

    async fn upsert_links(&mut self, links: &[LinkUpsert]) -> Result<u64> {
        if links.is_empty() {
            return Ok(0);
        }
        let team_ids: Vec<Uuid> = links.iter().map(|l| l.team_snapshot_id).collect();
        let player_ids: Vec<Uuid> = links.iter().map(|l| l.player_snapshot_id).collect();
        let factors: Vec<i32> = links.iter().map(|l| l.factor).collect();
        let positions: Vec<i32> = links.iter().map(|l| l.position).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO composition_links (team_snapshot_id, player_snapshot_id, factor, position)
            SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::int4[], $4::int4[])
            ON CONFLICT (team_snapshot_id, player_snapshot_id) DO UPDATE
               SET factor = EXCLUDED.factor,
                   position = EXCLUDED.position
            "#,
        )
        .bind(&team_ids)
        .bind(&player_ids)
        .bind(&factors)
        .bind(&positions)
        .execute(&mut *self.tx)
        .await
        .context("upserting composition links")?;
        Ok(result.rows_affected())
    }

    async fn replace_matches(&mut self, gameweek_id: Uuid, pairs: &[(Uuid, Uuid)]) -> Result<u64> {
        sqlx::query("DELETE FROM matches WHERE gameweek_id = $1")
            .bind(gameweek_id)
            .execute(&mut *self.tx)
            .await
            .context("clearing matches")?;
        if pairs.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = pairs.iter().map(|_| Uuid::new_v4()).collect();
        let firsts: Vec<Uuid> = pairs.iter().map(|(a, _)| *a).collect();
        let seconds: Vec<Uuid> = pairs.iter().map(|(_, b)| *b).collect();
        let positions: Vec<i32> = (0..pairs.len() as i32).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO matches (id, first_team_id, second_team_id, position, gameweek_id)
            SELECT t.id, t.first_team_id, t.second_team_id, t.position, $5
              FROM UNNEST($1::uuid[], $2::uuid[], $3::uuid[], $4::int4[])
                   AS t(id, first_team_id, second_team_id, position)
            "#,
        )
        .bind(&ids)
        .bind(&firsts)
        .bind(&seconds)
        .bind(&positions)
        .bind(gameweek_id)
        .execute(&mut *self.tx)
        .await
        .context("inserting matches")?;
        Ok(result.rows_affected())
    }

    async fn upsert_standings(
        &mut self,
        gameweek_id: Uuid,
        rows: &[StandingUpsert],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let team_ids: Vec<Uuid> = rows.iter().map(|r| r.team_snapshot_id).collect();
        let points: Vec<i32> = rows.iter().map(|r| r.points).collect();
        let positions: Vec<i32> = rows.iter().map(|r| r.position).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO standings (team_snapshot_id, points, position, gameweek_id)
            SELECT t.team_snapshot_id, t.points, t.position, $4
              FROM UNNEST($1::uuid[], $2::int4[], $3::int4[])
                   AS t(team_snapshot_id, points, position)
            ON CONFLICT (gameweek_id, team_snapshot_id) DO UPDATE
               SET points = EXCLUDED.points,
                   position = EXCLUDED.position
            "#,
        )
        .bind(&team_ids)
        .bind(&points)
        .bind(&positions)
        .bind(gameweek_id)
        .execute(&mut *self.tx)
        .await
        .context("upserting standings")?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("committing submission")
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub status: StatusCode,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Posts JSON documents to an external endpoint. One attempt per call.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn post_json<T: Serialize + ?Sized + Sync>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let span = info_span!("webhook_post", url);
        async move {
            let resp = self.client.post(url).json(body).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(DeliveryError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            Ok(DeliveryReceipt {
                status,
                url: final_url,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(player_id: i64, team_label: &str, points: i32) -> PlayerUpsert {
        PlayerUpsert {
            player_id,
            name: format!("Player {player_id}"),
            team_label: team_label.to_string(),
            points,
        }
    }

    fn team(team_id: i64, leader: &str, points: i32, position: i32) -> TeamUpsert {
        TeamUpsert {
            team_id,
            name: format!("Team {team_id}"),
            leader: leader.to_string(),
            points,
            position,
        }
    }

    #[tokio::test]
    async fn gameweek_upsert_keeps_id_and_created_at() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let first = tx.upsert_gameweek(1, 3, GameweekKind::Classic).await.unwrap();
        let again = tx.upsert_gameweek(1, 3, GameweekKind::Classic).await.unwrap();
        let other_league = tx.upsert_gameweek(2, 3, GameweekKind::Classic).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other_league);
        assert_eq!(store.counts().await.gameweeks, 2);
    }

    #[tokio::test]
    async fn player_upsert_overwrites_points_and_name_only() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let gw = tx.upsert_gameweek(1, 1, GameweekKind::Classic).await.unwrap().unwrap();
        let first = tx.upsert_players(gw, &[player(7, "ARS", 4)]).await.unwrap();
        let mut renamed = player(7, "ARS", 9);
        renamed.name = "Renamed".into();
        let second = tx.upsert_players(gw, &[renamed]).await.unwrap();
        let other_team = tx.upsert_players(gw, &[player(7, "CHE", 1)]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first[&7], second[&7]);
        assert_ne!(first[&7], other_team[&7]);
        let players = store.player_snapshots().await;
        let ars = players.iter().find(|p| p.team_label == "ARS").unwrap();
        assert_eq!((ars.points, ars.name.as_str()), (9, "Renamed"));
    }

    #[tokio::test]
    async fn team_points_follow_overwrite_flag() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let gw = tx.upsert_gameweek(1, 1, GameweekKind::HeadToHead).await.unwrap().unwrap();
        tx.upsert_teams(gw, &[team(1, "Ivan", 50, 0)], false).await.unwrap();
        tx.upsert_teams(gw, &[team(1, "Petr", 70, 5)], false).await.unwrap();
        tx.commit().await.unwrap();

        let teams = store.team_snapshots().await;
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].leader, "Petr");
        assert_eq!(teams[0].points, 50);
        assert_eq!(teams[0].position, 5);

        let mut tx = store.begin().await.unwrap();
        tx.upsert_teams(gw, &[team(1, "Petr", 70, 0)], true).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.team_snapshots().await[0].points, 70);
    }

    #[tokio::test]
    async fn resubmitted_rows_take_latest_position() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let gw = tx.upsert_gameweek(1, 1, GameweekKind::HeadToHead).await.unwrap().unwrap();
        let teams = tx.upsert_teams(gw, &[team(1, "A", 0, 0)], false).await.unwrap();
        let players = tx.upsert_players(gw, &[player(7, "ARS", 2)]).await.unwrap();
        let link = |factor, position| LinkUpsert {
            team_snapshot_id: teams[&1],
            player_snapshot_id: players[&7],
            factor,
            position,
        };
        let standing = |points, position| StandingUpsert {
            team_snapshot_id: teams[&1],
            points,
            position,
        };
        tx.upsert_links(&[link(1, 0)]).await.unwrap();
        tx.upsert_links(&[link(2, 4)]).await.unwrap();
        tx.upsert_standings(gw, &[standing(3, 0)]).await.unwrap();
        tx.upsert_standings(gw, &[standing(6, 2)]).await.unwrap();
        tx.commit().await.unwrap();

        let graph = store.load_gameweek(1, Some(1)).await.unwrap().unwrap();
        assert_eq!(graph.standings.len(), 1);
        assert_eq!((graph.standings[0].points, graph.standings[0].position), (6, 2));
        let state = store.state.lock().await;
        assert_eq!(state.links.len(), 1);
        assert_eq!((state.links[0].factor, state.links[0].position), (2, 4));
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            let gw = tx.upsert_gameweek(1, 1, GameweekKind::Classic).await.unwrap().unwrap();
            tx.upsert_players(gw, &[player(1, "ARS", 1)]).await.unwrap();
        }
        assert_eq!(store.counts().await, GraphCounts::default());
    }

    #[tokio::test]
    async fn matches_are_replaced_and_graph_is_ordered() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let gw = tx.upsert_gameweek(9, 2, GameweekKind::HeadToHead).await.unwrap().unwrap();
        let teams = tx
            .upsert_teams(gw, &[team(2, "B", 10, 1), team(1, "A", 20, 0)], false)
            .await
            .unwrap();
        tx.replace_matches(gw, &[(teams[&1], teams[&2]), (teams[&2], teams[&1])])
            .await
            .unwrap();
        tx.replace_matches(gw, &[(teams[&2], teams[&1])]).await.unwrap();
        tx.upsert_standings(
            gw,
            &[StandingUpsert {
                team_snapshot_id: teams[&1],
                points: 3,
                position: 0,
            }],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let graph = store.load_gameweek(9, None).await.unwrap().unwrap();
        assert_eq!(graph.gameweek.number, 2);
        assert_eq!(graph.contenders[0].team.team_id, 1);
        assert_eq!(graph.matches.len(), 1);
        assert_eq!(graph.matches[0].first_team_id, teams[&2]);
        assert_eq!(graph.standings[0].points, 3);
        assert!(store.load_gameweek(9, Some(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_gameweek_is_highest_number() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_gameweek(1, 5, GameweekKind::Classic).await.unwrap();
        tx.upsert_gameweek(1, 2, GameweekKind::Classic).await.unwrap();
        tx.commit().await.unwrap();

        let latest = store.load_gameweek(1, None).await.unwrap().unwrap();
        assert_eq!(latest.gameweek.number, 5);
        let listed = store.list_gameweeks(1).await.unwrap();
        assert_eq!(listed.iter().map(|g| g.number).collect::<Vec<_>>(), vec![5, 2]);
    }
}
