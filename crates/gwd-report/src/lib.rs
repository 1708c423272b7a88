//! Read-side analytics over a resolved gameweek graph and the plain-text /
//! structured renderings of those facts.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use gwd_core::{Contender, GameweekGraph, GameweekKind, RosterSlot};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gwd-report";

pub const TOP_PLAYERS: usize = 5;
pub const TOP_MATCHES: usize = 3;
pub const MATCH_TOP_SLOTS: usize = 3;

const SECTION_SEPARATOR: &str = "\n\n\n";

/// A distinct player of the gameweek with its aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStat {
    pub player_id: i64,
    pub name: String,
    pub team_label: String,
    pub points: i32,
    pub appearances: u32,
    pub ownership_pct: u32,
    pub captain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLine {
    pub name: String,
    pub team_label: String,
    pub effective_points: i32,
}

impl From<&RosterSlot> for SlotLine {
    fn from(slot: &RosterSlot) -> Self {
        Self {
            name: slot.player.name.clone(),
            team_label: slot.player.team_label.clone(),
            effective_points: slot.effective_points(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContenderLine {
    pub name: String,
    pub leader: String,
    pub points: i32,
    pub composition: Vec<SlotLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptainLine {
    pub name: String,
    pub team_label: String,
    pub doubled_points: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSide {
    pub name: String,
    pub leader: String,
    pub points: i32,
    pub top: Vec<SlotLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFacts {
    pub first: MatchSide,
    pub second: MatchSide,
    pub similarity_pct: u32,
    pub captains: Option<(CaptainLine, CaptainLine)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreLine {
    pub first_name: String,
    pub first_points: i32,
    pub second_name: String,
    pub second_points: i32,
}

impl ScoreLine {
    pub fn differential(&self) -> i32 {
        (self.first_points - self.second_points).abs()
    }

    pub fn total(&self) -> i32 {
        self.first_points + self.second_points
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub rank: usize,
    pub name: String,
    pub leader: String,
    pub points: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "entries", rename_all = "snake_case")]
pub enum Narrative {
    Classic(Vec<ContenderLine>),
    #[serde(rename = "h2h")]
    HeadToHead(Vec<MatchFacts>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadToHeadFacts {
    pub top_win: Vec<ScoreLine>,
    pub top_points: Vec<ScoreLine>,
    pub leaderboard: Vec<LeaderboardRow>,
}

/// Everything the renderer needs. Rendering never recomputes any of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestFacts {
    pub kind: GameweekKind,
    pub league_id: i64,
    pub gameweek: i32,
    pub narrative: Narrative,
    pub top_performance: Vec<PlayerStat>,
    pub top_ownership: Vec<PlayerStat>,
    pub top_captains: Vec<PlayerStat>,
    pub head_to_head: Option<HeadToHeadFacts>,
}

/// Distinct players across every contender of a gameweek, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct PlayerRegistry {
    players: Vec<PlayerStat>,
    index: HashMap<i64, usize>,
}

impl PlayerRegistry {
    pub fn from_contenders<'a>(contenders: impl IntoIterator<Item = &'a Contender>) -> Self {
        let mut registry = Self::default();
        for contender in contenders {
            for slot in &contender.composition {
                registry.record(slot);
            }
        }
        let distinct = registry.players.len() as u32;
        for stat in &mut registry.players {
            stat.ownership_pct = ownership_pct(stat.appearances, distinct);
        }
        registry
    }

    fn record(&mut self, slot: &RosterSlot) {
        let idx = *self.index.entry(slot.player.player_id).or_insert_with(|| {
            self.players.push(PlayerStat {
                player_id: slot.player.player_id,
                name: slot.player.name.clone(),
                team_label: slot.player.team_label.clone(),
                points: slot.player.points,
                appearances: 0,
                ownership_pct: 0,
                captain: false,
            });
            self.players.len() - 1
        });
        let stat = &mut self.players[idx];
        stat.appearances += 1;
        stat.captain |= slot.is_captain();
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn get(&self, player_id: i64) -> Option<&PlayerStat> {
        self.index.get(&player_id).map(|idx| &self.players[*idx])
    }

    pub fn top_performance(&self) -> Vec<PlayerStat> {
        self.top_by(|p| Reverse(i64::from(p.points)))
    }

    pub fn top_ownership(&self) -> Vec<PlayerStat> {
        self.top_by(|p| Reverse(p.appearances))
    }

    /// Non-captains sort last and are then dropped, so fewer than five may remain.
    pub fn top_captains(&self) -> Vec<PlayerStat> {
        self.top_by(|p| Reverse(if p.captain { i64::from(p.points) } else { i64::MIN }))
            .into_iter()
            .filter(|p| p.captain)
            .collect()
    }

    fn top_by<K: Ord>(&self, key: impl Fn(&PlayerStat) -> K) -> Vec<PlayerStat> {
        let mut sorted: Vec<&PlayerStat> = self.players.iter().collect();
        sorted.sort_by_key(|p| key(*p));
        sorted.into_iter().take(TOP_PLAYERS).cloned().collect()
    }
}

/// `appearances / distinct * 100`, truncated. The denominator is the number of
/// distinct players in the gameweek, not the number of contenders.
pub fn ownership_pct(appearances: u32, distinct_players: u32) -> u32 {
    if distinct_players == 0 {
        return 0;
    }
    appearances * 100 / distinct_players
}

/// Shared external player ids over the larger roster size, as a truncated
/// percentage. Zero when both rosters are empty.
pub fn similarity_pct(first: &Contender, second: &Contender) -> u32 {
    let larger = first.composition.len().max(second.composition.len());
    if larger == 0 {
        return 0;
    }
    let first_ids: HashSet<i64> = first.composition.iter().map(|s| s.player.player_id).collect();
    let shared = second
        .composition
        .iter()
        .map(|s| s.player.player_id)
        .collect::<HashSet<_>>()
        .intersection(&first_ids)
        .count();
    (shared * 100 / larger) as u32
}

fn by_effective_points(contender: &Contender) -> Vec<&RosterSlot> {
    let mut slots: Vec<&RosterSlot> = contender.composition.iter().collect();
    slots.sort_by_key(|s| Reverse(s.effective_points()));
    slots
}

pub fn contender_line(contender: &Contender) -> ContenderLine {
    ContenderLine {
        name: contender.team.name.clone(),
        leader: contender.team.leader.clone(),
        points: contender.team.points,
        composition: by_effective_points(contender)
            .into_iter()
            .map(SlotLine::from)
            .collect(),
    }
}

fn match_side(contender: &Contender) -> MatchSide {
    MatchSide {
        name: contender.team.name.clone(),
        leader: contender.team.leader.clone(),
        points: contender.team.points,
        top: by_effective_points(contender)
            .into_iter()
            .take(MATCH_TOP_SLOTS)
            .map(SlotLine::from)
            .collect(),
    }
}

fn captain_line(slot: &RosterSlot) -> CaptainLine {
    CaptainLine {
        name: slot.player.name.clone(),
        team_label: slot.player.team_label.clone(),
        doubled_points: slot.player.points * 2,
    }
}

pub fn match_facts(first: &Contender, second: &Contender) -> MatchFacts {
    let captains = match (first.sole_captain(), second.sole_captain()) {
        (Some(a), Some(b)) => Some((captain_line(a), captain_line(b))),
        _ => None,
    };
    MatchFacts {
        first: match_side(first),
        second: match_side(second),
        similarity_pct: similarity_pct(first, second),
        captains,
    }
}

fn paired_contenders(graph: &GameweekGraph) -> Vec<(&Contender, &Contender)> {
    graph
        .matches
        .iter()
        .filter_map(|m| Some((graph.contender(m.first_team_id)?, graph.contender(m.second_team_id)?)))
        .collect()
}

fn top_scorelines(lines: &[ScoreLine], key: impl Fn(&ScoreLine) -> i32) -> Vec<ScoreLine> {
    let mut sorted: Vec<&ScoreLine> = lines.iter().collect();
    sorted.sort_by_key(|l| Reverse(key(*l)));
    sorted.into_iter().take(TOP_MATCHES).cloned().collect()
}

/// Contenders ranked by their standing points; rows without a resolvable
/// contender are skipped.
pub fn leaderboard(graph: &GameweekGraph) -> Vec<LeaderboardRow> {
    let mut rows: Vec<(&Contender, i32)> = graph
        .standings
        .iter()
        .filter_map(|s| graph.contender(s.team_snapshot_id).map(|c| (c, s.points)))
        .collect();
    rows.sort_by_key(|(_, points)| Reverse(*points));
    rows.into_iter()
        .enumerate()
        .map(|(idx, (contender, points))| LeaderboardRow {
            rank: idx + 1,
            name: contender.team.name.clone(),
            leader: contender.team.leader.clone(),
            points,
        })
        .collect()
}

pub fn synthesize(graph: &GameweekGraph) -> DigestFacts {
    let registry = PlayerRegistry::from_contenders(&graph.contenders);

    let (narrative, head_to_head) = match graph.gameweek.kind {
        GameweekKind::Classic => {
            let mut contenders: Vec<&Contender> = graph.contenders.iter().collect();
            contenders.sort_by_key(|c| Reverse(c.team.points));
            let lines = contenders.into_iter().map(contender_line).collect();
            (Narrative::Classic(lines), None)
        }
        GameweekKind::HeadToHead => {
            let pairs = paired_contenders(graph);
            let facts = pairs.iter().map(|(a, b)| match_facts(a, b)).collect();
            let scorelines: Vec<ScoreLine> = pairs
                .iter()
                .map(|(a, b)| ScoreLine {
                    first_name: a.team.name.clone(),
                    first_points: a.team.points,
                    second_name: b.team.name.clone(),
                    second_points: b.team.points,
                })
                .collect();
            let h2h = HeadToHeadFacts {
                top_win: top_scorelines(&scorelines, ScoreLine::differential),
                top_points: top_scorelines(&scorelines, ScoreLine::total),
                leaderboard: leaderboard(graph),
            };
            (Narrative::HeadToHead(facts), Some(h2h))
        }
    };

    DigestFacts {
        kind: graph.gameweek.kind,
        league_id: graph.gameweek.league_id,
        gameweek: graph.gameweek.number,
        narrative,
        top_performance: registry.top_performance(),
        top_ownership: registry.top_ownership(),
        top_captains: registry.top_captains(),
        head_to_head,
    }
}

fn slot_list(slots: &[SlotLine]) -> String {
    slots
        .iter()
        .map(|s| format!("{} {} ({})", s.name, s.team_label, s.effective_points))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_contender(line: &ContenderLine) -> String {
    format!(
        "{} ({}) {} pts\nComposition: {}",
        line.name,
        line.leader,
        line.points,
        slot_list(&line.composition)
    )
}

fn render_match(facts: &MatchFacts) -> String {
    let (first, second) = (&facts.first, &facts.second);
    let mut out = format!(
        "{} ({}) {}:{} {} ({})\nSimilarity: {}%\n",
        first.name, first.leader, first.points, second.points, second.name, second.leader,
        facts.similarity_pct
    );
    if let Some((a, b)) = &facts.captains {
        out.push_str(&format!(
            "Captains: {} {} {}:{} {} {}\n",
            a.name, a.team_label, a.doubled_points, b.doubled_points, b.name, b.team_label
        ));
    }
    out.push_str(&format!("{}: {}\n", first.name, slot_list(&first.top)));
    out.push_str(&format!("{}: {}", second.name, slot_list(&second.top)));
    out
}

pub fn render_narrative(narrative: &Narrative) -> String {
    let blocks: Vec<String> = match narrative {
        Narrative::Classic(lines) => lines.iter().map(render_contender).collect(),
        Narrative::HeadToHead(matches) => matches.iter().map(render_match).collect(),
    };
    blocks.join("\n\n")
}

fn render_player_section(title: &str, players: &[PlayerStat]) -> String {
    let mut out = title.to_string();
    for (idx, p) in players.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} {} ({}) - {}%",
            idx + 1,
            p.name,
            p.team_label,
            p.points,
            p.ownership_pct
        ));
    }
    out
}

fn render_scorelines(title: &str, lines: &[ScoreLine], key: impl Fn(&ScoreLine) -> i32) -> String {
    let mut out = title.to_string();
    for l in lines {
        out.push_str(&format!(
            "\n{}: {} {}:{} {}",
            key(l),
            l.first_name,
            l.first_points,
            l.second_points,
            l.second_name
        ));
    }
    out
}

pub fn render_leaderboard(rows: &[LeaderboardRow]) -> String {
    let mut out = String::from("LEADERBOARD");
    for row in rows {
        out.push_str(&format!(
            "\n{}. {} ({}) {} pts",
            row.rank, row.name, row.leader, row.points
        ));
    }
    out
}

/// Section texts in fixed order, shared by both renderings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSections {
    pub matches_info: String,
    pub top_performance: String,
    pub top_ownership: String,
    pub top_captains: String,
    pub top_differential: Option<String>,
    pub top_points: Option<String>,
    pub leaderboard: Option<String>,
}

pub fn render_sections(facts: &DigestFacts) -> RenderedSections {
    let h2h = facts.head_to_head.as_ref();
    RenderedSections {
        matches_info: render_narrative(&facts.narrative),
        top_performance: render_player_section("TOP PRF (performance)", &facts.top_performance),
        top_ownership: render_player_section("TOP OWN (ownership)", &facts.top_ownership),
        top_captains: render_player_section("TOP CPT (captains)", &facts.top_captains),
        top_differential: h2h
            .map(|h| render_scorelines("TOP WIN", &h.top_win, ScoreLine::differential)),
        top_points: h2h.map(|h| render_scorelines("TOP PTS", &h.top_points, ScoreLine::total)),
        leaderboard: h2h.map(|h| render_leaderboard(&h.leaderboard)),
    }
}

impl RenderedSections {
    pub fn to_text(&self) -> String {
        let mut parts = vec![
            self.matches_info.as_str(),
            self.top_performance.as_str(),
            self.top_ownership.as_str(),
            self.top_captains.as_str(),
        ];
        parts.extend(
            [&self.top_differential, &self.top_points, &self.leaderboard]
                .into_iter()
                .flatten()
                .map(String::as_str),
        );
        parts.join(SECTION_SEPARATOR)
    }
}

pub fn render_text(facts: &DigestFacts) -> String {
    render_sections(facts).to_text()
}

/// Structured delivery body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEnvelope {
    #[serde(rename = "type")]
    pub kind: GameweekKind,
    pub league_id: i64,
    pub gw: i32,
    pub matches_info: String,
    pub top_performance: String,
    pub top_ownership: String,
    pub top_captains: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_differential: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_points: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaderboard: Option<String>,
}

pub fn render_envelope(facts: &DigestFacts) -> DigestEnvelope {
    let sections = render_sections(facts);
    DigestEnvelope {
        kind: facts.kind,
        league_id: facts.league_id,
        gw: facts.gameweek,
        matches_info: sections.matches_info,
        top_performance: sections.top_performance,
        top_ownership: sections.top_ownership,
        top_captains: sections.top_captains,
        top_differential: sections.top_differential,
        top_points: sections.top_points,
        leaderboard: sections.leaderboard,
    }
}
