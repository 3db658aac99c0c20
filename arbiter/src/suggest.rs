//! Builds the suggestion set: ranked candidate moves out of multi-PV engine
//! output, flagged and labelled for safety at a target strength.

use std::time::Duration;

use serde::Serialize;
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{Chess, Position, Role};
use tracing::{debug, warn};

use crate::eval;
use crate::uci::{AnalyzeJob, AnalyzeResult, JobKind, Personality, PvLine, Score, Search};

/// Suggestions never expose more than this many plies of a variation.
const MAX_PV_PLIES: usize = 10;

/// Strength tier at which users may ask for full-strength suggestions.
const EXPERT_ELO: u16 = 2000;

/// How likely a club player of the target strength is to go wrong after
/// picking this move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

/// Human-facing tag attached to a ranked suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SuggestionLabel {
    Best,
    Safe,
    Risky,
    Human,
    Alt,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveFlags {
    pub is_mate: bool,
    pub is_check: bool,
    pub is_capture: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_piece: Option<char>,
    pub is_promotion: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promotion_piece: Option<char>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Safety {
    pub blunder_risk: Risk,
    pub mate_threat: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionMove {
    pub rank: u8,
    #[serde(rename = "move")]
    pub mov: String,
    /// White-perspective evaluation of the line
    pub score: Score,
    /// Centipawns behind the top line, always `<= 0`; zero at rank 1
    pub cp_delta: i32,
    pub pv: Vec<String>,
    pub depth: u32,
    pub flags: MoveFlags,
    pub safety: Safety,
    pub label: SuggestionLabel,
}

/// The complete response payload for one suggestion request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionSet {
    pub fen: String,
    /// Side-to-move evaluation of the position, absent when mate is on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_eval: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mate_in: Option<i8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_rate: Option<f64>,
    pub suggestions: Vec<SuggestionMove>,
}

/// Search time allotted per strength tier. Monotone non-decreasing: stronger
/// targets get deeper searches.
pub fn movetime_for_elo(target_elo: u16) -> Duration {
    let ms = match target_elo {
        ..=799 => 300,
        800..=1199 => 500,
        1200..=1599 => 700,
        1600..=1999 => 900,
        _ => 1200,
    };
    Duration::from_millis(ms)
}

/// Engine skill level derived from the target elo, spanning the engine's
/// 0..=20 scale across the supported 500..=2500 band.
pub fn skill_for_elo(target_elo: u16) -> u8 {
    ((target_elo.clamp(500, 2500) - 500) / 100) as u8
}

/// Blunder-risk banding. Weaker targets tolerate bigger gaps before a move
/// starts looking dangerous over the board.
pub fn risk_for(drop_cp: i32, target_elo: u16) -> Risk {
    let (low, medium) = match target_elo {
        ..=1199 => (150, 400),
        1200..=1800 => (100, 300),
        _ => (60, 200),
    };

    if drop_cp <= low {
        Risk::Low
    } else if drop_cp <= medium {
        Risk::Medium
    } else {
        Risk::High
    }
}

/// Whether strength limiting applies: always, unless the caller opted out
/// and already sits at the expert tier.
pub fn limit_strength(target_elo: u16, disable_limit_strength: bool) -> bool {
    !(disable_limit_strength && target_elo >= EXPERT_ELO)
}

/// Assembles the engine job for a suggestion request.
#[allow(clippy::too_many_arguments)]
pub fn job(
    fen: Option<Fen>,
    moves: Vec<UciMove>,
    target_elo: u16,
    personality: Personality,
    multipv: u8,
    contempt_cp: i16,
    disable_limit_strength: bool,
    hash_mb: u32,
) -> AnalyzeJob {
    let mut job = AnalyzeJob::new(
        fen,
        moves,
        Search::MoveTime(movetime_for_elo(target_elo)),
        JobKind::Suggestion,
    );
    job.multipv = multipv;
    job.target_elo = target_elo;
    job.personality = personality;
    job.contempt_cp = contempt_cp;
    job.limit_strength = limit_strength(target_elo, disable_limit_strength);
    job.skill = Some(skill_for_elo(target_elo));
    job.hash_mb = hash_mb;
    job
}

/// Turns one analyze result into the ranked suggestion set. `pos` is the
/// position the engine searched (request fen with the request moves applied);
/// the side to move there is the player the suggestions are for.
pub fn build(request_fen: String, pos: &Chess, target_elo: u16, result: &AnalyzeResult) -> SuggestionSet {
    let player = pos.turn();
    let best_raw = result.lines[0].score;

    let mut suggestions = Vec::with_capacity(result.lines.len());
    for line in &result.lines {
        match build_move(pos, target_elo, best_raw, line) {
            Some(suggestion) => suggestions.push(suggestion),
            None => warn!(rank = line.rank, "Dropping malformed engine line"),
        }
    }

    // Position-level summary comes from the top line
    let best_white = eval::to_white_pov(best_raw, player);
    let (position_eval, mate_in) = match best_raw {
        Score::Cp(cp) => (Some(cp), None),
        Score::Mate(n) => (None, Some(n)),
    };

    debug!(
        count = suggestions.len(),
        win_rate = eval::win_percent(best_white),
        "Suggestion set built"
    );

    SuggestionSet {
        fen: request_fen,
        position_eval,
        mate_in,
        win_rate: Some(eval::win_percent(best_white)),
        suggestions,
    }
}

fn build_move(pos: &Chess, target_elo: u16, best_raw: Score, line: &PvLine) -> Option<SuggestionMove> {
    let player = pos.turn();
    let first = line.moves.first()?;
    let mov = first.to_move(pos).ok()?;

    // Gap behind the top line, in the player's own perspective. Raw scores
    // are already side-to-move, so no flipping is needed here.
    let drop_cp = match line.rank {
        1 => 0,
        _ => (eval::cp_axis(best_raw) - eval::cp_axis(line.score)).max(0),
    };

    let after = pos.clone().play(&mov).ok()?;

    let flags = MoveFlags {
        is_mate: matches!(line.score, Score::Mate(n) if n > 0),
        is_check: after.is_check(),
        is_capture: mov.is_capture(),
        captured_piece: mov.capture().map(Role::char),
        is_promotion: mov.is_promotion(),
        promotion_piece: mov.promotion().map(Role::char),
    };

    let blunder_risk = risk_for(drop_cp, target_elo);
    let safety = Safety {
        blunder_risk,
        mate_threat: matches!(line.score, Score::Mate(n) if n < 0),
    };

    let label = match (line.rank, blunder_risk) {
        (1, _) => SuggestionLabel::Best,
        (_, Risk::Low) => SuggestionLabel::Safe,
        _ => SuggestionLabel::Risky,
    };

    Some(SuggestionMove {
        rank: line.rank,
        mov: first.to_string(),
        score: eval::to_white_pov(line.score, player),
        cp_delta: -drop_cp,
        pv: line
            .moves
            .iter()
            .take(MAX_PV_PLIES)
            .map(ToString::to_string)
            .collect(),
        depth: line.depth,
        flags,
        safety,
        label,
    })
}
