//! Move classifier: derives a quality label and accuracy impact for a single
//! played ply from before/after engine evaluations and position context.

use serde::Serialize;
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, Move, Position};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::adapters::TracingAdapt;
use crate::error::EngineError;
use crate::eval::{self, Phase, MISSED_MATE_CPL};
use crate::pool::{CancelToken, Pool};
use crate::uci::{AnalyzeJob, JobKind, Score, Search};

/// Probe depth for both classifier engine calls.
const REVIEW_DEPTH: u32 = 10;

/// Mate scores are projected to this magnitude for client evaluation bars.
const UI_MATE_CP: i32 = 10_000;

/// Quality verdict for one played move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MoveLabel {
    Brilliant,
    Great,
    Best,
    Excellent,
    Good,
    Book,
    Inaccuracy,
    Mistake,
    Blunder,
}

/// One move-review request, validated at the session edge.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub fen_before: Fen,
    pub fen_after: Fen,
    pub played: UciMove,
    /// Game plies up to and including the reviewed one, for tracing context
    pub moves: Vec<UciMove>,
    pub player: Color,
    pub target_elo: u16,
    /// Opening-book status is supplied by the caller; no book is kept here
    pub book: bool,
    pub hash_mb: u32,
}

/// Full classification of one played ply.
#[derive(Debug, Clone)]
pub struct Classification {
    pub label: MoveLabel,
    pub cpl: i32,
    pub loss_win_pct: f64,
    pub gap_win_pct: f64,
    pub swing_win_pct: f64,
    pub played_is_best: bool,
    pub phase: Phase,
    /// Accuracy points this move costs, in `[0, 40]`
    pub accuracy_impact: f64,
    /// Accuracy impact scaled by the phase weight
    pub weighted_impact: f64,
    pub best_move: String,
    /// White-perspective cp, mates projected to the UI bar range
    pub eval_before: i32,
    pub eval_after: i32,
    /// Signed mate distance after the move, when one is on the board
    pub mate_in_after: Option<i8>,
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ReviewError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

/// Classifies one played move. Runs two sequential engine probes: multi-PV 2
/// on the position before the move, then single-PV on the position after it,
/// unless the move ended the game and the verdict can be synthesized.
#[instrument(skip_all, fields(played = %req.played, player = ?req.player, plies = req.moves.len(), fen = req.fen_before.tr()), err)]
pub async fn review(
    pool: &Pool,
    req: ReviewRequest,
    cancel: CancelToken,
) -> Result<Classification, ReviewError> {
    let pos_before: Chess = req
        .fen_before
        .clone()
        .into_position(CastlingMode::Standard)
        .map_err(|err| ReviewError::invalid(format!("invalid fenBefore: {err}")))?;
    let pos_after: Chess = req
        .fen_after
        .clone()
        .into_position(CastlingMode::Standard)
        .map_err(|err| ReviewError::invalid(format!("invalid fenAfter: {err}")))?;

    if pos_before.turn() != req.player {
        return Err(ReviewError::invalid("playerColor is not to move in fenBefore"));
    }

    let played: Move = req
        .played
        .to_move(&pos_before)
        .map_err(|err| ReviewError::invalid(format!("illegal move: {err}")))?;

    // Probe the position before the move: best line, runner-up, best move
    let mut probe = AnalyzeJob::new(
        Some(req.fen_before.clone()),
        vec![],
        Search::Depth(REVIEW_DEPTH),
        JobKind::Stats,
    );
    probe.multipv = 2;
    probe.hash_mb = req.hash_mb;

    let before = pool.submit(probe, cancel.clone()).wait().await?;
    let before_best = eval::to_white_pov(before.lines[0].score, req.player);
    let before_second = before
        .lines
        .get(1)
        .map(|line| eval::to_white_pov(line.score, req.player));
    let best_move = before.best_move.clone();
    let played_is_best = req.played == best_move;

    // Terminal positions bypass the second probe: engine output on finished
    // games is noise, the verdict is forced.
    let after_played = if pos_after.is_checkmate() {
        Score::Mate(if req.player == Color::White { 1 } else { -1 })
    } else if pos_after.is_stalemate() {
        Score::Cp(0)
    } else {
        if cancel.is_cancelled() {
            return Err(EngineError::Canceled.into());
        }

        let mut probe = AnalyzeJob::new(
            Some(req.fen_after.clone()),
            vec![],
            Search::Depth(REVIEW_DEPTH),
            JobKind::Stats,
        );
        probe.hash_mb = req.hash_mb;

        let after = pool.submit(probe, cancel).wait().await?;
        eval::to_white_pov(after.lines[0].score, pos_after.turn())
    };

    let verdict = classify_scores(ScoreSheet {
        player: req.player,
        before_best,
        before_second,
        after_played,
        played_is_best,
        book: req.book,
        material_delta: eval::material_delta(&pos_before, &played),
    });

    let phase = eval::detect_phase(&pos_before);
    let accuracy_impact = round1(40.0 * (1.0 - (-f64::from(verdict.cpl) / 150.0).exp()));
    let weighted_impact = round1(accuracy_impact * phase.weight());

    let classification = Classification {
        label: verdict.label,
        cpl: verdict.cpl,
        loss_win_pct: verdict.loss_win_pct,
        gap_win_pct: verdict.gap_win_pct,
        swing_win_pct: verdict.swing_win_pct,
        played_is_best,
        phase,
        accuracy_impact,
        weighted_impact,
        best_move: best_move.to_string(),
        eval_before: ui_cp(before_best),
        eval_after: ui_cp(after_played),
        mate_in_after: match after_played {
            Score::Mate(n) => Some(n),
            Score::Cp(_) => None,
        },
    };

    debug!(label = ?classification.label, cpl = classification.cpl, "Move classified");
    Ok(classification)
}

/// All inputs of the pure classification core. Scores are White-POV.
struct ScoreSheet {
    player: Color,
    before_best: Score,
    before_second: Option<Score>,
    after_played: Score,
    played_is_best: bool,
    book: bool,
    material_delta: i32,
}

struct Verdict {
    label: MoveLabel,
    cpl: i32,
    loss_win_pct: f64,
    gap_win_pct: f64,
    swing_win_pct: f64,
}

/// Whether a White-POV score is a mate in favor of `side`.
fn mate_for(side: Color, score: Score) -> bool {
    match score {
        Score::Mate(n) => (n > 0) == (side == Color::White),
        Score::Cp(_) => false,
    }
}

/// The deterministic classification ladder. Rules are evaluated in a fixed
/// order and the first match wins.
fn classify_scores(sheet: ScoreSheet) -> Verdict {
    let loss_win_pct = eval::loss_win_for_player(sheet.player, sheet.before_best, sheet.after_played);
    let gap_win_pct = sheet
        .before_second
        .map(|second| eval::gap_win_for_player(sheet.player, sheet.before_best, second))
        .unwrap_or(0.0);
    let swing_win_pct = eval::swing_win(sheet.before_best, sheet.after_played);

    // A forced mate thrown away outranks every other rule
    let missed_mate =
        mate_for(sheet.player, sheet.before_best) && !mate_for(sheet.player, sheet.after_played);

    let cpl = if missed_mate {
        MISSED_MATE_CPL
    } else {
        (eval::cp_axis_for(sheet.player, sheet.before_best)
            - eval::cp_axis_for(sheet.player, sheet.after_played))
        .max(0)
    };

    if missed_mate {
        return Verdict {
            label: MoveLabel::Blunder,
            cpl,
            loss_win_pct,
            gap_win_pct,
            swing_win_pct,
        };
    }

    let base = if sheet.played_is_best || loss_win_pct <= 0.2 {
        MoveLabel::Best
    } else if loss_win_pct <= 1.0 {
        MoveLabel::Excellent
    } else if loss_win_pct <= 3.0 {
        MoveLabel::Good
    } else if loss_win_pct <= 8.0 {
        MoveLabel::Inaccuracy
    } else if loss_win_pct <= 20.0 {
        MoveLabel::Mistake
    } else {
        MoveLabel::Blunder
    };

    let label = if sheet.book && !matches!(base, MoveLabel::Blunder | MoveLabel::Mistake) {
        MoveLabel::Book
    } else if matches!(base, MoveLabel::Best | MoveLabel::Excellent)
        && (swing_win_pct >= 15.0 || gap_win_pct >= 8.0)
    {
        MoveLabel::Great
    } else if base == MoveLabel::Best
        && sheet.material_delta < 0
        && eval::win_percent_for(sheet.player, sheet.after_played) >= 60.0
        && gap_win_pct >= 6.0
    {
        MoveLabel::Brilliant
    } else {
        base
    };

    Verdict {
        label,
        cpl,
        loss_win_pct,
        gap_win_pct,
        swing_win_pct,
    }
}

/// White-POV cp for client evaluation bars; mates clip to the bar range.
fn ui_cp(score: Score) -> i32 {
    match score {
        Score::Cp(cp) => cp,
        Score::Mate(n) => i32::from(n.signum()) * UI_MATE_CP,
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sheet(best: Score, after: Score) -> ScoreSheet {
        ScoreSheet {
            player: Color::White,
            before_best: best,
            before_second: None,
            after_played: after,
            played_is_best: false,
            book: false,
            material_delta: 0,
        }
    }

    #[test]
    fn missed_forced_mate_is_a_blunder() {
        let verdict = classify_scores(sheet(Score::Mate(2), Score::Cp(350)));
        assert_eq!(verdict.label, MoveLabel::Blunder);
        assert_eq!(verdict.cpl, MISSED_MATE_CPL);
    }

    #[test]
    fn keeping_the_mate_is_not_missing_it() {
        let mut s = sheet(Score::Mate(2), Score::Mate(3));
        s.played_is_best = true;
        let verdict = classify_scores(s);
        assert_eq!(verdict.label, MoveLabel::Best);
        assert_eq!(verdict.loss_win_pct, 0.0);
    }

    #[test]
    fn missed_mate_sign_respects_the_player() {
        // Black had the mate and kept it
        let mut s = sheet(Score::Mate(-1), Score::Mate(-1));
        s.player = Color::Black;
        assert_eq!(classify_scores(s).label, MoveLabel::Best);

        // Black had the mate and let it slip
        let mut s = sheet(Score::Mate(-1), Score::Cp(-200));
        s.player = Color::Black;
        let verdict = classify_scores(s);
        assert_eq!(verdict.label, MoveLabel::Blunder);
        assert_eq!(verdict.cpl, MISSED_MATE_CPL);
    }

    #[test]
    fn base_label_ladder() {
        assert_eq!(classify_scores(sheet(Score::Cp(300), Score::Cp(300))).label, MoveLabel::Best);
        assert_eq!(classify_scores(sheet(Score::Cp(20), Score::Cp(10))).label, MoveLabel::Excellent);
        assert_eq!(classify_scores(sheet(Score::Cp(100), Score::Cp(80))).label, MoveLabel::Good);
        assert_eq!(
            classify_scores(sheet(Score::Cp(150), Score::Cp(80))).label,
            MoveLabel::Inaccuracy
        );
        assert_eq!(
            classify_scores(sheet(Score::Cp(200), Score::Cp(100))).label,
            MoveLabel::Mistake
        );
        assert_eq!(
            classify_scores(sheet(Score::Cp(0), Score::Cp(-600))).label,
            MoveLabel::Blunder
        );
    }

    #[test]
    fn played_best_forces_the_base_label() {
        let mut s = sheet(Score::Cp(50), Score::Cp(40));
        s.played_is_best = true;
        assert_eq!(classify_scores(s).label, MoveLabel::Best);
    }

    #[test]
    fn book_override_spares_real_mistakes() {
        let mut s = sheet(Score::Cp(100), Score::Cp(80));
        s.book = true;
        assert_eq!(classify_scores(s).label, MoveLabel::Book);

        let mut s = sheet(Score::Cp(0), Score::Cp(-600));
        s.book = true;
        assert_eq!(classify_scores(s).label, MoveLabel::Blunder);
    }

    #[test]
    fn surprise_swing_upgrades_to_great() {
        // The move turned out far better than the static best suggested
        let verdict = classify_scores(sheet(Score::Cp(0), Score::Cp(500)));
        assert_eq!(verdict.label, MoveLabel::Great);
        assert_eq!(verdict.loss_win_pct, 0.0);
        assert!(verdict.swing_win_pct >= 15.0);
    }

    #[test]
    fn wide_gap_upgrades_to_great() {
        let mut s = sheet(Score::Cp(300), Score::Cp(300));
        s.played_is_best = true;
        s.before_second = Some(Score::Cp(100));
        assert_eq!(classify_scores(s).label, MoveLabel::Great);
    }

    #[test]
    fn sound_sacrifice_is_brilliant() {
        let mut s = sheet(Score::Cp(300), Score::Cp(300));
        s.played_is_best = true;
        s.before_second = Some(Score::Cp(210));
        s.material_delta = -3;
        let verdict = classify_scores(s);
        assert!(verdict.gap_win_pct >= 6.0 && verdict.gap_win_pct < 8.0);
        assert_eq!(verdict.label, MoveLabel::Brilliant);
    }

    #[test]
    fn losing_sacrifice_is_not_brilliant() {
        // Material down and the position is not winning enough
        let mut s = sheet(Score::Cp(40), Score::Cp(40));
        s.played_is_best = true;
        s.before_second = Some(Score::Cp(0));
        s.material_delta = -3;
        assert_eq!(classify_scores(s).label, MoveLabel::Best);
    }

    #[test]
    fn best_move_always_lands_in_the_top_family() {
        for (second, delta, book) in [
            (None, 0, false),
            (Some(Score::Cp(-100)), 0, false),
            (Some(Score::Cp(250)), -5, false),
            (None, 0, true),
        ] {
            let mut s = sheet(Score::Cp(300), Score::Cp(300));
            s.played_is_best = true;
            s.before_second = second;
            s.material_delta = delta;
            s.book = book;
            let label = classify_scores(s).label;
            assert!(
                matches!(
                    label,
                    MoveLabel::Best | MoveLabel::Great | MoveLabel::Brilliant | MoveLabel::Book
                ),
                "unexpected label {label:?}"
            );
        }
    }

    #[test]
    fn cpl_is_clamped_and_projected() {
        // Better than the engine's pick: no loss
        assert_eq!(classify_scores(sheet(Score::Cp(10), Score::Cp(80))).cpl, 0);

        // Plain cp difference
        assert_eq!(classify_scores(sheet(Score::Cp(120), Score::Cp(40))).cpl, 80);

        // Walking into a mate projects through the cp axis
        let verdict = classify_scores(sheet(Score::Cp(0), Score::Mate(-4)));
        assert_eq!(verdict.label, MoveLabel::Blunder);
        assert_eq!(verdict.cpl, 96_000);
    }

    #[test]
    fn impact_bounds() {
        for cpl in [0, 50, 150, 500, 10_000] {
            let impact = round1(40.0 * (1.0 - (-f64::from(cpl) / 150.0).exp()));
            assert!((0.0..=40.0).contains(&impact));
        }
    }

    #[test]
    fn ui_projection() {
        assert_eq!(ui_cp(Score::Cp(37)), 37);
        assert_eq!(ui_cp(Score::Mate(2)), 10_000);
        assert_eq!(ui_cp(Score::Mate(-6)), -10_000);
    }
}
