//! Evaluation primitives: score normalization, the win-percent curve,
//! loss/gap/swing metrics, material accounting, and game-phase detection.
//!
//! Scores cross module boundaries in White perspective only; conversion from
//! the engine's side-to-move perspective happens at ingest via `to_white_pov`.

use serde::Serialize;
use shakmaty::{ByRole, Chess, Color, Move, Position, Role};

use crate::uci::Score;

/// Slope of the calibrated cp to win-probability curve.
const WIN_PERCENT_SLOPE: f64 = 0.003_682_08;

/// Non-king material of the standard starting position, in pawn units.
const FULL_MATERIAL: i32 = 78;

/// Centipawn loss assigned to a move that throws away a forced mate.
pub const MISSED_MATE_CPL: i32 = 500;

/// Flips a raw engine score into White perspective. Mate distances keep
/// their magnitude; only the sign carries the side.
pub fn to_white_pov(score: Score, side_to_move: Color) -> Score {
    match side_to_move {
        Color::White => score,
        Color::Black => score.rev(),
    }
}

/// Win probability for White, in percent. Mate scores pin the curve to its
/// asymptotes. Domain: White-perspective scores only.
pub fn win_percent(score: Score) -> f64 {
    match score {
        Score::Cp(cp) => {
            50.0 + 50.0 * (2.0 / (1.0 + (-WIN_PERCENT_SLOPE * f64::from(cp)).exp()) - 1.0)
        }
        Score::Mate(n) if n > 0 => 100.0,
        Score::Mate(_) => 0.0,
    }
}

/// Win percent seen from `side`'s chair.
pub fn win_percent_for(side: Color, score: Score) -> f64 {
    match side {
        Color::White => win_percent(score),
        Color::Black => 100.0 - win_percent(score),
    }
}

/// Projects a mate distance onto the centipawn axis, so that shorter mates
/// dominate longer ones and every mate dominates any static eval.
pub fn mate_to_cp(n: i8) -> i32 {
    i32::from(n.signum()) * (100_000 - 1_000 * i32::from(n).abs())
}

/// Centipawn-axis value for comparisons that may mix mate and cp scores.
pub fn cp_axis(score: Score) -> i32 {
    match score {
        Score::Cp(cp) => cp,
        Score::Mate(n) => mate_to_cp(n),
    }
}

/// Centipawn-axis value from `side`'s perspective of a White-POV score.
pub fn cp_axis_for(side: Color, score: Score) -> i32 {
    match side {
        Color::White => cp_axis(score),
        Color::Black => -cp_axis(score),
    }
}

/// Win percent `side` gave up by playing `played` instead of `best`. Both
/// scores are White-POV; the result is oriented so that a positive number
/// means lost ground, and clamped at zero against engine noise.
pub fn loss_win_for_player(side: Color, best: Score, played: Score) -> f64 {
    (win_percent_for(side, best) - win_percent_for(side, played)).max(0.0)
}

/// Win percent separating the best move from the second best, from `side`'s
/// perspective; zero when there is no meaningful alternative.
pub fn gap_win_for_player(side: Color, best: Score, second: Score) -> f64 {
    (win_percent_for(side, best) - win_percent_for(side, second)).max(0.0)
}

/// Absolute win-percent swing between two position evaluations. Large swings
/// mark turning points.
pub fn swing_win(before: Score, after: Score) -> f64 {
    (win_percent(before) - win_percent(after)).abs()
}

/// Conventional piece value in pawn units. Kings count zero.
pub fn piece_value(role: Role) -> i32 {
    match role {
        Role::Pawn => 1,
        Role::Knight | Role::Bishop => 3,
        Role::Rook => 5,
        Role::Queen => 9,
        Role::King => 0,
    }
}

fn side_points(material: &ByRole<u8>) -> i32 {
    i32::from(material.pawn) * piece_value(Role::Pawn)
        + i32::from(material.knight) * piece_value(Role::Knight)
        + i32::from(material.bishop) * piece_value(Role::Bishop)
        + i32::from(material.rook) * piece_value(Role::Rook)
        + i32::from(material.queen) * piece_value(Role::Queen)
}

/// Material balance for `side`, in pawn units.
fn material_balance(pos: &Chess, side: Color) -> i32 {
    let material = pos.board().material();
    match side {
        Color::White => side_points(&material.white) - side_points(&material.black),
        Color::Black => side_points(&material.black) - side_points(&material.white),
    }
}

/// Best achievable material balance for the side to move, considering only
/// capture sequences. Declining every capture (standing pat) is always an
/// option, so a bad exchange is never forced.
fn resolve_captures(pos: &Chess, mut alpha: i32, beta: i32) -> i32 {
    if pos.is_checkmate() {
        return -10_000;
    }

    let stand_pat = material_balance(pos, pos.turn());
    if stand_pat >= beta {
        return beta;
    }
    if alpha < stand_pat {
        alpha = stand_pat;
    }

    let legal_moves = pos.legal_moves();
    let mut captures: Vec<_> = legal_moves.iter().filter(|m| m.is_capture()).collect();
    captures.sort_by_key(|m| -m.capture().map(piece_value).unwrap_or(0));

    for capture in captures {
        let mut next = pos.clone();
        next.play_unchecked(capture);
        let value = -resolve_captures(&next, -beta, -alpha);
        if value >= beta {
            return beta;
        }
        if value > alpha {
            alpha = value;
        }
    }

    alpha
}

/// Material swing for the side playing `mov`, in pawn units, after resolving
/// the forced capture exchanges the move invites. Negative values flag
/// sacrifices. `mov` must be legal in `pos`.
pub fn material_delta(pos: &Chess, mov: &Move) -> i32 {
    let side = pos.turn();
    let before = material_balance(pos, side);

    let mut after = pos.clone();
    after.play_unchecked(mov);

    // The opponent moves next; their resolved balance negated is ours
    let resolved = -resolve_captures(&after, -20_000, 20_000);
    resolved - before
}

/// Game phase, detected from the non-king material left on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Opening,
    Middlegame,
    Endgame,
}

impl Phase {
    /// Accuracy-impact weighting: endgame mistakes cost the most.
    pub fn weight(self) -> f64 {
        match self {
            Self::Opening => 0.7,
            Self::Middlegame => 1.0,
            Self::Endgame => 1.3,
        }
    }
}

pub fn detect_phase(pos: &Chess) -> Phase {
    let material = pos.board().material();
    let total = side_points(&material.white) + side_points(&material.black);
    let ratio = f64::from(total) / f64::from(FULL_MATERIAL);

    if ratio > 0.85 {
        Phase::Opening
    } else if ratio > 0.35 {
        Phase::Middlegame
    } else {
        Phase::Endgame
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use shakmaty::fen::Fen;
    use shakmaty::CastlingMode;

    use super::*;

    fn pos(fen: &str) -> Chess {
        let fen: Fen = fen.parse().unwrap();
        fen.into_position(CastlingMode::Standard).unwrap()
    }

    fn uci(pos: &Chess, mov: &str) -> Move {
        mov.parse::<shakmaty::uci::UciMove>()
            .unwrap()
            .to_move(pos)
            .unwrap()
    }

    #[test]
    fn white_pov_round_trip() {
        for score in [Score::Cp(120), Score::Cp(-3), Score::Mate(2), Score::Mate(-4)] {
            for side in [Color::White, Color::Black] {
                assert_eq!(to_white_pov(to_white_pov(score, side), side), score);
            }
        }
    }

    #[test]
    fn black_scores_flip() {
        assert_eq!(to_white_pov(Score::Cp(50), Color::Black), Score::Cp(-50));
        assert_eq!(to_white_pov(Score::Mate(2), Color::Black), Score::Mate(-2));
    }

    #[test]
    fn win_percent_boundaries() {
        assert_eq!(win_percent(Score::Cp(0)), 50.0);
        assert!(win_percent(Score::Cp(20_000)) > 99.9);
        assert!(win_percent(Score::Cp(-20_000)) < 0.1);
        assert_eq!(win_percent(Score::Mate(3)), 100.0);
        assert_eq!(win_percent(Score::Mate(-1)), 0.0);
    }

    #[test]
    fn win_percent_is_monotone() {
        let mut last = 0.0;
        for cp in (-900..=900).step_by(50) {
            let wp = win_percent(Score::Cp(cp));
            assert!(wp > last, "wp({cp}) = {wp} not above {last}");
            last = wp;
        }
    }

    #[test]
    fn mate_projection() {
        assert_eq!(mate_to_cp(1), 99_000);
        assert_eq!(mate_to_cp(-1), -99_000);
        assert_eq!(mate_to_cp(10), 90_000);
        assert_eq!(mate_to_cp(-10), -90_000);
        // Shorter mates stay ahead of longer ones
        assert!(mate_to_cp(2) > mate_to_cp(5));
    }

    #[test]
    fn loss_is_oriented_per_side() {
        // White best +100, played drops to 0
        let loss = loss_win_for_player(Color::White, Score::Cp(100), Score::Cp(0));
        assert!(loss > 0.0);

        // For Black the same White-POV pair means gained ground
        assert_eq!(loss_win_for_player(Color::Black, Score::Cp(100), Score::Cp(0)), 0.0);

        // Black best is a negative White-POV score
        let loss = loss_win_for_player(Color::Black, Score::Cp(-100), Score::Cp(0));
        assert!(loss > 0.0);
    }

    #[test]
    fn swing_is_absolute() {
        let swing = swing_win(Score::Cp(-200), Score::Cp(200));
        assert_eq!(swing, swing_win(Score::Cp(200), Score::Cp(-200)));
        assert!(swing > 25.0);
    }

    #[test]
    fn phase_of_start_position() {
        assert_eq!(detect_phase(&Chess::default()), Phase::Opening);
    }

    #[test]
    fn phase_of_pawn_endgame() {
        let endgame = pos("8/5k2/8/8/3P4/3K4/8/8 w - - 0 1");
        assert_eq!(detect_phase(&endgame), Phase::Endgame);
    }

    #[test]
    fn phase_of_queenless_middlegame() {
        let middlegame = pos("r1b1kb1r/pppp1ppp/2n2n2/4p3/4P3/2N2N2/PPPP1PPP/R1B1KB1R w KQkq - 0 1");
        assert_eq!(detect_phase(&middlegame), Phase::Middlegame);
    }

    #[test]
    fn capture_of_hanging_pawn_gains() {
        let position = pos("4k3/8/8/3p4/8/8/3Q4/4K3 w - - 0 1");
        let mov = uci(&position, "d2d5");
        assert_eq!(material_delta(&position, &mov), 1);
    }

    #[test]
    fn queen_takes_defended_pawn_is_a_sacrifice() {
        let position = pos("4k3/8/4p3/3p4/8/8/3Q4/4K3 w - - 0 1");
        let mov = uci(&position, "d2d5");
        assert_eq!(material_delta(&position, &mov), -8);
    }

    #[test]
    fn quiet_move_keeps_material() {
        let position = Chess::default();
        let mov = uci(&position, "e2e4");
        assert_eq!(material_delta(&position, &mov), 0);
    }

    #[test]
    fn phase_weights() {
        assert_eq!(Phase::Opening.weight(), 0.7);
        assert_eq!(Phase::Middlegame.weight(), 1.0);
        assert_eq!(Phase::Endgame.weight(), 1.3);
    }
}
