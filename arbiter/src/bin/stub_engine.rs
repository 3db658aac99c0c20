//! Deterministic UCI engine used by the integration tests. Speaks enough of
//! the protocol to exercise the driver, pool, and session paths: handshake,
//! option echo, multi-PV info emission, `stop`, and scripted failure modes.
//!
//! Scoring is fixed: legal moves sorted by coordinate notation, a mating
//! move promoted to the front with `score mate 1`, the rest on a descending
//! centipawn ladder. Flags:
//!
//! * `--delay-ms <n>`  - hold each search for `n` ms (interruptible by `stop`)
//! * `--crash-on-go`   - exit the process the moment a search starts
//! * `--crash-after <n>` - exit after completing `n` searches

use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Move, Position};

struct Options {
    delay: Duration,
    crash_on_go: bool,
    crash_after: Option<u32>,
}

fn parse_args() -> Options {
    let mut options = Options {
        delay: Duration::ZERO,
        crash_on_go: false,
        crash_after: None,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--delay-ms" => {
                let ms = args.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                options.delay = Duration::from_millis(ms);
            }
            "--crash-on-go" => options.crash_on_go = true,
            "--crash-after" => {
                options.crash_after = args.next().and_then(|v| v.parse().ok());
            }
            _ => (),
        }
    }

    options
}

/// Centipawn ladder for non-mating ranks, side-to-move perspective.
const SCORES: [i32; 8] = [20, -15, -120, -250, -400, -550, -700, -850];

fn main() {
    let options = parse_args();

    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut pos = Chess::default();
    let mut multipv = 1usize;
    let mut searches = 0u32;

    loop {
        let line = match rx.recv() {
            Ok(line) => line,
            Err(_) => return,
        };

        let mut words = line.split_whitespace();
        match words.next() {
            Some("uci") => {
                writeln!(out, "id name StubEngine").unwrap();
                writeln!(out, "id author arbiter tests").unwrap();
                writeln!(out, "option name MultiPV type spin default 1 min 1 max 8").unwrap();
                writeln!(out, "uciok").unwrap();
                out.flush().unwrap();
            }
            Some("isready") => {
                writeln!(out, "readyok").unwrap();
                out.flush().unwrap();
            }
            Some("ucinewgame") => (),
            Some("setoption") => {
                // setoption name <key> value <val>
                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.get(1) == Some(&"name")
                    && tokens.get(2) == Some(&"MultiPV")
                    && tokens.get(3) == Some(&"value")
                {
                    multipv = tokens
                        .get(4)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(1)
                        .clamp(1, 8);
                }
            }
            Some("position") => pos = parse_position(&line),
            Some("go") => {
                if options.crash_on_go {
                    std::process::exit(2);
                }

                if !options.delay.is_zero() {
                    // Honor stop/quit arriving mid-search
                    match rx.recv_timeout(options.delay) {
                        Ok(cmd) if cmd.trim() == "quit" => return,
                        Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => (),
                        Err(mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }

                answer_go(&mut out, &pos, multipv);
                searches += 1;
                if options.crash_after == Some(searches) {
                    return;
                }
            }
            Some("stop") => (),
            Some("quit") => return,
            _ => (),
        }
    }
}

fn parse_position(line: &str) -> Chess {
    let tokens: Vec<&str> = line.split_whitespace().skip(1).collect();

    let (mut pos, moves) = match tokens.first() {
        Some(&"startpos") => {
            let moves = if tokens.get(1) == Some(&"moves") {
                &tokens[2..]
            } else {
                &[][..]
            };
            (Chess::default(), moves)
        }
        Some(&"fen") => {
            let moves_at = tokens.iter().position(|t| *t == "moves").unwrap_or(tokens.len());
            let fen = tokens[1..moves_at].join(" ");
            let pos = fen
                .parse::<Fen>()
                .ok()
                .and_then(|fen| fen.into_position(CastlingMode::Standard).ok())
                .unwrap_or_default();
            let moves = if moves_at < tokens.len() {
                &tokens[moves_at + 1..]
            } else {
                &[][..]
            };
            (pos, moves)
        }
        _ => (Chess::default(), &[][..]),
    };

    for raw in moves {
        if let Ok(mov) = raw.parse::<UciMove>() {
            if let Ok(legal) = mov.to_move(&pos) {
                pos.play_unchecked(&legal);
            }
        }
    }

    pos
}

fn answer_go(out: &mut impl Write, pos: &Chess, multipv: usize) {
    let legal = pos.legal_moves();
    let mut moves: Vec<Move> = legal.iter().cloned().collect();
    moves.sort_by_key(|m| UciMove::from_standard(m).to_string());

    if moves.is_empty() {
        writeln!(out, "bestmove (none)").unwrap();
        out.flush().unwrap();
        return;
    }

    // A mate in one always tops the list
    let mate_at = moves.iter().position(|m| {
        let mut next = pos.clone();
        next.play_unchecked(m);
        next.is_checkmate()
    });
    if let Some(idx) = mate_at {
        moves.swap(0, idx);
    }

    let ranked: Vec<(usize, String)> = moves
        .iter()
        .take(multipv)
        .enumerate()
        .map(|(idx, m)| (idx, UciMove::from_standard(m).to_string()))
        .collect();

    for depth in [8, 12] {
        for (idx, mov) in &ranked {
            let score = if *idx == 0 && mate_at.is_some() {
                "mate 1".to_owned()
            } else {
                format!("cp {}", SCORES[*idx])
            };
            writeln!(
                out,
                "info depth {depth} seldepth {} multipv {} score {score} nodes {} pv {mov}",
                depth + 4,
                idx + 1,
                1000 * depth,
            )
            .unwrap();
        }
    }

    writeln!(out, "bestmove {}", ranked[0].1).unwrap();
    out.flush().unwrap();
}
