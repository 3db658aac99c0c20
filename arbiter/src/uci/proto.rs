//! Line-level UCI subprotocol: typed outbound commands and inbound message
//! parsing over the engine's stdio pair.

use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStdin, ChildStdout};
use tracing::{debug, trace, warn};

use crate::error::EngineError;

pub struct Protocol {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    name: String,
}

impl Protocol {
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            stdin,
            stdout: BufReader::new(stdout).lines(),
            name: String::new(),
        }
    }

    async fn send(&mut self, command: Command) -> Result<(), EngineError> {
        let mut command = command.to_string();
        command.push('\n');

        self.stdin
            .write_all(command.as_bytes())
            .await
            .map_err(|err| EngineError::Crash(format!("engine stdin closed: {err}")))?;

        debug!("UCI send: {}", command.trim());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Msg, EngineError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|err| EngineError::Crash(format!("while reading engine: {err}")))?
                .ok_or_else(|| EngineError::Crash("engine stdout closed".into()))?;

            let line = line.trim();
            if !line.is_empty() {
                debug!("UCI recv: {}", line);
                if let Some(msg) = Msg::parse(line) {
                    return Ok(msg);
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn set_option(&mut self, option: &str, value: String) -> Result<(), EngineError> {
        self.send(Command::SetOption(option.to_owned(), value)).await
    }

    /// Performs the `uci`/`uciok` handshake, capturing the engine name.
    pub async fn init(&mut self) -> Result<(), EngineError> {
        self.send(Command::Uci).await?;

        loop {
            use Msg::*;

            match self.recv().await? {
                Id { name: Some(n) } => self.name = n,
                UciOk => break,
                _ => (),
            }
        }

        Ok(())
    }

    /// Synchronizes with the engine I/O via `isready`/`readyok`.
    pub async fn wait_ready(&mut self) -> Result<(), EngineError> {
        self.send(Command::IsReady).await?;

        while !matches!(self.recv().await?, Msg::ReadyOk) {}

        Ok(())
    }

    pub async fn new_game(&mut self) -> Result<(), EngineError> {
        self.send(Command::NewGame).await
    }

    /// Sets the position for analysis. `None` stands for the standard
    /// starting position and renders as `position startpos`.
    pub async fn position(
        &mut self,
        fen: Option<Fen>,
        moves: impl IntoIterator<Item = UciMove>,
    ) -> Result<(), EngineError> {
        self.send(Command::Position {
            fen,
            line: moves.into_iter().collect(),
        })
        .await
    }

    /// Starts the search and hands back the stream of `info` updates.
    pub async fn go(&mut self, search: Search) -> Result<InfoStream<'_>, EngineError> {
        self.send(Command::Go(search)).await?;

        Ok(InfoStream {
            proto: self,
            best: None,
        })
    }

    pub async fn quit(&mut self) -> Result<(), EngineError> {
        self.send(Command::Quit).await
    }
}

/// Search bound carried by the `go` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Search {
    Depth(u32),
    MoveTime(Duration),
}

/// Ongoing engine analysis after the `go` command. Holds a mutable borrow of
/// the protocol, so no other communication can interleave with the search;
/// `stop` can still be sent through it to finish early.
pub struct InfoStream<'a> {
    proto: &'a mut Protocol,
    /// Set once `bestmove` was consumed. After that the stream yields nothing
    /// and stdout must not be read further.
    best: Option<BestMove>,
}

impl InfoStream<'_> {
    /// Gets the next `info` record, or `None` once `bestmove` arrived. After
    /// `Ok(None)`, `finish` returns the cached best move without touching the
    /// engine output.
    pub async fn info(&mut self) -> Result<Option<Info>, EngineError> {
        if self.best.is_some() {
            return Ok(None);
        }

        loop {
            match self.proto.recv().await? {
                Msg::BestMove(best) => {
                    self.best = Some(best);
                    return Ok(None);
                }
                Msg::Info(info) => return Ok(Some(info)),
                _ => (),
            }
        }
    }

    /// Asks the engine to cut the search short. The stream must still be
    /// drained to the final `bestmove` to leave the I/O in sync.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        self.proto.send(Command::Stop).await
    }

    /// Consumes the remainder of the search, discarding any pending `info`
    /// records, and returns the final best move.
    pub async fn finish(mut self) -> Result<BestMove, EngineError> {
        if let Some(best) = self.best {
            return Ok(best);
        }

        loop {
            if let Msg::BestMove(best) = self.proto.recv().await? {
                return Ok(best);
            }
        }
    }
}

/// Command sent to the engine
#[derive(Debug)]
enum Command {
    /// Initialize UCI mode
    Uci,
    /// Set engine option
    SetOption(String, String),
    /// Sync with engine IO
    IsReady,
    /// Start new game
    NewGame,
    /// Setup the position
    Position {
        /// Position FEN - if missing, startpos is used
        fen: Option<Fen>,
        /// Moves after the initial FEN
        line: Vec<UciMove>,
    },
    /// Start evaluation
    Go(Search),
    /// Stop engine evaluation as soon as possible
    Stop,
    /// Gracefully quit
    Quit,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Command::*;

        match self {
            Uci => write!(f, "uci"),
            SetOption(name, value) => write!(f, "setoption name {name} value {value}"),
            IsReady => write!(f, "isready"),
            NewGame => write!(f, "ucinewgame"),
            Position { fen, line } => {
                match fen {
                    Some(fen) => write!(f, "position fen {fen}")?,
                    None => write!(f, "position startpos")?,
                }

                if !line.is_empty() {
                    write!(f, " moves")?;
                    for m in line {
                        write!(f, " {m}")?;
                    }
                }

                Ok(())
            }
            Go(Search::Depth(depth)) => write!(f, "go depth {depth}"),
            Go(Search::MoveTime(time)) => write!(f, "go movetime {}", time.as_millis()),
            Stop => write!(f, "stop"),
            Quit => write!(f, "quit"),
        }
    }
}

/// Messages received from the engine
#[derive(Debug)]
enum Msg {
    /// Information about the engine
    Id { name: Option<String> },
    /// Initialization complete
    UciOk,
    /// IO sync
    ReadyOk,
    /// Analysis complete
    BestMove(BestMove),
    /// Analysis step
    Info(Info),
}

/// Final search verdict carried by the `bestmove` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestMove {
    pub mov: UciMove,
    pub ponder: Option<UciMove>,
}

impl Msg {
    fn parse_id(args: &str) -> Option<Self> {
        let name = args.split_once(" name ").map(|(_, name)| name.to_owned());
        Some(Self::Id { name })
    }

    fn parse_bestmove(args: &str) -> Option<Self> {
        let mut args = args.split_whitespace();
        let m = args.next()?;
        let mov = match m.parse() {
            Ok(m) => m,
            Err(err) => {
                warn!(mov = m, ?err, "Invalid best move");
                return None;
            }
        };

        let ponder = match (args.next(), args.next()) {
            (Some("ponder"), Some(p)) => p.parse().ok(),
            _ => None,
        };

        Some(Msg::BestMove(BestMove { mov, ponder }))
    }

    fn parse(line: &str) -> Option<Self> {
        let idx = line.find(' ').unwrap_or(line.len());
        let cmd = line[..idx].trim();
        let args = &line[idx..];

        match cmd {
            "id" => Self::parse_id(args),
            "uciok" => Some(Self::UciOk),
            "readyok" => Some(Self::ReadyOk),
            "bestmove" => Self::parse_bestmove(args),
            "info" => Info::parse(args).map(Self::Info),
            _ => {
                trace!(line, "Unrecognized engine line");
                None
            }
        }
    }
}

/// One engine `info` record. Parsing is total: a malformed value drops that
/// single field, unknown keys are skipped, and the line itself always yields
/// a record. Records without a score or line are useless for analysis and
/// are dropped by the caller, not the parser.
#[derive(Debug, Default, Clone)]
pub struct Info {
    /// Line number (1 - best, 2 - second best, ...). Defaults to 1 in
    /// single-line mode where engines omit the key.
    pub multipv: u8,
    /// Engine evaluation, from the side-to-move perspective
    pub score: Option<Score>,
    /// The engine line (`pv`)
    pub line: Vec<UciMove>,
    /// Depth the calculation reached
    pub depth: u32,
    /// Selective depth, when reported
    pub seldepth: Option<u32>,
}

impl Info {
    /// Parses the `info` arguments. Returns `None` only for pure debug
    /// (`info string …`) lines.
    fn parse(args: &str) -> Option<Self> {
        // `string` denotes debug information up until the end of the line -
        // handled before splitting tokens to preserve its form
        let args = match args.split_once(" string ") {
            Some((args, msg)) => {
                debug!(info = msg, "Engine info");
                if args.trim().is_empty() {
                    return None;
                }
                args
            }
            None => args,
        };

        let mut args = args.split_whitespace().peekable();
        let mut info = Info {
            multipv: 1,
            ..Info::default()
        };

        while let Some(token) = args.next() {
            match token {
                "multipv" => {
                    if let Some(v) = parse_field(args.next(), "multipv") {
                        info.multipv = v;
                    }
                }
                "depth" => {
                    if let Some(v) = parse_field(args.next(), "depth") {
                        info.depth = v;
                    }
                }
                "seldepth" => {
                    info.seldepth = parse_field(args.next(), "seldepth");
                }
                "score" => match args.next() {
                    Some("cp") => {
                        info.score = parse_field(args.next(), "score cp").map(Score::Cp);
                    }
                    Some("mate") => {
                        info.score = parse_field(args.next(), "score mate").map(Score::Mate);
                    }
                    other => debug!(?other, "Invalid score specifier"),
                },
                "pv" => {
                    info.line.clear();
                    while let Some(mv) = args.peek().and_then(|m| m.parse().ok()) {
                        args.next();
                        info.line.push(mv);
                    }
                }
                _ => (),
            }
        }

        Some(info)
    }

    /// Whether the record carries enough to contribute to a result.
    pub fn is_usable(&self) -> bool {
        self.score.is_some() && !self.line.is_empty()
    }
}

fn parse_field<T: std::str::FromStr>(value: Option<&str>, key: &str) -> Option<T> {
    match value.map(str::parse) {
        Some(Ok(v)) => Some(v),
        Some(Err(_)) => {
            debug!(key, ?value, "Malformed info field dropped");
            None
        }
        None => {
            debug!(key, "Missing info value");
            None
        }
    }
}

/// Engine score evaluation
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Score {
    /// Centipawns score (from the engine PoV)
    Cp(i32),
    /// Mate in #moves (negative if the engine gets mated)
    Mate(i8),
}

impl Score {
    pub fn rev(self) -> Score {
        match self {
            Score::Cp(cp) => Score::Cp(-cp),
            Score::Mate(m) => Score::Mate(-m),
        }
    }

    pub fn is_mate(self) -> bool {
        matches!(self, Score::Mate(_))
    }
}

/// Ordering decides which line is better for the side the score belongs to:
/// * The best is `Mate(n)` where `n >= 0`.
///   * `Mate(n) > Mate(m)` <=> `n < m` - the fewer moves to mate the better
/// * If there is no mate, `Cp` are ordered: `Cp(n) > Cp(m)` <=> `n > m`
/// * The worst are opponent mates - `Mate(n)` where `n < 0`
///   * `Mate(n) > Mate(m)` <=> `n > m` - more moves to get mated is better
impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        use Score::*;

        match (self, other) {
            (Cp(n), Cp(m)) => n.cmp(m),
            (Mate(n), Cp(_)) if *n >= 0 => Ordering::Greater,
            (Cp(_), Mate(m)) if *m >= 0 => Ordering::Less,
            (Mate(_), Cp(_)) => Ordering::Less,
            (Cp(_), Mate(_)) => Ordering::Greater,
            (Mate(n), Mate(m)) if *n >= 0 && *m < 0 => Ordering::Greater,
            (Mate(n), Mate(m)) if *n < 0 && *m >= 0 => Ordering::Less,
            (Mate(n), Mate(m)) if *n >= 0 && *m >= 0 => m.cmp(n),
            (Mate(n), Mate(m)) => n.cmp(m),
        }
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cp(cp) => {
                let h = cp / 100;
                let l = cp.abs() % 100;
                write!(f, "{h}.{l}")
            }
            Self::Mate(m) => {
                write!(f, "#{m}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn info(line: &str) -> Info {
        match Msg::parse(line) {
            Some(Msg::Info(info)) => info,
            other => panic!("expected info, got {other:?}"),
        }
    }

    #[test]
    fn command_rendering() {
        assert_eq!(Command::Uci.to_string(), "uci");
        assert_eq!(
            Command::SetOption("MultiPV".into(), "3".into()).to_string(),
            "setoption name MultiPV value 3"
        );
        assert_eq!(
            Command::Go(Search::MoveTime(Duration::from_millis(700))).to_string(),
            "go movetime 700"
        );
        assert_eq!(Command::Go(Search::Depth(10)).to_string(), "go depth 10");
    }

    #[test]
    fn position_startpos() {
        let cmd = Command::Position {
            fen: None,
            line: vec!["e2e4".parse().unwrap(), "e7e5".parse().unwrap()],
        };
        assert_eq!(cmd.to_string(), "position startpos moves e2e4 e7e5");
    }

    #[test]
    fn position_fen() {
        let fen: Fen = "8/8/8/8/8/4k3/4p3/4K3 w - - 0 1".parse().unwrap();
        let cmd = Command::Position {
            fen: Some(fen),
            line: vec![],
        };
        assert_eq!(cmd.to_string(), "position fen 8/8/8/8/8/4k3/4p3/4K3 w - - 0 1");
    }

    #[test]
    fn full_info_line() {
        let info = info(
            "info depth 12 seldepth 17 multipv 2 score cp -34 nodes 91001 nps 812000 \
             pv e7e5 g1f3 b8c6",
        );
        assert_eq!(info.depth, 12);
        assert_eq!(info.seldepth, Some(17));
        assert_eq!(info.multipv, 2);
        assert_eq!(info.score, Some(Score::Cp(-34)));
        assert_eq!(info.line.len(), 3);
        assert!(info.is_usable());
    }

    #[test]
    fn mate_score() {
        let info = info("info depth 5 score mate -3 pv e1e2");
        assert_eq!(info.score, Some(Score::Mate(-3)));
    }

    #[test]
    fn malformed_field_drops_field_not_line() {
        let info = info("info depth twelve multipv 1 score cp 40 pv d2d4");
        assert_eq!(info.depth, 0);
        assert_eq!(info.score, Some(Score::Cp(40)));
        assert_eq!(info.line.len(), 1);
    }

    #[test]
    fn info_without_score_is_kept_but_unusable() {
        let info = info("info depth 3 currmove e2e4 currmovenumber 1");
        assert!(!info.is_usable());
        assert_eq!(info.depth, 3);
    }

    #[test]
    fn debug_string_line_is_skipped() {
        assert!(Msg::parse("info string NNUE evaluation enabled").is_none());
    }

    #[test]
    fn bestmove_with_ponder() {
        match Msg::parse("bestmove e2e4 ponder e7e5") {
            Some(Msg::BestMove(best)) => {
                assert_eq!(best.mov, "e2e4".parse().unwrap());
                assert_eq!(best.ponder, Some("e7e5".parse().unwrap()));
            }
            other => panic!("expected bestmove, got {other:?}"),
        }
    }

    #[test]
    fn unknown_lines_ignored() {
        assert!(Msg::parse("option name Hash type spin default 16").is_none());
        assert!(Msg::parse("joining cluster node 4").is_none());
    }

    #[test]
    fn score_ordering() {
        assert!(Score::Mate(1) > Score::Mate(4));
        assert!(Score::Mate(1) > Score::Cp(900));
        assert!(Score::Cp(-500) > Score::Mate(-2));
        assert!(Score::Mate(-5) > Score::Mate(-2));
        assert!(Score::Cp(30) > Score::Cp(-30));
    }

    #[test]
    fn score_rev_round_trip() {
        for score in [Score::Cp(120), Score::Cp(0), Score::Mate(3), Score::Mate(-1)] {
            assert_eq!(score.rev().rev(), score);
        }
    }
}
