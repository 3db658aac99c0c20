//! UCI engine driver: owns one engine subprocess and exposes a strict
//! request/response `analyze` call over the line protocol.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use derivative::Derivative;
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process;
use tokio::spawn;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::adapters::TracingAdapt;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::CancelToken;

pub use self::proto::{BestMove, Score, Search};

mod proto;

/// Engine handshake must produce `readyok` within this window, or the driver
/// is declared dead.
const READY_TIMEOUT: Duration = Duration::from_secs(5);
/// After `stop`, the engine gets this long to emit its final `bestmove`.
const STOP_GRACE: Duration = Duration::from_millis(500);
/// After `quit`, the process gets this long to exit before being killed.
const QUIT_GRACE: Duration = Duration::from_secs(2);
/// Wall ceiling for depth-bounded searches, which carry no movetime to
/// derive a deadline from.
const DEPTH_WALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Unique analysis job identifier, for tracing and pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// What the job's output feeds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Multi-PV candidate moves for the suggestion builder
    Suggestion,
    /// Evaluation probe for the move classifier
    Stats,
}

/// Engine personality, a closed set validated at the session edge so that
/// free-form strings never reach `setoption`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Personality {
    #[default]
    Default,
    Aggressive,
    Defensive,
    Positional,
    Tactical,
    Human,
}

impl Personality {
    pub const ALL: [Self; 6] = [
        Self::Default,
        Self::Aggressive,
        Self::Defensive,
        Self::Positional,
        Self::Tactical,
        Self::Human,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Aggressive => "Aggressive",
            Self::Defensive => "Defensive",
            Self::Positional => "Positional",
            Self::Tactical => "Tactical",
            Self::Human => "Human",
        }
    }
}

impl std::str::FromStr for Personality {
    type Err = UnknownPersonality;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPersonality(s.to_owned()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown personality: {0}")]
pub struct UnknownPersonality(pub String);

/// One analysis request, immutable once enqueued.
#[derive(Debug, Clone)]
pub struct AnalyzeJob {
    pub id: JobId,
    /// Starting position; `None` is the standard initial position
    pub fen: Option<Fen>,
    /// Plies applied on top of `fen`
    pub moves: Vec<UciMove>,
    pub search: Search,
    pub multipv: u8,
    pub target_elo: u16,
    pub personality: Personality,
    pub contempt_cp: i16,
    pub limit_strength: bool,
    /// Engine skill level, when the caller derives one from the target elo
    pub skill: Option<u8>,
    pub hash_mb: u32,
    pub kind: JobKind,
}

impl AnalyzeJob {
    pub fn new(fen: Option<Fen>, moves: Vec<UciMove>, search: Search, kind: JobKind) -> Self {
        Self {
            id: JobId::next(),
            fen,
            moves,
            search,
            multipv: 1,
            target_elo: 2000,
            personality: Personality::Default,
            contempt_cp: 0,
            limit_strength: false,
            skill: None,
            hash_mb: 128,
            kind,
        }
    }

    /// Hard deadline for the whole analyze call, search plus overhead.
    pub fn wall_timeout(&self) -> Duration {
        match self.search {
            Search::MoveTime(t) => t * 2 + Duration::from_secs(5),
            Search::Depth(_) => DEPTH_WALL_TIMEOUT,
        }
    }
}

/// A single principal variation from one analyze call.
#[derive(Debug, Clone)]
pub struct PvLine {
    /// 1-based multipv rank
    pub rank: u8,
    pub depth: u32,
    pub seldepth: Option<u32>,
    /// Raw engine score, side-to-move perspective
    pub score: Score,
    pub moves: Vec<UciMove>,
}

/// Frozen output of one analyze call.
#[derive(Debug, Clone)]
pub struct AnalyzeResult {
    pub best_move: UciMove,
    /// Lines ordered by rank, a contiguous prefix of `1..=multipv`
    pub lines: Vec<PvLine>,
    /// Deepest depth observed across all lines
    pub depth: u32,
    pub elapsed: Duration,
}

/// Driver over one engine subprocess. The stdio pair is exclusively owned
/// here; all interaction goes through `analyze` and `shutdown`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Engine {
    #[derivative(Debug = "ignore")]
    child: process::Child,
    #[derivative(Debug = "ignore")]
    proto: proto::Protocol,
    name: String,
    /// Last applied `Hash` value; resent only on change, as UCI requires
    hash_mb: Option<u32>,
}

impl Engine {
    /// Spawns the engine process and completes the UCI handshake. The engine
    /// must report ready within five seconds.
    #[instrument(skip(config), err)]
    pub async fn spawn(config: &EngineConfig) -> Result<Engine, EngineError> {
        trace!(?config, "Starting engine");

        let mut command = process::Command::new(&config.binary_path);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| EngineError::Crash(format!("while starting engine: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Crash("cannot open engine stdin".into()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Crash("cannot open engine stdout".into()))?;

        // Drained on a side task so a chatty engine cannot deadlock on a
        // full stderr pipe.
        match child.stderr.take() {
            Some(stderr) => {
                let _task = spawn(async move {
                    let mut stderr = BufReader::new(stderr).lines();
                    loop {
                        match stderr.next_line().await {
                            Err(err) => {
                                error!("While reading from engine stderr: {err}");
                                break;
                            }
                            Ok(None) => break,
                            Ok(Some(line)) => warn!(err = line, "Engine stderr"),
                        }
                    }
                });
            }
            None => warn!("Cannot open engine stderr"),
        }
        info!(pid = ?child.id(), "Engine process started");

        let mut proto = proto::Protocol::new(stdin, stdout);

        timeout(READY_TIMEOUT, async {
            proto.init().await?;
            if config.threads > 1 {
                proto.set_option("Threads", config.threads.to_string()).await?;
            }
            proto.wait_ready().await
        })
        .await
        .map_err(|_| EngineError::Crash("engine not ready within 5s of spawn".into()))??;

        let engine = Self {
            name: proto.name().to_owned(),
            child,
            proto,
            hash_mb: None,
        };

        trace!(name = engine.name, "Engine initialized");
        Ok(engine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs one analysis to completion. Every call starts from a clean
    /// search state: `ucinewgame` first, so the previous search's
    /// transposition table cannot bias this one, then options in a fixed
    /// order, position, and `go`.
    ///
    /// Cancellation sends `stop` and drains to `bestmove`; the driver stays
    /// usable afterwards. Any other error leaves the driver dead.
    #[instrument(skip_all, fields(id = %job.id, fen = job.fen.tr(), moves = job.moves.tr(), search = ?job.search, multipv = job.multipv), err)]
    pub async fn analyze(
        &mut self,
        job: &AnalyzeJob,
        cancel: &CancelToken,
    ) -> Result<AnalyzeResult, EngineError> {
        let started = Instant::now();

        self.proto.new_game().await?;
        self.proto.wait_ready().await?;
        self.apply_options(job).await?;
        self.proto
            .position(job.fen.clone(), job.moves.iter().cloned())
            .await?;

        let mut lines: BTreeMap<u8, PvLine> = BTreeMap::new();
        let mut depth = 0;

        let mut stream = self.proto.go(job.search).await?;
        let best = loop {
            let next = tokio::select! {
                info = stream.info() => Some(info?),
                () = cancel.cancelled() => None,
            };

            let info = match next {
                Some(Some(info)) => info,
                // `bestmove` arrived; the search is complete
                Some(None) => break stream.finish().await?,
                // Canceled mid-search: cut it short but keep the I/O in sync
                None => {
                    debug!("Analysis canceled, stopping search");
                    stream.stop().await?;
                    return match timeout(STOP_GRACE, stream.finish()).await {
                        Ok(Ok(_)) => Err(EngineError::Canceled),
                        Ok(Err(err)) => Err(err),
                        Err(_) => {
                            warn!("Engine ignored stop, killing");
                            Err(EngineError::Timeout)
                        }
                    };
                }
            };

            if !info.is_usable() {
                continue;
            }

            depth = depth.max(info.depth);
            let line = PvLine {
                rank: info.multipv,
                depth: info.depth,
                seldepth: info.seldepth,
                // Usability is checked above
                score: info.score.unwrap_or(Score::Cp(0)),
                moves: info.line,
            };

            // Keep the deepest record per rank
            match lines.get(&line.rank) {
                Some(prev) if prev.depth > line.depth => (),
                _ => {
                    lines.insert(line.rank, line);
                }
            }
        };

        let mut lines: Vec<PvLine> = lines.into_values().collect();
        if lines.is_empty() {
            return Err(EngineError::Crash("no principal variation produced".into()));
        }

        // Engine-rounding edge case: the final bestmove may come from a
        // deeper iteration than the last rank-1 info. The bestmove wins.
        if lines[0].moves.first() != Some(&best.mov) {
            warn!(
                rank1 = ?lines[0].moves.first(),
                best = %best.mov,
                "Rank-1 PV disagrees with bestmove, overriding"
            );
            lines[0].moves = vec![best.mov.clone()];
        }

        let result = AnalyzeResult {
            best_move: best.mov,
            lines,
            depth,
            elapsed: started.elapsed(),
        };

        debug!(
            lines = result.lines.len(),
            depth = result.depth,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Position analyzed"
        );
        Ok(result)
    }

    /// Job options in the order UCI semantics require: hash first (resized
    /// only on change), strength limiting before elo, then the rest.
    async fn apply_options(&mut self, job: &AnalyzeJob) -> Result<(), EngineError> {
        if self.hash_mb != Some(job.hash_mb) {
            self.proto.set_option("Hash", job.hash_mb.to_string()).await?;
            self.hash_mb = Some(job.hash_mb);
        }

        self.proto
            .set_option("UCI_LimitStrength", job.limit_strength.to_string())
            .await?;
        if job.limit_strength {
            self.proto
                .set_option("UCI_Elo", job.target_elo.to_string())
                .await?;
        }
        self.proto
            .set_option("Personality", job.personality.as_str().to_owned())
            .await?;
        self.proto
            .set_option("MultiPV", job.multipv.to_string())
            .await?;
        if let Some(skill) = job.skill {
            self.proto.set_option("Skill", skill.to_string()).await?;
        }
        self.proto
            .set_option("Contempt", job.contempt_cp.to_string())
            .await
    }

    /// Gracefully stops the engine: `quit`, then a two second grace before
    /// the process is killed.
    #[instrument(skip(self), fields(name = self.name))]
    pub async fn shutdown(mut self) {
        if let Err(err) = self.proto.quit().await {
            debug!(%err, "Quit not delivered, engine already gone");
        }

        match timeout(QUIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Engine exited"),
            Ok(Err(err)) => error!(?err, "While waiting for engine exit"),
            Err(_) => {
                warn!("Engine ignored quit, killing");
                if let Err(err) = self.child.kill().await {
                    error!(?err, "While killing engine");
                }
            }
        }
    }
}
