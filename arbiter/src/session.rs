//! Per-client session dispatcher: authentication gate, typed request
//! routing, and the single in-flight analysis slot.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Context as _;
use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, Position};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument};

use crate::auth::{AuthUser, TokenVerifier};
use crate::classify::{self, ReviewError, ReviewRequest};
use crate::error::{
    ClientError, EngineError, ErrorCode, CLOSE_AUTH_FAILED, CLOSE_AUTH_TIMEOUT,
    CLOSE_VERSION_OUTDATED,
};
use crate::pool::{CancelToken, Pool};
use crate::suggest;
use crate::uci::{AnalyzeJob, Personality};

use self::messages::{
    AnalysisErrorFrame, AnalysisResultFrame, AuthErrorFrame, AuthSuccessFrame, ClientMessage,
    ErrorFrame, ReadyFrame, ReviewRequestFrame, ServerMessage, SuggestionRequest,
    SuggestionResultFrame, VersionErrorFrame, VersionInfo,
};

pub mod messages;

/// Clients must authenticate within this window of connecting.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a session needs from the process: the pool, the verifier seam,
/// and the handful of server-level knobs.
pub struct SessionCtx {
    pub pool: Arc<Pool>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub min_client_version: u32,
    pub download_url: String,
    pub hash_mb: u32,
}

/// Runs one client session to completion. Generic over the byte stream so
/// tests drive it over an in-memory duplex.
#[instrument(skip_all, fields(%peer))]
pub async fn run_session<S>(stream: S, ctx: Arc<SessionCtx>, peer: String) -> crate::Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    send(
        &mut write,
        &ServerMessage::Ready(ReadyFrame {
            version: VersionInfo {
                min_version: ctx.min_client_version,
                download_url: ctx.download_url.clone(),
            },
        }),
    )
    .await?;

    let user = match authenticate(&mut lines, &mut write, &ctx).await? {
        Some(user) => user,
        None => return Ok(()),
    };
    info!(user = user.id, "Session authenticated");

    serve(&mut lines, &mut write, &ctx).await
}

async fn send<W>(write: &mut W, frame: &ServerMessage) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(frame).wrap_err("while encoding frame")?;
    line.push('\n');
    write
        .write_all(line.as_bytes())
        .await
        .wrap_err("while writing frame")?;
    Ok(())
}

/// The pre-auth state: only `auth` is welcome, and only for ten seconds.
/// Parse errors are answered without closing; any other request, a stale
/// version, or a bad token closes the session with its documented code.
async fn authenticate<R, W>(
    lines: &mut Lines<BufReader<R>>,
    write: &mut W,
    ctx: &SessionCtx,
) -> crate::Result<Option<AuthUser>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let deadline = Instant::now() + AUTH_TIMEOUT;

    loop {
        let line = match timeout_at(deadline, lines.next_line()).await {
            Err(_) => {
                debug!("Authentication deadline expired");
                send(
                    write,
                    &ServerMessage::Error(ErrorFrame {
                        request_id: None,
                        error: ErrorCode::Unauthenticated,
                        message: "no auth received in time".into(),
                        close_code: Some(CLOSE_AUTH_TIMEOUT),
                    }),
                )
                .await?;
                return Ok(None);
            }
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(err)) => {
                debug!(%err, "Connection lost before auth");
                return Ok(None);
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let auth = match messages::parse_client_frame(&line) {
            Ok(ClientMessage::Auth(auth)) => auth,
            Ok(_) => {
                send(
                    write,
                    &ServerMessage::Error(ErrorFrame {
                        request_id: None,
                        error: ErrorCode::Unauthenticated,
                        message: "authenticate first".into(),
                        close_code: Some(CLOSE_AUTH_TIMEOUT),
                    }),
                )
                .await?;
                return Ok(None);
            }
            Err(err) => {
                send(
                    write,
                    &ServerMessage::Error(ErrorFrame::from_client_error(None, &err)),
                )
                .await?;
                continue;
            }
        };

        if let Some(version) = auth.version {
            if version < ctx.min_client_version {
                debug!(version, min = ctx.min_client_version, "Client below minimum version");
                send(
                    write,
                    &ServerMessage::VersionError(VersionErrorFrame {
                        min_version: ctx.min_client_version,
                        download_url: ctx.download_url.clone(),
                        close_code: CLOSE_VERSION_OUTDATED,
                    }),
                )
                .await?;
                return Ok(None);
            }
        }

        match ctx.verifier.verify(&auth.token).await {
            Ok(user) => {
                send(
                    write,
                    &ServerMessage::AuthSuccess(AuthSuccessFrame { user: user.clone() }),
                )
                .await?;
                return Ok(Some(user));
            }
            Err(err) => {
                debug!(%err, "Token rejected");
                send(
                    write,
                    &ServerMessage::AuthError(AuthErrorFrame {
                        error: ErrorCode::AuthFailed,
                        message: "token rejected".into(),
                        close_code: CLOSE_AUTH_FAILED,
                    }),
                )
                .await?;
                return Ok(None);
            }
        }
    }
}

struct InFlight {
    cancel: CancelToken,
    task: JoinHandle<Option<ServerMessage>>,
}

/// The authenticated request loop. Inbound frames and the in-flight
/// completion race; responses are emitted in request order because at most
/// one analysis is ever in flight.
async fn serve<R, W>(
    lines: &mut Lines<BufReader<R>>,
    write: &mut W,
    ctx: &Arc<SessionCtx>,
) -> crate::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut in_flight: Option<InFlight> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        debug!(%err, "Session read failed");
                        break;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }

                match messages::parse_client_frame(&line) {
                    Ok(msg) => handle_message(msg, &mut in_flight, write, ctx).await?,
                    Err(err) => {
                        send(write, &ServerMessage::Error(ErrorFrame::from_client_error(None, &err)))
                            .await?;
                    }
                }
            }
            outcome = finished(&mut in_flight) => {
                if let Some(frame) = outcome {
                    send(write, &frame).await?;
                }
            }
        }
    }

    // The client went away; whatever is still running is moot
    if let Some(flight) = in_flight.take() {
        flight.cancel.cancel();
    }
    Ok(())
}

/// Resolves when the in-flight analysis completes; pending forever while the
/// slot is empty. `None` outcomes are superseded jobs whose response is
/// swallowed.
async fn finished(in_flight: &mut Option<InFlight>) -> Option<ServerMessage> {
    match in_flight.as_mut() {
        Some(flight) => {
            let outcome = (&mut flight.task).await;
            *in_flight = None;
            match outcome {
                Ok(frame) => frame,
                Err(err) => {
                    error!(?err, "Analysis task failed");
                    Some(ServerMessage::Error(ErrorFrame {
                        request_id: None,
                        error: ErrorCode::Internal,
                        message: "analysis task failed".into(),
                        close_code: None,
                    }))
                }
            }
        }
        None => std::future::pending().await,
    }
}

async fn handle_message<W>(
    msg: ClientMessage,
    in_flight: &mut Option<InFlight>,
    write: &mut W,
    ctx: &Arc<SessionCtx>,
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match msg {
        ClientMessage::Auth(_) => {
            send(
                write,
                &ServerMessage::Error(ErrorFrame {
                    request_id: None,
                    error: ErrorCode::InvalidRequest,
                    message: "already authenticated".into(),
                    close_code: None,
                }),
            )
            .await
        }
        ClientMessage::Analyze(req) => start_suggestion(req, true, in_flight, write, ctx).await,
        ClientMessage::Suggestion(req) => start_suggestion(req, false, in_flight, write, ctx).await,
        ClientMessage::AnalyzeNew(req) => start_review(req, in_flight, write, ctx).await,
    }
}

/// A newer analyze-family request cancels the in-flight one. The superseded
/// job resolves canceled and its response is never sent.
fn supersede(in_flight: &mut Option<InFlight>) {
    if let Some(prev) = in_flight.take() {
        debug!("Superseding in-flight analysis");
        prev.cancel.cancel();
    }
}

/// Validated suggestion request, ready to submit.
struct SuggestionPlan {
    job: AnalyzeJob,
    /// Position the engine will search, for flag extraction
    pos: Chess,
    fen: String,
    request_id: Option<String>,
    target_elo: u16,
}

fn plan_suggestion(req: &SuggestionRequest, ctx: &SessionCtx) -> Result<SuggestionPlan, ClientError> {
    if !(500..=2500).contains(&req.target_elo) {
        return Err(ClientError::invalid_request("targetElo out of range [500, 2500]"));
    }

    let multipv = req.multi_pv.unwrap_or(3);
    if !(1..=8).contains(&multipv) {
        return Err(ClientError::invalid_request("multiPv out of range [1, 8]"));
    }

    let contempt = req.contempt.unwrap_or(0);
    if contempt > 100 {
        return Err(ClientError::invalid_request("contempt out of range [0, 100]"));
    }

    let personality = match &req.personality {
        Some(raw) => raw
            .parse::<Personality>()
            .map_err(|err| ClientError::invalid_request(err.to_string()))?,
        None => Personality::Default,
    };

    let (fen, root) = parse_fen(&req.fen)?;
    let (moves, searched) = parse_moves(&root, &req.moves)?;

    // A finished game has nothing to suggest; an engine probe would only
    // produce an empty bestmove
    if searched.legal_moves().is_empty() {
        return Err(ClientError::invalid_request("position has no legal moves"));
    }

    // The standard starting position goes to the engine as `startpos`
    let engine_fen = (root != Chess::default()).then_some(fen);
    let job = suggest::job(
        engine_fen,
        moves,
        req.target_elo,
        personality,
        multipv,
        i16::from(contempt),
        req.disable_limit_strength,
        ctx.hash_mb,
    );

    Ok(SuggestionPlan {
        job,
        pos: searched,
        fen: req.fen.clone(),
        request_id: req.request_id.clone(),
        target_elo: req.target_elo,
    })
}

async fn start_suggestion<W>(
    req: SuggestionRequest,
    legacy: bool,
    in_flight: &mut Option<InFlight>,
    write: &mut W,
    ctx: &Arc<SessionCtx>,
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let plan = match plan_suggestion(&req, ctx) {
        Ok(plan) => plan,
        Err(err) => {
            return send(
                write,
                &ServerMessage::Error(ErrorFrame::from_client_error(req.request_id.clone(), &err)),
            )
            .await;
        }
    };

    supersede(in_flight);

    let cancel = CancelToken::new();
    let pending = ctx.pool.submit(plan.job, cancel.clone());
    debug!(id = %pending.id(), legacy, "Suggestion submitted");

    let task = tokio::spawn(async move {
        match pending.wait().await {
            Ok(result) => {
                let set = suggest::build(plan.fen, &plan.pos, plan.target_elo, &result);
                let frame = SuggestionResultFrame {
                    request_id: plan.request_id,
                    result: set,
                };
                Some(if legacy {
                    ServerMessage::Result(frame)
                } else {
                    ServerMessage::SuggestionResult(frame)
                })
            }
            Err(EngineError::Canceled) => None,
            Err(err) => Some(ServerMessage::Error(ErrorFrame {
                request_id: plan.request_id,
                error: (&err).into(),
                message: err.to_string(),
                close_code: None,
            })),
        }
    });

    *in_flight = Some(InFlight { cancel, task });
    Ok(())
}

fn plan_review(req: &ReviewRequestFrame, ctx: &SessionCtx) -> Result<ReviewRequest, ClientError> {
    if !(500..=2500).contains(&req.target_elo) {
        return Err(ClientError::invalid_request("targetElo out of range [500, 2500]"));
    }

    let player = match req.player_color.as_str() {
        "w" => Color::White,
        "b" => Color::Black,
        other => {
            return Err(ClientError::invalid_request(format!(
                "playerColor must be \"w\" or \"b\", got \"{other}\""
            )));
        }
    };

    let fen_before: Fen = req
        .fen_before
        .parse()
        .map_err(|err| ClientError::invalid_request(format!("invalid fenBefore: {err}")))?;
    let fen_after: Fen = req
        .fen_after
        .parse()
        .map_err(|err| ClientError::invalid_request(format!("invalid fenAfter: {err}")))?;
    let played: UciMove = req
        .mov
        .parse()
        .map_err(|err| ClientError::invalid_request(format!("invalid move: {err}")))?;

    let moves = req
        .moves
        .iter()
        .map(|raw| raw.parse::<UciMove>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ClientError::invalid_request(format!("invalid moves entry: {err}")))?;

    Ok(ReviewRequest {
        fen_before,
        fen_after,
        played,
        moves,
        player,
        target_elo: req.target_elo,
        book: req.book,
        hash_mb: ctx.hash_mb,
    })
}

async fn start_review<W>(
    req: ReviewRequestFrame,
    in_flight: &mut Option<InFlight>,
    write: &mut W,
    ctx: &Arc<SessionCtx>,
) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let plan = match plan_review(&req, ctx) {
        Ok(plan) => plan,
        Err(err) => {
            return send(
                write,
                &ServerMessage::AnalysisError(AnalysisErrorFrame {
                    request_id: req.request_id.clone(),
                    error: err.code,
                    message: err.message,
                }),
            )
            .await;
        }
    };

    supersede(in_flight);

    let cancel = CancelToken::new();
    let pool = ctx.pool.clone();
    let request_id = req.request_id.clone();
    let mov = req.mov.clone();

    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match classify::review(&pool, plan, cancel).await {
                Ok(classification) => Some(ServerMessage::AnalysisResult(
                    AnalysisResultFrame::new(request_id, mov, classification),
                )),
                Err(ReviewError::Engine(EngineError::Canceled)) => None,
                Err(ReviewError::InvalidRequest(message)) => {
                    Some(ServerMessage::AnalysisError(AnalysisErrorFrame {
                        request_id,
                        error: ErrorCode::InvalidRequest,
                        message,
                    }))
                }
                Err(ReviewError::Engine(err)) => {
                    Some(ServerMessage::AnalysisError(AnalysisErrorFrame {
                        request_id,
                        error: (&err).into(),
                        message: err.to_string(),
                    }))
                }
            }
        }
    });

    *in_flight = Some(InFlight { cancel, task });
    Ok(())
}

fn parse_fen(raw: &str) -> Result<(Fen, Chess), ClientError> {
    let fen: Fen = raw
        .parse()
        .map_err(|err| ClientError::invalid_request(format!("invalid fen: {err}")))?;
    let pos = fen
        .clone()
        .into_position(CastlingMode::Standard)
        .map_err(|err| ClientError::invalid_request(format!("invalid position: {err}")))?;
    Ok((fen, pos))
}

/// Parses and legality-checks the request moves against the root position,
/// returning them alongside the position they lead to.
fn parse_moves(root: &Chess, moves: &[String]) -> Result<(Vec<UciMove>, Chess), ClientError> {
    let mut cursor = root.clone();
    let mut parsed = Vec::with_capacity(moves.len());

    for raw in moves {
        let mov: UciMove = raw
            .parse()
            .map_err(|err| ClientError::invalid_request(format!("invalid move {raw}: {err}")))?;
        let legal = mov
            .to_move(&cursor)
            .map_err(|err| ClientError::invalid_request(format!("illegal move {raw}: {err}")))?;
        cursor.play_unchecked(&legal);
        parsed.push(mov);
    }

    Ok((parsed, cursor))
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use crate::auth::StaticTokenVerifier;
    use crate::config::{AuthConfig, EngineConfig, ScalingConfig, StaticUser};

    use super::*;

    fn test_ctx() -> Arc<SessionCtx> {
        let mut auth = AuthConfig::default();
        auth.tokens.insert(
            "valid".into(),
            StaticUser {
                id: "u1".into(),
                email: "a@b".into(),
            },
        );

        // No engines: these tests never reach a live search
        let scaling = ScalingConfig {
            min_engines: 0,
            max_engines: 1,
            ..ScalingConfig::default()
        };

        Arc::new(SessionCtx {
            pool: Arc::new(Pool::new(EngineConfig::default(), scaling)),
            verifier: Arc::new(StaticTokenVerifier::new(&auth)),
            min_client_version: 2,
            download_url: "https://example.invalid/app".into(),
            hash_mb: 16,
        })
    }

    struct Client {
        read: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        write: tokio::io::WriteHalf<DuplexStream>,
    }

    fn connect(ctx: Arc<SessionCtx>) -> Client {
        let (server, client) = duplex(16 * 1024);
        tokio::spawn(async move {
            let _ = run_session(server, ctx, "test".into()).await;
        });

        let (read, write) = tokio::io::split(client);
        Client {
            read: BufReader::new(read).lines(),
            write,
        }
    }

    impl Client {
        async fn send(&mut self, frame: &str) {
            self.write.write_all(frame.as_bytes()).await.unwrap();
            self.write.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> serde_json::Value {
            let line = self.read.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn ready_then_auth_success() {
        let mut client = connect(test_ctx());

        let ready = client.recv().await;
        assert_eq!(ready["type"], "ready");
        assert_eq!(ready["version"]["minVersion"], 2);

        client.send(r#"{"type":"auth","token":"valid"}"#).await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "auth_success");
        assert_eq!(reply["user"]["id"], "u1");
        assert_eq!(reply["user"]["email"], "a@b");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_closes_with_4001_after_the_deadline() {
        let mut client = connect(test_ctx());
        let _ready = client.recv().await;

        // Send nothing; virtual time runs out the auth window
        let reply = client.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "unauthenticated");
        assert_eq!(reply["closeCode"], 4001);
        assert!(client.read.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_token_closes_with_4003() {
        let mut client = connect(test_ctx());
        let _ready = client.recv().await;

        client.send(r#"{"type":"auth","token":"forged"}"#).await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "auth_error");
        assert_eq!(reply["closeCode"], 4003);

        // Server hangs up after the frame
        assert!(client.read.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn outdated_version_closes_with_4002() {
        let mut client = connect(test_ctx());
        let _ready = client.recv().await;

        client.send(r#"{"type":"auth","token":"valid","version":1}"#).await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "version_error");
        assert_eq!(reply["closeCode"], 4002);
        assert_eq!(reply["downloadUrl"], "https://example.invalid/app");
    }

    #[tokio::test]
    async fn request_before_auth_closes_with_4001() {
        let mut client = connect(test_ctx());
        let _ready = client.recv().await;

        client
            .send(r#"{"type":"suggestion","requestId":"r1","fen":"x","targetElo":1500}"#)
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "unauthenticated");
        assert_eq!(reply["closeCode"], 4001);
    }

    #[tokio::test]
    async fn parse_errors_do_not_close() {
        let mut client = connect(test_ctx());
        let _ready = client.recv().await;

        client.send("{broken").await;
        let reply = client.recv().await;
        assert_eq!(reply["error"], "invalid_json");

        // Still alive: auth works afterwards
        client.send(r#"{"type":"auth","token":"valid"}"#).await;
        assert_eq!(client.recv().await["type"], "auth_success");
    }

    #[tokio::test]
    async fn unknown_type_after_auth_is_reported_not_fatal() {
        let mut client = connect(test_ctx());
        let _ready = client.recv().await;
        client.send(r#"{"type":"auth","token":"valid"}"#).await;
        let _ok = client.recv().await;

        client.send(r#"{"type":"ping"}"#).await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["error"], "unknown_message_type");

        client.send(r#"{"type":"ping"}"#).await;
        assert_eq!(client.recv().await["error"], "unknown_message_type");
    }

    #[tokio::test]
    async fn invalid_suggestion_fields_are_rejected() {
        let mut client = connect(test_ctx());
        let _ready = client.recv().await;
        client.send(r#"{"type":"auth","token":"valid"}"#).await;
        let _ok = client.recv().await;

        client
            .send(r#"{"type":"suggestion","requestId":"r1","fen":"not a fen","targetElo":1500}"#)
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["error"], "invalid_request");
        assert_eq!(reply["requestId"], "r1");

        client
            .send(
                r#"{"type":"suggestion","requestId":"r2","fen":"rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1","targetElo":3000}"#,
            )
            .await;
        assert_eq!(client.recv().await["error"], "invalid_request");

        client
            .send(
                r#"{"type":"suggestion","requestId":"r3","fen":"rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1","targetElo":1500,"personality":"Hypermodern"}"#,
            )
            .await;
        assert_eq!(client.recv().await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn invalid_review_fields_get_analysis_error() {
        let mut client = connect(test_ctx());
        let _ready = client.recv().await;
        client.send(r#"{"type":"auth","token":"valid"}"#).await;
        let _ok = client.recv().await;

        client
            .send(
                r#"{"type":"analyze_new","requestId":"r4","fenBefore":"bad","fenAfter":"bad","move":"e2e4","playerColor":"w","targetElo":1500}"#,
            )
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "analysis_error");
        assert_eq!(reply["error"], "invalid_request");
        assert_eq!(reply["requestId"], "r4");
    }
}
