//! Shared fixtures for the integration suites: the stub engine binary and a
//! line-frame test client.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

use arbiter::auth::StaticTokenVerifier;
use arbiter::config::{AuthConfig, EngineConfig, ScalingConfig, StaticUser};
use arbiter::pool::Pool;
use arbiter::session::{run_session, SessionCtx};

pub fn stub_engine(args: &[&str]) -> EngineConfig {
    EngineConfig {
        binary_path: PathBuf::from(env!("CARGO_BIN_EXE_stub_engine")),
        args: args.iter().map(|arg| (*arg).to_owned()).collect(),
        threads: 1,
        hash_mb: 16,
    }
}

pub fn scaling(min: usize, max: usize) -> ScalingConfig {
    ScalingConfig {
        min_engines: min,
        max_engines: max,
        scale_up_threshold: 1,
        ..ScalingConfig::default()
    }
}

pub fn session_ctx(engine_args: &[&str], min: usize, max: usize) -> Arc<SessionCtx> {
    let mut auth = AuthConfig::default();
    auth.tokens.insert(
        "valid".into(),
        StaticUser {
            id: "u1".into(),
            email: "a@b".into(),
        },
    );

    Arc::new(SessionCtx {
        pool: Arc::new(Pool::new(stub_engine(engine_args), scaling(min, max))),
        verifier: Arc::new(StaticTokenVerifier::new(&auth)),
        min_client_version: 1,
        download_url: "https://example.invalid/app".into(),
        hash_mb: 16,
    })
}

pub struct Client {
    read: Lines<BufReader<ReadHalf<DuplexStream>>>,
    write: WriteHalf<DuplexStream>,
}

pub fn connect(ctx: Arc<SessionCtx>) -> Client {
    let (server, client) = tokio::io::duplex(64 * 1024);
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
    pub async fn send(&mut self, frame: &str) {
        self.write.write_all(frame.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
    }

    pub async fn recv(&mut self) -> serde_json::Value {
        let line = self.read.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Authenticates with the fixture token, consuming the ready frame.
    pub async fn login(&mut self) {
        let ready = self.recv().await;
        assert_eq!(ready["type"], "ready");
        self.send(r#"{"type":"auth","token":"valid"}"#).await;
        let reply = self.recv().await;
        assert_eq!(reply["type"], "auth_success");
    }

    pub async fn closed(&mut self) -> bool {
        self.read.next_line().await.unwrap().is_none()
    }
}
