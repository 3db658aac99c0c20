//! Types helping proper record tracing

use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{Chess, EnPassantMode};

/// Adapter trait for types that we want to change how are they recorded in
/// tracing spans and events.
pub trait TracingAdapt {
    fn tr(&self) -> String;
}

impl TracingAdapt for Chess {
    fn tr(&self) -> String {
        let fen = Fen::from_position(self.clone(), EnPassantMode::Always);
        format!("{fen}")
    }
}

impl TracingAdapt for Fen {
    fn tr(&self) -> String {
        format!("{self}")
    }
}

/// `None` is the standard starting position
impl TracingAdapt for Option<Fen> {
    fn tr(&self) -> String {
        match self {
            Some(fen) => fen.tr(),
            None => "startpos".to_owned(),
        }
    }
}

impl TracingAdapt for [UciMove] {
    fn tr(&self) -> String {
        let mut out = String::from("<");

        for (idx, mov) in self.iter().enumerate() {
            if idx > 0 {
                out.push(' ');
            }
            out.push_str(&mov.to_string());
        }

        out.push('>');
        out
    }
}

impl TracingAdapt for Vec<UciMove> {
    fn tr(&self) -> String {
        self[..].tr()
    }
}
