use std::fmt;

use crate::error::{Classify, ErrorKind, ResolveError};

/// What happened to one token.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Resolved(String),
    Failed(String),
    /// The page was fetched but carried nothing we could report.
    NoInfo,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Resolved(text) => write!(f, "{}", text),
            Outcome::Failed(reason) => write!(f, "unable to resolve ({})", reason),
            Outcome::NoInfo => write!(f, "unable to retrieve info"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyLine {
    pub token: String,
    pub outcome: Outcome,
}

impl ReplyLine {
    pub fn from_result(token: impl Into<String>, result: Result<String, ResolveError>) -> Self {
        let outcome = match result {
            Ok(text) => Outcome::Resolved(text),
            Err(e) if e.kind() == ErrorKind::NoInfo => Outcome::NoInfo,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        Self {
            token: token.into(),
            outcome,
        }
    }
}

impl fmt::Display for ReplyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.token, self.outcome)
    }
}

/// Build the single reply for a batch of lines. Nothing to say for an empty
/// batch; one line stays inline with the label, several go under it.
pub fn compose(label: &str, lines: &[ReplyLine]) -> Option<String> {
    match lines {
        [] => None,
        [only] => Some(format!("{} {}", label, only)),
        many => {
            let body: Vec<String> = many.iter().map(ToString::to_string).collect();
            Some(format!("{}\n{}", label, body.join("\n")))
        }
    }
}
