//! Wire messages for the control plane.
//!
//! Requests travel over the request/reply channel, one message per call;
//! publications fan out over the publish/subscribe channel with a topic
//! prefix. All messages are single lines, colon-separated at the first colon
//! only, since title text may itself contain colons.
//!
//! ```text
//! requests:      TRANSITION:<name>  RUN:<n>  TITLE:<text>  RECORD:<token>
//! replies:       OK                 FAIL - <reason>
//! publications:  STATE:<name>  TRANSITION:<name>  RUN:<n>  TITLE:<text>  RECORD:<bool>
//! ```

use crate::error::RcError;
use std::fmt;
use std::str::FromStr;

/// Parses the bool-like tokens accepted by `RECORD:` requests.
pub fn parse_bool_token(token: &str) -> Result<bool, RcError> {
    match token.to_ascii_lowercase().as_str() {
        "on" | "true" | "enabled" => Ok(true),
        "off" | "false" | "disabled" => Ok(false),
        _ => Err(RcError::InvalidValue(format!(
            "'{token}' is not a recording flag (on/true/enabled/off/false/disabled)"
        ))),
    }
}

/// One request on the request/reply channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask the authority to enter a new state.
    Transition(String),
    /// Set the run number (non-negative integer, enforced at parse).
    Run(u32),
    /// Set the run title.
    Title(String),
    /// Set the recording flag.
    Record(bool),
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Transition(name) => write!(f, "TRANSITION:{name}"),
            Request::Run(n) => write!(f, "RUN:{n}"),
            Request::Title(text) => write!(f, "TITLE:{text}"),
            Request::Record(flag) => write!(f, "RECORD:{flag}"),
        }
    }
}

impl FromStr for Request {
    type Err = RcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (keyword, rest) = s
            .split_once(':')
            .ok_or_else(|| RcError::Malformed(s.to_string()))?;
        match keyword {
            "TRANSITION" => Ok(Request::Transition(rest.to_string())),
            "RUN" => rest
                .parse::<u32>()
                .map(Request::Run)
                .map_err(|_| RcError::InvalidValue(format!("'{rest}' is not a run number"))),
            "TITLE" => Ok(Request::Title(rest.to_string())),
            "RECORD" => parse_bool_token(rest).map(Request::Record),
            _ => Err(RcError::Malformed(s.to_string())),
        }
    }
}

/// One reply on the request/reply channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The request was accepted and applied.
    Ok,
    /// The request was rejected; the reason is operator-readable text.
    Fail(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => write!(f, "OK"),
            Reply::Fail(reason) => write!(f, "FAIL - {reason}"),
        }
    }
}

impl FromStr for Reply {
    type Err = RcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "OK" {
            Ok(Reply::Ok)
        } else if let Some(reason) = s.strip_prefix("FAIL - ") {
            Ok(Reply::Fail(reason.to_string()))
        } else {
            Err(RcError::Malformed(s.to_string()))
        }
    }
}

/// One message on the publish/subscribe channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Publication {
    /// Heartbeat / initial state broadcast.
    State(String),
    /// A transition was accepted and performed.
    Transition(String),
    /// Run-number update.
    Run(u32),
    /// Title update.
    Title(String),
    /// Recording-flag update.
    Record(bool),
}

impl fmt::Display for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Publication::State(name) => write!(f, "STATE:{name}"),
            Publication::Transition(name) => write!(f, "TRANSITION:{name}"),
            Publication::Run(n) => write!(f, "RUN:{n}"),
            Publication::Title(text) => write!(f, "TITLE:{text}"),
            Publication::Record(flag) => write!(f, "RECORD:{flag}"),
        }
    }
}

impl FromStr for Publication {
    type Err = RcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (keyword, rest) = s
            .split_once(':')
            .ok_or_else(|| RcError::Malformed(s.to_string()))?;
        match keyword {
            "STATE" => Ok(Publication::State(rest.to_string())),
            "TRANSITION" => Ok(Publication::Transition(rest.to_string())),
            "RUN" => rest
                .parse::<u32>()
                .map(Publication::Run)
                .map_err(|_| RcError::InvalidValue(format!("'{rest}' is not a run number"))),
            "TITLE" => Ok(Publication::Title(rest.to_string())),
            "RECORD" => parse_bool_token(rest).map(Publication::Record),
            _ => Err(RcError::Malformed(s.to_string())),
        }
    }
}
