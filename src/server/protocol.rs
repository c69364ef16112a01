//! Wire vocabulary between pool clients and the pool server.
//!
//! Every exchange is one command frame followed by one response frame,
//! both in the [`crate::ipc::Channel`] frame encoding. A successful `get`
//! response is additionally followed by the session's file descriptor; an
//! error response whose frame ends with the `data` marker is followed by a
//! scalar carrying a renderable error page.

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::spawn::{AppType, SpawnMethod, SpawnOptions};

/// Marker arg announcing a scalar error page after an error frame.
pub const DATA_MARKER: &str = "data";

/// A client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Acquire a session for an app root.
    Get(SpawnOptions),
    /// Release the session previously returned under this id.
    Close { session_id: u64 },
    Clear,
    SetMax(u32),
    SetMaxPerApp(u32),
    SetMaxIdleTime(u64),
    GetActive,
    GetCount,
    GetSpawnServerPid,
}

impl Command {
    pub fn to_frame(&self) -> Vec<String> {
        match self {
            Command::Get(opts) => vec![
                "get".into(),
                opts.app_root.clone(),
                if opts.lower_privilege { "1" } else { "0" }.into(),
                opts.lowest_user.clone(),
                opts.environment.clone(),
                opts.spawn_method.as_str().into(),
                opts.app_type.as_str().into(),
            ],
            Command::Close { session_id } => vec!["close".into(), session_id.to_string()],
            Command::Clear => vec!["clear".into()],
            Command::SetMax(n) => vec!["setMax".into(), n.to_string()],
            Command::SetMaxPerApp(n) => vec!["setMaxPerApp".into(), n.to_string()],
            Command::SetMaxIdleTime(secs) => {
                vec!["setMaxIdleTime".into(), secs.to_string()]
            }
            Command::GetActive => vec!["getActive".into()],
            Command::GetCount => vec!["getCount".into()],
            Command::GetSpawnServerPid => vec!["getSpawnServerPid".into()],
        }
    }

    pub fn from_frame(frame: &[String]) -> Result<Self> {
        let name = frame
            .first()
            .ok_or_else(|| Error::Protocol("empty command frame".into()))?;
        match name.as_str() {
            "get" => {
                if frame.len() != 7 {
                    return Err(Error::Protocol(format!(
                        "get expects 6 arguments, got {}",
                        frame.len() - 1
                    )));
                }
                Ok(Command::Get(SpawnOptions {
                    app_root: frame[1].clone(),
                    lower_privilege: frame[2] == "1",
                    lowest_user: frame[3].clone(),
                    environment: frame[4].clone(),
                    spawn_method: SpawnMethod::from_str(&frame[5])?,
                    app_type: AppType::from_str(&frame[6])?,
                }))
            }
            "close" => Ok(Command::Close {
                session_id: parse_arg(frame, 1)?,
            }),
            "clear" => Ok(Command::Clear),
            "setMax" => Ok(Command::SetMax(parse_arg(frame, 1)?)),
            "setMaxPerApp" => Ok(Command::SetMaxPerApp(parse_arg(frame, 1)?)),
            "setMaxIdleTime" => Ok(Command::SetMaxIdleTime(parse_arg(frame, 1)?)),
            "getActive" => Ok(Command::GetActive),
            "getCount" => Ok(Command::GetCount),
            "getSpawnServerPid" => Ok(Command::GetSpawnServerPid),
            other => Err(Error::Protocol(format!("unknown command: {:?}", other))),
        }
    }
}

/// A server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Plain acknowledgement.
    Ok,
    /// `get` succeeded; the session stream fd follows this frame.
    Session { pid: i32, session_id: u64 },
    /// Numeric answer to one of the counter queries.
    Value(i64),
    /// The pool cannot satisfy the request right now; retry later.
    Busy,
    /// The request failed. When `has_page` is set, a scalar with a
    /// renderable error page follows this frame.
    Error {
        kind: String,
        message: String,
        has_page: bool,
    },
}

impl Response {
    pub fn to_frame(&self) -> Vec<String> {
        match self {
            Response::Ok => vec!["ok".into()],
            Response::Session { pid, session_id } => {
                vec!["ok".into(), pid.to_string(), session_id.to_string()]
            }
            Response::Value(n) => vec![n.to_string()],
            Response::Busy => vec!["busy".into()],
            Response::Error {
                kind,
                message,
                has_page,
            } => {
                let mut frame = vec![
                    "error".into(),
                    kind.clone(),
                    sanitize_message(message),
                ];
                if *has_page {
                    frame.push(DATA_MARKER.into());
                }
                frame
            }
        }
    }

    pub fn from_frame(frame: &[String]) -> Result<Self> {
        let name = frame
            .first()
            .ok_or_else(|| Error::Protocol("empty response frame".into()))?;
        match name.as_str() {
            "ok" if frame.len() == 1 => Ok(Response::Ok),
            "ok" if frame.len() == 3 => Ok(Response::Session {
                pid: parse_arg(frame, 1)?,
                session_id: parse_arg(frame, 2)?,
            }),
            "busy" => Ok(Response::Busy),
            "error" => {
                if frame.len() < 3 {
                    return Err(Error::Protocol("truncated error response".into()));
                }
                let has_page = frame.last().map(String::as_str) == Some(DATA_MARKER);
                let message_end = frame.len() - usize::from(has_page);
                Ok(Response::Error {
                    kind: frame[1].clone(),
                    message: frame[2..message_end].join(" "),
                    has_page,
                })
            }
            n => match n.parse::<i64>() {
                Ok(value) if frame.len() == 1 => Ok(Response::Value(value)),
                _ => Err(Error::Protocol(format!("unknown response: {:?}", n))),
            },
        }
    }
}

fn parse_arg<T: FromStr>(frame: &[String], index: usize) -> Result<T> {
    frame
        .get(index)
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "{}: missing or malformed argument {}",
                frame[0], index
            ))
        })
}

/// Error messages travel as one frame line; flatten any newlines.
fn sanitize_message(message: &str) -> String {
    let flat = message.replace('\n', " ");
    if flat.trim().is_empty() {
        "unknown error".to_string()
    } else {
        flat
    }
}
