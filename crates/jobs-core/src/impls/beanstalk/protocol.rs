//! beanstalkd wire protocol: commands, responses and a tokio-util codec.
//!
//! Text protocol, `\r\n` terminated. Commands that carry a body (`put`) and
//! responses that carry one (`RESERVED`, `OK`) announce its length in the
//! header line; the body follows with its own `\r\n`.

use std::collections::HashMap;
use std::fmt::Write as _;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Longest header line accepted from the server.
const MAX_LINE: usize = 1024;

/// Body limit floor, so `stats-*` answers fit even with a tiny job size.
const MIN_BODY: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    BadResponse(String),

    /// OUT_OF_MEMORY, INTERNAL_ERROR, BAD_FORMAT, UNKNOWN_COMMAND
    #[error("server error: {0}")]
    Server(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put {
        priority: u32,
        delay: u32,
        ttr: u32,
        body: Bytes,
    },
    Use(String),
    Watch(String),
    Ignore(String),
    ReserveWithTimeout(u32),
    Delete(u64),
    Release {
        id: u64,
        priority: u32,
        delay: u32,
    },
    Bury {
        id: u64,
        priority: u32,
    },
    Touch(u64),
    StatsJob(u64),
    StatsTube(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Inserted(u64),
    /// `BURIED` (after release / bury) or `BURIED <id>` (put under memory pressure).
    Buried(Option<u64>),
    Using(String),
    Watching(u32),
    Reserved { id: u64, body: Bytes },
    TimedOut,
    DeadlineSoon,
    Deleted,
    Released,
    Touched,
    NotFound,
    NotIgnored,
    Ok(Bytes),
    ExpectedCrlf,
    JobTooBig,
    Draining,
}

/// Tube names: 1-200 bytes of letters, digits and `-+/;.$_()`, not starting with `-`.
pub fn validate_tube(name: &str) -> Result<(), ProtocolError> {
    let valid = !name.is_empty()
        && name.len() <= 200
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidCommand(format!("invalid tube name `{name}`")))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BeanstalkCodec {
    max_body: usize,
}

impl BeanstalkCodec {
    /// Rejects response bodies announced larger than `max_body`.
    pub fn new(max_body: usize) -> Self {
        Self {
            max_body: max_body.max(MIN_BODY),
        }
    }
}

impl Default for BeanstalkCodec {
    fn default() -> Self {
        Self::new(65_535)
    }
}

impl Encoder<Command> for BeanstalkCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut line = String::new();
        // write! into a String cannot fail
        let _ = match &command {
            Command::Put {
                priority,
                delay,
                ttr,
                body,
            } => write!(line, "put {priority} {delay} {ttr} {}", body.len()),
            Command::Use(tube) => {
                validate_tube(tube)?;
                write!(line, "use {tube}")
            }
            Command::Watch(tube) => {
                validate_tube(tube)?;
                write!(line, "watch {tube}")
            }
            Command::Ignore(tube) => {
                validate_tube(tube)?;
                write!(line, "ignore {tube}")
            }
            Command::ReserveWithTimeout(secs) => write!(line, "reserve-with-timeout {secs}"),
            Command::Delete(id) => write!(line, "delete {id}"),
            Command::Release {
                id,
                priority,
                delay,
            } => write!(line, "release {id} {priority} {delay}"),
            Command::Bury { id, priority } => write!(line, "bury {id} {priority}"),
            Command::Touch(id) => write!(line, "touch {id}"),
            Command::StatsJob(id) => write!(line, "stats-job {id}"),
            Command::StatsTube(tube) => {
                validate_tube(tube)?;
                write!(line, "stats-tube {tube}")
            }
        };

        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        if let Command::Put { body, .. } = command {
            dst.reserve(body.len() + 2);
            dst.put_slice(&body);
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

impl Decoder for BeanstalkCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(eol) = src.windows(2).position(|w| w == b"\r\n") else {
            if src.len() > MAX_LINE {
                return Err(ProtocolError::BadResponse("response line too long".into()));
            }
            return Ok(None);
        };

        let line = std::str::from_utf8(&src[..eol])
            .map_err(|_| ProtocolError::BadResponse("response line is not utf-8".into()))?
            .to_string();
        let mut parts = line.split(' ');
        let word = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        // Responses with a body: wait until all of it has arrived.
        let with_body = match (word, args.as_slice()) {
            ("RESERVED", [id, len]) => Some((Some(parse_num(id)?), parse_num::<usize>(len)?)),
            ("OK", [len]) => Some((None, parse_num::<usize>(len)?)),
            _ => None,
        };
        if let Some((id, len)) = with_body {
            if len > self.max_body {
                return Err(ProtocolError::BadResponse(format!(
                    "body of {len} bytes exceeds the {} byte limit",
                    self.max_body
                )));
            }
            let header = eol + 2;
            let frame = header + len + 2;
            if src.len() < frame {
                src.reserve(frame - src.len());
                return Ok(None);
            }
            if &src[header + len..frame] != b"\r\n" {
                return Err(ProtocolError::BadResponse("body not terminated by CRLF".into()));
            }
            src.advance(header);
            let body = src.split_to(len).freeze();
            src.advance(2);
            return Ok(Some(match id {
                Some(id) => Response::Reserved { id, body },
                None => Response::Ok(body),
            }));
        }

        src.advance(eol + 2);
        let response = match (word, args.as_slice()) {
            ("INSERTED", [id]) => Response::Inserted(parse_num(id)?),
            ("BURIED", []) => Response::Buried(None),
            ("BURIED", [id]) => Response::Buried(Some(parse_num(id)?)),
            ("USING", [tube]) => Response::Using(tube.to_string()),
            ("WATCHING", [count]) => Response::Watching(parse_num(count)?),
            ("TIMED_OUT", []) => Response::TimedOut,
            ("DEADLINE_SOON", []) => Response::DeadlineSoon,
            ("DELETED", []) => Response::Deleted,
            ("RELEASED", []) => Response::Released,
            ("TOUCHED", []) => Response::Touched,
            ("NOT_FOUND", []) => Response::NotFound,
            ("NOT_IGNORED", []) => Response::NotIgnored,
            ("EXPECTED_CRLF", []) => Response::ExpectedCrlf,
            ("JOB_TOO_BIG", []) => Response::JobTooBig,
            ("DRAINING", []) => Response::Draining,
            ("OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND", []) => {
                return Err(ProtocolError::Server(word.to_string()));
            }
            _ => return Err(ProtocolError::BadResponse(line)),
        };
        Ok(Some(response))
    }
}

fn parse_num<T: std::str::FromStr>(s: &str) -> Result<T, ProtocolError> {
    s.parse()
        .map_err(|_| ProtocolError::BadResponse(format!("expected a number, got `{s}`")))
}

/// Parse the flat YAML map returned by `stats-job` / `stats-tube`.
pub fn parse_stats(body: &[u8]) -> HashMap<String, String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}

pub fn stat_u64(stats: &HashMap<String, String>, key: &str) -> u64 {
    stats.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}
