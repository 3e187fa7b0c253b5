//! Terminal command parsing

use crate::game::Symbol;
use shared::message::split_list;
use std::path::PathBuf;
use thiserror::Error;

pub const HELP: &str = "\
Commands:
  post <text>                       post to your followers
  dm <user> <text>                  direct message
  follow <user> | unfollow <user>
  like <user> <post_timestamp>
  file <user> <path> [description]  offer and send a file
  accept <file_id> | ignore <file_id>
  game <user> [X|O]                 invite to tic-tac-toe
  move <game_id> <0-8>
  group create <name> <a,b,...>
  group add|remove <group_id> <a,b,...>
  group send <group_id> <text>
  revoke <token>
  peers | transfers | help | exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Post(String),
    Dm { to: String, content: String },
    Follow(String),
    Unfollow(String),
    Like { author: String, post_timestamp: String },
    SendFile {
        to: String,
        path: PathBuf,
        description: String,
    },
    Accept(String),
    Ignore(String),
    Invite { to: String, symbol: Symbol },
    Move { game_id: String, position: usize },
    GroupCreate { name: String, members: Vec<String> },
    GroupAdd { group_id: String, members: Vec<String> },
    GroupRemove { group_id: String, members: Vec<String> },
    GroupSend { group_id: String, content: String },
    Revoke(String),
    Peers,
    Transfers,
    Help,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid {what}: {value:?}")]
    Invalid { what: &'static str, value: String },
}

/// Splits off the first whitespace-delimited word
fn next_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest.trim_start())),
        None => Some((s, "")),
    }
}

fn word<'a>(rest: &mut &'a str, usage: &'static str) -> Result<&'a str, InputError> {
    let (word, tail) = next_word(rest).ok_or(InputError::Usage(usage))?;
    *rest = tail;
    Ok(word)
}

fn text(rest: &str, usage: &'static str) -> Result<String, InputError> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(InputError::Usage(usage));
    }
    Ok(rest.to_string())
}

fn members(rest: &str, usage: &'static str) -> Result<Vec<String>, InputError> {
    let members = split_list(rest);
    if members.is_empty() {
        return Err(InputError::Usage(usage));
    }
    Ok(members)
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, InputError> {
        let (name, mut rest) = next_word(line).ok_or(InputError::Empty)?;
        let command = match name.to_ascii_lowercase().as_str() {
            "post" => Command::Post(text(rest, "post <text>")?),
            "dm" => {
                const USAGE: &str = "dm <user> <text>";
                let to = word(&mut rest, USAGE)?.to_string();
                Command::Dm {
                    to,
                    content: text(rest, USAGE)?,
                }
            }
            "follow" => Command::Follow(word(&mut rest, "follow <user>")?.to_string()),
            "unfollow" => Command::Unfollow(word(&mut rest, "unfollow <user>")?.to_string()),
            "like" => {
                const USAGE: &str = "like <user> <post_timestamp>";
                let author = word(&mut rest, USAGE)?.to_string();
                let post_timestamp = word(&mut rest, USAGE)?;
                if post_timestamp.parse::<u64>().is_err() {
                    return Err(InputError::Invalid {
                        what: "timestamp",
                        value: post_timestamp.to_string(),
                    });
                }
                Command::Like {
                    author,
                    post_timestamp: post_timestamp.to_string(),
                }
            }
            "file" => {
                const USAGE: &str = "file <user> <path> [description]";
                let to = word(&mut rest, USAGE)?.to_string();
                let path = PathBuf::from(word(&mut rest, USAGE)?);
                Command::SendFile {
                    to,
                    path,
                    description: rest.trim().to_string(),
                }
            }
            "accept" => Command::Accept(word(&mut rest, "accept <file_id>")?.to_string()),
            "ignore" => Command::Ignore(word(&mut rest, "ignore <file_id>")?.to_string()),
            "game" => {
                let to = word(&mut rest, "game <user> [X|O]")?.to_string();
                let symbol = match next_word(rest) {
                    Some((symbol, _)) => symbol.parse().map_err(|_| InputError::Invalid {
                        what: "symbol",
                        value: symbol.to_string(),
                    })?,
                    None => Symbol::X,
                };
                Command::Invite { to, symbol }
            }
            "move" => {
                const USAGE: &str = "move <game_id> <0-8>";
                let game_id = word(&mut rest, USAGE)?.to_string();
                let position = word(&mut rest, USAGE)?;
                let position = position
                    .parse::<usize>()
                    .ok()
                    .filter(|p| *p < 9)
                    .ok_or_else(|| InputError::Invalid {
                        what: "position",
                        value: position.to_string(),
                    })?;
                Command::Move { game_id, position }
            }
            "group" => Self::parse_group(rest)?,
            "revoke" => Command::Revoke(word(&mut rest, "revoke <token>")?.to_string()),
            "peers" => Command::Peers,
            "transfers" => Command::Transfers,
            "help" | "?" => Command::Help,
            "exit" | "quit" => Command::Exit,
            other => return Err(InputError::Unknown(other.to_string())),
        };
        Ok(command)
    }

    fn parse_group(mut rest: &str) -> Result<Self, InputError> {
        const USAGE: &str = "group create|add|remove|send ...";
        let action = word(&mut rest, USAGE)?.to_ascii_lowercase();
        match action.as_str() {
            "create" => {
                const USAGE: &str = "group create <name> <a,b,...>";
                let name = word(&mut rest, USAGE)?.to_string();
                Ok(Command::GroupCreate {
                    name,
                    members: members(rest, USAGE)?,
                })
            }
            "add" | "remove" => {
                const USAGE: &str = "group add|remove <group_id> <a,b,...>";
                let group_id = word(&mut rest, USAGE)?.to_string();
                let members = members(rest, USAGE)?;
                Ok(if action == "add" {
                    Command::GroupAdd { group_id, members }
                } else {
                    Command::GroupRemove { group_id, members }
                })
            }
            "send" => {
                const USAGE: &str = "group send <group_id> <text>";
                let group_id = word(&mut rest, USAGE)?.to_string();
                Ok(Command::GroupSend {
                    group_id,
                    content: text(rest, USAGE)?,
                })
            }
            _ => Err(InputError::Usage(USAGE)),
        }
    }
}
