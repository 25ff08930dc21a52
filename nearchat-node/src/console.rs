//! Line-oriented console on stdin.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use crate::node::Input;

pub const HELP: &str = "\
/msg <peer> <text>      direct encrypted message
/send <peer> <path>     send a file
/cancel <transfer-id>   cancel an outgoing transfer
/read <peer> <msg-id>   send a read receipt
/react <peer> <msg-id> <emoji>
/avatar <peer>          fetch a peer's avatar
/all <text>             broadcast to the room
/block <peer>           block and disconnect
/unblock <peer>
/name <name>            change display name
/peers                  list known peers
/quit";

/// `<peer>` is a full peer id or an unambiguous prefix of one.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Msg { peer: String, text: String },
    Send { peer: String, path: PathBuf },
    Cancel(Uuid),
    Read { peer: String, id: Uuid },
    React { peer: String, id: Uuid, emoji: String },
    Avatar(String),
    All(String),
    Block(String),
    Unblock(String),
    Name(String),
    Peers,
    Help,
    Quit,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command {0}, try /help")]
    Unknown(String),
    #[error("bad id, expected a uuid")]
    BadId,
}

fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.split_once(char::is_whitespace) {
        Some((head, rest)) => Some((head, rest.trim())),
        None => Some((s, "")),
    }
}

fn parse_id(s: &str) -> Result<Uuid, ParseError> {
    Uuid::parse_str(s.trim()).map_err(|_| ParseError::BadId)
}

/// Parse one console line. Lines without a leading slash broadcast to the room.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::All(line.to_owned())));
    };
    let (cmd, args) = split_word(rest).unwrap_or(("", ""));
    let command = match cmd {
        "msg" => match split_word(args) {
            Some((peer, text)) if !text.is_empty() => Command::Msg {
                peer: peer.to_owned(),
                text: text.to_owned(),
            },
            _ => return Err(ParseError::Usage("/msg <peer> <text>")),
        },
        "send" => match split_word(args) {
            Some((peer, path)) if !path.is_empty() => Command::Send {
                peer: peer.to_owned(),
                path: PathBuf::from(path),
            },
            _ => return Err(ParseError::Usage("/send <peer> <path>")),
        },
        "cancel" => Command::Cancel(parse_id(args)?),
        "read" => match split_word(args) {
            Some((peer, id)) if !id.is_empty() => Command::Read {
                peer: peer.to_owned(),
                id: parse_id(id)?,
            },
            _ => return Err(ParseError::Usage("/read <peer> <msg-id>")),
        },
        "react" => {
            let usage = ParseError::Usage("/react <peer> <msg-id> <emoji>");
            let Some((peer, rest)) = split_word(args) else {
                return Err(usage);
            };
            match split_word(rest) {
                Some((id, emoji)) if !emoji.is_empty() => Command::React {
                    peer: peer.to_owned(),
                    id: parse_id(id)?,
                    emoji: emoji.to_owned(),
                },
                _ => return Err(usage),
            }
        }
        "avatar" if !args.is_empty() => Command::Avatar(args.to_owned()),
        "avatar" => return Err(ParseError::Usage("/avatar <peer>")),
        "all" if !args.is_empty() => Command::All(args.to_owned()),
        "all" => return Err(ParseError::Usage("/all <text>")),
        "block" if !args.is_empty() => Command::Block(args.to_owned()),
        "block" => return Err(ParseError::Usage("/block <peer>")),
        "unblock" if !args.is_empty() => Command::Unblock(args.to_owned()),
        "unblock" => return Err(ParseError::Usage("/unblock <peer>")),
        "name" if !args.is_empty() => Command::Name(args.to_owned()),
        "name" => return Err(ParseError::Usage("/name <name>")),
        "peers" => Command::Peers,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_owned())),
    };
    Ok(Some(command))
}

/// Forward parsed stdin lines to the event loop until stdin closes.
pub async fn run(inputs: UnboundedSender<Input>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse(&line) {
                Ok(Some(cmd)) => {
                    if inputs.send(Input::Command(cmd)).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => println!("{e}"),
            },
            Ok(None) => {
                debug!("stdin closed");
                return;
            }
            Err(e) => {
                debug!(error = %e, "stdin read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_broadcasts() {
        assert_eq!(parse("hi all").unwrap(), Some(Command::All("hi all".into())));
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn msg_keeps_spaces_in_text() {
        assert_eq!(
            parse("/msg 3fa8 see you  at noon").unwrap(),
            Some(Command::Msg {
                peer: "3fa8".into(),
                text: "see you  at noon".into()
            })
        );
        assert_eq!(parse("/msg 3fa8"), Err(ParseError::Usage("/msg <peer> <text>")));
    }

    #[test]
    fn send_and_cancel() {
        assert_eq!(
            parse("/send ab12 /tmp/cat.png").unwrap(),
            Some(Command::Send {
                peer: "ab12".into(),
                path: PathBuf::from("/tmp/cat.png")
            })
        );
        let id = Uuid::new_v4();
        assert_eq!(parse(&format!("/cancel {id}")).unwrap(), Some(Command::Cancel(id)));
        assert_eq!(parse("/cancel nope"), Err(ParseError::BadId));
    }

    #[test]
    fn receipts_reactions_and_avatar() {
        let id = Uuid::new_v4();
        assert_eq!(
            parse(&format!("/read ab12 {id}")).unwrap(),
            Some(Command::Read {
                peer: "ab12".into(),
                id
            })
        );
        assert_eq!(
            parse(&format!("/react ab12 {id} 🎉")).unwrap(),
            Some(Command::React {
                peer: "ab12".into(),
                id,
                emoji: "🎉".into()
            })
        );
        assert_eq!(parse("/avatar ab12").unwrap(), Some(Command::Avatar("ab12".into())));
        assert_eq!(parse("/read ab12"), Err(ParseError::Usage("/read <peer> <msg-id>")));
        assert_eq!(parse("/read ab12 xyz"), Err(ParseError::BadId));
        assert_eq!(
            parse(&format!("/react ab12 {id}")),
            Err(ParseError::Usage("/react <peer> <msg-id> <emoji>"))
        );
        assert_eq!(parse("/avatar"), Err(ParseError::Usage("/avatar <peer>")));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(parse("/dance"), Err(ParseError::Unknown("dance".into())));
        assert_eq!(parse("/quit").unwrap(), Some(Command::Quit));
    }
}
