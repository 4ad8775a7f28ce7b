//! Line-oriented command loop on stdin, and the handlers that print social traffic.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use lsnp_core::{field, Destination, Envelope, LsnpCore, MessageKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::net::Daemon;

/// One received direct message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmEntry {
    pub from: String,
    pub content: String,
}

/// DM history written by the DM handler, read by the `history` command.
pub type DmHistory = Arc<Mutex<Vec<DmEntry>>>;

const HELP: &str = "\
commands:
  peers                         list known peers
  post <text>                   broadcast a post
  dm <user> <text>              direct message
  follow <user> | unfollow <user>
  send <user> <path> [desc]     offer a file
  accept <fileid> | reject <fileid>
  history                       received direct messages
  tokens                        issued / granted / revoked tokens
  revoke <token>                revoke and broadcast
  ping                          re-announce and ask peers for profiles
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Peers,
    Post(String),
    Dm { user: String, text: String },
    Follow(String),
    Unfollow(String),
    Send {
        user: String,
        path: PathBuf,
        description: String,
    },
    Accept(String),
    Reject(String),
    History,
    Tokens,
    Revoke(String),
    Ping,
    Quit,
}

pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let arg = |usage: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("usage: {usage}"))
        } else {
            Ok(rest.to_string())
        }
    };
    let user_and_text = |usage: &str| -> Result<(String, String), String> {
        match rest.split_once(char::is_whitespace) {
            Some((user, text)) if !text.trim().is_empty() => {
                Ok((user.to_string(), text.trim().to_string()))
            }
            _ => Err(format!("usage: {usage}")),
        }
    };
    match word.to_ascii_lowercase().as_str() {
        "help" | "?" => Ok(Command::Help),
        "peers" => Ok(Command::Peers),
        "post" => arg("post <text>").map(Command::Post),
        "dm" => user_and_text("dm <user> <text>").map(|(user, text)| Command::Dm { user, text }),
        "follow" => arg("follow <user>").map(Command::Follow),
        "unfollow" => arg("unfollow <user>").map(Command::Unfollow),
        "send" => {
            let mut parts = rest.splitn(3, char::is_whitespace);
            match (parts.next(), parts.next()) {
                (Some(user), Some(path)) if !user.is_empty() && !path.is_empty() => {
                    Ok(Command::Send {
                        user: user.to_string(),
                        path: PathBuf::from(path),
                        description: parts.next().unwrap_or_default().trim().to_string(),
                    })
                }
                _ => Err("usage: send <user> <path> [description]".to_string()),
            }
        }
        "accept" => arg("accept <fileid>").map(Command::Accept),
        "reject" => arg("reject <fileid>").map(Command::Reject),
        "history" => Ok(Command::History),
        "tokens" => Ok(Command::Tokens),
        "revoke" => arg("revoke <token>").map(Command::Revoke),
        "ping" => Ok(Command::Ping),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command {other:?}, try help")),
    }
}

/// Read commands until `quit`. On stdin EOF the daemon keeps running headless.
pub async fn command_loop(daemon: Daemon, history: DmHistory) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            info!("stdin closed, running without command loop");
            std::future::pending::<()>().await;
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse(&line) {
            Ok(c) => c,
            Err(msg) => {
                println!("{msg}");
                continue;
            }
        };
        if command == Command::Quit {
            return Ok(());
        }
        if let Err(e) = run(&daemon, &history, command).await {
            println!("error: {e:#}");
        }
    }
}

async fn run(daemon: &Daemon, history: &DmHistory, command: Command) -> anyhow::Result<()> {
    let actions = {
        let mut core = daemon.core.lock().await;
        match command {
            Command::Help => {
                println!("{HELP}");
                Vec::new()
            }
            Command::Peers => {
                if core.peers().is_empty() {
                    println!("no peers yet");
                }
                for p in core.peers().peers() {
                    println!("{:<28} {:<20} {:<10} {}", p.user_id.as_str(), p.display_name, p.status, p.addr);
                }
                Vec::new()
            }
            Command::Post(text) => {
                let ttl = core.config().token_ttl_secs;
                let post = core
                    .new_envelope(MessageKind::Post)
                    .with(field::CONTENT, text)
                    .with(field::TTL, ttl);
                core.send(post, Destination::Broadcast, false)?
            }
            Command::Dm { user, text } => {
                let dm = core.new_envelope(MessageKind::Dm).with(field::CONTENT, text);
                core.send_to(dm, &user, true)?
            }
            Command::Follow(user) => {
                let follow = core.new_envelope(MessageKind::Follow);
                core.send_to(follow, &user, true)?
            }
            Command::Unfollow(user) => {
                let unfollow = core.new_envelope(MessageKind::Unfollow);
                core.send_to(unfollow, &user, true)?
            }
            Command::Send {
                user,
                path,
                description,
            } => {
                let (file_id, actions) = core.offer_file(&path, &user, &description)?;
                println!("offered {} to {user} as {file_id}", path.display());
                actions
            }
            Command::Accept(file_id) => core.accept_file(&file_id)?,
            Command::Reject(file_id) => core.reject_file(&file_id)?,
            Command::History => {
                if let Ok(entries) = history.lock() {
                    for e in entries.iter() {
                        println!("{}: {}", e.from, e.content);
                    }
                }
                Vec::new()
            }
            Command::Tokens => {
                let tokens = core.tokens();
                for t in tokens.issued() {
                    println!("issued   {t}");
                }
                for (t, _) in tokens.granted() {
                    println!("granted  {t}");
                }
                println!("{} revoked", tokens.revoked().len());
                Vec::new()
            }
            Command::Revoke(token) => core.revoke_token(&token),
            Command::Ping => core.announce(),
            Command::Quit => Vec::new(),
        }
    };
    daemon.execute(actions).await;
    Ok(())
}

/// Print POST/LIKE/DM/FOLLOW/UNFOLLOW/GROUP/TICTACTOE traffic; DMs also go to `history`.
/// The core has already checked each message's token before these run.
pub fn register_handlers(core: &mut LsnpCore, history: &DmHistory) {
    let history = history.clone();
    core.register_handler("DM", move |env, _| {
        let entry = DmEntry {
            from: sender(env),
            content: env.get(field::CONTENT).unwrap_or_default().to_string(),
        };
        println!("[dm] {}: {}", entry.from, entry.content);
        if let Ok(mut h) = history.lock() {
            h.push(entry);
        }
    });
    core.register_handler("POST", |env, _| {
        println!("[post] {}: {}", sender(env), env.get(field::CONTENT).unwrap_or_default());
    });
    core.register_handler("LIKE", |env, _| {
        println!("[like] {} {}", sender(env), env.get("ACTION").unwrap_or("LIKE"));
    });
    core.register_handler("FOLLOW", |env, _| println!("[follow] {} follows you", sender(env)));
    core.register_handler("UNFOLLOW", |env, _| {
        println!("[follow] {} unfollowed you", sender(env))
    });
    for kind in ["GROUP_CREATE", "GROUP_UPDATE", "GROUP_MESSAGE"] {
        core.register_handler(kind, print_generic);
    }
    for kind in ["TICTACTOE_INVITE", "TICTACTOE_MOVE", "TICTACTOE_RESULT"] {
        core.register_handler(kind, print_generic);
    }
}

fn sender(env: &Envelope) -> String {
    env.sender().unwrap_or("?").to_string()
}

fn print_generic(env: &Envelope, from: SocketAddr) {
    let fields: Vec<String> = env
        .fields()
        .filter(|(k, _)| *k != field::TOKEN && *k != field::MESSAGE_ID)
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    println!("[{}] from {from}: {}", env.kind(), fields.join(" "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsnp_core::{encode_envelope, CoreConfig, LocalProfile, UserId};

    #[test]
    fn parses_commands() {
        assert_eq!(parse("peers"), Ok(Command::Peers));
        assert_eq!(parse("  POST hello world "), Ok(Command::Post("hello world".into())));
        assert_eq!(
            parse("dm bob see you at 5"),
            Ok(Command::Dm {
                user: "bob".into(),
                text: "see you at 5".into()
            })
        );
        assert_eq!(
            parse("send bob ./notes.txt meeting notes"),
            Ok(Command::Send {
                user: "bob".into(),
                path: PathBuf::from("./notes.txt"),
                description: "meeting notes".into()
            })
        );
        assert_eq!(
            parse("send bob a.bin"),
            Ok(Command::Send {
                user: "bob".into(),
                path: PathBuf::from("a.bin"),
                description: String::new()
            })
        );
        assert_eq!(parse("accept f1"), Ok(Command::Accept("f1".into())));
        assert_eq!(parse("quit"), Ok(Command::Quit));
    }

    #[test]
    fn rejects_incomplete_commands() {
        assert!(parse("dm bob").is_err());
        assert!(parse("post").is_err());
        assert!(parse("send bob").is_err());
        assert!(parse("revoke").is_err());
        assert!(parse("dance").is_err());
    }

    #[test]
    fn dm_history_records_each_message_once() {
        let profile = LocalProfile::new(UserId::new("alice", "10.0.0.1"), "Alice");
        let mut core = LsnpCore::new(profile, CoreConfig::default());
        let history = DmHistory::default();
        register_handlers(&mut core, &history);

        let token = format!("bob@10.0.0.2|{}|chat", lsnp_core::core::system_unix_time() + 600);
        let dm = Envelope::new(MessageKind::Dm)
            .with(field::FROM, "bob@10.0.0.2")
            .with(field::TO, "alice@10.0.0.1")
            .with(field::CONTENT, "lunch?")
            .with(field::MESSAGE_ID, "0123456789abcdef")
            .with(field::TOKEN, token);
        let bytes = encode_envelope(&dm).unwrap();
        let from: SocketAddr = "10.0.0.2:50999".parse().unwrap();
        core.on_datagram(&bytes, from);
        core.on_datagram(&bytes, from);

        let entries = history.lock().unwrap();
        assert_eq!(
            *entries,
            vec![DmEntry {
                from: "bob@10.0.0.2".into(),
                content: "lunch?".into()
            }]
        );
    }
}
