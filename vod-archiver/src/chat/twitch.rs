//! Twitch chat over IRC-on-WebSocket.
//!
//! Joins anonymously (`justinfan` login), requests message tags so each
//! PRIVMSG carries its id, sender id and server timestamp, and answers PING.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

use super::source::{ChatError, ChatMessage, ChatSource, ChatStream};
use crate::database::time::now_ms;
use crate::utils::http_client::install_rustls_provider;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A parsed IRC line we act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcEvent {
    Chat(ChatMessage),
    Ping(String),
    Reconnect,
    Other,
}

/// Undo IRCv3 tag value escaping.
fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some(':') => out.push(';'),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Parse one IRC line.
///
/// ```text
/// @id=abc;user-id=1;display-name=Foo;tmi-sent-ts=1700000000000 :foo!foo@foo.tmi.twitch.tv PRIVMSG #chan :hello
/// ```
pub fn parse_irc_line(line: &str) -> IrcEvent {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut rest = line;

    let mut tags = HashMap::new();
    if let Some(tagged) = rest.strip_prefix('@') {
        let Some((raw_tags, tail)) = tagged.split_once(' ') else {
            return IrcEvent::Other;
        };
        for tag in raw_tags.split(';') {
            let (key, value) = tag.split_once('=').unwrap_or((tag, ""));
            tags.insert(key, unescape_tag(value));
        }
        rest = tail;
    }

    let mut prefix = None;
    if let Some(prefixed) = rest.strip_prefix(':') {
        let Some((p, tail)) = prefixed.split_once(' ') else {
            return IrcEvent::Other;
        };
        prefix = Some(p);
        rest = tail;
    }

    let (command, params) = rest.split_once(' ').unwrap_or((rest, ""));
    match command {
        "PING" => IrcEvent::Ping(params.trim_start_matches(':').to_string()),
        "RECONNECT" => IrcEvent::Reconnect,
        "PRIVMSG" => {
            let Some((_target, content)) = params.split_once(" :") else {
                return IrcEvent::Other;
            };
            let login = prefix
                .and_then(|p| p.split('!').next())
                .unwrap_or_default()
                .to_string();
            let Some(message_id) = tags.remove("id").filter(|id| !id.is_empty()) else {
                // Without tags there is no stable id to dedupe on
                return IrcEvent::Other;
            };
            let username = tags
                .remove("display-name")
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| login.clone());
            let user_id = tags
                .remove("user-id")
                .filter(|u| !u.is_empty())
                .unwrap_or(login);
            let sent_at = tags
                .get("tmi-sent-ts")
                .and_then(|ts| ts.parse().ok())
                .unwrap_or_else(now_ms);

            IrcEvent::Chat(ChatMessage {
                message_id,
                user_id,
                username,
                content: content.to_string(),
                sent_at,
            })
        }
        _ => IrcEvent::Other,
    }
}

/// Twitch IRC chat source.
#[derive(Debug, Clone)]
pub struct TwitchChatSource {
    url: String,
}

impl TwitchChatSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ChatSource for TwitchChatSource {
    async fn connect(&self, channel: &str) -> Result<Box<dyn ChatStream>, ChatError> {
        install_rustls_provider();
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChatError::Connect(e.to_string()))?;
        let (mut sink, stream) = ws.split();

        let nick = format!("justinfan{}", 10_000 + rand::random::<u32>() % 90_000);
        let login = [
            "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
            "PASS SCHMOOPIIE".to_string(),
            format!("NICK {nick}"),
            format!("JOIN #{}", channel.to_lowercase()),
        ];
        for line in login {
            sink.send(Message::text(line))
                .await
                .map_err(|e| ChatError::Connect(e.to_string()))?;
        }
        debug!(channel, nick, "Joined Twitch chat");

        Ok(Box::new(TwitchChatStream {
            sink,
            stream,
            queue: VecDeque::new(),
            pongs: Vec::new(),
        }))
    }
}

struct TwitchChatStream {
    sink: SplitSink<Ws, Message>,
    stream: SplitStream<Ws>,
    queue: VecDeque<ChatMessage>,
    pongs: Vec<String>,
}

#[async_trait]
impl ChatStream for TwitchChatStream {
    async fn next_message(&mut self) -> Result<Option<ChatMessage>, ChatError> {
        loop {
            for payload in std::mem::take(&mut self.pongs) {
                self.sink
                    .send(Message::text(format!("PONG :{payload}")))
                    .await
                    .map_err(|e| ChatError::Closed(e.to_string()))?;
            }
            if let Some(message) = self.queue.pop_front() {
                return Ok(Some(message));
            }

            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ChatError::Closed(e.to_string())),
                None => return Ok(None),
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    debug!(?frame, "Chat server closed the connection");
                    return Ok(None);
                }
                _ => continue,
            };

            // One frame may carry several lines
            for line in text.as_str().split("\r\n").filter(|l| !l.is_empty()) {
                trace!(line, "IRC");
                match parse_irc_line(line) {
                    IrcEvent::Chat(message) => self.queue.push_back(message),
                    IrcEvent::Ping(payload) => self.pongs.push(payload),
                    IrcEvent::Reconnect => {
                        return Err(ChatError::Closed("server requested reconnect".to_string()));
                    }
                    IrcEvent::Other => {}
                }
            }
        }
    }
}
