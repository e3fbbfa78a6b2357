//! Init handshake: optional `AUTH`, server `INFO` discovery, optional
//! `CLIENT SETNAME`, and a final probe that decides `Open` vs `Closed`.

use std::collections::HashMap;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::message::Command;
use crate::protocol::Reply;
use crate::state::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    #[default]
    Unknown,
    Master,
    Slave,
    Sentinel,
}

#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub version: Option<String>,
    pub server_type: ServerType,
}

pub fn run(engine: &Engine) -> Result<()> {
    if let Some(password) = engine.opts().password.clone() {
        send_expect_ok(engine, Command::new("AUTH").arg(password).must_succeed())?;
    }

    let info_reply = send_raw(engine, Command::new("INFO"))?;
    let info = match &info_reply {
        Reply::Bulk(Some(bytes)) => parse_info(&String::from_utf8_lossy(bytes)),
        _ => ServerInfo::default(),
    };
    engine.set_server_info(info);

    let probe = if let Some(name) = engine.opts().name.clone() {
        send_raw(engine, Command::new("CLIENT").arg("SETNAME").arg(name))
    } else {
        Ok(info_reply)
    };

    finish_probe(engine, probe)
}

fn finish_probe(engine: &Engine, probe: Result<Reply>) -> Result<()> {
    let reply = match probe {
        Ok(reply) => reply,
        Err(err) => {
            engine.force_close_during_init(&err);
            return Err(err);
        }
    };
    if let Reply::Error(text) = &reply {
        let server_err = crate::error::ServerError::parse(text);
        if !server_err.is_err_kind() {
            let err = Error::Server(server_err);
            engine.force_close_during_init(&err);
            return Err(err);
        }
    }
    engine.state().transition(ConnectionState::Opening, ConnectionState::Open);
    Ok(())
}

fn send_expect_ok(engine: &Engine, cmd: Command) -> Result<()> {
    let completion = crate::message::Completion::new();
    let msg = crate::message::Message::new(
        cmd.during_init().expect_reply("OK"),
        crate::message::Sink::Raw(std::sync::Arc::clone(&completion)),
    );
    engine.submit_during_init(msg)?;
    let reply = completion.wait(Some(engine.opts().sync_timeout))?;
    match reply {
        Reply::Pass => Ok(()),
        Reply::Error(text) => Err(Error::Server(crate::error::ServerError::parse(&text))),
        other => Err(Error::Protocol(format!(
            "expected OK during handshake, got {other:?}"
        ))),
    }
}

fn send_raw(engine: &Engine, cmd: Command) -> Result<Reply> {
    let completion = crate::message::Completion::new();
    let msg = crate::message::Message::new(
        cmd.during_init(),
        crate::message::Sink::Raw(std::sync::Arc::clone(&completion)),
    );
    engine.submit_during_init(msg)?;
    completion.wait(Some(engine.opts().sync_timeout))
}

/// Parses `key:value` lines from an `INFO` reply, skipping blanks and
/// `#`-prefixed section headers.
fn parse_info(text: &str) -> ServerInfo {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key, value);
        }
    }
    let version = fields.get("redis_version").and_then(|v| version_prefix(v));
    let server_type = if fields.get("redis_mode") == Some(&"sentinel") {
        ServerType::Sentinel
    } else {
        match fields.get("role") {
            Some(&"master") => ServerType::Master,
            Some(&"slave") => ServerType::Slave,
            _ => ServerType::Unknown,
        }
    };
    ServerInfo { version, server_type }
}

fn version_prefix(value: &str) -> Option<String> {
    let prefix: String = value
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if prefix.is_empty() {
        None
    } else {
        Some(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_master_info() {
        let text = "# Server\r\nredis_version:7.2.4\r\n# Replication\r\nrole:master\r\n";
        let info = parse_info(text);
        assert_eq!(info.version.as_deref(), Some("7.2.4"));
        assert_eq!(info.server_type, ServerType::Master);
    }

    #[test]
    fn parses_sentinel_mode() {
        let text = "redis_mode:sentinel\r\nredis_version:7.0.0\r\n";
        let info = parse_info(text);
        assert_eq!(info.server_type, ServerType::Sentinel);
    }
}
