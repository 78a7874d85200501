//! Shadow commands and their topics
//!
//! Every command kind publishes to one topic and is acknowledged on two:
//!
//! ```text
//! $aws/things/{thing}/shadow/{get|update|delete}
//! $aws/things/{thing}/shadow/{get|update|delete}/accepted
//! $aws/things/{thing}/shadow/{get|update|delete}/rejected
//! $aws/things/{thing}/shadow/update/delta
//! ```

use std::fmt;

const TOPIC_PREFIX: &str = "$aws/things";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowCommand {
    Get,
    Update,
    Delete,
}

impl ShadowCommand {
    pub const ALL: [ShadowCommand; 3] = [
        ShadowCommand::Get,
        ShadowCommand::Update,
        ShadowCommand::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShadowCommand::Get => "get",
            ShadowCommand::Update => "update",
            ShadowCommand::Delete => "delete",
        }
    }
}

impl fmt::Display for ShadowCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandAck {
    Accepted,
    Rejected,
}

impl CommandAck {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAck::Accepted => "accepted",
            CommandAck::Rejected => "rejected",
        }
    }
}

/// Topic names for one thing's shadow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowTopics {
    base: String,
}

impl ShadowTopics {
    pub fn new(thing_name: &str) -> Self {
        Self {
            base: format!("{}/{}/shadow", TOPIC_PREFIX, thing_name),
        }
    }

    /// Topic a command is published to
    pub fn command(&self, command: ShadowCommand) -> String {
        format!("{}/{}", self.base, command.as_str())
    }

    /// Topic a command is acknowledged on
    pub fn ack(&self, command: ShadowCommand, ack: CommandAck) -> String {
        format!("{}/{}/{}", self.base, command.as_str(), ack.as_str())
    }

    pub fn delta(&self) -> String {
        format!("{}/update/delta", self.base)
    }

    /// Every topic a device subscribes to: the delta topic, then the
    /// accepted/rejected pair of each command.
    pub fn all_subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.delta()];
        for command in ShadowCommand::ALL {
            topics.push(self.ack(command, CommandAck::Accepted));
            topics.push(self.ack(command, CommandAck::Rejected));
        }
        topics
    }

    pub fn is_delta(&self, topic: &str) -> bool {
        topic == self.delta()
    }

    /// Identify an acknowledgement topic of this shadow
    pub fn parse_ack(&self, topic: &str) -> Option<(ShadowCommand, CommandAck)> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        let (command, ack) = rest.split_once('/')?;

        let command = ShadowCommand::ALL
            .into_iter()
            .find(|c| c.as_str() == command)?;
        let ack = match ack {
            "accepted" => CommandAck::Accepted,
            "rejected" => CommandAck::Rejected,
            _ => return None,
        };
        Some((command, ack))
    }
}
