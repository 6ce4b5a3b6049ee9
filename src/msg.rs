// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action the cluster master sends once every worker is listening
pub const READY_ACTION: &str = "egg-ready";

/// A structured message received from the child over the notification channel
///
/// Anything the child sends that is not an object with an `action` still parses, it simply
/// is not a ready notice.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Message {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Message {
    pub fn ready(address: &str) -> Self {
        Self {
            action: Some(READY_ACTION.to_string()),
            data: Some(serde_json::json!({ "address": address })),
        }
    }

    /// Parses one line of the channel, `None` for anything that isn't a JSON object
    pub fn parse(line: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => serde_json::from_value(value).ok(),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(%err, line, "ignoring malformed notification");
                None
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.action.as_deref() == Some(READY_ACTION)
    }

    /// The `data.address` the master reports, if any
    pub fn address(&self) -> Option<&str> {
        self.data.as_ref()?.get("address")?.as_str()
    }
}

/// Source of messages from the spawned child
#[async_trait]
pub trait Notifications: Send {
    /// Next message, `None` once the sender has gone away
    ///
    /// Implementations must be cancel safe: the readiness loop races this against its tick.
    async fn next_message(&mut self) -> Option<Message>;
}

#[cfg(unix)]
#[async_trait]
impl Notifications for crate::control::AsyncCtlEnd<crate::control::Read> {
    async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.recv_line().await {
                Ok(Some(line)) => {
                    if let Some(msg) = Message::parse(&line) {
                        return Some(msg);
                    }
                }
                Ok(None) => return None,
                Err(err) => {
                    tracing::warn!(%err, "notification channel failed");
                    return None;
                }
            }
        }
    }
}

#[async_trait]
impl Notifications for tokio::sync::mpsc::Receiver<Message> {
    async fn next_message(&mut self) -> Option<Message> {
        self.recv().await
    }
}
