// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Command surface used by the fastboot transport. Command framing and the
//! download phase are handled by the transport. This only maps a command
//! string to an engine call and the result to a reply.

use std::{error::Error as _, fmt};

use tracing::{debug, warn};

use crate::{
    device::{Platform, Storage},
    engine::{self, FlashingEngine},
    util,
};

/// Response to a single command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Okay(String),
    Fail(String),
}

impl Reply {
    fn okay(message: impl Into<String>) -> Self {
        Self::Okay(message.into())
    }

    fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }

    pub fn is_okay(&self) -> bool {
        matches!(self, Self::Okay(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Okay(m) | Self::Fail(m) => m,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Okay(m) => write!(f, "OKAY{m}"),
            Self::Fail(m) => write!(f, "FAIL{m}"),
        }
    }
}

/// Join an error and its sources into one line.
fn error_chain(error: &engine::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }

    message
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

pub struct Session<S, P> {
    engine: FlashingEngine<S, P>,
    download: Option<Vec<u8>>,
}

impl<S, P> fmt::Debug for Session<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("engine", &self.engine)
            .field("download", &self.download.as_ref().map(|d| util::NumBytes(d.len())))
            .finish()
    }
}

impl<S: Storage, P: Platform> Session<S, P> {
    pub fn new(engine: FlashingEngine<S, P>) -> Self {
        Self {
            engine,
            download: None,
        }
    }

    pub fn engine(&self) -> &FlashingEngine<S, P> {
        &self.engine
    }

    pub fn into_engine(self) -> FlashingEngine<S, P> {
        self.engine
    }

    /// Store the payload of a completed `download` for the next `flash`.
    pub fn download(&mut self, data: Vec<u8>) {
        debug!("Downloaded {:?}", util::NumBytes(data.len()));
        self.download = Some(data);
    }

    pub fn handle(&mut self, command: &str) -> Reply {
        debug!("Command: {command:?}");

        let result = if let Some(target) = command.strip_prefix("flash:") {
            match &self.download {
                Some(data) => self.engine.flash(target, data).map(|_| String::new()),
                None => return Reply::fail("No image downloaded"),
            }
        } else if let Some(target) = command.strip_prefix("erase:") {
            self.engine.erase(target).map(|_| String::new())
        } else if let Some(suffix) = command.strip_prefix("set_active:") {
            self.engine.set_active(suffix).map(|_| String::new())
        } else if let Some(name) = command.strip_prefix("getvar:") {
            return self.getvar(name);
        } else {
            return Reply::fail("Unknown command");
        };

        match result {
            Ok(m) => Reply::okay(m),
            Err(e) => {
                warn!("Command {command:?} failed: {e}");
                Reply::fail(error_chain(&e))
            }
        }
    }

    fn getvar(&self, name: &str) -> Reply {
        let slots = self.engine.slots();

        let (key, arg) = match name.split_once(':') {
            Some((k, a)) => (k, Some(a)),
            None => (name, None),
        };

        let value = match (key, arg) {
            ("current-slot", None) => match self.engine.current_slot() {
                Some(s) => Ok(s.to_owned()),
                None => return Reply::fail("Slots are not supported"),
            },
            ("slot-suffixes", None) => Ok(slots.suffixes().join(",")),
            ("slot-count", None) => Ok(slots.suffixes().len().to_string()),
            ("slot-successful", Some(s)) => self.engine.slot_info(s).map(|i| i.successful),
            ("slot-unbootable", Some(s)) => self.engine.slot_info(s).map(|i| i.unbootable),
            ("slot-retry-count", Some(s)) => self.engine.slot_info(s).map(|i| i.retry_count),
            ("has-slot", Some(base)) => Ok(yes_no(slots.has_slot(base)).to_owned()),
            ("partition-size", Some(target)) => self
                .engine
                .partition_size(target)
                .map(|size| format!("{size:#x}")),
            _ => return Reply::fail("Unknown variable"),
        };

        match value {
            Ok(v) => Reply::Okay(v),
            Err(e) => Reply::Fail(error_chain(&e)),
        }
    }
}
