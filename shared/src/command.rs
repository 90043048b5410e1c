//! Command batches and their delivery semantics.
//!
//! A [`CallBatch`] is an ordered sequence of [`CallItem`]s. Each item carries
//! two flags: `sync` (the remote executes it inline and may return a value)
//! and `block` (the local caller waits until the batch has actually been
//! transmitted). The batch-level `is_sync`/`is_blocking` are true when ANY
//! item requests them, so a caller can mix a fire-and-forget command with a
//! result-bearing one in a single ordered batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One remote-controllable action on a game instance.
///
/// Each variant carries its own typed payload; there is no loosely-typed
/// key-value command map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Hold a key down.
    PressKey { key: String },
    /// Release a previously pressed key.
    ReleaseKey { key: String },
    /// Press and release in one stroke.
    TapKey { key: String },
    /// Move the cursor to window coordinates.
    MoveCursor { x: i32, y: i32 },
    /// Click a mouse button at the current cursor position.
    Click { button: u8 },
    /// Trigger the ability bound to an action-bar slot.
    CastAbility { slot: u8 },
    /// Interrupt the current cast.
    StopCast,
    /// Sample one screen pixel; result-bearing.
    ReadPixel { x: i32, y: i32 },
    /// Report the instance's current status; result-bearing.
    ReadStatus,
    /// Put a line of text into the game chat.
    Say { text: String },
    /// No effect; useful as a transmission probe.
    Noop,
}

/// Per-command results; `None` marks a command that did not execute.
pub type CommandResults = Vec<Option<Value>>;

/// One command plus its delivery flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallItem {
    pub command: Command,
    /// Remote executes inline and may return a value.
    pub sync: bool,
    /// Local caller blocks until the batch is transmitted.
    pub block: bool,
}

impl CallItem {
    /// Fire-and-forget item.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            sync: false,
            block: false,
        }
    }

    /// Result-bearing item; implies nothing about blocking.
    pub fn sync(command: Command) -> Self {
        Self {
            command,
            sync: true,
            block: false,
        }
    }

    /// Blocking round-trip item.
    pub fn blocking(command: Command) -> Self {
        Self {
            command,
            sync: true,
            block: true,
        }
    }
}

/// Ordered batch of commands dispatched (and, for sync items, answered)
/// together. Order within a batch is preserved end-to-end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallBatch {
    pub items: Vec<CallItem>,
}

impl CallBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(item: CallItem) -> Self {
        Self { items: vec![item] }
    }

    pub fn push(&mut self, item: CallItem) {
        self.items.push(item);
    }

    /// True when any item wants a remote-side inline execution.
    pub fn is_sync(&self) -> bool {
        self.items.iter().any(|item| item.sync)
    }

    /// True when any item wants the caller to wait for transmission.
    pub fn is_blocking(&self) -> bool {
        self.items.iter().any(|item| item.block)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// What a caller of `send_remote_call`/`commands_from_*` gets back.
///
/// `connected == false` means nothing in the batch can be assumed to have
/// executed. Partial execution is only possible when `connected == true`,
/// in which case failed positions hold `None`.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub connected: bool,
    pub results: Option<CommandResults>,
}

impl CallOutcome {
    /// Batch never reached the remote.
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            results: None,
        }
    }

    /// Batch queued or transmitted without a result payload.
    pub fn sent() -> Self {
        Self {
            connected: true,
            results: None,
        }
    }
}

/// Application-side executor for a single command.
pub trait CommandInterpreter: Send + Sync {
    fn execute(&self, command: &Command) -> crate::error::Result<Option<Value>>;
}

/// Runs a batch through an interpreter with fail-fast semantics: the first
/// failing command and every command after it report `None`. Failure never
/// leaks across batches.
pub fn interpret_batch<I: CommandInterpreter + ?Sized>(
    interpreter: &I,
    batch: &CallBatch,
) -> CommandResults {
    let mut results = Vec::with_capacity(batch.items.len());
    let mut failed = false;
    for item in &batch.items {
        if failed {
            results.push(None);
            continue;
        }
        match interpreter.execute(&item.command) {
            Ok(value) => results.push(value),
            Err(e) => {
                log::warn!("command {:?} failed: {}", item.command, e);
                failed = true;
                results.push(None);
            }
        }
    }
    results
}
