//! Command response override hook.
//!
//! Before a command reaches its built-in handler it is offered to the controller's
//! [`CommandResponder`]. A responder that returns a completion replaces the handler entirely.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{CompletionEntry, NvmeCommand, NvmeStatus};

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("failed to read command response file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse command response file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub trait CommandResponder: Send {
    /// Returns `Some` to complete `command` (received on `sqid`) with the given entry instead of
    /// running the built-in handler. SQID, SQHD, CID and the phase tag are filled in by the
    /// controller.
    fn respond(
        &mut self,
        sqid: u16,
        command: &NvmeCommand,
    ) -> Result<Option<CompletionEntry>, ResponderError>;
}

/// Declines every command.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResponder;

impl CommandResponder for NoResponder {
    fn respond(
        &mut self,
        _sqid: u16,
        _command: &NvmeCommand,
    ) -> Result<Option<CompletionEntry>, ResponderError> {
        Ok(None)
    }
}

/// A single override. Absent match fields match anything; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponseRule {
    pub sqid: Option<u16>,
    pub opcode: Option<u8>,
    pub cid: Option<u16>,
    pub nsid: Option<u32>,

    pub sct: u8,
    pub sc: u8,
    pub dnr: bool,
    /// Command specific result returned in DW0.
    pub result: u32,
}

impl ResponseRule {
    pub fn matches(&self, sqid: u16, command: &NvmeCommand) -> bool {
        self.sqid.map_or(true, |v| v == sqid)
            && self.opcode.map_or(true, |v| v == command.opc)
            && self.cid.map_or(true, |v| v == command.cid)
            && self.nsid.map_or(true, |v| v == command.nsid)
    }

    pub fn completion(&self) -> CompletionEntry {
        CompletionEntry::new(NvmeStatus {
            sct: self.sct,
            sc: self.sc,
            dnr: self.dnr,
        })
        .with_result(self.result)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseRules {
    pub rules: Vec<ResponseRule>,
}

/// Reads a JSON rule file on every offered command so a harness can change the overrides
/// while the controller runs. A missing file declines.
#[derive(Debug, Clone)]
pub struct FileResponder {
    path: PathBuf,
}

impl FileResponder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileResponder { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<ResponseRules>, ResponderError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ResponderError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| ResponderError::Parse {
                path: self.path.clone(),
                source,
            })
    }
}

impl CommandResponder for FileResponder {
    fn respond(
        &mut self,
        sqid: u16,
        command: &NvmeCommand,
    ) -> Result<Option<CompletionEntry>, ResponderError> {
        let Some(rules) = self.load()? else {
            return Ok(None);
        };
        Ok(rules
            .rules
            .iter()
            .find(|rule| rule.matches(sqid, command))
            .map(ResponseRule::completion))
    }
}
