//! Queued operations and their in-flight state.

use std::fs::File;
use std::path::PathBuf;

use crate::engine::OpId;
use crate::opcode::Opcode;
use crate::payload::Payload;

/// One queued operation plus the retransmission state shared by all kinds.
pub(crate) struct Work {
    pub(crate) op: OpId,
    pub(crate) item: Item,
    /// Last request sent, kept verbatim so a retry reuses its `seq_number`
    pub(crate) payload: Payload,
    /// Opcode of the outstanding request; responses echoing anything else
    /// are foreign
    pub(crate) last_opcode: Opcode,
    /// `seq_number` of the last accepted response, for duplicate suppression
    pub(crate) last_response_seq: Option<u16>,
    /// Remaining retransmissions before the operation fails
    pub(crate) retries: u8,
    pub(crate) started: bool,
}

impl Work {
    pub(crate) fn new(op: OpId, item: Item, retries: u8) -> Self {
        Self {
            op,
            item,
            payload: Payload::default(),
            last_opcode: Opcode::None,
            last_response_seq: None,
            retries,
            started: false,
        }
    }
}

pub(crate) enum Item {
    Download(Download),
    Upload(Upload),
    List(List),
    CreateDirectory { remote_path: String },
    RemoveDirectory { remote_path: String },
    RemoveFile { remote_path: String },
    Rename { from: String, to: String },
    CalcFileCrc32 { remote_path: String },
    ResetSessions,
}

pub(crate) struct Download {
    pub(crate) remote_path: String,
    /// Local destination, named after the remote basename
    pub(crate) local_path: PathBuf,
    /// Opened (truncating) when the item starts, not when it is queued
    pub(crate) sink: Option<File>,
    pub(crate) bytes_transferred: u32,
    pub(crate) file_size: u32,
    pub(crate) progress: ProgressThrottle,
}

pub(crate) struct Upload {
    /// Remote destination, named after the local basename
    pub(crate) remote_path: String,
    pub(crate) source: File,
    pub(crate) bytes_transferred: u32,
    pub(crate) file_size: u32,
    pub(crate) progress: ProgressThrottle,
}

pub(crate) struct List {
    pub(crate) remote_path: String,
    /// Entries accumulated across batches; also the next request's offset
    pub(crate) entries: Vec<String>,
}

/// Limits progress reports to whole-percent changes.
#[derive(Default)]
pub(crate) struct ProgressThrottle {
    last_percent: Option<u64>,
}

impl ProgressThrottle {
    /// Whether a report should go out for this position.
    pub(crate) fn should_report(&mut self, bytes: u32, total: u32) -> bool {
        if total == 0 {
            return false;
        }
        let percent = u64::from(bytes) * 100 / u64::from(total);
        if self.last_percent == Some(percent) {
            return false;
        }
        self.last_percent = Some(percent);
        true
    }
}
