//! The serialized work queue and the per-opcode state machines.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::opcode::{Opcode, ServerResult};
use crate::payload::{Payload, MAX_DATA_SIZE};
use crate::seq_lt;
use crate::work::{Download, Item, List, ProgressThrottle, Upload, Work};

/// Default number of retransmissions of an unanswered request before the
/// operation fails with [`Error::Timeout`].
pub const DEFAULT_RETRIES: u8 = 4;

/// Handle correlating [`Event`]s with the operation they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tuning knobs for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retransmissions per request before giving up
    pub retries: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
        }
    }
}

/// An operation to enqueue.
#[derive(Debug, Clone)]
pub enum Command {
    /// Fetch a remote file into `local_dir`, named after the remote basename
    Download {
        /// Path on the server
        remote_path: String,
        /// Existing local directory to write into
        local_dir: PathBuf,
    },
    /// Send a local file into `remote_dir`, named after the local basename
    Upload {
        /// Local file to read
        local_path: PathBuf,
        /// Directory on the server
        remote_dir: String,
    },
    /// Enumerate the entries under a remote directory
    ListDirectory {
        /// Directory on the server
        remote_path: String,
    },
    /// Create a remote directory
    CreateDirectory {
        /// Directory to create
        remote_path: String,
    },
    /// Remove an empty remote directory
    RemoveDirectory {
        /// Directory to remove
        remote_path: String,
    },
    /// Remove a remote file
    RemoveFile {
        /// File to remove
        remote_path: String,
    },
    /// Move or rename a remote file or directory
    Rename {
        /// Current path
        from: String,
        /// New path
        to: String,
    },
    /// Ask the server for a file's CRC32
    CalcFileCrc32 {
        /// File to checksum
        remote_path: String,
    },
    /// Drop all server-side session state
    ResetSessions,
}

/// Successful outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Nothing to report beyond success
    Done,
    /// Directory entries, each prefixed with its type tag (`F` or `D`)
    Listing(Vec<String>),
    /// Server-computed checksum
    Crc32(u32),
}

/// Externally visible effect of advancing the engine.
///
/// Callers apply events in order: transmits and timer changes while they
/// still hold whatever lock guards the engine, progress and completion
/// callbacks after releasing it.
#[derive(Debug)]
pub enum Event {
    /// Send this payload to the peer
    Transmit(Payload),
    /// Arm (or rearm) the one-shot response timer
    SetTimer,
    /// Cancel the response timer
    StopTimer,
    /// A transfer advanced
    Progress {
        /// The operation reporting progress
        op: OpId,
        /// Bytes moved so far
        bytes_transferred: u32,
        /// Total size of the transfer
        total_bytes: u32,
    },
    /// The operation left the queue
    Complete {
        /// The finished operation
        op: OpId,
        /// Its terminal result
        result: Result<Completion, Error>,
    },
}

/// What a state-machine step decided about the operation in flight.
enum Step {
    /// Keep waiting on the outstanding request
    Ignore,
    /// A new request was framed into the work payload; transmit and rearm
    Sent,
    /// The operation finished
    Complete(Result<Completion, Error>),
}

/// A request about to be framed into a work item's payload.
struct Request {
    opcode: Opcode,
    session: u8,
    offset: u32,
    data: Vec<u8>,
    /// `READ_FILE` carries the requested byte count in `size`
    size: Option<u8>,
}

impl Request {
    fn path(opcode: Opcode, path: &str) -> Self {
        let mut data = Vec::with_capacity(path.len() + 1);
        data.extend_from_slice(path.as_bytes());
        data.push(0);
        Self {
            opcode,
            session: 0,
            offset: 0,
            data,
            size: None,
        }
    }

    fn list(path: &str, offset: u32) -> Self {
        Self {
            offset,
            ..Self::path(Opcode::ListDirectory, path)
        }
    }

    fn rename(from: &str, to: &str) -> Self {
        let mut data = Vec::with_capacity(from.len() + to.len() + 2);
        data.extend_from_slice(from.as_bytes());
        data.push(0);
        data.extend_from_slice(to.as_bytes());
        data.push(0);
        Self {
            opcode: Opcode::Rename,
            session: 0,
            offset: 0,
            data,
            size: None,
        }
    }

    fn bare(opcode: Opcode, session: u8) -> Self {
        Self {
            opcode,
            session,
            offset: 0,
            data: Vec::new(),
            size: None,
        }
    }

    fn read(session: u8, offset: u32, count: u8) -> Self {
        Self {
            opcode: Opcode::ReadFile,
            session,
            offset,
            data: Vec::new(),
            size: Some(count),
        }
    }

    fn write(session: u8, offset: u32, chunk: Vec<u8>) -> Self {
        Self {
            opcode: Opcode::WriteFile,
            session,
            offset,
            data: chunk,
            size: None,
        }
    }
}

/// Client half of the MAVLink File Transfer Protocol.
///
/// The engine performs no network I/O and arms no timers itself. Feed it
/// commands, decoded inbound payloads, and timer expiries; it answers with
/// the [`Event`]s those inputs caused. Operations run strictly one at a
/// time, in enqueue order.
pub struct Engine {
    config: EngineConfig,
    queue: VecDeque<Work>,
    next_seq: u16,
    next_op: u64,
    /// Session token from the last file open; zero outside a session
    session: u8,
}

impl Engine {
    /// Creates an idle engine.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            next_seq: 0,
            next_op: 0,
            session: 0,
        }
    }

    /// Number of queued operations, including the one in flight.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn set_next_seq(&mut self, seq: u16) {
        self.next_seq = seq;
    }

    /// Enqueues `command` and starts it if the line is idle.
    ///
    /// Arguments that cannot be expressed on the wire, and upload sources
    /// that cannot be opened, complete the operation synchronously: the
    /// returned events then carry the terminal [`Event::Complete`] and no
    /// frame is ever sent for it.
    pub fn push(&mut self, command: Command) -> (OpId, Vec<Event>) {
        let op = OpId(self.next_op);
        self.next_op += 1;
        let mut events = Vec::new();
        match self.admit(command) {
            Ok(item) => {
                trace!(op = %op, "queued");
                self.queue.push_back(Work::new(op, item, self.config.retries));
                self.start_front(&mut events);
            }
            Err(err) => {
                debug!(op = %op, %err, "rejected at enqueue");
                events.push(Event::Complete {
                    op,
                    result: Err(err),
                });
            }
        }
        (op, events)
    }

    /// Validates a command and builds its work item.
    fn admit(&mut self, command: Command) -> Result<Item, Error> {
        match command {
            Command::Download {
                remote_path,
                local_dir,
            } => {
                fits_in_payload(&remote_path)?;
                let name = basename(&remote_path).ok_or(Error::InvalidParameter)?;
                Ok(Item::Download(Download {
                    local_path: local_dir.join(name),
                    remote_path,
                    sink: None,
                    bytes_transferred: 0,
                    file_size: 0,
                    progress: ProgressThrottle::default(),
                }))
            }
            Command::Upload {
                local_path,
                remote_dir,
            } => {
                let name = local_path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or(Error::InvalidParameter)?;
                let remote_path = join_remote(&remote_dir, name);
                fits_in_payload(&remote_path)?;
                let source = File::open(&local_path).map_err(|err| {
                    warn!("cannot open {}: {err}", local_path.display());
                    io_error(err)
                })?;
                let len = source.metadata().map_err(|_| Error::FileIoError)?.len();
                // Wire offsets are 32 bits.
                let file_size = u32::try_from(len).map_err(|_| Error::InvalidParameter)?;
                Ok(Item::Upload(Upload {
                    remote_path,
                    source,
                    bytes_transferred: 0,
                    file_size,
                    progress: ProgressThrottle::default(),
                }))
            }
            Command::ListDirectory { remote_path } => {
                fits_in_payload(&remote_path)?;
                Ok(Item::List(List {
                    remote_path,
                    entries: Vec::new(),
                }))
            }
            Command::CreateDirectory { remote_path } => {
                fits_in_payload(&remote_path)?;
                Ok(Item::CreateDirectory { remote_path })
            }
            Command::RemoveDirectory { remote_path } => {
                fits_in_payload(&remote_path)?;
                Ok(Item::RemoveDirectory { remote_path })
            }
            Command::RemoveFile { remote_path } => {
                fits_in_payload(&remote_path)?;
                Ok(Item::RemoveFile { remote_path })
            }
            Command::Rename { from, to } => {
                if from.len() + to.len() + 2 > MAX_DATA_SIZE {
                    return Err(Error::InvalidParameter);
                }
                Ok(Item::Rename { from, to })
            }
            Command::CalcFileCrc32 { remote_path } => {
                fits_in_payload(&remote_path)?;
                Ok(Item::CalcFileCrc32 { remote_path })
            }
            Command::ResetSessions => Ok(Item::ResetSessions),
        }
    }

    /// Starts the operation at the head of the queue if it is idle.
    ///
    /// Normally the engine drives itself from `push`, `handle_payload`, and
    /// `handle_timeout`; an explicit tick only matters to embedders that
    /// batch enqueues.
    pub fn do_work(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        self.start_front(&mut events);
        events
    }

    fn start_front(&mut self, events: &mut Vec<Event>) {
        while let Some(mut work) = self.queue.pop_front() {
            if work.started {
                self.queue.push_front(work);
                return;
            }
            work.started = true;
            match self.start_item(&mut work) {
                Ok(()) => {
                    events.push(Event::Transmit(work.payload.clone()));
                    events.push(Event::SetTimer);
                    self.queue.push_front(work);
                    return;
                }
                Err(err) => {
                    debug!(op = %work.op, %err, "failed to start");
                    events.push(Event::Complete {
                        op: work.op,
                        result: Err(err),
                    });
                    // Give the next queued operation its chance.
                }
            }
        }
    }

    fn start_item(&mut self, work: &mut Work) -> Result<(), Error> {
        let request = match &mut work.item {
            Item::Download(download) => {
                let sink = File::create(&download.local_path).map_err(|err| {
                    warn!("cannot create {}: {err}", download.local_path.display());
                    Error::FileIoError
                })?;
                download.sink = Some(sink);
                Request::path(Opcode::OpenFileRo, &download.remote_path)
            }
            Item::Upload(upload) => Request::path(Opcode::OpenFileWo, &upload.remote_path),
            Item::List(list) => Request::list(&list.remote_path, 0),
            Item::CreateDirectory { remote_path } => {
                Request::path(Opcode::CreateDirectory, remote_path)
            }
            Item::RemoveDirectory { remote_path } => {
                Request::path(Opcode::RemoveDirectory, remote_path)
            }
            Item::RemoveFile { remote_path } => Request::path(Opcode::RemoveFile, remote_path),
            Item::Rename { from, to } => Request::rename(from, to),
            Item::CalcFileCrc32 { remote_path } => {
                Request::path(Opcode::CalcFileCrc32, remote_path)
            }
            Item::ResetSessions => Request::bare(Opcode::ResetSessions, self.session),
        };
        self.frame(work, request);
        Ok(())
    }

    /// Stamps a fresh sequence number and writes `request` into the work
    /// item's payload, where the retry path can find it verbatim.
    fn frame(&mut self, work: &mut Work, request: Request) {
        let mut payload = Payload::default();
        payload.seq_number = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        payload.session = request.session;
        payload.opcode = request.opcode.into();
        payload.offset = request.offset;
        payload.set_data(&request.data);
        if let Some(size) = request.size {
            payload.size = size;
        }
        trace!(
            op = %work.op,
            opcode = ?request.opcode,
            seq = payload.seq_number,
            offset = payload.offset,
            size = payload.size,
            "framed request"
        );
        work.last_opcode = request.opcode;
        work.payload = payload;
    }

    /// Routes a decoded inbound payload to the operation in flight.
    ///
    /// Duplicate, stale, and foreign responses are discarded without
    /// touching any state.
    pub fn handle_payload(&mut self, payload: &Payload) -> Vec<Event> {
        let mut events = Vec::new();
        if payload.size as usize > MAX_DATA_SIZE {
            warn!(size = payload.size, "payload with invalid size");
            return events;
        }
        let Some(mut work) = self.queue.pop_front() else {
            trace!("response with no operation in flight");
            return events;
        };
        if !work.started || Opcode::from_u8(payload.req_opcode) != Some(work.last_opcode) {
            trace!(req_opcode = payload.req_opcode, "ignoring foreign response");
            self.queue.push_front(work);
            return events;
        }
        if let Some(last) = work.last_response_seq {
            if payload.seq_number == last || seq_lt(payload.seq_number, last) {
                trace!(seq = payload.seq_number, "ignoring duplicate response");
                self.queue.push_front(work);
                return events;
            }
        }
        work.last_response_seq = Some(payload.seq_number);
        // An answering server is alive; give the next request a full budget.
        work.retries = self.config.retries;

        let step = match Opcode::from_u8(payload.opcode) {
            Some(Opcode::Ack) => self.on_ack(&mut work, payload, &mut events),
            Some(Opcode::Nak) => self.on_nak(&mut work, payload),
            _ => {
                warn!(opcode = payload.opcode, "response is neither ACK nor NAK");
                Step::Ignore
            }
        };
        self.apply(work, step, &mut events);
        events
    }

    fn apply(&mut self, work: Work, step: Step, events: &mut Vec<Event>) {
        match step {
            Step::Ignore => self.queue.push_front(work),
            Step::Sent => {
                events.push(Event::Transmit(work.payload.clone()));
                events.push(Event::SetTimer);
                self.queue.push_front(work);
            }
            Step::Complete(result) => {
                debug!(op = %work.op, ok = result.is_ok(), "operation finished");
                events.push(Event::StopTimer);
                events.push(Event::Complete {
                    op: work.op,
                    result,
                });
                self.start_front(events);
            }
        }
    }

    fn on_ack(&mut self, work: &mut Work, payload: &Payload, events: &mut Vec<Event>) -> Step {
        match work.last_opcode {
            Opcode::OpenFileRo => self.download_opened(work, payload),
            Opcode::ReadFile => self.download_chunk(work, payload, events),
            Opcode::OpenFileWo => self.upload_opened(work, payload),
            Opcode::WriteFile => self.upload_chunk(work, events),
            Opcode::ListDirectory => self.list_batch(work, payload),
            Opcode::TerminateSession | Opcode::ResetSessions => {
                self.session = 0;
                Step::Complete(Ok(Completion::Done))
            }
            Opcode::CalcFileCrc32 => match payload.data().get(..4) {
                Some(bytes) => {
                    let mut crc = [0u8; 4];
                    crc.copy_from_slice(bytes);
                    Step::Complete(Ok(Completion::Crc32(u32::from_le_bytes(crc))))
                }
                None => Step::Complete(Err(Error::ProtocolError)),
            },
            Opcode::CreateDirectory
            | Opcode::RemoveDirectory
            | Opcode::RemoveFile
            | Opcode::Rename => Step::Complete(Ok(Completion::Done)),
            other => {
                warn!(opcode = ?other, "unexpected ACK");
                Step::Ignore
            }
        }
    }

    fn on_nak(&mut self, work: &mut Work, payload: &Payload) -> Step {
        let code = payload
            .data()
            .first()
            .copied()
            .and_then(ServerResult::from_u8);
        debug!(op = %work.op, ?code, "request NAKed");
        if work.last_opcode == Opcode::ReadFile && code == Some(ServerResult::Eof) {
            // The file ended before the size advertised at open; that is a
            // successful download, once the session is closed.
            if let Item::Download(download) = &mut work.item {
                download.file_size = download.bytes_transferred;
            }
            let session = self.session;
            self.frame(work, Request::bare(Opcode::TerminateSession, session));
            return Step::Sent;
        }
        if let Item::List(list) = &mut work.item {
            // EOF ends the listing; any other failure still salvages the
            // entries already collected.
            if code == Some(ServerResult::Eof) || !list.entries.is_empty() {
                return Step::Complete(Ok(Completion::Listing(std::mem::take(
                    &mut list.entries,
                ))));
            }
        }
        Step::Complete(Err(Error::from_nak(payload)))
    }

    fn download_opened(&mut self, work: &mut Work, payload: &Payload) -> Step {
        {
            let Item::Download(download) = &mut work.item else {
                warn!("OPEN_FILE_RO ACK outside a download");
                return Step::Ignore;
            };
            let Some(bytes) = payload.data().get(..4) else {
                return Step::Complete(Err(Error::ProtocolError));
            };
            let mut size = [0u8; 4];
            size.copy_from_slice(bytes);
            download.file_size = u32::from_le_bytes(size);
            download.bytes_transferred = 0;
            self.session = payload.session;
            debug!(
                file_size = download.file_size,
                session = self.session,
                "download session opened"
            );
        }
        self.download_next(work)
    }

    fn download_chunk(&mut self, work: &mut Work, payload: &Payload, events: &mut Vec<Event>) -> Step {
        let op = work.op;
        {
            let Item::Download(download) = &mut work.item else {
                warn!("READ_FILE ACK outside a download");
                return Step::Ignore;
            };
            if payload.size == 0 {
                // A zero-length read is the server's other way of saying EOF.
                download.file_size = download.bytes_transferred;
            } else {
                let Some(sink) = download.sink.as_mut() else {
                    warn!("READ_FILE ACK with no open sink");
                    return Step::Complete(Err(Error::FileIoError));
                };
                if let Err(err) = sink.write_all(payload.data()) {
                    warn!("writing {} failed: {err}", download.local_path.display());
                    return Step::Complete(Err(Error::FileIoError));
                }
                download.bytes_transferred = download
                    .bytes_transferred
                    .saturating_add(u32::from(payload.size));
                if download
                    .progress
                    .should_report(download.bytes_transferred, download.file_size)
                {
                    events.push(Event::Progress {
                        op,
                        bytes_transferred: download.bytes_transferred,
                        total_bytes: download.file_size,
                    });
                }
            }
        }
        self.download_next(work)
    }

    /// Requests the next chunk, or closes the session once the advertised
    /// size has arrived.
    fn download_next(&mut self, work: &mut Work) -> Step {
        let (transferred, file_size) = match &work.item {
            Item::Download(download) => (download.bytes_transferred, download.file_size),
            _ => return Step::Ignore,
        };
        let session = self.session;
        if transferred < file_size {
            let count = (file_size - transferred).min(MAX_DATA_SIZE as u32) as u8;
            self.frame(work, Request::read(session, transferred, count));
        } else {
            self.frame(work, Request::bare(Opcode::TerminateSession, session));
        }
        Step::Sent
    }

    fn upload_opened(&mut self, work: &mut Work, payload: &Payload) -> Step {
        if let Item::Upload(upload) = &mut work.item {
            upload.bytes_transferred = 0;
        }
        self.session = payload.session;
        debug!(session = self.session, "upload session opened");
        self.upload_next(work)
    }

    fn upload_chunk(&mut self, work: &mut Work, events: &mut Vec<Event>) -> Step {
        let op = work.op;
        // The acknowledged chunk is the one still framed in the payload.
        let acked = u32::from(work.payload.size);
        {
            let Item::Upload(upload) = &mut work.item else {
                warn!("WRITE_FILE ACK outside an upload");
                return Step::Ignore;
            };
            upload.bytes_transferred = upload.bytes_transferred.saturating_add(acked);
            if upload
                .progress
                .should_report(upload.bytes_transferred, upload.file_size)
            {
                events.push(Event::Progress {
                    op,
                    bytes_transferred: upload.bytes_transferred,
                    total_bytes: upload.file_size,
                });
            }
        }
        self.upload_next(work)
    }

    /// Frames the next chunk of the source file, or closes the session once
    /// everything has been written.
    fn upload_next(&mut self, work: &mut Work) -> Step {
        let session = self.session;
        let chunk = {
            let Item::Upload(upload) = &mut work.item else {
                warn!("upload step outside an upload");
                return Step::Ignore;
            };
            if upload.bytes_transferred < upload.file_size {
                let want = (upload.file_size - upload.bytes_transferred)
                    .min(MAX_DATA_SIZE as u32) as usize;
                let mut chunk = vec![0u8; want];
                if let Err(err) = upload.source.read_exact(&mut chunk) {
                    warn!("reading upload source failed: {err}");
                    return Step::Complete(Err(Error::FileIoError));
                }
                Some((chunk, upload.bytes_transferred))
            } else {
                None
            }
        };
        match chunk {
            Some((chunk, offset)) => self.frame(work, Request::write(session, offset, chunk)),
            None => self.frame(work, Request::bare(Opcode::TerminateSession, session)),
        }
        Step::Sent
    }

    fn list_batch(&mut self, work: &mut Work, payload: &Payload) -> Step {
        let (path, added, total) = {
            let Item::List(list) = &mut work.item else {
                warn!("LIST_DIRECTORY ACK outside a listing");
                return Step::Ignore;
            };
            let mut added = 0usize;
            for entry in payload.data().split(|&byte| byte == 0) {
                // Skipped markers take no slot in the accumulated listing.
                if entry.is_empty() || entry[0] == b'S' {
                    continue;
                }
                list.entries
                    .push(String::from_utf8_lossy(entry).into_owned());
                added += 1;
            }
            (list.remote_path.clone(), added, list.entries.len())
        };
        if added == 0 {
            let Item::List(list) = &mut work.item else {
                return Step::Ignore;
            };
            return Step::Complete(Ok(Completion::Listing(std::mem::take(&mut list.entries))));
        }
        self.frame(work, Request::list(&path, total as u32));
        Step::Sent
    }

    /// Drives the retry loop after the response timer fires.
    ///
    /// The last payload is resent verbatim, `seq_number` included, so the
    /// server can recognize the retransmission; once the retry budget is
    /// spent the operation fails with [`Error::Timeout`].
    pub fn handle_timeout(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        let Some(mut work) = self.queue.pop_front() else {
            trace!("timer fired with no operation in flight");
            return events;
        };
        if !work.started {
            self.queue.push_front(work);
            return events;
        }
        if work.retries == 0 {
            warn!(op = %work.op, "no answer after all retries");
            events.push(Event::Complete {
                op: work.op,
                result: Err(Error::Timeout),
            });
            self.start_front(&mut events);
            return events;
        }
        work.retries -= 1;
        debug!(
            op = %work.op,
            retries_left = work.retries,
            seq = work.payload.seq_number,
            "resending"
        );
        events.push(Event::Transmit(work.payload.clone()));
        events.push(Event::SetTimer);
        self.queue.push_front(work);
        events
    }
}

/// One spare byte is needed for the NUL terminator.
fn fits_in_payload(path: &str) -> Result<(), Error> {
    if path.len() + 1 > MAX_DATA_SIZE {
        Err(Error::InvalidParameter)
    } else {
        Ok(())
    }
}

fn basename(remote_path: &str) -> Option<&str> {
    match remote_path.rsplit('/').next() {
        Some(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn io_error(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::FileDoesNotExist
    } else {
        Error::FileIoError
    }
}
