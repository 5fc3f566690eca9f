use crate::{
    Command, Completion, Engine, EngineConfig, Error, Event, OpId, Opcode, Payload, ServerResult,
};

/// Drives an [`Engine`] by hand, recording everything it emits.
pub(super) struct Harness {
    pub(super) engine: Engine,
    pub(super) sent: Vec<Payload>,
    pub(super) progress: Vec<(OpId, u32, u32)>,
    pub(super) completed: Vec<(OpId, Result<Completion, Error>)>,
    pub(super) timer_sets: usize,
    pub(super) timer_stops: usize,
}

impl Harness {
    pub(super) fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub(super) fn with_config(config: EngineConfig) -> Self {
        Self {
            engine: Engine::new(config),
            sent: Vec::new(),
            progress: Vec::new(),
            completed: Vec::new(),
            timer_sets: 0,
            timer_stops: 0,
        }
    }

    pub(super) fn absorb(&mut self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Transmit(payload) => self.sent.push(payload),
                Event::SetTimer => self.timer_sets += 1,
                Event::StopTimer => self.timer_stops += 1,
                Event::Progress {
                    op,
                    bytes_transferred,
                    total_bytes,
                } => self.progress.push((op, bytes_transferred, total_bytes)),
                Event::Complete { op, result } => self.completed.push((op, result)),
            }
        }
    }

    pub(super) fn push(&mut self, command: Command) -> OpId {
        let (op, events) = self.engine.push(command);
        self.absorb(events);
        op
    }

    pub(super) fn deliver(&mut self, payload: Payload) {
        let events = self.engine.handle_payload(&payload);
        self.absorb(events);
    }

    pub(super) fn timeout(&mut self) {
        let events = self.engine.handle_timeout();
        self.absorb(events);
    }

    /// The most recent transmission.
    pub(super) fn last_sent(&self) -> Payload {
        self.sent.last().expect("nothing transmitted").clone()
    }

    /// ACK answering `request`, echoing its opcode and stepping the
    /// sequence number the way the server does.
    pub(super) fn ack(request: &Payload, session: u8, data: &[u8]) -> Payload {
        let mut reply = Payload::default();
        reply.seq_number = request.seq_number.wrapping_add(1);
        reply.session = session;
        reply.opcode = Opcode::Ack.into();
        reply.req_opcode = request.opcode;
        reply.set_data(data);
        reply
    }

    /// NAK answering `request` with `code` and an optional errno byte.
    pub(super) fn nak(request: &Payload, code: ServerResult, errno: Option<u8>) -> Payload {
        let mut reply = Payload::default();
        reply.seq_number = request.seq_number.wrapping_add(1);
        reply.opcode = Opcode::Nak.into();
        reply.req_opcode = request.opcode;
        match errno {
            Some(errno) => reply.set_data(&[code as u8, errno]),
            None => reply.set_data(&[code as u8]),
        }
        reply
    }
}
