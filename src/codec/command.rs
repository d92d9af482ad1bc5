//! Command sub protocol: typed argument packing and the dispatch table.
//!
//! Commands are addressed by a byte id from a fixed table. Each command
//! declares its argument types and, for request/response pairs, the types
//! of the response payload. Arguments serialize in declared order with
//! fixed little endian widths.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use super::{encode_frame, Framer, COMMAND_PROTOCOL, TEXT_PROTOCOL};
use crate::error::{StriderError, StriderResult};
use crate::signals::{Signals, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    U8,
    I32,
    U32,
    F32,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    U8(u8),
    I32(i32),
    U32(u32),
    F32(f32),
    Bool(bool),
}

impl Value {
    pub fn as_f32(self) -> f32 {
        match self {
            Value::U8(value) => value as f32,
            Value::I32(value) => value as f32,
            Value::U32(value) => value as f32,
            Value::F32(value) => value,
            Value::Bool(value) => value as u8 as f32,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Value::U8(value) => value,
            Value::I32(value) => value as u8,
            Value::U32(value) => value as u8,
            Value::F32(value) => value as u8,
            Value::Bool(value) => value as u8,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Value::U8(value) => value as i32,
            Value::I32(value) => value,
            Value::U32(value) => value as i32,
            Value::F32(value) => value as i32,
            Value::Bool(value) => value as i32,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Value::U8(value) => value as u32,
            Value::I32(value) => value as u32,
            Value::U32(value) => value,
            Value::F32(value) => value as u32,
            Value::Bool(value) => value as u32,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Value::U8(value) => value != 0,
            Value::I32(value) => value != 0,
            Value::U32(value) => value != 0,
            Value::F32(value) => value != 0.0,
            Value::Bool(value) => value,
        }
    }

    /// Build a value of the given wire kind from a plain float, used when
    /// replaying configuration steps read from the settings file.
    pub fn coerce(kind: ArgKind, value: f64) -> Value {
        match kind {
            ArgKind::U8 => Value::U8(value as u8),
            ArgKind::I32 => Value::I32(value as i32),
            ArgKind::U32 => Value::U32(value as u32),
            ArgKind::F32 => Value::F32(value as f32),
            ArgKind::Bool => Value::Bool(value != 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub id: u8,
    pub name: &'static str,
    pub args: &'static [ArgKind],
    pub response: &'static [ArgKind],
}

use ArgKind::{Bool, F32, I32, U32, U8};

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        id: 0,
        name: "heartbeat",
        args: &[],
        response: &[],
    },
    CommandSpec {
        id: 1,
        name: "estop",
        args: &[U8],
        response: &[U8],
    },
    CommandSpec {
        id: 2,
        name: "pwm",
        args: &[F32, F32, F32],
        response: &[F32, F32, F32],
    },
    CommandSpec {
        id: 3,
        name: "plan",
        args: &[
            U8, U8, F32, F32, F32, F32, F32, F32, F32, F32, F32, F32, F32, F32, F32, F32, F32, F32,
            F32,
        ],
        response: &[],
    },
    CommandSpec {
        id: 4,
        name: "enable_pid",
        args: &[Bool],
        response: &[Bool],
    },
    CommandSpec {
        id: 5,
        name: "pid_config",
        args: &[U8, F32, F32, F32, F32, F32],
        response: &[U8, F32, F32, F32, F32, F32],
    },
    CommandSpec {
        id: 6,
        name: "leg_number",
        args: &[U8],
        response: &[U8],
    },
    CommandSpec {
        id: 7,
        name: "pwm_limits",
        args: &[U8, I32, I32, I32, I32],
        response: &[U8, I32, I32, I32, I32],
    },
    CommandSpec {
        id: 8,
        name: "adc_limits",
        args: &[U8, F32, F32],
        response: &[U8, F32, F32],
    },
    CommandSpec {
        id: 9,
        name: "calf_scale",
        args: &[F32, F32],
        response: &[F32, F32],
    },
    CommandSpec {
        id: 10,
        name: "report_time",
        args: &[U32],
        response: &[U32],
    },
    CommandSpec {
        id: 11,
        name: "pid_seed_time",
        args: &[],
        response: &[F32],
    },
    CommandSpec {
        id: 12,
        name: "reset_pids",
        args: &[Bool],
        response: &[],
    },
    CommandSpec {
        id: 13,
        name: "dither",
        args: &[U32, I32],
        response: &[U32, I32],
    },
    CommandSpec {
        id: 14,
        name: "following_error_threshold",
        args: &[U8, F32],
        response: &[U8, F32],
    },
    CommandSpec {
        id: 16,
        name: "set_geometry",
        args: &[U8, U8, F32],
        response: &[],
    },
    CommandSpec {
        id: 21,
        name: "report_adc",
        args: &[Bool],
        response: &[U32, U32, U32, U32],
    },
    CommandSpec {
        id: 22,
        name: "report_pid",
        args: &[Bool],
        response: &[F32, F32, F32, F32, F32, F32, F32, F32, F32],
    },
    CommandSpec {
        id: 23,
        name: "report_pwm",
        args: &[Bool],
        response: &[I32, I32, I32],
    },
    CommandSpec {
        id: 24,
        name: "report_xyz",
        args: &[Bool],
        response: &[F32, F32, F32],
    },
    CommandSpec {
        id: 25,
        name: "report_angles",
        args: &[Bool],
        response: &[F32, F32, F32, F32, Bool],
    },
    CommandSpec {
        id: 26,
        name: "report_loop_time",
        args: &[Bool],
        response: &[U32],
    },
];

static COMMANDS_BY_ID: Lazy<HashMap<u8, &'static CommandSpec>> =
    Lazy::new(|| COMMANDS.iter().map(|spec| (spec.id, spec)).collect());

static COMMANDS_BY_NAME: Lazy<HashMap<&'static str, &'static CommandSpec>> =
    Lazy::new(|| COMMANDS.iter().map(|spec| (spec.name, spec)).collect());

pub fn command_by_id(id: u8) -> Option<&'static CommandSpec> {
    COMMANDS_BY_ID.get(&id).copied()
}

pub fn command_by_name(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS_BY_NAME.get(name).copied()
}

pub fn encode_args(values: &[Value]) -> Bytes {
    let mut buffer = BytesMut::new();
    for value in values {
        match value {
            Value::U8(value) => buffer.put_u8(*value),
            Value::I32(value) => buffer.put_i32_le(*value),
            Value::U32(value) => buffer.put_u32_le(*value),
            Value::F32(value) => buffer.put_f32_le(*value),
            Value::Bool(value) => buffer.put_u8(*value as u8),
        }
    }
    buffer.freeze()
}

pub fn decode_args(kinds: &[ArgKind], payload: &[u8]) -> StriderResult<Vec<Value>> {
    let mut buffer = payload;
    let mut values = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let width = match kind {
            ArgKind::U8 | ArgKind::Bool => 1,
            _ => 4,
        };
        if buffer.remaining() < width {
            return Err(StriderError::MalformedMessage(format!(
                "payload ends short of a {kind:?} argument"
            )));
        }
        values.push(match kind {
            ArgKind::U8 => Value::U8(buffer.get_u8()),
            ArgKind::I32 => Value::I32(buffer.get_i32_le()),
            ArgKind::U32 => Value::U32(buffer.get_u32_le()),
            ArgKind::F32 => Value::F32(buffer.get_f32_le()),
            ArgKind::Bool => Value::Bool(buffer.get_u8() != 0),
        });
    }
    if buffer.has_remaining() {
        return Err(StriderError::MalformedMessage(format!(
            "{} trailing bytes after arguments",
            buffer.remaining()
        )));
    }
    Ok(values)
}

struct PendingResponse {
    id: u8,
    values: Option<Vec<Value>>,
}

/// One command/text session over a byte stream.
///
/// Exposes a fire and forget [`trigger`](CommandSession::trigger), a
/// [`blocking_trigger`](CommandSession::blocking_trigger) that pumps the
/// stream until a matching response frame arrives or a timeout elapses, and
/// handler registration keyed by command id for incoming frames.
pub struct CommandSession<T> {
    stream: T,
    framer: Framer,
    events: Signals<u8, Vec<Value>>,
    text: Signals<(), String>,
    pending: Option<PendingResponse>,
}

impl<T: Read + Write> CommandSession<T> {
    pub fn new(stream: T) -> Self {
        CommandSession {
            stream,
            framer: Framer::new(),
            events: Signals::new(),
            text: Signals::new(),
            pending: None,
        }
    }

    /// Register a handler invoked with the decoded arguments of every
    /// incoming frame with this command id.
    pub fn on(&self, command: u8, callback: impl FnMut(&Vec<Value>) + 'static) -> Token {
        self.events.on(command, callback)
    }

    pub fn on_text(&self, mut callback: impl FnMut(&str) + 'static) -> Token {
        self.text.on((), move |line: &String| callback(line))
    }

    /// Send a command without waiting for any response.
    pub fn trigger(&mut self, name: &str, args: &[Value]) -> StriderResult<()> {
        let spec =
            command_by_name(name).ok_or_else(|| StriderError::UnknownCommand(name.to_owned()))?;
        if args.len() > spec.args.len() {
            return Err(StriderError::MalformedMessage(format!(
                "{} takes at most {} arguments, got {}",
                name,
                spec.args.len(),
                args.len()
            )));
        }
        let mut payload = BytesMut::new();
        payload.put_u8(spec.id);
        payload.put_slice(&encode_args(args));
        self.stream
            .write_all(&encode_frame(COMMAND_PROTOCOL, &payload))?;
        self.stream.flush()?;
        Ok(())
    }

    /// Send a command and pump the stream until its response arrives.
    ///
    /// Frames for other commands received while waiting are dispatched to
    /// their handlers as usual. A timeout surfaces as an error and leaves
    /// the session usable.
    pub fn blocking_trigger(
        &mut self,
        name: &str,
        args: &[Value],
        timeout: Duration,
    ) -> StriderResult<Vec<Value>> {
        let spec =
            command_by_name(name).ok_or_else(|| StriderError::UnknownCommand(name.to_owned()))?;
        self.trigger(name, args)?;
        self.pending = Some(PendingResponse {
            id: spec.id,
            values: None,
        });
        let deadline = Instant::now() + timeout;
        loop {
            self.pump()?;
            if let Some(values) = self.pending.as_mut().and_then(|p| p.values.take()) {
                self.pending = None;
                return Ok(values);
            }
            if Instant::now() >= deadline {
                self.pending = None;
                return Err(StriderError::CommandTimeout {
                    command: spec.name,
                    timeout,
                });
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drain available bytes from the stream and dispatch complete frames.
    pub fn pump(&mut self) -> StriderResult<()> {
        let mut buffer = [0u8; 256];
        loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => self.framer.push(&buffer[..read]),
                Err(error)
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    break
                }
                Err(error) => return Err(error.into()),
            }
        }
        while let Some((protocol, payload)) = self.framer.next_frame() {
            self.dispatch(protocol, &payload);
        }
        Ok(())
    }

    fn dispatch(&mut self, protocol: u8, payload: &[u8]) {
        match protocol {
            COMMAND_PROTOCOL => {
                let Some((&id, arguments)) = payload.split_first() else {
                    warn!("dropping empty command frame");
                    return;
                };
                let Some(spec) = command_by_id(id) else {
                    warn!("dropping frame with unknown command id {}", id);
                    return;
                };
                let values = match decode_args(spec.response, arguments) {
                    Ok(values) => values,
                    Err(error) => {
                        warn!("dropping malformed {} frame: {}", spec.name, error);
                        return;
                    }
                };
                if let Some(pending) = self.pending.as_mut() {
                    if pending.id == id {
                        pending.values = Some(values.clone());
                    }
                }
                self.events.trigger(&id, &values);
            }
            TEXT_PROTOCOL => {
                let line = String::from_utf8_lossy(payload).into_owned();
                debug!("firmware text: {}", line);
                self.text.trigger(&(), &line);
            }
            other => warn!("dropping frame with unknown protocol id {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    use super::*;

    /// Byte stream with scripted incoming bytes and captured output.
    struct MockStream {
        incoming: Cursor<Vec<u8>>,
        outgoing: Vec<u8>,
    }

    impl MockStream {
        fn new(incoming: Vec<u8>) -> Self {
            MockStream {
                incoming: Cursor::new(incoming),
                outgoing: Vec::new(),
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.incoming.read(buf)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn response_frame(name: &str, values: &[Value]) -> Vec<u8> {
        let spec = command_by_name(name).unwrap();
        let mut payload = vec![spec.id];
        payload.extend_from_slice(&encode_args(values));
        encode_frame(COMMAND_PROTOCOL, &payload).to_vec()
    }

    #[test]
    fn args_round_trip() {
        let kinds = [
            ArgKind::U8,
            ArgKind::I32,
            ArgKind::U32,
            ArgKind::F32,
            ArgKind::Bool,
        ];
        let values = vec![
            Value::U8(7),
            Value::I32(-42),
            Value::U32(100_000),
            Value::F32(0.025),
            Value::Bool(true),
        ];
        let encoded = encode_args(&values);
        let decoded = decode_args(&kinds, &encoded).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn short_payload_is_rejected() {
        let result = decode_args(&[ArgKind::F32], &[0, 0]);
        assert!(result.is_err());
    }

    #[test]
    fn blocking_trigger_returns_response() {
        let stream = MockStream::new(response_frame("pid_seed_time", &[Value::F32(0.025)]));
        let mut session = CommandSession::new(stream);
        let values = session
            .blocking_trigger("pid_seed_time", &[], Duration::from_millis(50))
            .unwrap();
        assert_eq!(values, vec![Value::F32(0.025)]);
    }

    #[test]
    fn blocking_trigger_times_out_without_response() {
        let stream = MockStream::new(Vec::new());
        let mut session = CommandSession::new(stream);
        let result = session.blocking_trigger("pid_seed_time", &[], Duration::from_millis(5));
        assert!(matches!(
            result,
            Err(StriderError::CommandTimeout { .. })
        ));
    }

    #[test]
    fn incoming_frames_reach_registered_handlers() {
        let mut bytes = response_frame(
            "report_xyz",
            &[Value::F32(40.0), Value::F32(0.0), Value::F32(-40.0)],
        );
        bytes.extend_from_slice(&response_frame("report_loop_time", &[Value::U32(180)]));
        let mut session = CommandSession::new(MockStream::new(bytes));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let handle = Rc::clone(&seen);
        session.on(command_by_name("report_xyz").unwrap().id, move |values| {
            handle.borrow_mut().push(values.clone());
        });
        session.pump().unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![vec![Value::F32(40.0), Value::F32(0.0), Value::F32(-40.0)]]
        );
    }

    #[test]
    fn trigger_writes_a_command_frame() {
        let mut session = CommandSession::new(MockStream::new(Vec::new()));
        session
            .trigger("estop", &[Value::U8(2)])
            .unwrap();
        let written = session.stream.outgoing.clone();
        // length, protocol, command id, argument, checksum
        assert_eq!(written.len(), 5);
        assert_eq!(written[1], COMMAND_PROTOCOL);
        assert_eq!(written[2], 1);
        assert_eq!(written[3], 2);
    }
}
