//! Codificación binaria de los mensajes.
//!
//! Header: `length: u32` (mensaje completo, header incluido) + `command: u16`,
//! todo big-endian. Los strings van con prefijo `u16` de longitud.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::clock::{datetime_to_ms, ms_to_datetime};
use crate::error::ProtocolError;
use crate::task::{ExecStatus, JobKind, OutputState, TermReason};

use super::manifest::validate_file_name;
use super::message::*;
use super::{CHALLENGE_LEN, HEADER_LEN, MAX_MESSAGE_LEN, RESPONSE_LEN};

type Result<T> = std::result::Result<T, ProtocolError>;

/* --------- Lectura --------- */

struct Reader {
    buf: Bytes,
    what: &'static str,
}

impl Reader {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Truncated(self.what))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn string(&mut self) -> Result<String> {
        let n = self.u16()? as usize;
        self.need(n)?;
        let raw = self.buf.split_to(n);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(self.what))
    }

    fn file_name(&mut self) -> Result<String> {
        let name = self.string()?;
        validate_file_name(&name)?;
        Ok(name)
    }

    fn strings(&mut self) -> Result<Vec<String>> {
        let n = self.u16()?;
        (0..n).map(|_| self.string()).collect()
    }

    fn finish(self) -> Result<()> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(self.what, n)),
        }
    }
}

fn invalid(field: &'static str, value: impl Into<u64>) -> ProtocolError {
    ProtocolError::InvalidValue {
        field,
        value: value.into(),
    }
}

fn kind_from(raw: u8) -> Result<JobKind> {
    match raw {
        0 => Ok(JobKind::Render),
        1 => Ok(JobKind::Filter),
        other => Err(invalid("job kind", other)),
    }
}

fn kind_to(kind: JobKind) -> u8 {
    match kind {
        JobKind::Render => 0,
        JobKind::Filter => 1,
    }
}

fn connect_code_from(raw: u8) -> Result<ConnectCode> {
    match raw {
        0 => Ok(ConnectCode::Accepted),
        1 => Ok(ConnectCode::AuthFailed),
        2 => Ok(ConnectCode::AlreadyConnected),
        3 => Ok(ConnectCode::Busy),
        other => Err(invalid("connect code", other)),
    }
}

fn connect_code_to(code: ConnectCode) -> u8 {
    match code {
        ConnectCode::Accepted => 0,
        ConnectCode::AuthFailed => 1,
        ConnectCode::AlreadyConnected => 2,
        ConnectCode::Busy => 3,
    }
}

fn response_code_from(raw: u8) -> Result<TaskResponseCode> {
    match raw {
        0 => Ok(TaskResponseCode::Accepted),
        1 => Ok(TaskResponseCode::Busy),
        2 => Ok(TaskResponseCode::Unsupported),
        3 => Ok(TaskResponseCode::Quitting),
        4 => Ok(TaskResponseCode::TransferFailed),
        other => Err(invalid("task response", other)),
    }
}

fn response_code_to(code: TaskResponseCode) -> u8 {
    match code {
        TaskResponseCode::Accepted => 0,
        TaskResponseCode::Busy => 1,
        TaskResponseCode::Unsupported => 2,
        TaskResponseCode::Quitting => 3,
        TaskResponseCode::TransferFailed => 4,
    }
}

fn control_from(code: u16, arg: u32) -> Result<ControlCmd> {
    Ok(match code {
        1 => ControlCmd::KillUser,
        2 => ControlCmd::KillServer,
        3 => ControlCmd::Stop,
        4 => ControlCmd::Continue,
        5 => ControlCmd::Ping,
        6 => ControlCmd::ClientQuit,
        7 => ControlCmd::NoMoreTasks,
        8 => ControlCmd::GiveBack { keep: arg },
        other => return Err(invalid("control command", other)),
    })
}

fn control_to(cmd: ControlCmd) -> (u16, u32) {
    match cmd {
        ControlCmd::KillUser => (1, 0),
        ControlCmd::KillServer => (2, 0),
        ControlCmd::Stop => (3, 0),
        ControlCmd::Continue => (4, 0),
        ControlCmd::Ping => (5, 0),
        ControlCmd::ClientQuit => (6, 0),
        ControlCmd::NoMoreTasks => (7, 0),
        ControlCmd::GiveBack { keep } => (8, keep),
    }
}

fn control_status_from(raw: u8) -> Result<ControlStatus> {
    match raw {
        0 => Ok(ControlStatus::Ok),
        1 => Ok(ControlStatus::Refused),
        2 => Ok(ControlStatus::Unsupported),
        other => Err(invalid("control status", other)),
    }
}

fn control_status_to(status: ControlStatus) -> u8 {
    match status {
        ControlStatus::Ok => 0,
        ControlStatus::Refused => 1,
        ControlStatus::Unsupported => 2,
    }
}

fn reason_from(raw: u8) -> Result<TermReason> {
    Ok(match raw {
        0 => TermReason::Unset,
        1 => TermReason::Exited,
        2 => TermReason::Signaled,
        3 => TermReason::Timeout,
        4 => TermReason::LaunchFailed,
        5 => TermReason::Killed,
        6 => TermReason::TransferFailed,
        other => return Err(invalid("termination reason", other)),
    })
}

fn reason_to(reason: TermReason) -> u8 {
    match reason {
        TermReason::Unset => 0,
        TermReason::Exited => 1,
        TermReason::Signaled => 2,
        TermReason::Timeout => 3,
        TermReason::LaunchFailed => 4,
        TermReason::Killed => 5,
        TermReason::TransferFailed => 6,
    }
}

fn output_from(raw: u8) -> Result<OutputState> {
    Ok(match raw {
        0 => OutputState::Unset,
        1 => OutputState::Bad,
        2 => OutputState::Resumable,
        3 => OutputState::Complete,
        other => return Err(invalid("output state", other)),
    })
}

fn output_to(state: OutputState) -> u8 {
    match state {
        OutputState::Unset => 0,
        OutputState::Bad => 1,
        OutputState::Resumable => 2,
        OutputState::Complete => 3,
    }
}

fn read_status(r: &mut Reader) -> Result<Option<ExecStatus>> {
    match r.u8()? {
        0 => Ok(None),
        1 => {
            let reason = reason_from(r.u8()?)?;
            let code = r.i32()?;
            let started_at = ms_to_datetime(r.i64()?);
            let ended_at = ms_to_datetime(r.i64()?);
            let cpu_time = Duration::from_millis(r.u64()?);
            let output = output_from(r.u8()?)?;
            Ok(Some(ExecStatus {
                reason,
                code,
                started_at,
                ended_at,
                cpu_time,
                output,
            }))
        }
        other => Err(invalid("status flag", other)),
    }
}

fn read_job(r: &mut Reader) -> Result<JobRequest> {
    Ok(JobRequest {
        kind: kind_from(r.u8()?)?,
        desc: r.string()?,
        input: r.file_name()?,
        output: r.file_name()?,
        format: r.string()?,
        timeout_ms: r.u32()?,
        args: r.strings()?,
        additional: {
            let n = r.u16()?;
            (0..n).map(|_| r.file_name()).collect::<Result<_>>()?
        },
    })
}

/// Valida el header y devuelve `(length, command)`.
pub fn parse_header(raw: [u8; HEADER_LEN], max_len: u32) -> Result<(u32, Command)> {
    let mut b = &raw[..];
    let len = b.get_u32();
    let cmd = b.get_u16();

    if len < HEADER_LEN as u32 {
        return Err(ProtocolError::TooShort(len));
    }
    if len > max_len {
        return Err(ProtocolError::TooLong(len, max_len));
    }
    let cmd = Command::from_u16(cmd).ok_or(ProtocolError::UnknownCommand(cmd))?;
    Ok((len, cmd))
}

/// Decodifica el cuerpo (sin header) de un mensaje.
pub fn decode(cmd: Command, body: Bytes) -> Result<Message> {
    let mut r = Reader {
        buf: body,
        what: cmd.name(),
    };

    let msg = match cmd {
        Command::ChallengeRequest => Message::ChallengeRequest {
            challenge: r.array::<CHALLENGE_LEN>()?,
            now_ms: r.i64()?,
            max_jobs: r.u16()?,
            task_capacity: r.u16()?,
        },
        Command::ChallengeResponse => Message::ChallengeResponse {
            response: r.array::<RESPONSE_LEN>()?,
            now_ms: r.i64()?,
        },
        Command::NowConnected => {
            let code = connect_code_from(r.u8()?)?;
            let now_ms = r.i64()?;
            let n = r.u16()?;
            let mut capabilities = Vec::with_capacity(n as usize);
            for _ in 0..n {
                capabilities.push(Capability {
                    kind: kind_from(r.u8()?)?,
                    desc: r.string()?,
                });
            }
            Message::NowConnected {
                code,
                now_ms,
                capabilities,
            }
        }
        Command::TaskRequest => {
            let task_id = r.u64()?;
            let frame = r.i32()?;
            let njobs = r.u16()?;
            let mut jobs = Vec::with_capacity(njobs as usize);
            for _ in 0..njobs {
                jobs.push(read_job(&mut r)?);
            }
            let nfiles = r.u16()?;
            let mut files = Vec::with_capacity(nfiles as usize);
            for _ in 0..nfiles {
                files.push(ManifestEntry {
                    name: r.file_name()?,
                    size: r.u64()?,
                    mtime_ms: r.i64()?,
                });
            }
            Message::TaskRequest(TaskRequest {
                task_id,
                frame,
                jobs,
                files,
            })
        }
        Command::FileRequest => Message::FileRequest {
            task_id: r.u64()?,
            index: r.u16()?,
        },
        Command::FileDownload => Message::FileDownload {
            task_id: r.u64()?,
            index: r.u16()?,
            size: r.u64()?,
        },
        Command::TaskResponse => Message::TaskResponse {
            task_id: r.u64()?,
            code: response_code_from(r.u8()?)?,
        },
        Command::TaskDone => {
            let task_id = r.u64()?;
            let outcome = match r.u8()? {
                0 => DoneOutcome::Processed,
                1 => DoneOutcome::GivenBack,
                other => return Err(invalid("done outcome", other)),
            };
            Message::TaskDone(TaskDone {
                task_id,
                outcome,
                render: read_status(&mut r)?,
                filter: read_status(&mut r)?,
            })
        }
        Command::FileUpload => Message::FileUpload {
            task_id: r.u64()?,
            kind: kind_from(r.u8()?)?,
            size: r.u64()?,
        },
        Command::DoneComplete => Message::DoneComplete { task_id: r.u64()? },
        Command::ControlRequest => {
            let seq = r.u32()?;
            let code = r.u16()?;
            let arg = r.u32()?;
            Message::ControlRequest {
                seq,
                cmd: control_from(code, arg)?,
            }
        }
        Command::ControlResponse => {
            let seq = r.u32()?;
            let code = r.u16()?;
            let arg = r.u32()?;
            Message::ControlResponse {
                seq,
                cmd: control_from(code, arg)?,
                status: control_status_from(r.u8()?)?,
                a: r.u32()?,
                b: r.u32()?,
            }
        }
    };

    r.finish()?;
    Ok(msg)
}

/* --------- Escritura --------- */

fn put_str(b: &mut BytesMut, s: &str, field: &'static str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| invalid(field, s.len() as u64))?;
    b.put_u16(len);
    b.put_slice(s.as_bytes());
    Ok(())
}

fn put_count(b: &mut BytesMut, n: usize, field: &'static str) -> Result<()> {
    let n = u16::try_from(n).map_err(|_| invalid(field, n as u64))?;
    b.put_u16(n);
    Ok(())
}

fn put_status(b: &mut BytesMut, st: Option<&ExecStatus>) {
    let Some(st) = st else {
        b.put_u8(0);
        return;
    };
    b.put_u8(1);
    b.put_u8(reason_to(st.reason));
    b.put_i32(st.code);
    b.put_i64(datetime_to_ms(st.started_at));
    b.put_i64(datetime_to_ms(st.ended_at));
    b.put_u64(st.cpu_time.as_millis() as u64);
    b.put_u8(output_to(st.output));
}

fn put_job(b: &mut BytesMut, job: &JobRequest) -> Result<()> {
    b.put_u8(kind_to(job.kind));
    put_str(b, &job.desc, "desc")?;
    put_str(b, &job.input, "input")?;
    put_str(b, &job.output, "output")?;
    put_str(b, &job.format, "format")?;
    b.put_u32(job.timeout_ms);
    put_count(b, job.args.len(), "args")?;
    for a in &job.args {
        put_str(b, a, "args")?;
    }
    put_count(b, job.additional.len(), "additional")?;
    for a in &job.additional {
        put_str(b, a, "additional")?;
    }
    Ok(())
}

/// Serializa un mensaje completo (header incluido).
pub fn encode(msg: &Message) -> Result<Bytes> {
    let mut b = BytesMut::with_capacity(64);
    b.put_u32(0); // se completa al final
    b.put_u16(msg.command() as u16);

    match msg {
        Message::ChallengeRequest {
            challenge,
            now_ms,
            max_jobs,
            task_capacity,
        } => {
            b.put_slice(challenge);
            b.put_i64(*now_ms);
            b.put_u16(*max_jobs);
            b.put_u16(*task_capacity);
        }
        Message::ChallengeResponse { response, now_ms } => {
            b.put_slice(response);
            b.put_i64(*now_ms);
        }
        Message::NowConnected {
            code,
            now_ms,
            capabilities,
        } => {
            b.put_u8(connect_code_to(*code));
            b.put_i64(*now_ms);
            put_count(&mut b, capabilities.len(), "capabilities")?;
            for cap in capabilities {
                b.put_u8(kind_to(cap.kind));
                put_str(&mut b, &cap.desc, "capability")?;
            }
        }
        Message::TaskRequest(req) => {
            b.put_u64(req.task_id);
            b.put_i32(req.frame);
            put_count(&mut b, req.jobs.len(), "jobs")?;
            for job in &req.jobs {
                put_job(&mut b, job)?;
            }
            put_count(&mut b, req.files.len(), "files")?;
            for f in &req.files {
                put_str(&mut b, &f.name, "file name")?;
                b.put_u64(f.size);
                b.put_i64(f.mtime_ms);
            }
        }
        Message::FileRequest { task_id, index } => {
            b.put_u64(*task_id);
            b.put_u16(*index);
        }
        Message::FileDownload {
            task_id,
            index,
            size,
        } => {
            b.put_u64(*task_id);
            b.put_u16(*index);
            b.put_u64(*size);
        }
        Message::TaskResponse { task_id, code } => {
            b.put_u64(*task_id);
            b.put_u8(response_code_to(*code));
        }
        Message::TaskDone(done) => {
            b.put_u64(done.task_id);
            b.put_u8(match done.outcome {
                DoneOutcome::Processed => 0,
                DoneOutcome::GivenBack => 1,
            });
            put_status(&mut b, done.render.as_ref());
            put_status(&mut b, done.filter.as_ref());
        }
        Message::FileUpload {
            task_id,
            kind,
            size,
        } => {
            b.put_u64(*task_id);
            b.put_u8(kind_to(*kind));
            b.put_u64(*size);
        }
        Message::DoneComplete { task_id } => b.put_u64(*task_id),
        Message::ControlRequest { seq, cmd } => {
            let (code, arg) = control_to(*cmd);
            b.put_u32(*seq);
            b.put_u16(code);
            b.put_u32(arg);
        }
        Message::ControlResponse {
            seq,
            cmd,
            status,
            a,
            b: second,
        } => {
            let (code, arg) = control_to(*cmd);
            b.put_u32(*seq);
            b.put_u16(code);
            b.put_u32(arg);
            b.put_u8(control_status_to(*status));
            b.put_u32(*a);
            b.put_u32(*second);
        }
    }

    let len = b.len();
    if len > MAX_MESSAGE_LEN as usize {
        return Err(ProtocolError::TooLong(
            u32::try_from(len).unwrap_or(u32::MAX),
            MAX_MESSAGE_LEN,
        ));
    }
    b[..4].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(b.freeze())
}

/* --------- I/O async --------- */

/// Lee un mensaje completo. `Ok(None)` si el peer cerró limpio entre mensajes.
pub async fn read_message<R>(r: &mut R, max_len: u32) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = r.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }

    let (len, cmd) = parse_header(header, max_len)?;
    let mut body = vec![0u8; len as usize - HEADER_LEN];
    r.read_exact(&mut body).await?;
    decode(cmd, Bytes::from(body)).map(Some)
}

pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let raw = encode(msg)?;
    w.write_all(&raw).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Message {
        Message::TaskRequest(TaskRequest {
            task_id: 42,
            frame: 7,
            jobs: vec![JobRequest {
                kind: JobKind::Render,
                desc: "blender".into(),
                input: "scene_0007.blend".into(),
                output: "frame_0007.png".into(),
                format: "png".into(),
                timeout_ms: 60_000,
                args: vec!["-a".into()],
                additional: vec!["textures.zip".into()],
            }],
            files: vec![
                ManifestEntry {
                    name: "scene_0007.blend".into(),
                    size: 1234,
                    mtime_ms: 1_700_000_000_000,
                },
                ManifestEntry {
                    name: "textures.zip".into(),
                    size: 99,
                    mtime_ms: 1_700_000_000_001,
                },
            ],
        })
    }

    #[test]
    fn header_cuenta_el_mensaje_completo() {
        let raw = encode(&Message::DoneComplete { task_id: 5 }).unwrap();
        assert_eq!(raw.len(), HEADER_LEN + 8);
        assert_eq!(&raw[..4], &(raw.len() as u32).to_be_bytes());
        assert_eq!(&raw[4..6], &10u16.to_be_bytes());
    }

    #[test]
    fn header_fuera_de_rango_se_rechaza() {
        let mut h = [0u8; HEADER_LEN];
        h[..4].copy_from_slice(&3u32.to_be_bytes());
        h[4..].copy_from_slice(&1u16.to_be_bytes());
        assert!(matches!(parse_header(h, MAX_MESSAGE_LEN), Err(ProtocolError::TooShort(3))));

        h[..4].copy_from_slice(&(MAX_MESSAGE_LEN + 1).to_be_bytes());
        assert!(matches!(parse_header(h, MAX_MESSAGE_LEN), Err(ProtocolError::TooLong(..))));

        h[..4].copy_from_slice(&6u32.to_be_bytes());
        h[4..].copy_from_slice(&99u16.to_be_bytes());
        assert!(matches!(
            parse_header(h, MAX_MESSAGE_LEN),
            Err(ProtocolError::UnknownCommand(99))
        ));
    }

    #[test]
    fn task_request_se_decodifica_igual() {
        let msg = sample_request();
        let raw = encode(&msg).unwrap();
        let decoded = decode(Command::TaskRequest, raw.slice(HEADER_LEN..)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn cuerpo_truncado_o_sobrante_es_error() {
        let raw = encode(&sample_request()).unwrap();
        let short = raw.slice(HEADER_LEN..raw.len() - 3);
        assert!(matches!(
            decode(Command::TaskRequest, short),
            Err(ProtocolError::Truncated("TaskRequest"))
        ));

        let mut long = BytesMut::from(&raw[HEADER_LEN..]);
        long.put_u8(0);
        assert!(matches!(
            decode(Command::TaskRequest, long.freeze()),
            Err(ProtocolError::TrailingBytes("TaskRequest", 1))
        ));
    }

    #[test]
    fn nombre_de_archivo_con_punto_punto_es_ilegal() {
        let Message::TaskRequest(mut req) = sample_request() else {
            unreachable!()
        };
        req.files[0].name = "../etc/passwd".into();
        let raw = encode(&Message::TaskRequest(req)).unwrap();
        assert!(matches!(
            decode(Command::TaskRequest, raw.slice(HEADER_LEN..)),
            Err(ProtocolError::IllegalFileName(_))
        ));
    }

    #[test]
    fn task_done_conserva_estados() {
        let st = ExecStatus {
            reason: TermReason::Exited,
            code: 3,
            started_at: ms_to_datetime(1_700_000_000_000),
            ended_at: ms_to_datetime(1_700_000_005_000),
            cpu_time: Duration::from_millis(4_200),
            output: OutputState::Bad,
        };
        let msg = Message::TaskDone(TaskDone {
            task_id: 9,
            outcome: DoneOutcome::Processed,
            render: Some(st),
            filter: None,
        });
        let raw = encode(&msg).unwrap();
        assert_eq!(decode(Command::TaskDone, raw.slice(HEADER_LEN..)).unwrap(), msg);
    }

    #[test]
    fn control_give_back_lleva_el_argumento() {
        let msg = Message::ControlRequest {
            seq: 17,
            cmd: ControlCmd::GiveBack { keep: 2 },
        };
        let raw = encode(&msg).unwrap();
        assert_eq!(decode(Command::ControlRequest, raw.slice(HEADER_LEN..)).unwrap(), msg);
    }

    #[tokio::test]
    async fn lectura_async_detecta_eof_limpio_y_truncado() {
        let raw = encode(&Message::FileRequest { task_id: 1, index: 0 }).unwrap();

        let mut whole = &raw[..];
        assert_eq!(
            read_message(&mut whole, MAX_MESSAGE_LEN).await.unwrap(),
            Some(Message::FileRequest { task_id: 1, index: 0 })
        );
        assert_eq!(read_message(&mut whole, MAX_MESSAGE_LEN).await.unwrap(), None);

        let mut cut = &raw[..raw.len() - 1];
        assert!(read_message(&mut cut, MAX_MESSAGE_LEN).await.is_err());
    }
}
