//! Tareas de I/O de una conexión.
//!
//! Cada conexión tiene una tarea lectora y una escritora; ninguna toca las
//! colas del scheduler. Hablan con el runtime por canales: el runtime manda
//! [`LinkCommand`]s y recibe [`LinkEvent`]s.
//!
//! Después de un mensaje que trae cuerpo (`FileDownload` / `FileUpload`) el
//! lector se detiene hasta que el runtime le diga dónde poner esos bytes
//! ([`LinkHandle::receive_body`]). Así nunca se intercala otro mensaje entre
//! un header de archivo y su cuerpo.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::files::FileHandle;
use crate::task::ConnId;

use super::codec;
use super::message::Message;

const CHUNK: usize = 64 * 1024;

#[derive(Debug)]
pub enum LinkCommand {
    Send(Message),
    /// Header + exactamente `size` bytes de `path`. `hold` mantiene vivo el
    /// archivo hasta que terminó de salir.
    SendFile {
        header: Message,
        path: PathBuf,
        size: u64,
        hold: Option<FileHandle>,
    },
    Close,
}

/// Destino del cuerpo de archivo que acaba de anunciarse.
#[derive(Debug)]
pub enum BodySink {
    File { path: PathBuf, mtime: Option<SystemTime> },
    Discard,
}

#[derive(Debug)]
pub enum LinkEvent {
    Message(Message),
    /// Terminó de llegar un cuerpo. `error` si no se pudo guardar (los bytes se
    /// consumieron igual y la conexión sigue sana).
    BodyReceived { size: u64, error: Option<String> },
    /// Se emite una sola vez. `None` = cierre limpio.
    Closed(Option<ProtocolError>),
}

struct Activity {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = self.epoch + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }
}

/// Lado del runtime de una conexión. Clonarlo es barato.
#[derive(Clone)]
pub struct LinkHandle {
    id: ConnId,
    peer: String,
    cmd_tx: mpsc::UnboundedSender<LinkCommand>,
    sink_tx: mpsc::UnboundedSender<BodySink>,
    activity: Arc<Activity>,
    reader: AbortHandle,
}

impl LinkHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// `false` si la conexión ya está cerrada.
    pub fn send(&self, msg: Message) -> bool {
        self.cmd_tx.send(LinkCommand::Send(msg)).is_ok()
    }

    pub fn send_file(&self, header: Message, path: PathBuf, size: u64, hold: Option<FileHandle>) -> bool {
        self.cmd_tx
            .send(LinkCommand::SendFile {
                header,
                path,
                size,
                hold,
            })
            .is_ok()
    }

    /// Hay que llamarlo exactamente una vez por cada mensaje con cuerpo recibido.
    pub fn receive_body(&self, sink: BodySink) {
        let _ = self.sink_tx.send(sink);
    }

    pub fn close(&self) {
        if self.cmd_tx.send(LinkCommand::Close).is_err() {
            self.reader.abort();
        }
    }

    /// Tiempo sin tráfico en ningún sentido.
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.activity.idle_for(now)
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Emite `Closed` una sola vez aunque lector y escritor mueran a la vez.
struct Notifier<T, F> {
    id: ConnId,
    tx: mpsc::UnboundedSender<T>,
    wrap: F,
    closed: AtomicBool,
}

impl<T, F> Notifier<T, F>
where
    F: Fn(ConnId, LinkEvent) -> T,
{
    fn emit(&self, ev: LinkEvent) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send((self.wrap)(self.id, ev)).is_ok()
    }

    fn closed(&self, err: Option<ProtocolError>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send((self.wrap)(self.id, LinkEvent::Closed(err)));
        }
    }
}

/// Arranca lector y escritor sobre `stream`. Los eventos llegan a `tx`
/// envueltos con `wrap` (así cada runtime los mete en su propio enum de I/O).
/// El `JoinHandle` es el del escritor: termina cuando salió todo lo encolado
/// antes del `Close`.
pub fn spawn_link<S, T, F>(
    id: ConnId,
    stream: S,
    peer: String,
    max_len: u32,
    tx: mpsc::UnboundedSender<T>,
    wrap: F,
) -> (LinkHandle, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    T: Send + 'static,
    F: Fn(ConnId, LinkEvent) -> T + Send + Sync + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();

    let activity = Arc::new(Activity {
        epoch: Instant::now(),
        last_ms: AtomicU64::new(0),
    });
    let notifier = Arc::new(Notifier {
        id,
        tx,
        wrap,
        closed: AtomicBool::new(false),
    });

    let reader = tokio::spawn(read_loop(
        rd,
        max_len,
        sink_rx,
        Arc::clone(&activity),
        Arc::clone(&notifier),
    ))
    .abort_handle();

    let writer = tokio::spawn(write_loop(
        wr,
        cmd_rx,
        Arc::clone(&activity),
        notifier,
        reader.clone(),
    ));

    debug!("conexión {} con {} abierta", id, peer);
    let handle = LinkHandle {
        id,
        peer,
        cmd_tx,
        sink_tx,
        activity,
        reader,
    };
    (handle, writer)
}

/* --------- Lectura --------- */

async fn read_loop<S, T, F>(
    mut rd: ReadHalf<S>,
    max_len: u32,
    mut sink_rx: mpsc::UnboundedReceiver<BodySink>,
    activity: Arc<Activity>,
    notifier: Arc<Notifier<T, F>>,
) where
    S: AsyncRead + AsyncWrite,
    F: Fn(ConnId, LinkEvent) -> T,
{
    loop {
        let msg = match codec::read_message(&mut rd, max_len).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return notifier.closed(None),
            Err(e) => return notifier.closed(Some(e)),
        };
        activity.touch();

        let body = msg.body_len();
        if !notifier.emit(LinkEvent::Message(msg)) {
            return;
        }
        let Some(size) = body else { continue };

        // 1) esperar a que el runtime diga dónde va el cuerpo
        let Some(sink) = sink_rx.recv().await else {
            return;
        };

        // 2) consumirlo entero
        match receive_body(&mut rd, size, sink, &activity).await {
            Ok(error) => {
                if !notifier.emit(LinkEvent::BodyReceived { size, error }) {
                    return;
                }
            }
            Err(e) => return notifier.closed(Some(e)),
        }
    }
}

/// Lee `size` bytes del socket. Error de socket = `Err` (se cierra la conexión);
/// error de disco = `Ok(Some(..))`, y el resto del cuerpo se descarta.
async fn receive_body<R>(
    rd: &mut R,
    size: u64,
    sink: BodySink,
    activity: &Activity,
) -> Result<Option<String>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let (mut file, path, mtime) = match sink {
        BodySink::File { path, mtime } => match File::create(&path).await {
            Ok(f) => (Some(f), Some(path), mtime),
            Err(e) => {
                warn!("no se pudo crear {}: {}", path.display(), e);
                (None, Some(path), None)
            }
        },
        BodySink::Discard => (None, None, None),
    };
    let mut error = match (&file, &path) {
        (None, Some(p)) => Some(format!("no se pudo crear {}", p.display())),
        _ => None,
    };

    let mut buf = vec![0u8; CHUNK];
    let mut left = size;
    while left > 0 {
        let want = left.min(CHUNK as u64) as usize;
        let n = rd.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        activity.touch();
        left -= n as u64;

        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(&buf[..n]).await {
                error = Some(format!("error escribiendo: {e}"));
                file = None;
            }
        }
    }

    if let (Some(mut f), Some(path)) = (file, path) {
        if let Err(e) = f.flush().await {
            return Ok(Some(format!("error escribiendo {}: {e}", path.display())));
        }
        if let Some(t) = mtime {
            let std_file = f.into_std().await;
            if let Err(e) = std_file.set_modified(t) {
                warn!("no se pudo fijar mtime de {}: {}", path.display(), e);
            }
        }
    }
    Ok(error)
}

/* --------- Escritura --------- */

async fn write_loop<S, T, F>(
    mut wr: WriteHalf<S>,
    mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
    activity: Arc<Activity>,
    notifier: Arc<Notifier<T, F>>,
    reader: AbortHandle,
) where
    S: AsyncRead + AsyncWrite,
    F: Fn(ConnId, LinkEvent) -> T,
{
    let mut result = Ok(());
    while let Some(cmd) = cmd_rx.recv().await {
        let step = match cmd {
            LinkCommand::Send(msg) => codec::write_message(&mut wr, &msg).await,
            LinkCommand::SendFile {
                header,
                path,
                size,
                hold,
            } => {
                let r = send_file(&mut wr, &header, &path, size, &activity).await;
                drop(hold);
                r
            }
            LinkCommand::Close => break,
        };
        activity.touch();
        if let Err(e) = step {
            result = Err(e);
            break;
        }
    }

    let _ = wr.shutdown().await;
    reader.abort();
    notifier.closed(result.err());
}

async fn send_file<W>(
    wr: &mut W,
    header: &Message,
    path: &std::path::Path,
    size: u64,
    activity: &Activity,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    // se abre antes de mandar el header: una vez anunciado el tamaño no hay vuelta atrás
    let file = File::open(path).await?;
    codec::write_message(wr, header).await?;

    let mut src = file.take(size);
    let mut buf = vec![0u8; CHUNK];
    let mut sent = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        wr.write_all(&buf[..n]).await?;
        activity.touch();
        sent += n as u64;
    }
    wr.flush().await?;

    if sent != size {
        return Err(ProtocolError::ShortBody {
            expected: size,
            got: sent,
        });
    }
    Ok(())
}
