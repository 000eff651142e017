use std::time::Duration;

use thiserror::Error;

use crate::wire::ConnectCode;

/// Todo lo que un peer o el transporte pueden hacer mal. Cualquier
/// `ProtocolError` cierra esa conexión (y sólo esa).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("error de I/O en la conexión: {0}")]
    Io(#[from] std::io::Error),

    #[error("mensaje de {0} bytes supera el máximo de {1}")]
    TooLong(u32, u32),

    #[error("mensaje de {0} bytes es más corto que el header")]
    TooShort(u32),

    #[error("comando desconocido: {0}")]
    UnknownCommand(u16),

    #[error("mensaje {0} truncado")]
    Truncated(&'static str),

    #[error("mensaje {0} con {1} bytes sobrantes")]
    TrailingBytes(&'static str, usize),

    #[error("valor inválido en {field}: {value}")]
    InvalidValue { field: &'static str, value: u64 },

    #[error("texto inválido (no UTF-8) en {0}")]
    InvalidUtf8(&'static str),

    #[error("nombre de archivo ilegal: {0:?}")]
    IllegalFileName(String),

    #[error("mensaje {got} fuera de secuencia (estado: {state})")]
    Unexpected { got: &'static str, state: &'static str },

    #[error("respuesta de autenticación inválida")]
    AuthFailed,

    #[error("el peer rechazó la conexión: {0:?}")]
    Denied(ConnectCode),

    #[error("el peer no respondió en {0:?}")]
    Timeout(Duration),

    #[error("cuerpo de archivo incompleto: esperados {expected} bytes, enviados {got}")]
    ShortBody { expected: u64, got: u64 },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no se pudo leer el job {path}: {source}")]
    JobFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("job inválido: {0}")]
    InvalidJob(String),

    #[error("patrón de entrada inválido: {0}")]
    Pattern(String),

    #[error("no se pudo preparar {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
