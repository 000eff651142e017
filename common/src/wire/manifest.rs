//! Nombres de archivo en el cable y la decisión de "ya lo tengo".

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use crate::clock::{system_time_to_ms, ClockSkew};
use crate::error::ProtocolError;
use crate::files::FixedState;

use super::message::ManifestEntry;

/// Un nombre del manifiesto tiene que ser una ruta relativa sin `..`, saltos
/// de línea ni NUL: el worker lo resuelve dentro de su directorio de trabajo.
pub fn validate_file_name(name: &str) -> Result<(), ProtocolError> {
    let illegal = || ProtocolError::IllegalFileName(name.to_string());

    if name.is_empty() || name.contains(['\n', '\r', '\0']) {
        return Err(illegal());
    }
    let path = Path::new(name);
    if path.is_absolute() || name.starts_with('/') || name.starts_with('\\') {
        return Err(illegal());
    }
    for c in path.components() {
        match c {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(illegal()),
        }
    }
    Ok(())
}

/// Nombre con el que viaja `path`: la propia ruta si ya es un nombre válido,
/// si no el último componente.
pub fn wire_name(path: &Path) -> Option<String> {
    let raw = path.to_str()?;
    if validate_file_name(raw).is_ok() {
        return Some(raw.to_string());
    }
    let name = path.file_name()?.to_str()?;
    validate_file_name(name).ok()?;
    Some(name.to_string())
}

/// Nombres asignados en la vida de un dispatcher. Cada ruta conserva siempre
/// el mismo nombre y dos rutas distintas nunca comparten uno, así la caché del
/// worker no confunde `/a/tex.png` con `/b/tex.png`.
#[derive(Debug, Default)]
pub struct WireNames {
    by_path: HashMap<PathBuf, String>,
    taken: HashSet<String>,
}

impl WireNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nombre para `path`; `None` si no tiene ningún nombre transmisible.
    pub fn name_for(&mut self, path: &Path) -> Option<String> {
        if let Some(name) = self.by_path.get(path) {
            return Some(name.clone());
        }
        let base = wire_name(path)?;
        let mut name = base.clone();
        let mut n = 2;
        while self.taken.contains(&name) {
            name = disambiguate(&base, n);
            n += 1;
        }
        self.taken.insert(name.clone());
        self.by_path.insert(path.to_path_buf(), name.clone());
        Some(name)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

/// `dir/tex.png` → `dir/2-tex.png`: el prefijo va en el último componente para
/// no tocar la extensión.
fn disambiguate(base: &str, n: u32) -> String {
    match base.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/{n}-{file}"),
        None => format!("{n}-{base}"),
    }
}

/// `true` si hay que pedir el archivo. Se saltea cuando la copia local tiene el
/// mismo tamaño y no es más vieja que la del dispatcher (comparando en su reloj).
pub fn needs_transfer(
    local: Option<FixedState>,
    entry: &ManifestEntry,
    skew: &ClockSkew,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    let Some(local) = local else {
        return true;
    };
    if local.size != entry.size {
        return true;
    }
    skew.local_to_remote(system_time_to_ms(local.mtime)) < entry.mtime_ms
}
