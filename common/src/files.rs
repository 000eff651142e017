//! Registro de archivos con conteo de referencias.
//!
//! Cada ruta se registra una sola vez; las tareas guardan [`FileHandle`]s y el
//! archivo vive mientras alguna tarea lo referencie. Cuando se suelta la última
//! referencia se aplica la política de borrado del archivo.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    RenderInput,
    RenderOutput,
    FilterInput,
    FilterOutput,
    Additional,
}

/// Ordenadas de menos a más "ansiosa": `mark_for_deletion` sólo sube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    Never,
    OnExit,
    OnCycleEnd,
    OnFrameDone,
}

/// Tamaño y mtime recordados mientras hay una transferencia pendiente.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedState {
    pub size: u64,
    pub mtime: SystemTime,
}

#[derive(Debug)]
struct Entry {
    role: FileRole,
    policy: DeletePolicy,
    refs: usize,
    fixed: Option<FixedState>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<PathBuf, Entry>,
}

impl Inner {
    fn release(&mut self, path: &Path) {
        let Some(entry) = self.entries.get_mut(path) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        let policy = entry.policy;
        entry.fixed = None;

        match policy {
            DeletePolicy::Never => {
                self.entries.remove(path);
            }
            DeletePolicy::OnFrameDone => {
                self.entries.remove(path);
                unlink(path);
            }
            // se borran en end_cycle / shutdown
            DeletePolicy::OnExit | DeletePolicy::OnCycleEnd => {}
        }
    }

    fn sweep(&mut self, policies: &[DeletePolicy]) -> usize {
        let doomed: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, e)| e.refs == 0 && policies.contains(&e.policy))
            .map(|(p, _)| p.clone())
            .collect();

        for path in &doomed {
            self.entries.remove(path);
            unlink(path);
        }
        doomed.len()
    }
}

fn unlink(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("archivo borrado: {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("no se pudo borrar {}: {}", path.display(), e),
    }
}

#[derive(Clone, Default)]
pub struct FileRegistry {
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devuelve un handle para `path`, creando la entrada si no existe.
    /// Si ya existía se conserva el rol con el que se registró primero.
    pub fn get_or_create(&self, path: impl Into<PathBuf>, role: FileRole) -> FileHandle {
        let path = path.into();
        let mut inner = lock(&self.inner);
        let entry = inner.entries.entry(path.clone()).or_insert(Entry {
            role,
            policy: DeletePolicy::Never,
            refs: 0,
            fixed: None,
        });
        entry.refs += 1;

        FileHandle {
            registry: Arc::clone(&self.inner),
            path: Arc::new(path),
        }
    }

    /// Archivos con al menos una referencia viva.
    pub fn live_count(&self) -> usize {
        lock(&self.inner).entries.values().filter(|e| e.refs > 0).count()
    }

    pub fn refs(&self, path: &Path) -> usize {
        lock(&self.inner).entries.get(path).map_or(0, |e| e.refs)
    }

    /// Fin de ciclo: borra los archivos `OnCycleEnd` que ya nadie usa.
    pub fn end_cycle(&self) -> usize {
        lock(&self.inner).sweep(&[DeletePolicy::OnCycleEnd])
    }

    /// Salida del proceso: borra todo lo `OnExit`/`OnCycleEnd` sin referencias.
    pub fn shutdown(&self) -> usize {
        lock(&self.inner).sweep(&[DeletePolicy::OnCycleEnd, DeletePolicy::OnExit])
    }
}

/// Referencia a un archivo registrado. Clonar suma una referencia, soltar la resta.
pub struct FileHandle {
    registry: Arc<Mutex<Inner>>,
    path: Arc<PathBuf>,
}

impl FileHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> FileRole {
        lock(&self.registry)
            .entries
            .get(self.path.as_path())
            .map_or(FileRole::Additional, |e| e.role)
    }

    pub fn policy(&self) -> DeletePolicy {
        lock(&self.registry)
            .entries
            .get(self.path.as_path())
            .map_or(DeletePolicy::Never, |e| e.policy)
    }

    /// Sube la política de borrado; nunca la relaja.
    pub fn mark_for_deletion(&self, policy: DeletePolicy) {
        if let Some(e) = lock(&self.registry).entries.get_mut(self.path.as_path()) {
            if policy > e.policy {
                e.policy = policy;
            }
        }
    }

    pub fn set_fixed_state(&self, size: u64, mtime: SystemTime) {
        if let Some(e) = lock(&self.registry).entries.get_mut(self.path.as_path()) {
            e.fixed = Some(FixedState { size, mtime });
        }
    }

    pub fn clear_fixed_state(&self) {
        if let Some(e) = lock(&self.registry).entries.get_mut(self.path.as_path()) {
            e.fixed = None;
        }
    }

    pub fn fixed_state(&self) -> Option<FixedState> {
        lock(&self.registry)
            .entries
            .get(self.path.as_path())
            .and_then(|e| e.fixed)
    }

    /// Tamaño y mtime: los recordados si hay transferencia pendiente, si no los del disco.
    pub fn stat(&self) -> io::Result<FixedState> {
        if let Some(fixed) = self.fixed_state() {
            return Ok(fixed);
        }
        let meta = std::fs::metadata(self.path.as_path())?;
        Ok(FixedState {
            size: meta.len(),
            mtime: meta.modified()?,
        })
    }
}

impl Clone for FileHandle {
    fn clone(&self) -> Self {
        if let Some(e) = lock(&self.registry).entries.get_mut(self.path.as_path()) {
            e.refs += 1;
        }
        Self {
            registry: Arc::clone(&self.registry),
            path: Arc::clone(&self.path),
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        lock(&self.registry).release(&self.path);
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileHandle").field(&self.path).finish()
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}
