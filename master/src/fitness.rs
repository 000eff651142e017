//! Qué tarea va a qué worker.
//!
//! Preferencia lexicográfica, de mayor a menor peso:
//! 1. el worker puede hacer todas las mitades que le faltan a la tarea
//! 2. el worker está por debajo de su concurrencia anunciada
//! 3. el worker con menos tareas asignadas
//! 4. la tarea más adelante en `todo`
//!
//! Empates: la conexión más vieja.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use common::{ConnId, JobKind, JobMask, Task, TaskId};

use crate::state::WorkerLink;

/// Rechazos recientes: a quién no volver a ofrecerle cada tarea.
pub type Refusals = HashMap<TaskId, HashSet<ConnId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Choice {
    pub task: TaskId,
    pub conn: ConnId,
    pub mask: JobMask,
}

/// Mitades de `task` que se le mandarían a `w`; `None` si no puede la siguiente.
pub fn job_mask_for(task: &Task, w: &WorkerLink) -> Option<JobMask> {
    let next = task.next_kind()?;
    let job = task.job(next)?;
    if !w.can_do(next, &job.desc) {
        return None;
    }
    let mut mask = JobMask::only(next);
    if next == JobKind::Render {
        if let Some(filter) = &task.filter {
            if w.can_do(JobKind::Filter, &filter.desc) {
                mask.set(JobKind::Filter);
            }
        }
    }
    Some(mask)
}

/// Tope de tareas asignadas. En modo ajustado no se encola más allá de la
/// concurrencia: lo que sobra conviene que lo agarre otro.
pub fn assignment_cap(w: &WorkerLink, tight: bool) -> usize {
    if tight {
        w.max_jobs
    } else {
        w.max_jobs + w.capacity
    }
}

/// Puede recibir un TaskRequest ahora (sin mirar la tarea).
pub fn accepts_dispatch(w: &WorkerLink, tight: bool) -> bool {
    w.is_ready()
        && w.dispatch.is_none()
        && !w.no_more_tasks
        && !w.give_back_pending
        && !w.kill_sent
        && w.assigned.len() < assignment_cap(w, tight)
}

pub fn choose<'a>(
    todo: &[&Task],
    workers: impl IntoIterator<Item = &'a WorkerLink>,
    tight: bool,
    refused: &Refusals,
) -> Option<Choice> {
    let workers: Vec<&WorkerLink> = workers
        .into_iter()
        .filter(|w| accepts_dispatch(w, tight))
        .collect();
    if workers.is_empty() {
        return None;
    }

    let mut best: Option<((bool, bool, Reverse<usize>, Reverse<usize>, Reverse<ConnId>), Choice)> = None;

    for (pos, task) in todo.iter().enumerate() {
        let skip = refused.get(&task.id);
        for w in &workers {
            if skip.is_some_and(|s| s.contains(&w.id)) {
                continue;
            }
            let Some(mask) = job_mask_for(task, w) else {
                continue;
            };
            let key = (
                mask.covers(task.pending_kinds()),
                w.assigned.len() < w.max_jobs,
                Reverse(w.assigned.len()),
                Reverse(pos),
                Reverse(w.id),
            );
            if best.as_ref().map_or(true, |(k, _)| key > *k) {
                best = Some((
                    key,
                    Choice {
                        task: task.id,
                        conn: w.id,
                        mask,
                    },
                ));
            }
        }
    }

    best.map(|(_, c)| c)
}

/// Algún worker listo (además de `except`) podría hacer la mitad `kind`/`desc`.
pub fn someone_else_can(
    workers: &BTreeMap<ConnId, WorkerLink>,
    except: Option<ConnId>,
    kind: JobKind,
    desc: &str,
    refused: Option<&HashSet<ConnId>>,
) -> bool {
    workers.values().any(|w| {
        Some(w.id) != except
            && w.is_ready()
            && !refused.is_some_and(|r| r.contains(&w.id))
            && w.can_do(kind, desc)
    })
}

/// Workers a los que pedirles give-back: hay alguno ocioso y ellos tienen
/// más tareas que su concurrencia.
pub fn overloaded(workers: &BTreeMap<ConnId, WorkerLink>) -> Vec<ConnId> {
    let idle = workers
        .values()
        .any(|w| w.is_ready() && w.assigned.is_empty() && !w.no_more_tasks);
    if !idle {
        return Vec::new();
    }
    workers
        .values()
        .filter(|w| w.is_ready() && !w.give_back_pending && w.assigned.len() > w.max_jobs)
        .map(|w| w.id)
        .collect()
}
