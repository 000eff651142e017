//! Configuración por variables de entorno.
//!
//! Igual que el resto del sistema: cada valor tiene un default razonable y se
//! puede sobreescribir con una env var (útil en Docker).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::wire::MAX_MESSAGE_LEN;

/// Lee `key` y la parsea; si no está o no parsea usa `default`.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(key, default))
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).as_deref().map(str::trim),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

/// Umbrales del load average para frenar arranques (con histéresis).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadGate {
    pub high: f64,
    pub low: f64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub todo_low: usize,
    pub todo_high: usize,
    pub done_low: usize,
    pub done_high: usize,
    /// 0 = sin límite
    pub max_failed_in_sequence: u32,
    pub load_gate: Option<LoadGate>,
    pub load_check_interval: Duration,
    pub tick_interval: Duration,
    /// Cuánto esperar después de un kill antes de escalar
    pub kill_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            todo_low: 2,
            todo_high: 5,
            done_low: 0,
            done_high: 3,
            max_failed_in_sequence: 5,
            load_gate: None,
            load_check_interval: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let load_gate = match env::var("LOAD_HIGH").ok() {
            Some(raw) => {
                let high: f64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("LOAD_HIGH inválido: {raw:?}"))?;
                let low = env_or("LOAD_LOW", (high - 0.5).max(0.0));
                Some(LoadGate { high, low })
            }
            None => None,
        };

        let cfg = Self {
            todo_low: env_or("TODO_LOW", d.todo_low),
            todo_high: env_or("TODO_HIGH", d.todo_high),
            done_low: env_or("DONE_LOW", d.done_low),
            done_high: env_or("DONE_HIGH", d.done_high),
            max_failed_in_sequence: env_or("MAX_FAILED_IN_SEQUENCE", d.max_failed_in_sequence),
            load_gate,
            load_check_interval: env_secs("LOAD_CHECK_SECS", 5),
            tick_interval: d.tick_interval,
            kill_grace: env_secs("KILL_GRACE_SECS", 10),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.todo_high == 0 {
            bail!("TODO_HIGH tiene que ser al menos 1");
        }
        if self.todo_low > self.todo_high {
            bail!(
                "TODO_LOW ({}) no puede ser mayor que TODO_HIGH ({})",
                self.todo_low,
                self.todo_high
            );
        }
        if self.done_low > self.done_high {
            bail!(
                "DONE_LOW ({}) no puede ser mayor que DONE_HIGH ({})",
                self.done_low,
                self.done_high
            );
        }
        if let Some(gate) = self.load_gate {
            if gate.low > gate.high {
                bail!("LOAD_LOW ({}) no puede ser mayor que LOAD_HIGH ({})", gate.low, gate.high);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub secret: String,
    pub keepalive_interval: Duration,
    pub response_timeout: Duration,
    pub force_redownload: bool,
    pub max_message_len: u32,
}

impl LinkConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            keepalive_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(20),
            force_redownload: false,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    pub fn from_env() -> Result<Self> {
        let secret = env::var("FARM_SECRET").context("falta FARM_SECRET (clave compartida)")?;
        if secret.is_empty() {
            bail!("FARM_SECRET no puede estar vacío");
        }

        Ok(Self {
            keepalive_interval: env_secs("KEEPALIVE_SECS", 30),
            response_timeout: env_secs("RESPONSE_TIMEOUT_SECS", 20),
            force_redownload: env_flag("FORCE_REDOWNLOAD"),
            ..Self::new(secret)
        })
    }
}
