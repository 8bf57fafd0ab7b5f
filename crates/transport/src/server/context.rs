use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use oopjit_common::FailureReason;
use tracing::{debug, info};
use uuid::Uuid;

use crate::process::ProcessHandle;

#[derive(Debug)]
struct ThreadContextEntry {
    owner: Uuid,
    script_contexts: Vec<u64>,
}

#[derive(Debug)]
struct ScriptContextEntry {
    owner: Uuid,
    thread_context_id: u64,
    code_bytes: u64,
}

#[derive(Debug, Default)]
struct ContextTables {
    threads: HashMap<u64, ThreadContextEntry>,
    scripts: HashMap<u64, ScriptContextEntry>,
    /// Client process behind each connection id, as announced in `Hello`.
    clients: HashMap<Uuid, u32>,
}

/// Server-side registry of the contexts each client connection created.
///
/// Every call names the contexts it runs against; a context that was never
/// created, was already closed, or belongs to another connection fails the
/// call with [`FailureReason::InvalidState`].
///
/// Contexts of a client that exits without cleaning up are closed by
/// [`ServerContextManager::reap_exited_clients`].
#[derive(Debug)]
pub struct ServerContextManager {
    tables: Mutex<ContextTables>,
    next_id: AtomicU64,
}

impl Default for ServerContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerContextManager {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(ContextTables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn tables(&self) -> MutexGuard<'_, ContextTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remembers which client process speaks for `owner`.
    pub fn register_client(&self, owner: Uuid, client_pid: u32) {
        self.tables().clients.insert(owner, client_pid);
    }

    pub fn register_thread_context(&self, owner: Uuid) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tables().threads.insert(
            id,
            ThreadContextEntry {
                owner,
                script_contexts: Vec::new(),
            },
        );
        debug!(%owner, thread_context_id = id, "Thread context registered");
        id
    }

    pub fn register_script_context(
        &self,
        owner: Uuid,
        thread_context_id: u64,
    ) -> Result<u64, FailureReason> {
        let mut tables = self.tables();
        let thread = tables
            .threads
            .get_mut(&thread_context_id)
            .filter(|t| t.owner == owner)
            .ok_or(FailureReason::InvalidState)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        thread.script_contexts.push(id);
        tables.scripts.insert(
            id,
            ScriptContextEntry {
                owner,
                thread_context_id,
                code_bytes: 0,
            },
        );
        debug!(%owner, thread_context_id, script_context_id = id, "Script context registered");
        Ok(id)
    }

    /// Liveness check run before every code generation call.
    pub fn check_alive(
        &self,
        owner: Uuid,
        thread_context_id: u64,
        script_context_id: u64,
    ) -> Result<(), FailureReason> {
        let tables = self.tables();
        let thread_alive = tables
            .threads
            .get(&thread_context_id)
            .is_some_and(|t| t.owner == owner);
        let script_alive = tables.scripts.get(&script_context_id).is_some_and(|s| {
            s.owner == owner && s.thread_context_id == thread_context_id
        });
        if thread_alive && script_alive {
            Ok(())
        } else {
            Err(FailureReason::InvalidState)
        }
    }

    /// Adds generated code to the script context's running total.
    pub fn record_code(&self, script_context_id: u64, bytes: u64) {
        if let Some(script) = self.tables().scripts.get_mut(&script_context_id) {
            script.code_bytes = script.code_bytes.saturating_add(bytes);
        }
    }

    pub fn code_bytes(&self, script_context_id: u64) -> Option<u64> {
        self.tables()
            .scripts
            .get(&script_context_id)
            .map(|s| s.code_bytes)
    }

    pub fn close_script_context(
        &self,
        owner: Uuid,
        script_context_id: u64,
    ) -> Result<(), FailureReason> {
        let mut tables = self.tables();
        let script = tables
            .scripts
            .get(&script_context_id)
            .filter(|s| s.owner == owner)
            .ok_or(FailureReason::InvalidState)?;
        let thread_context_id = script.thread_context_id;
        tables.scripts.remove(&script_context_id);
        if let Some(thread) = tables.threads.get_mut(&thread_context_id) {
            thread.script_contexts.retain(|id| *id != script_context_id);
        }
        debug!(%owner, script_context_id, "Script context closed");
        Ok(())
    }

    /// Closes a thread context together with every script context under it.
    pub fn close_thread_context(
        &self,
        owner: Uuid,
        thread_context_id: u64,
    ) -> Result<(), FailureReason> {
        let mut tables = self.tables();
        if !tables
            .threads
            .get(&thread_context_id)
            .is_some_and(|t| t.owner == owner)
        {
            return Err(FailureReason::InvalidState);
        }
        let thread = tables.threads.remove(&thread_context_id);
        for script_context_id in thread.map(|t| t.script_contexts).unwrap_or_default() {
            tables.scripts.remove(&script_context_id);
        }
        debug!(%owner, thread_context_id, "Thread context closed");
        Ok(())
    }

    /// Closes every context owned by a client process that has exited.
    /// Returns the number of thread contexts closed.
    pub fn reap_exited_clients(&self) -> usize {
        let clients: Vec<(Uuid, u32)> = self
            .tables()
            .clients
            .iter()
            .map(|(owner, pid)| (*owner, *pid))
            .collect();
        let exited: HashSet<Uuid> = clients
            .into_iter()
            .filter(|(_, pid)| ProcessHandle::from_pid(*pid).has_exited())
            .map(|(owner, _)| owner)
            .collect();
        if exited.is_empty() {
            return 0;
        }

        let mut tables = self.tables();
        let before = tables.threads.len();
        tables.threads.retain(|_, thread| !exited.contains(&thread.owner));
        tables.scripts.retain(|_, script| !exited.contains(&script.owner));
        tables.clients.retain(|owner, _| !exited.contains(owner));
        let reaped = before.saturating_sub(tables.threads.len());
        if reaped > 0 {
            info!(clients = exited.len(), thread_contexts = reaped, "Reaped contexts of exited clients");
        }
        reaped
    }

    pub fn live_thread_contexts(&self) -> usize {
        self.tables().threads.len()
    }

    pub fn live_script_contexts(&self) -> usize {
        self.tables().scripts.len()
    }
}
