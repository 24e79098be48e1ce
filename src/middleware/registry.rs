//! Middleware registry: append-only registrations compiled into cached chains.
//!
//! Writes are serialised through a mutex and only allowed until
//! [`MiddlewareRegistry::freeze`]. Reads (`compile`) never take the lock: the
//! state lives behind an `ArcSwap` and newly compiled chains are published
//! with a compare-and-swap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

use super::chain::{Chain, EntryId, MiddlewareEntry, Role, Scope, Signature};
use super::Middleware;
use crate::error::RegistryError;

struct RegistryState {
    entries: Vec<Arc<MiddlewareEntry>>,
    errors: Arc<[Arc<MiddlewareEntry>]>,
    chains: HashMap<Signature, Arc<Chain>>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            errors: Arc::from(Vec::new()),
            chains: HashMap::new(),
        }
    }
}

/// Accumulates middleware registrations and compiles them per path.
pub struct MiddlewareRegistry {
    state: ArcSwap<RegistryState>,
    frozen: AtomicBool,
    write_lock: Mutex<()>,
}

impl Default for MiddlewareRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MiddlewareRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(RegistryState::default()),
            frozen: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    /// Append an entry named after the handler type.
    pub fn register<M>(&self, handler: M, scope: Scope, role: Role) -> Result<EntryId, RegistryError>
    where
        M: Middleware + 'static,
    {
        let name: Arc<str> = Arc::from(handler.name());
        self.insert(name, Arc::new(handler), scope, role)
    }

    /// Append an entry under an explicit name.
    pub fn register_named<M>(
        &self,
        name: &str,
        handler: M,
        scope: Scope,
        role: Role,
    ) -> Result<EntryId, RegistryError>
    where
        M: Middleware + 'static,
    {
        self.insert(Arc::from(name), Arc::new(handler), scope, role)
    }

    /// Normal entry for every path.
    pub fn use_all<M>(&self, name: &str, handler: M) -> Result<EntryId, RegistryError>
    where
        M: Middleware + 'static,
    {
        self.register_named(name, handler, Scope::All, Role::Normal)
    }

    /// Normal entry for paths under `prefix`.
    pub fn use_prefix<M>(&self, prefix: &str, name: &str, handler: M) -> Result<EntryId, RegistryError>
    where
        M: Middleware + 'static,
    {
        if !prefix.starts_with('/') {
            return Err(RegistryError::InvalidPrefix(prefix.to_string()));
        }
        self.register_named(name, handler, Scope::prefix(prefix), Role::Normal)
    }

    /// Error-handling entry (always global).
    pub fn use_error<M>(&self, name: &str, handler: M) -> Result<EntryId, RegistryError>
    where
        M: Middleware + 'static,
    {
        self.register_named(name, handler, Scope::All, Role::ErrorHandler)
    }

    fn insert(
        &self,
        name: Arc<str>,
        handler: Arc<dyn Middleware>,
        scope: Scope,
        role: Role,
    ) -> Result<EntryId, RegistryError> {
        if let Scope::Prefix(p) = &scope {
            if !p.starts_with('/') {
                return Err(RegistryError::InvalidPrefix(p.to_string()));
            }
            if role == Role::ErrorHandler {
                return Err(RegistryError::ScopedErrorHandler(p.to_string()));
            }
        }

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.frozen.load(Ordering::Acquire) {
            warn!(entry = %name, "Registration rejected - registry is frozen");
            return Err(RegistryError::Frozen);
        }

        let current = self.state.load_full();
        let id = current.entries.len() as EntryId;
        let entry = Arc::new(MiddlewareEntry {
            id,
            name: Arc::clone(&name),
            scope,
            role,
            handler,
        });

        let mut entries = current.entries.clone();
        entries.push(Arc::clone(&entry));
        let errors: Arc<[Arc<MiddlewareEntry>]> = entries
            .iter()
            .filter(|e| e.role == Role::ErrorHandler)
            .cloned()
            .collect();

        // New registrations invalidate every cached chain.
        self.state.store(Arc::new(RegistryState {
            entries,
            errors,
            chains: HashMap::new(),
        }));

        info!(
            entry = %name,
            entry_id = id,
            role = ?role,
            scope = ?entry.scope,
            "Middleware registered"
        );
        Ok(id)
    }

    /// Close the registry for writes. Idempotent.
    pub fn freeze(&self) {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !self.frozen.swap(true, Ordering::AcqRel) {
            let state = self.state.load();
            info!(
                entries = state.entries.len(),
                error_handlers = state.errors.len(),
                "Middleware registry frozen"
            );
        }
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Number of registered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.load().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct chains currently cached.
    #[must_use]
    pub fn cached_chains(&self) -> usize {
        self.state.load().chains.len()
    }

    /// Chain for `path`: matching normal entries in registration order, then
    /// all error handlers in registration order.
    ///
    /// The query string, if any, is ignored. Results are cached per
    /// signature, so `/api/a` and `/api/b` share one chain.
    #[must_use]
    pub fn compile(&self, path: &str) -> Arc<Chain> {
        let path = path.split('?').next().unwrap_or("/");
        let snapshot = self.state.load_full();

        let signature: Signature = snapshot
            .entries
            .iter()
            .filter(|e| e.role == Role::Normal && e.scope.matches(path))
            .map(|e| e.id)
            .collect();

        if let Some(chain) = snapshot.chains.get(&signature) {
            return Arc::clone(chain);
        }

        let normal = signature
            .iter()
            .filter_map(|id| snapshot.entries.get(*id as usize).cloned())
            .collect();
        let chain = Arc::new(Chain::new(
            signature.clone(),
            normal,
            Arc::clone(&snapshot.errors),
        ));

        debug!(
            path = %path,
            normal_entries = chain.normal_len(),
            error_entries = chain.error_len(),
            "Compiled middleware chain"
        );

        let generation = snapshot.entries.len();
        self.state.rcu(|current| {
            // A registration raced us; the chain belongs to an older generation.
            if current.entries.len() != generation || current.chains.contains_key(&signature) {
                return Arc::clone(current);
            }
            let mut chains = current.chains.clone();
            chains.insert(signature.clone(), Arc::clone(&chain));
            Arc::new(RegistryState {
                entries: current.entries.clone(),
                errors: Arc::clone(&current.errors),
                chains,
            })
        });

        chain
    }
}
