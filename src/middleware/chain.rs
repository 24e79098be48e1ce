use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::Middleware;

/// Registration order of an entry (its position in the registry).
pub type EntryId = u32;

/// Positions of the normal entries a path matches; identifies a chain.
pub type Signature = SmallVec<[EntryId; 16]>;

/// Which paths an entry applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    /// Segment-aware prefix: `/api` matches `/api` and `/api/x`, not `/apix`.
    Prefix(Arc<str>),
}

impl Scope {
    /// Prefix scope; trailing slashes are dropped (`/api/` == `/api`).
    #[must_use]
    pub fn prefix(prefix: &str) -> Self {
        let trimmed = prefix.trim_end_matches('/');
        if trimmed.is_empty() {
            Scope::Prefix(Arc::from("/"))
        } else {
            Scope::Prefix(Arc::from(trimmed))
        }
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Prefix(p) if p.as_ref() == "/" => true,
            Scope::Prefix(p) => match path.strip_prefix(p.as_ref()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }
}

/// Whether an entry runs in the normal or the error-handling segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Normal,
    ErrorHandler,
}

/// A registered handler with its scope, position and role. Immutable.
pub struct MiddlewareEntry {
    pub id: EntryId,
    pub name: Arc<str>,
    pub scope: Scope,
    pub role: Role,
    pub handler: Arc<dyn Middleware>,
}

impl fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("role", &self.role)
            .finish()
    }
}

/// The compiled, ordered entries for one path-scope signature.
///
/// Normal entries come first in registration order, followed by every
/// error-handling entry in registration order. Never mutated after
/// construction.
#[derive(Debug)]
pub struct Chain {
    signature: Signature,
    normal: Vec<Arc<MiddlewareEntry>>,
    errors: Arc<[Arc<MiddlewareEntry>]>,
}

impl Chain {
    pub(crate) fn new(
        signature: Signature,
        normal: Vec<Arc<MiddlewareEntry>>,
        errors: Arc<[Arc<MiddlewareEntry>]>,
    ) -> Self {
        Self {
            signature,
            normal,
            errors,
        }
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    #[inline]
    #[must_use]
    pub fn normal(&self, idx: usize) -> Option<&Arc<MiddlewareEntry>> {
        self.normal.get(idx)
    }

    #[inline]
    #[must_use]
    pub fn error_handler(&self, idx: usize) -> Option<&Arc<MiddlewareEntry>> {
        self.errors.get(idx)
    }

    #[must_use]
    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    #[must_use]
    pub fn error_len(&self) -> usize {
        self.errors.len()
    }

    /// Entry names in execution order (normal segment, then error segment).
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.normal
            .iter()
            .chain(self.errors.iter())
            .map(|e| e.name.as_ref())
            .collect()
    }
}
