//! # Scope / authorization
//!
//! Per-operation scope functions produce a [`CompiledScope`] — a filter the
//! pipeline composes with caller-supplied filters via AND. Three
//! distinguished values: `Empty` (matches nothing, forbidden), `All` (the
//! `*` sentinel, elided from the composed filter) and an ordinary compiled
//! filter.
//!
//! Composition rule for operation `Op` with caller filter `F` and scope `S`:
//! public + anonymous ⇒ `F`; anonymous + non-public ⇒ 401; `S = Empty` ⇒
//! 403; otherwise `S ∧ F` with `All` absorbing.

pub mod builder;

use std::sync::Arc;

use crate::error::ApiError;
use crate::filter::{CompiledFilter, FilterError};
use crate::models::{Operation, RequestContext, UserContext};

#[derive(Debug, Clone)]
pub enum CompiledScope {
    /// Matches everything; elided from the composed filter.
    All,
    /// Matches nothing; authenticated but no access.
    Empty,
    Filter(Arc<CompiledFilter>),
}

impl CompiledScope {
    pub fn all() -> Self {
        CompiledScope::All
    }

    pub fn empty() -> Self {
        CompiledScope::Empty
    }

    /// Compiles an expression into a scope. The `*` sentinel is accepted
    /// here so string-configured scopes can grant everything.
    pub fn parse(expr: &str) -> Result<Self, FilterError> {
        let trimmed = expr.trim();
        if trimmed == "*" {
            return Ok(CompiledScope::All);
        }
        Ok(CompiledScope::Filter(Arc::new(CompiledFilter::compile(trimmed)?)))
    }

    pub fn from_filter(filter: CompiledFilter) -> Self {
        CompiledScope::Filter(Arc::new(filter))
    }
}

pub type ScopeFn = Arc<dyn Fn(&UserContext) -> CompiledScope + Send + Sync>;

/// Which operations are reachable without authentication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicAccess {
    pub read: bool,
    pub subscribe: bool,
}

impl PublicAccess {
    pub fn none() -> Self {
        Self::default()
    }

    /// `public: true` — read & subscribe are unauthenticated.
    pub fn read_and_subscribe() -> Self {
        Self { read: true, subscribe: true }
    }

    fn allows(&self, op: Operation) -> bool {
        match op {
            Operation::Read => self.read,
            Operation::Subscribe => self.subscribe,
            _ => false,
        }
    }
}

#[derive(Clone, Default)]
pub struct ScopeConfig {
    pub public: PublicAccess,
    pub read: Option<ScopeFn>,
    pub create: Option<ScopeFn>,
    pub update: Option<ScopeFn>,
    pub delete: Option<ScopeFn>,
    pub subscribe: Option<ScopeFn>,
    /// Used when the per-operation function is absent.
    pub fallback: Option<ScopeFn>,
}

impl std::fmt::Debug for ScopeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeConfig")
            .field("public", &self.public)
            .field("read", &self.read.is_some())
            .field("create", &self.create.is_some())
            .field("update", &self.update.is_some())
            .field("delete", &self.delete.is_some())
            .field("subscribe", &self.subscribe.is_some())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ScopeConfig {
    pub fn public() -> Self {
        Self { public: PublicAccess::read_and_subscribe(), ..Default::default() }
    }

    fn scope_fn(&self, op: Operation) -> Option<&ScopeFn> {
        let per_op = match op {
            Operation::Read => self.read.as_ref(),
            Operation::Create => self.create.as_ref(),
            Operation::Update => self.update.as_ref(),
            Operation::Delete => self.delete.as_ref(),
            Operation::Subscribe => self.subscribe.as_ref(),
        };
        per_op.or(self.fallback.as_ref())
    }

    /// Resolves the scope filter for this operation, applying the
    /// composition rule. `Ok(None)` means unrestricted.
    pub fn resolve(
        &self,
        op: Operation,
        ctx: &RequestContext,
    ) -> Result<Option<Arc<CompiledFilter>>, ApiError> {
        let user = match &ctx.user {
            Some(user) => user,
            None => {
                return if self.public.allows(op) {
                    Ok(None)
                } else {
                    Err(ApiError::Unauthenticated)
                };
            }
        };
        match self.scope_fn(op) {
            None => Ok(None),
            Some(scope_fn) => match scope_fn(user) {
                CompiledScope::All => Ok(None),
                CompiledScope::Empty => Err(ApiError::Forbidden),
                CompiledScope::Filter(filter) => Ok(Some(filter)),
            },
        }
    }
}

/// `S ∧ F` with `All`/absent absorbing.
pub fn compose(
    scope: Option<Arc<CompiledFilter>>,
    caller: Option<Arc<CompiledFilter>>,
) -> Option<Arc<CompiledFilter>> {
    match (scope, caller) {
        (None, None) => None,
        (Some(s), None) => Some(s),
        (None, Some(f)) => Some(f),
        (Some(s), Some(f)) => Some(Arc::new(s.and(&f))),
    }
}
