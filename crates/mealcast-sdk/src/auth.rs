// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Principal lookup.
//!
//! There is no process-wide token cache: the signed-in principal lives in an
//! [`AuthContext`] that is created at login, passed to whoever needs it, and
//! invalidated at logout.

use std::sync::{Arc, RwLock};

use tracing::info;

use crate::types::Principal;

/// Source of the current principal.
///
/// Returning `None` means nobody is signed in: submissions fail with
/// `Unauthenticated` and result streams cannot be subscribed.
pub trait PrincipalProvider: Send + Sync {
    fn principal(&self) -> Option<Principal>;
}

/// Shared, explicitly scoped login state.
///
/// Clones observe the same login: logging out through one clone signs out all
/// of them.
#[derive(Clone, Default)]
pub struct AuthContext {
    inner: Arc<RwLock<Option<Principal>>>,
}

impl AuthContext {
    /// A context with nobody signed in.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// A context with `owner_id` signed in.
    pub fn login(owner_id: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        let ctx = Self::default();
        ctx.sign_in(Principal::new(owner_id, bearer_token));
        ctx
    }

    /// Replace the signed-in principal.
    pub fn sign_in(&self, principal: Principal) {
        info!(owner_id = %principal.owner_id, "Principal signed in");
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(principal);
    }

    /// Invalidate the current login.
    pub fn logout(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.take() {
            info!(owner_id = %previous.owner_id, "Principal signed out");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl PrincipalProvider for AuthContext {
    fn principal(&self) -> Option<Principal> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("principal", &self.principal())
            .finish()
    }
}

/// A fixed principal, handy for tools and tests.
impl PrincipalProvider for Principal {
    fn principal(&self) -> Option<Principal> {
        Some(self.clone())
    }
}
