//! Proxy registry: placeholder references for deferred entities.
//!
//! A [`Proxy`] is a cheap identity stub. Its state lives in the
//! [`ProxyRegistry`] arena owned by the session, together with the handle
//! of the batch cohort it was created in. Reading the state never triggers
//! a load; `Session::initialize` and `Session::access` do.

use crate::batch::CohortId;
use crate::identity_map::ObjectKey;
use batchfetch_core::{Error, Model, Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Arena slot of a proxy, qualified by the registry epoch that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId {
    epoch: u64,
    index: usize,
}

/// Initialization state of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Not read from storage yet.
    Uninitialized,
    /// A batch statement covering this proxy is in flight.
    Initializing,
    /// Bound to the instance in the identity map.
    Initialized,
    /// The batch statement returned no row for this identity.
    NotFound,
}

/// Placeholder reference to an entity of type `M`.
pub struct Proxy<M> {
    id: ProxyId,
    pk: Value,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Proxy<M> {
    /// Arena handle.
    pub fn id(&self) -> ProxyId {
        self.id
    }

    /// Primary key this proxy stands for.
    pub fn pk(&self) -> &Value {
        &self.pk
    }
}

impl<M> Clone for Proxy<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            pk: self.pk.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M> PartialEq for Proxy<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<M> Eq for Proxy<M> {}

impl<M> fmt::Debug for Proxy<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("model", &std::any::type_name::<M>())
            .field("pk", &self.pk)
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Debug)]
struct ProxyEntry {
    pk: Value,
    entity: &'static str,
    cohort: Option<CohortId>,
    state: ProxyState,
}

/// Arena of proxy entries with one entry per identity.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    entries: Vec<ProxyEntry>,
    // Entries sharing a key hash; matched by primary key.
    by_key: HashMap<ObjectKey, Vec<usize>>,
    epoch: u64,
}

impl ProxyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing proxy for an identity, if one was issued.
    pub fn existing<M: Model>(&self, pk: &Value) -> Option<Proxy<M>> {
        let key = ObjectKey::from_pk::<M>(std::slice::from_ref(pk));
        self.find(&key, pk).map(|index| self.handle(index))
    }

    fn find(&self, key: &ObjectKey, pk: &Value) -> Option<usize> {
        self.by_key
            .get(key)?
            .iter()
            .copied()
            .find(|index| self.entries[*index].pk.same_key(pk))
    }

    /// Create a proxy for `pk`, or return the one already issued.
    ///
    /// The second element is `true` when a new entry was created. A new
    /// entry starts `Initialized` if the identity is already materialized.
    pub fn create_proxy<M: Model>(
        &mut self,
        pk: Value,
        cohort: Option<CohortId>,
        materialized: bool,
    ) -> (Proxy<M>, bool) {
        let key = ObjectKey::from_pk::<M>(std::slice::from_ref(&pk));
        self.create_keyed(key, pk, M::TABLE_NAME, cohort, materialized)
    }

    fn create_keyed<M>(
        &mut self,
        key: ObjectKey,
        pk: Value,
        entity: &'static str,
        cohort: Option<CohortId>,
        materialized: bool,
    ) -> (Proxy<M>, bool) {
        if let Some(index) = self.find(&key, &pk) {
            return (self.handle(index), false);
        }

        let index = self.entries.len();
        self.entries.push(ProxyEntry {
            pk,
            entity,
            cohort: if materialized { None } else { cohort },
            state: if materialized {
                ProxyState::Initialized
            } else {
                ProxyState::Uninitialized
            },
        });
        self.by_key.entry(key).or_default().push(index);
        (self.handle(index), true)
    }

    fn handle<M>(&self, index: usize) -> Proxy<M> {
        Proxy {
            id: ProxyId {
                epoch: self.epoch,
                index,
            },
            pk: self.entries[index].pk.clone(),
            _marker: PhantomData,
        }
    }

    #[allow(clippy::result_large_err)]
    fn entry(&self, id: ProxyId) -> Result<&ProxyEntry> {
        if id.epoch != self.epoch {
            return Err(Error::detached_proxy(
                "proxy was issued before the session was cleared",
            ));
        }
        self.entries
            .get(id.index)
            .ok_or_else(|| Error::detached_proxy("proxy does not belong to this session"))
    }

    #[allow(clippy::result_large_err)]
    fn entry_mut(&mut self, id: ProxyId) -> Result<&mut ProxyEntry> {
        self.entry(id)?;
        Ok(&mut self.entries[id.index])
    }

    /// Current state of a proxy.
    #[allow(clippy::result_large_err)]
    pub fn state(&self, id: ProxyId) -> Result<ProxyState> {
        self.entry(id).map(|e| e.state)
    }

    /// Whether the proxy is bound to an instance. Never triggers a load.
    #[allow(clippy::result_large_err)]
    pub fn is_initialized(&self, id: ProxyId) -> Result<bool> {
        Ok(self.state(id)? == ProxyState::Initialized)
    }

    #[allow(clippy::result_large_err)]
    pub fn set_state(&mut self, id: ProxyId, state: ProxyState) -> Result<()> {
        let entry = self.entry_mut(id)?;
        tracing::trace!(
            entity = entry.entity,
            pk = ?entry.pk,
            from = ?entry.state,
            to = ?state,
            "Proxy state change"
        );
        entry.state = state;
        Ok(())
    }

    /// Cohort the proxy was created in, if it is still pending.
    #[allow(clippy::result_large_err)]
    pub fn cohort_of(&self, id: ProxyId) -> Result<Option<CohortId>> {
        self.entry(id).map(|e| e.cohort)
    }

    /// Primary key of a proxy.
    #[allow(clippy::result_large_err)]
    pub fn pk_of(&self, id: ProxyId) -> Result<&Value> {
        self.entry(id).map(|e| &e.pk)
    }

    /// Drop every entry. Handles issued before the call become detached.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_key.clear();
        self.epoch += 1;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
