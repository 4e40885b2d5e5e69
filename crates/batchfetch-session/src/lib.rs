//! Session-scoped deferred loading for batchfetch.
//!
//! `batchfetch-session` is the **loading layer**. It hands out placeholder
//! references for entities that have not been read yet and decides how many
//! of them one statement can satisfy.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per primary key.
//! - **Proxies**: cheap handles whose state lives in the session.
//! - **Batch cohorts**: proxies created together are fetched together.
//! - **Subselect descriptors**: collections of an owner group are fetched by
//!   replaying the query that produced the owners.
//! - **Statistics**: statement counters shared by every session of a factory.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(SessionConfig::default().with_statistics(true));
//! let mut session = factory.open_session(conn);
//!
//! // No statement yet
//! let groups = session.load_many::<EmployeeGroup, _>([1_i64, 2])?;
//!
//! // One statement initializes both groups
//! session.initialize(&cx, &groups[0]).await?;
//!
//! // One statement initializes both collections
//! session.initialize_collection(&cx, &groups[0], EMPLOYEES).await?;
//! ```

pub mod batch;
pub mod criteria;
pub mod factory;
pub mod identity_map;
pub mod proxy;
pub mod stats;
pub mod subselect;

pub use batch::{BatchCohort, CohortArena, CohortId};
pub use criteria::Criteria;
pub use factory::SessionFactory;
pub use identity_map::{IdentityMap, ModelReadGuard, ObjectKey, read_model};
pub use proxy::{Proxy, ProxyId, ProxyRegistry, ProxyState};
pub use stats::{Statistics, StatisticsSnapshot};
pub use subselect::{SubselectDescriptor, SubselectRegistry};

use asupersync::{Cx, Outcome};
use batchfetch_core::{
    CollectionInfo, CollectionRole, Connection, Error, FetchMode, Model, ModelRef, NotFoundError,
    Row, Value,
};
use identity_map::hash_values;
use std::any::TypeId;
use std::collections::HashMap;
use std::slice;
use std::sync::Arc;
use subselect::OWNER_PK_ALIAS;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Batch size for models that do not declare one (`Model::BATCH_SIZE == 1`).
    pub default_batch_fetch_size: usize,
    /// Whether statistics are recorded.
    pub generate_statistics: bool,
    /// Whether closing a session logs the statistics summary.
    pub log_statistics_on_close: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_batch_fetch_size: 1,
            generate_statistics: false,
            log_statistics_on_close: false,
        }
    }
}

impl SessionConfig {
    /// Create new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback batch size (builder pattern). Zero is treated as 1.
    #[must_use]
    pub fn with_default_batch_fetch_size(mut self, size: usize) -> Self {
        self.default_batch_fetch_size = size.max(1);
        self
    }

    /// Enable or disable statistics (builder pattern).
    #[must_use]
    pub fn with_statistics(mut self, value: bool) -> Self {
        self.generate_statistics = value;
        self
    }

    /// Log the statistics summary when a session closes (builder pattern).
    #[must_use]
    pub fn with_log_statistics_on_close(mut self, value: bool) -> Self {
        self.log_statistics_on_close = value;
        self
    }
}

#[allow(clippy::result_large_err)]
fn single_pk<M: Model>() -> Result<&'static str, Error> {
    match M::PRIMARY_KEY {
        [column] => Ok(*column),
        _ => Err(Error::composite_key(M::TABLE_NAME)),
    }
}

fn first_pk<M: Model>(model: &ModelRef<M>) -> Value {
    read_model(model)
        .primary_key_value()
        .into_iter()
        .next()
        .unwrap_or(Value::Null)
}

fn owner_collection_initialized<P: Model, C>(owner: &ModelRef<P>, role: &CollectionRole<P, C>) -> bool {
    let guard = read_model(owner);
    role.of(&guard).is_initialized()
}

fn subselect_role_count<P: Model>() -> usize {
    P::COLLECTIONS
        .iter()
        .filter(|info| info.fetch == FetchMode::Subselect)
        .count()
}

// ============================================================================
// Session
// ============================================================================

/// A unit of deferred loading over one connection.
///
/// Proxies, cohorts and subselect descriptors are only meaningful to the
/// session that created them. The session is used by one task at a time;
/// every loading method takes `&mut self`.
pub struct Session<C: Connection> {
    /// The database connection.
    connection: C,
    /// Configuration.
    config: SessionConfig,
    /// Counters shared with the factory.
    stats: Arc<Statistics>,
    /// Persistence context.
    identity_map: IdentityMap,
    /// Proxy arena.
    proxies: ProxyRegistry,
    /// Batch cohorts of pending proxies.
    cohorts: CohortArena,
    /// Owner groups eligible for subselect collection fetching.
    subselects: SubselectRegistry,
    closed: bool,
}

impl<C: Connection> Session<C> {
    /// Create a new session from an existing connection.
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, SessionConfig::default())
    }

    /// Create a new session with custom configuration and private statistics.
    pub fn with_config(connection: C, config: SessionConfig) -> Self {
        let stats = Arc::new(Statistics::new(config.generate_statistics));
        Self::with_statistics(connection, config, stats)
    }

    /// Create a session reporting into shared statistics.
    pub fn with_statistics(connection: C, config: SessionConfig, stats: Arc<Statistics>) -> Self {
        stats.record_session_open();
        tracing::debug!(
            default_batch_fetch_size = config.default_batch_fetch_size,
            statistics = stats.is_enabled(),
            "Session opened"
        );
        Self {
            connection,
            config,
            stats,
            identity_map: IdentityMap::new(),
            proxies: ProxyRegistry::new(),
            cohorts: CohortArena::new(),
            subselects: SubselectRegistry::new(),
            closed: false,
        }
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Statement and load counters.
    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// The persistence context.
    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Number of owner groups still eligible for subselect fetching.
    pub fn subselect_descriptor_count(&self) -> usize {
        self.subselects.len()
    }

    /// Number of batch cohorts with members still pending.
    pub fn cohort_count(&self) -> usize {
        self.cohorts.len()
    }

    /// Effective batch size for `M`.
    pub fn batch_size_for<M: Model>(&self) -> usize {
        if M::BATCH_SIZE > 1 {
            M::BATCH_SIZE
        } else {
            self.config.default_batch_fetch_size.max(1)
        }
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    /// Get a proxy for `pk` without touching the database.
    ///
    /// The proxy joins the open cohort of `M`, so proxies obtained by
    /// consecutive `load` calls are fetched together. An identity that is
    /// already materialized yields an initialized proxy.
    #[allow(clippy::result_large_err)]
    pub fn load<M: Model>(&mut self, pk: impl Into<Value>) -> Result<Proxy<M>, Error> {
        single_pk::<M>()?;
        let pk = pk.into();
        if let Some(existing) = self.proxies.existing::<M>(&pk) {
            return Ok(existing);
        }

        if self.identity_map.contains::<M>(slice::from_ref(&pk)) {
            let (proxy, _) = self.proxies.create_proxy::<M>(pk, None, true);
            return Ok(proxy);
        }

        let batch_size = self.batch_size_for::<M>();
        let cohort = self
            .cohorts
            .join_open(TypeId::of::<M>(), M::TABLE_NAME, batch_size);
        let (proxy, created) = self.proxies.create_proxy::<M>(pk, Some(cohort), false);
        if created {
            self.cohorts.push_member(cohort, proxy.id());
        }
        tracing::trace!(model = M::TABLE_NAME, pk = ?proxy.pk(), "Proxy created");
        Ok(proxy)
    }

    /// Get proxies for several keys as one fresh cohort. No statement is issued.
    #[allow(clippy::result_large_err)]
    pub fn load_many<M: Model, V: Into<Value>>(
        &mut self,
        pks: impl IntoIterator<Item = V>,
    ) -> Result<Vec<Proxy<M>>, Error> {
        single_pk::<M>()?;
        let batch_size = self.batch_size_for::<M>();
        let cohort = self.cohorts.create(M::TABLE_NAME, batch_size);

        let mut proxies = Vec::new();
        for pk in pks {
            let pk = pk.into();
            if let Some(existing) = self.proxies.existing::<M>(&pk) {
                proxies.push(existing);
                continue;
            }
            let materialized = self.identity_map.contains::<M>(slice::from_ref(&pk));
            let (proxy, created) = self
                .proxies
                .create_proxy::<M>(pk, Some(cohort), materialized);
            if created && !materialized {
                self.cohorts.push_member(cohort, proxy.id());
            }
            proxies.push(proxy);
        }
        if self.cohorts.get(cohort).is_some_and(BatchCohort::is_empty) {
            self.cohorts.release(cohort);
        }

        tracing::debug!(
            model = M::TABLE_NAME,
            proxies = proxies.len(),
            batch_size = batch_size,
            "Proxies created"
        );
        Ok(proxies)
    }

    /// Whether a proxy is bound to its instance. Never triggers a load.
    #[allow(clippy::result_large_err)]
    pub fn is_initialized<M: Model>(&self, proxy: &Proxy<M>) -> Result<bool, Error> {
        self.proxies.is_initialized(proxy.id())
    }

    /// Initialize a proxy together with the pending members of its chunk.
    ///
    /// No-op for proxies that are already initialized or known missing.
    /// A missing row is not an error here; it surfaces from
    /// [`access`](Self::access).
    #[tracing::instrument(level = "debug", skip(self, cx, proxy), fields(model = M::TABLE_NAME, pk = ?proxy.pk()))]
    pub async fn initialize<M: Model>(&mut self, cx: &Cx, proxy: &Proxy<M>) -> Outcome<(), Error> {
        let id = proxy.id();
        match self.proxies.state(id) {
            Ok(ProxyState::Initialized | ProxyState::NotFound) => return Outcome::Ok(()),
            Ok(ProxyState::Uninitialized | ProxyState::Initializing) => {}
            Err(e) => return Outcome::Err(e),
        }
        let pk_col = match single_pk::<M>() {
            Ok(col) => col,
            Err(e) => return Outcome::Err(e),
        };

        let cohort = match self.proxies.cohort_of(id) {
            Ok(cohort) => cohort,
            Err(e) => return Outcome::Err(e),
        };

        // Materialized by another operation since the proxy was created.
        if self.identity_map.contains::<M>(slice::from_ref(proxy.pk())) {
            if let Err(e) = self.proxies.set_state(id, ProxyState::Initialized) {
                return Outcome::Err(e);
            }
            if let Some(cohort) = cohort {
                self.release_settled_cohort(cohort);
            }
            return Outcome::Ok(());
        }

        let chunk: Vec<ProxyId> = match cohort {
            Some(cohort) => {
                self.cohorts.seal(cohort);
                self.cohorts
                    .get(cohort)
                    .and_then(|c| c.chunk_containing(id))
                    .map_or_else(|| vec![id], <[ProxyId]>::to_vec)
            }
            None => vec![id],
        };

        let mut pending: Vec<(ProxyId, Value)> = Vec::with_capacity(chunk.len());
        for member in chunk {
            match self.proxies.state(member) {
                Ok(ProxyState::Initialized | ProxyState::NotFound) => continue,
                Ok(_) => {}
                Err(e) => return Outcome::Err(e),
            }
            let pk = match self.proxies.pk_of(member) {
                Ok(pk) => pk.clone(),
                Err(e) => return Outcome::Err(e),
            };
            if self.identity_map.contains::<M>(slice::from_ref(&pk)) {
                let _ = self.proxies.set_state(member, ProxyState::Initialized);
                continue;
            }
            pending.push((member, pk));
        }
        self.mark(&pending, ProxyState::Initializing);

        let keys: Vec<Value> = pending.iter().map(|(_, pk)| pk.clone()).collect();
        tracing::debug!(
            model = M::TABLE_NAME,
            chunk_size = keys.len(),
            "Batch fetching proxies"
        );

        let dialect = self.connection.dialect();
        let sql = batch::identity_batch_sql(dialect, M::TABLE_NAME, pk_col, keys.len());
        let rows = match self.run_statement(cx, &sql, &keys).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => {
                self.mark(&pending, ProxyState::Uninitialized);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.mark(&pending, ProxyState::Uninitialized);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.mark(&pending, ProxyState::Uninitialized);
                return Outcome::Panicked(p);
            }
        };
        self.stats.record_entity_fetch();

        let loaded = match self.hydrate::<M>(&rows) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.mark(&pending, ProxyState::Uninitialized);
                return Outcome::Err(e);
            }
        };

        let mut missing = 0_usize;
        for (member, pk) in &pending {
            let state = if self.identity_map.contains::<M>(slice::from_ref(pk)) {
                ProxyState::Initialized
            } else {
                missing += 1;
                ProxyState::NotFound
            };
            let _ = self.proxies.set_state(*member, state);
        }
        if let Some(cohort) = cohort {
            self.release_settled_cohort(cohort);
        }

        let owners: Vec<Value> = loaded.iter().map(first_pk).collect();
        let mut params = Vec::with_capacity(keys.len());
        let criteria = Criteria::In(pk_col, keys).build_with_dialect(dialect, &mut params);
        self.record_subselect::<M>(pk_col, criteria, params, &owners);

        tracing::debug!(
            model = M::TABLE_NAME,
            loaded = loaded.len(),
            missing = missing,
            "Batch fetch complete"
        );
        Outcome::Ok(())
    }

    /// Initialize a proxy and return its instance.
    ///
    /// Fails with [`Error::NotFound`] when the row does not exist.
    pub async fn access<M: Model>(&mut self, cx: &Cx, proxy: &Proxy<M>) -> Outcome<ModelRef<M>, Error> {
        match self.initialize(cx, proxy).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let found = match self.proxies.state(proxy.id()) {
            Ok(ProxyState::Initialized) => self.identity_map.lookup::<M>(slice::from_ref(proxy.pk())),
            Ok(_) => None,
            Err(e) => return Outcome::Err(e),
        };
        match found {
            Some(instance) => Outcome::Ok(instance),
            None => Outcome::Err(Error::NotFound(NotFoundError {
                entity: M::TABLE_NAME,
                pk: proxy.pk().clone(),
            })),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get an instance by primary key, reading it immediately if it is not
    /// tracked yet.
    #[tracing::instrument(level = "debug", skip(self, cx, pk), fields(model = M::TABLE_NAME))]
    pub async fn find<M: Model>(
        &mut self,
        cx: &Cx,
        pk: impl Into<Value>,
    ) -> Outcome<Option<ModelRef<M>>, Error> {
        let pk = pk.into();
        let pk_col = match single_pk::<M>() {
            Ok(col) => col,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(found) = self.identity_map.lookup::<M>(slice::from_ref(&pk)) {
            return Outcome::Ok(Some(found));
        }

        let proxy = self.proxies.existing::<M>(&pk);
        if let Some(proxy) = &proxy {
            if matches!(self.proxies.state(proxy.id()), Ok(ProxyState::NotFound)) {
                return Outcome::Ok(None);
            }
        }

        let sql = batch::identity_batch_sql(self.connection.dialect(), M::TABLE_NAME, pk_col, 1);
        let rows = match self.run_statement(cx, &sql, slice::from_ref(&pk)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.stats.record_entity_fetch();

        let found = match self.hydrate::<M>(&rows) {
            Ok(loaded) => loaded.into_iter().next(),
            Err(e) => return Outcome::Err(e),
        };
        if let Some(proxy) = proxy {
            let state = if found.is_some() {
                ProxyState::Initialized
            } else {
                ProxyState::NotFound
            };
            let _ = self.proxies.set_state(proxy.id(), state);
        }
        Outcome::Ok(found)
    }

    /// Run one list query and return initialized handles for the results.
    ///
    /// When `M` has subselect-fetched collections, the rendered criteria is
    /// remembered so the first collection access covers every result.
    #[tracing::instrument(level = "debug", skip(self, cx, criteria), fields(model = M::TABLE_NAME))]
    pub async fn list<M: Model>(&mut self, cx: &Cx, criteria: &Criteria) -> Outcome<Vec<Proxy<M>>, Error> {
        let pk_col = match single_pk::<M>() {
            Ok(col) => col,
            Err(e) => return Outcome::Err(e),
        };
        let dialect = self.connection.dialect();
        let mut params = Vec::new();
        let predicate = criteria.build_with_dialect(dialect, &mut params);
        let mut sql = format!("SELECT * FROM {}", dialect.quote_identifier(M::TABLE_NAME));
        if let Some(predicate) = &predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }

        let rows = match self.run_statement(cx, &sql, &params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.stats.record_query_execution();

        let loaded = match self.hydrate::<M>(&rows) {
            Ok(loaded) => loaded,
            Err(e) => return Outcome::Err(e),
        };

        let owners: Vec<Value> = loaded.iter().map(first_pk).collect();
        let mut proxies = Vec::with_capacity(owners.len());
        for pk in &owners {
            let (proxy, created) = self.proxies.create_proxy::<M>(pk.clone(), None, true);
            if !created {
                let _ = self.proxies.set_state(proxy.id(), ProxyState::Initialized);
            }
            proxies.push(proxy);
        }

        self.record_subselect::<M>(pk_col, predicate, params, &owners);
        tracing::debug!(model = M::TABLE_NAME, rows = proxies.len(), "List query complete");
        Outcome::Ok(proxies)
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Whether an owner's collection is initialized. Never triggers a load.
    ///
    /// An owner proxy that is not initialized reports `false`.
    #[allow(clippy::result_large_err)]
    pub fn is_collection_initialized<P: Model, Child>(
        &self,
        owner: &Proxy<P>,
        role: CollectionRole<P, Child>,
    ) -> Result<bool, Error> {
        if !self.proxies.is_initialized(owner.id())? {
            return Ok(false);
        }
        Ok(self
            .identity_map
            .lookup::<P>(slice::from_ref(owner.pk()))
            .is_some_and(|instance| owner_collection_initialized(&instance, &role)))
    }

    /// Initialize one owner's collection, and every collection the same
    /// statement can satisfy.
    ///
    /// The owner proxy is initialized first if needed.
    #[tracing::instrument(level = "debug", skip(self, cx, owner, role), fields(owner = P::TABLE_NAME, role = role.name()))]
    pub async fn initialize_collection<P: Model, Child: Model>(
        &mut self,
        cx: &Cx,
        owner: &Proxy<P>,
        role: CollectionRole<P, Child>,
    ) -> Outcome<(), Error> {
        let Some(info) = role.info() else {
            return Outcome::Err(Error::unknown_collection_role(P::TABLE_NAME, role.name()));
        };
        let instance = match self.access(cx, owner).await {
            Outcome::Ok(instance) => instance,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if owner_collection_initialized(&instance, &role) {
            return Outcome::Ok(());
        }

        let outcome = match info.fetch {
            FetchMode::Subselect => {
                let key = ObjectKey::from_pk::<P>(slice::from_ref(owner.pk()));
                let descriptor = self
                    .subselects
                    .descriptor_for(&key)
                    .map(|(index, d)| (index, d.clone()));
                if let Some((index, descriptor)) = descriptor {
                    self.fetch_by_subselect(cx, index, &descriptor, info, role).await
                } else {
                    tracing::debug!("No subselect descriptor for owner; loading its collection alone");
                    self.fetch_for_owners(cx, vec![owner.pk().clone()], info, role)
                        .await
                }
            }
            FetchMode::Batch => {
                let owners = self.pending_owners(owner.pk(), info.batch_size, &role);
                self.fetch_for_owners(cx, owners, info, role).await
            }
            FetchMode::Select => {
                self.fetch_for_owners(cx, vec![owner.pk().clone()], info, role)
                    .await
            }
        };
        match outcome {
            Outcome::Ok(_) => {
                if info.fetch == FetchMode::Subselect {
                    self.settle_subselects(info, &role);
                }
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Complete `role` on descriptors whose owners were all filled by other
    /// statements; their replay would fetch nothing new.
    fn settle_subselects<P: Model, Child>(&mut self, info: &'static CollectionInfo, role: &CollectionRole<P, Child>) {
        let identity_map = &self.identity_map;
        let discarded = self.subselects.complete_role_where(
            P::TABLE_NAME,
            info.name,
            subselect_role_count::<P>(),
            |pk| {
                identity_map
                    .lookup::<P>(slice::from_ref(pk))
                    .is_none_or(|instance| owner_collection_initialized(&instance, role))
            },
        );
        if discarded > 0 {
            tracing::debug!(
                owner = P::TABLE_NAME,
                role = info.name,
                discarded = discarded,
                "Satisfied subselect descriptors discarded"
            );
        }
    }

    /// Initialize an owner's collection and return its elements.
    pub async fn collection<P: Model, Child: Model>(
        &mut self,
        cx: &Cx,
        owner: &Proxy<P>,
        role: CollectionRole<P, Child>,
    ) -> Outcome<Vec<ModelRef<Child>>, Error> {
        match self.initialize_collection(cx, owner, role).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let items = self
            .identity_map
            .lookup::<P>(slice::from_ref(owner.pk()))
            .map(|instance| {
                let guard = read_model(&instance);
                role.of(&guard).get().map(<[_]>::to_vec).unwrap_or_default()
            })
            .unwrap_or_default();
        Outcome::Ok(items)
    }

    /// Loaded owners whose collection is still pending, trigger first.
    fn pending_owners<P: Model, Child>(
        &self,
        trigger: &Value,
        batch_size: usize,
        role: &CollectionRole<P, Child>,
    ) -> Vec<Value> {
        let mut owners = vec![trigger.clone()];
        for instance in self.identity_map.instances_of::<P>() {
            if owners.len() >= batch_size {
                break;
            }
            let guard = read_model(&instance);
            if role.of(&guard).is_initialized() {
                continue;
            }
            let Some(pk) = guard.primary_key_value().into_iter().next() else {
                continue;
            };
            if !pk.same_key(trigger) {
                owners.push(pk);
            }
        }
        owners
    }

    async fn fetch_for_owners<P: Model, Child: Model>(
        &mut self,
        cx: &Cx,
        owners: Vec<Value>,
        info: &'static CollectionInfo,
        role: CollectionRole<P, Child>,
    ) -> Outcome<usize, Error> {
        tracing::debug!(
            owner = P::TABLE_NAME,
            role = info.name,
            owners = owners.len(),
            fetch = ?info.fetch,
            "Fetching collections"
        );
        let sql = subselect::owner_batch_sql(
            self.connection.dialect(),
            info.child_table,
            info.fk_column,
            owners.len(),
        );
        let rows = match self.run_statement(cx, &sql, &owners).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.stats.record_collection_fetch();

        match self.distribute(&rows, &owners, role) {
            Ok(count) => Outcome::Ok(count),
            Err(e) => Outcome::Err(e),
        }
    }

    async fn fetch_by_subselect<P: Model, Child: Model>(
        &mut self,
        cx: &Cx,
        index: usize,
        descriptor: &SubselectDescriptor,
        info: &'static CollectionInfo,
        role: CollectionRole<P, Child>,
    ) -> Outcome<usize, Error> {
        tracing::debug!(
            owner = P::TABLE_NAME,
            role = info.name,
            owners = descriptor.owners().len(),
            "Fetching collections by subselect"
        );
        let sql = descriptor.collection_sql(self.connection.dialect(), info.child_table, info.fk_column);
        let rows = match self.run_statement(cx, &sql, descriptor.params()).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.stats.record_collection_fetch();

        let count = match self.distribute(&rows, descriptor.owners(), role) {
            Ok(count) => count,
            Err(e) => return Outcome::Err(e),
        };
        if self
            .subselects
            .complete_role(index, info.name, subselect_role_count::<P>())
        {
            tracing::debug!(owner = P::TABLE_NAME, "Subselect descriptor discarded");
        }
        Outcome::Ok(count)
    }

    /// Group collection rows by owner and initialize every pending owner in
    /// `owners`. Owners without rows get an empty collection.
    #[allow(clippy::result_large_err)]
    fn distribute<P: Model, Child: Model>(
        &mut self,
        rows: &[Row],
        owners: &[Value],
        role: CollectionRole<P, Child>,
    ) -> Result<usize, Error> {
        let mut by_owner: HashMap<u64, Vec<ModelRef<Child>>> = HashMap::new();
        for row in rows {
            let Some(owner_pk) = row.get_by_name(OWNER_PK_ALIAS) else {
                continue;
            };
            let owner_hash = hash_values(slice::from_ref(owner_pk));
            let child = self.identity_map.register(Child::from_row(row)?);
            by_owner.entry(owner_hash).or_default().push(child);
        }
        self.stats.record_entity_load(rows.len() as u64);

        let mut initialized = 0_usize;
        for pk in owners {
            let Some(instance) = self.identity_map.lookup::<P>(slice::from_ref(pk)) else {
                continue;
            };
            let children = by_owner
                .get(&hash_values(slice::from_ref(pk)))
                .cloned()
                .unwrap_or_default();
            let guard = read_model(&instance);
            if role.of(&guard).set_loaded(children).is_ok() {
                initialized += 1;
            }
        }
        self.stats.record_collection_load(initialized as u64);

        tracing::debug!(
            role = role.name(),
            rows = rows.len(),
            collections = initialized,
            "Collections initialized"
        );
        Ok(initialized)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn run_statement(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        self.stats.record_prepare();
        tracing::trace!(sql = %sql, params = params.len(), "Executing statement");
        let outcome = self.connection.query(cx, sql, params).await;
        if matches!(outcome, Outcome::Ok(_)) {
            self.stats.record_execute();
        }
        outcome
    }

    #[allow(clippy::result_large_err)]
    fn hydrate<M: Model>(&mut self, rows: &[Row]) -> Result<Vec<ModelRef<M>>, Error> {
        let mut loaded = Vec::with_capacity(rows.len());
        for row in rows {
            let model = M::from_row(row)?;
            loaded.push(self.identity_map.register(model));
        }
        self.stats.record_entity_load(loaded.len() as u64);
        Ok(loaded)
    }

    /// Drop a cohort once none of its members can trigger a fetch.
    fn release_settled_cohort(&mut self, cohort: CohortId) {
        let settled = self.cohorts.get(cohort).is_some_and(|c| {
            c.members().iter().all(|member| {
                matches!(
                    self.proxies.state(*member),
                    Ok(ProxyState::Initialized | ProxyState::NotFound)
                )
            })
        });
        if settled && self.cohorts.release(cohort).is_some() {
            tracing::trace!(cohort = ?cohort, "Settled cohort released");
        }
    }

    fn mark(&mut self, members: &[(ProxyId, Value)], state: ProxyState) {
        for (member, _) in members {
            let _ = self.proxies.set_state(*member, state);
        }
    }

    fn record_subselect<M: Model>(
        &mut self,
        pk_col: &'static str,
        criteria_sql: Option<String>,
        params: Vec<Value>,
        owners: &[Value],
    ) {
        if !M::has_subselect_collections() || owners.is_empty() {
            return;
        }
        let keys: Vec<ObjectKey> = owners
            .iter()
            .map(|pk| ObjectKey::from_pk::<M>(slice::from_ref(pk)))
            .collect();
        self.subselects.record(
            SubselectDescriptor::new(M::TABLE_NAME, pk_col, criteria_sql, params, owners.to_vec()),
            &keys,
        );
        tracing::debug!(
            model = M::TABLE_NAME,
            owners = owners.len(),
            "Subselect descriptor recorded"
        );
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop every tracked instance, proxy, cohort and descriptor.
    ///
    /// Proxies issued before the call report a detached-proxy error.
    pub fn clear(&mut self) {
        tracing::debug!(
            tracked = self.identity_map.len(),
            proxies = self.proxies.len(),
            "Session cleared"
        );
        self.identity_map.clear();
        self.proxies.clear();
        self.cohorts.clear();
        self.subselects.clear();
    }

    /// Close the session.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stats.record_session_close();
        if self.config.log_statistics_on_close {
            self.stats.log_summary();
        }
        tracing::debug!("Session closed");
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("tracked", &self.identity_map.len())
            .field("proxies", &self.proxies.len())
            .field("cohorts", &self.cohorts.len())
            .field("subselects", &self.subselects.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
