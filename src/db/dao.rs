//! Fluent data-access object.
//!
//! A [`Dao`] accumulates loader options, filters and ordering, builds statements seeded
//! with them, executes those statements against a session and shapes the rows it gets
//! back. Unless it was given a session explicitly, it looks up the ambient session each
//! time it executes, so a DAO can be built before any scope is entered.

use crate::db::ambient;
use crate::db::session::ScopedSession;
use crate::db::statement::{
    Column, ColumnValue, Delete, Entity, Executable, OrderBy, Predicate, Projection,
    QueryOption, Select, Table, Update, Value, compile_insert,
};
use crate::error::{DbError, DbResult};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Dao {
    session: Option<Arc<ScopedSession>>,
    options: Vec<QueryOption>,
    criteria: Vec<Predicate>,
    order_by: Vec<OrderBy>,
}

impl Dao {
    /// DAO bound to whatever session is ambient when it executes.
    pub fn new() -> Self {
        Self::default()
    }

    /// DAO pinned to `session`.
    pub fn with_session(session: Arc<ScopedSession>) -> Self {
        Self {
            session: Some(session),
            ..Self::default()
        }
    }

    pub fn options<I>(&mut self, options: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<QueryOption>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    /// Add a WHERE criterion, combined with the others by AND.
    pub fn filter(&mut self, predicate: Predicate) -> &mut Self {
        self.criteria.push(predicate);
        self
    }

    pub fn order_by(&mut self, order: OrderBy) -> &mut Self {
        self.order_by.push(order);
        self
    }

    fn session(&self) -> DbResult<Arc<ScopedSession>> {
        match &self.session {
            Some(session) => Ok(session.clone()),
            None => ambient::current_session(),
        }
    }

    // =========================================================================
    // Statement factories
    // =========================================================================

    /// SELECT of `projection` carrying the accumulated options, filters and ordering.
    pub fn select<P: Projection>(&self, projection: P) -> Select<P> {
        let stmt = self
            .options
            .iter()
            .cloned()
            .fold(Select::new(projection), Select::option);
        let stmt = self.criteria.iter().cloned().fold(stmt, Select::filter);
        self.order_by.iter().cloned().fold(stmt, Select::order_by)
    }

    /// UPDATE of `E` carrying the accumulated filters.
    pub fn update<E: Entity>(&self) -> Update<E> {
        self.criteria.iter().cloned().fold(Update::new(), Update::filter)
    }

    /// DELETE of `E` carrying the accumulated filters.
    pub fn delete<E: Entity>(&self) -> Delete<E> {
        self.criteria.iter().cloned().fold(Delete::new(), Delete::filter)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Look an entity up by primary key.
    pub async fn get<E: Entity>(&self, id: impl Into<Value>) -> DbResult<Option<E>> {
        let session = self.session()?;
        let table = Table::<E>::new();
        let stmt = Select::new(table)
            .filter(table.primary_key_eq(id))
            .compile(session.engine().dialect())?;
        let row = session.fetch_optional(&stmt).await?;
        row.map(|row| E::from_row(&row, 0))
            .transpose()
            .map_err(DbError::from)
    }

    /// Entities whose `column` is one of `ids`.
    ///
    /// With `preserve_order` the result follows `ids` position by position: ids without
    /// a row are skipped and an id listed twice yields its row twice.
    pub async fn get_by_ids<E, V>(
        &self,
        column: Column<E, V>,
        ids: &[V],
        preserve_order: bool,
    ) -> DbResult<Vec<E>>
    where
        E: Entity + Clone,
        V: Into<Value> + Clone,
    {
        let found = self.fetch_by_ids(column, ids).await?;
        if !preserve_order || found.is_empty() {
            return Ok(found);
        }

        let by_key: HashMap<Value, E> = found
            .into_iter()
            .map(|entity| (column.read(&entity).into(), entity))
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| by_key.get(&id.clone().into()).cloned())
            .collect())
    }

    /// Rows matching `ids`, in database order.
    async fn fetch_by_ids<E, V>(&self, column: Column<E, V>, ids: &[V]) -> DbResult<Vec<E>>
    where
        E: Entity,
        V: Into<Value> + Clone,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let stmt = self
            .select(Table::<E>::new())
            .filter(column.is_in(ids.iter().cloned()));
        self.get_all(&stmt).await
    }

    /// [`get_by_ids`](Self::get_by_ids) keyed by `map_column`. A key seen twice keeps the
    /// last entity.
    pub async fn get_map_by_ids<E, V, K>(
        &self,
        column: Column<E, V>,
        ids: &[V],
        map_column: Column<E, K>,
    ) -> DbResult<HashMap<K, E>>
    where
        E: Entity,
        V: Into<Value> + Clone,
        K: Eq + Hash,
    {
        let found = self.fetch_by_ids(column, ids).await?;
        Ok(found
            .into_iter()
            .map(|entity| (map_column.read(&entity), entity))
            .collect())
    }

    /// [`get_by_ids`](Self::get_by_ids) grouped by `map_column`, in result order.
    pub async fn get_grouped_by_ids<E, V, K>(
        &self,
        column: Column<E, V>,
        ids: &[V],
        map_column: Column<E, K>,
    ) -> DbResult<HashMap<K, Vec<E>>>
    where
        E: Entity,
        V: Into<Value> + Clone,
        K: Eq + Hash,
    {
        let found = self.fetch_by_ids(column, ids).await?;
        let mut groups: HashMap<K, Vec<E>> = HashMap::new();
        for entity in found {
            groups
                .entry(map_column.read(&entity))
                .or_default()
                .push(entity);
        }
        Ok(groups)
    }

    /// Insert `entity` right away and return it as stored, generated key included.
    pub async fn add<E: Entity>(&self, entity: &E) -> DbResult<E> {
        let session = self.session()?;
        insert(&session, entity).await
    }

    /// Insert every entity in order, returning them as stored.
    pub async fn add_all<E: Entity>(&self, entities: &[E]) -> DbResult<Vec<E>> {
        let session = self.session()?;
        let mut stored = Vec::with_capacity(entities.len());
        for entity in entities {
            stored.push(insert(&session, entity).await?);
        }
        Ok(stored)
    }

    /// First row of `stmt`. A miss yields `None` for every projected item.
    pub async fn get_first<P: Projection>(&self, stmt: &Select<P>) -> DbResult<P::First> {
        let session = self.session()?;
        let compiled = stmt.compile(session.engine().dialect())?;
        let row = session.fetch_optional(&compiled).await?;
        let first = row
            .map(|row| stmt.projection().decode(&row))
            .transpose()?;
        Ok(P::first(first))
    }

    /// Every row of `stmt`, de-duplicated when a one-to-many join can repeat rows.
    pub async fn get_all<P: Projection>(&self, stmt: &Select<P>) -> DbResult<Vec<P::Output>> {
        let session = self.session()?;
        let compiled = stmt.compile(session.engine().dialect())?;
        let rows = session.fetch_all(&compiled).await?;
        let projection = stmt.projection();

        if !stmt.is_fan_out() {
            return rows
                .iter()
                .map(|row| projection.decode(row).map_err(DbError::from))
                .collect();
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(rows.len());
        for row in &rows {
            let item = projection.decode(row)?;
            if seen.insert(projection.identity(&item)) {
                unique.push(item);
            }
        }
        debug!(
            rows = rows.len(),
            unique = unique.len(),
            "De-duplicated fan-out result"
        );
        Ok(unique)
    }

    /// Rows affected by `stmt`.
    pub async fn get_rows_count(&self, stmt: &impl Executable) -> DbResult<u64> {
        let session = self.session()?;
        let compiled = stmt.compile(session.engine().dialect())?;
        Ok(session.execute(&compiled).await?.rows_affected())
    }

    /// Keyset page of `E` ordered by `cursor`.
    ///
    /// Rows come strictly after `after` (before it when `reverse`); `None` starts from
    /// the first row. A page shorter than `page_size` is the last one.
    pub async fn get_page<E, V>(
        &self,
        cursor: Column<E, V>,
        after: Option<V>,
        page_size: u64,
        reverse: bool,
    ) -> DbResult<Vec<E>>
    where
        E: Entity,
        V: ColumnValue,
    {
        if page_size == 0 {
            return Ok(Vec::new());
        }

        let page_stmt = |after: Option<V>, limit: u64| {
            let mut stmt = Select::new(Table::<E>::new());
            if let Some(after) = after {
                stmt = stmt.filter(if reverse {
                    cursor.lt(after)
                } else {
                    cursor.gt(after)
                });
            }
            stmt = self.options.iter().cloned().fold(stmt, Select::option);
            stmt = self.criteria.iter().cloned().fold(stmt, Select::filter);
            stmt = stmt.order_by(if reverse { cursor.desc() } else { cursor.asc() });
            stmt = self.order_by.iter().cloned().fold(stmt, Select::order_by);
            stmt.limit(limit)
        };

        let mut stmt = page_stmt(after, page_size);
        if !stmt.is_fan_out() {
            return self.get_all(&stmt).await;
        }

        // LIMIT counts joined rows, so filling a page may take several fetches.
        let session = self.session()?;
        let dialect = session.engine().dialect();
        let mut seen = HashSet::new();
        let mut page = Vec::new();
        let mut limit = page_size;
        let mut fetches = 0;
        loop {
            let rows = session.fetch_all(&stmt.compile(dialect)?).await?;
            fetches += 1;
            let mut last = None;
            for row in &rows {
                let entity = stmt.projection().decode(row)?;
                last = Some(cursor.read(&entity));
                if (page.len() as u64) < page_size && seen.insert(entity.primary_key()) {
                    page.push(entity);
                }
            }

            let exhausted = (rows.len() as u64) < limit;
            let remaining = page_size - page.len() as u64;
            match last {
                Some(last) if !exhausted && remaining > 0 => {
                    limit = remaining;
                    stmt = page_stmt(Some(last), limit);
                }
                _ => break,
            }
        }

        debug!(
            fetches = fetches,
            entities = page.len(),
            "Filled fan-out page"
        );
        Ok(page)
    }
}

/// INSERT `entity` and read the stored row back.
async fn insert<E: Entity>(session: &ScopedSession, entity: &E) -> DbResult<E> {
    let dialect = session.engine().dialect();
    let stmt = compile_insert(entity, dialect)?;

    if dialect.uses_returning() {
        let row = session.fetch_optional(&stmt).await?.ok_or_else(|| {
            DbError::internal(format!("INSERT into {} returned no row", E::TABLE))
        })?;
        return E::from_row(&row, 0).map_err(DbError::from);
    }

    let result = session.execute(&stmt).await?;
    let key = match entity.primary_key() {
        Value::Null => result.last_insert_id().map(Value::Int).ok_or_else(|| {
            DbError::internal(format!("No generated key reported for {}", E::TABLE))
        })?,
        key => key,
    };

    let table = Table::<E>::new();
    let reload = Select::new(table)
        .filter(table.primary_key_eq(key))
        .compile(dialect)?;
    let row = session.fetch_optional(&reload).await?.ok_or_else(|| {
        DbError::internal(format!("Inserted row of {} could not be read back", E::TABLE))
    })?;
    E::from_row(&row, 0).map_err(DbError::from)
}
