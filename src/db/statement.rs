//! Statement model and SQL compilation.
//!
//! Statements are immutable descriptions of a SELECT, UPDATE or DELETE built from a
//! static schema mapping: every entity declares its table and columns through
//! [`Entity`], and every queryable column is a [`Column`] bound to its owner entity at
//! compile time. Compilation lowers a statement onto `sea-query` and renders it with the
//! query builder of the engine's dialect, which quotes identifiers and numbers
//! placeholders. Execution is left to the session.

use crate::db::engine::Dialect;
use crate::error::{DbError, DbResult};
use sea_query::{
    Alias, BinOper, ConditionalStatement, DeleteStatement, Expr, InsertStatement, JoinType,
    MysqlQueryBuilder, Order, OrderedStatement, PostgresQueryBuilder, Query,
    QueryStatementWriter, SelectStatement, SimpleExpr, SqliteQueryBuilder, UpdateStatement,
    Value as SeaValue, Values,
};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query as SqlxQuery;
use sqlx::{Any, Decode, Row, Type};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

// =============================================================================
// Values
// =============================================================================

/// A bindable SQL value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn to_sea(&self) -> SeaValue {
        match self {
            Self::Null => SeaValue::from(None::<String>),
            Self::Bool(v) => SeaValue::from(*v),
            Self::Int(v) => SeaValue::from(*v),
            Self::Float(v) => SeaValue::from(*v),
            Self::Text(v) => SeaValue::from(v.clone()),
            Self::Bytes(v) => SeaValue::from(v.clone()),
        }
    }

    /// Read back a parameter collected by the query builder.
    fn from_sea(value: SeaValue) -> DbResult<Self> {
        let value = match value {
            SeaValue::Bool(v) => v.map(Value::Bool),
            SeaValue::TinyInt(v) => v.map(|v| Value::Int(v.into())),
            SeaValue::SmallInt(v) => v.map(|v| Value::Int(v.into())),
            SeaValue::Int(v) => v.map(|v| Value::Int(v.into())),
            SeaValue::BigInt(v) => v.map(Value::Int),
            SeaValue::TinyUnsigned(v) => v.map(|v| Value::Int(v.into())),
            SeaValue::SmallUnsigned(v) => v.map(|v| Value::Int(v.into())),
            SeaValue::Unsigned(v) => v.map(|v| Value::Int(v.into())),
            SeaValue::BigUnsigned(v) => v
                .map(|v| {
                    i64::try_from(v).map(Value::Int).map_err(|_| {
                        DbError::validation(format!("Integer parameter {} is out of range", v))
                    })
                })
                .transpose()?,
            SeaValue::Float(v) => v.map(|v| Value::Float(v.into())),
            SeaValue::Double(v) => v.map(Value::Float),
            SeaValue::String(v) => v.map(|v| Value::Text(v.to_string())),
            SeaValue::Char(v) => v.map(|v| Value::Text(v.to_string())),
            SeaValue::Bytes(v) => v.map(|v| Value::Bytes(v.to_vec())),
            #[allow(unreachable_patterns)]
            other => {
                return Err(DbError::validation(format!(
                    "Unsupported parameter type: {:?}",
                    other
                )));
            }
        };
        Ok(value.unwrap_or(Value::Null))
    }
}

// Floats compare by bit pattern so values can key hash maps.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Text(v) => v.hash(state),
            Self::Bytes(v) => v.hash(state),
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v $(as $cast)?)
                }
            }
        )+
    };
}

impl_value_from! {
    bool => Bool,
    i64 => Int,
    i32 => Int as i64,
    i16 => Int as i64,
    u32 => Int as i64,
    f64 => Float,
    f32 => Float as f64,
    String => Text,
    Vec<u8> => Bytes,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Bind a value to an `Any` query.
pub(crate) fn bind_value<'q>(
    query: SqlxQuery<'q, Any, AnyArguments<'q>>,
    value: &Value,
) -> SqlxQuery<'q, Any, AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
    }
}

// =============================================================================
// Schema Mapping
// =============================================================================

/// A row type mapped to a table.
///
/// Implementations declare the table layout statically; `from_row` decodes the
/// entity positionally starting at `offset`, in `COLUMNS` order, so the same entity
/// can be read from joined rows that carry several entities side by side.
pub trait Entity: Sized + Send + Sync + Unpin + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    const PRIMARY_KEY: &'static str;

    /// Identity of this entity, `Value::Null` while it has not been assigned yet.
    fn primary_key(&self) -> Value;

    fn from_row(row: &AnyRow, offset: usize) -> Result<Self, sqlx::Error>;

    /// Columns written by INSERT. Leave generated keys out while they are unset.
    fn insert_values(&self) -> Vec<(&'static str, Value)>;

    /// Whole-entity projection.
    fn table() -> Table<Self> {
        Table::new()
    }
}

/// A table-qualified column name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualifiedColumn {
    pub table: &'static str,
    pub column: &'static str,
}

impl QualifiedColumn {
    fn expr(self) -> Expr {
        Expr::col((Alias::new(self.table), Alias::new(self.column)))
    }
}

impl fmt::Display for QualifiedColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// A column of entity `E` holding values of type `V`.
///
/// The accessor reads the same value back from a loaded entity.
pub struct Column<E, V> {
    name: &'static str,
    read: fn(&E) -> V,
}

impl<E, V> Clone for Column<E, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E, V> Copy for Column<E, V> {}

impl<E: Entity, V> fmt::Debug for Column<E, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Column({})", self.qualified())
    }
}

impl<E: Entity, V> Column<E, V> {
    pub fn new(name: &'static str, read: fn(&E) -> V) -> Self {
        Self { name, read }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn qualified(&self) -> QualifiedColumn {
        QualifiedColumn {
            table: E::TABLE,
            column: self.name,
        }
    }

    /// Read this column's value from a loaded entity.
    pub fn read(&self, entity: &E) -> V {
        (self.read)(entity)
    }

    fn compare(&self, op: CompareOp, value: impl Into<Value>) -> Predicate {
        Predicate::Compare {
            column: self.qualified(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(&self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Eq, value)
    }

    pub fn ne(&self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Ne, value)
    }

    pub fn gt(&self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Gt, value)
    }

    pub fn ge(&self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Ge, value)
    }

    pub fn lt(&self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Lt, value)
    }

    pub fn le(&self, value: impl Into<Value>) -> Predicate {
        self.compare(CompareOp::Le, value)
    }

    pub fn is_in<I, T>(&self, values: I) -> Predicate
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Predicate::In {
            column: self.qualified(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(&self) -> Predicate {
        Predicate::IsNull {
            column: self.qualified(),
            negated: false,
        }
    }

    pub fn is_not_null(&self) -> Predicate {
        Predicate::IsNull {
            column: self.qualified(),
            negated: true,
        }
    }

    /// Column-to-column equality, typically a join condition.
    pub fn eq_column<F: Entity, W>(&self, other: &Column<F, W>) -> Predicate {
        Predicate::Columns {
            left: self.qualified(),
            op: CompareOp::Eq,
            right: other.qualified(),
        }
    }

    pub fn asc(&self) -> OrderBy {
        OrderBy {
            column: self.qualified(),
            descending: false,
        }
    }

    pub fn desc(&self) -> OrderBy {
        OrderBy {
            column: self.qualified(),
            descending: true,
        }
    }
}

/// Whole-entity projection item for `E`.
pub struct Table<E> {
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Table<E> {
    pub fn new() -> Self {
        Self {
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        E::TABLE
    }

    /// Identity predicate on the primary key.
    pub fn primary_key_eq(&self, id: impl Into<Value>) -> Predicate {
        Predicate::Compare {
            column: QualifiedColumn {
                table: E::TABLE,
                column: E::PRIMARY_KEY,
            },
            op: CompareOp::Eq,
            value: id.into(),
        }
    }
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for Table<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Table<E> {}

impl<E: Entity> fmt::Debug for Table<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({})", E::TABLE)
    }
}

// =============================================================================
// Predicates, Ordering, Options
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn bin_oper(self) -> BinOper {
        match self {
            Self::Eq => BinOper::Equal,
            Self::Ne => BinOper::NotEqual,
            Self::Gt => BinOper::GreaterThan,
            Self::Ge => BinOper::GreaterThanOrEqual,
            Self::Lt => BinOper::SmallerThan,
            Self::Le => BinOper::SmallerThanOrEqual,
        }
    }
}

/// A boolean condition for WHERE and JOIN ON clauses.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: QualifiedColumn,
        op: CompareOp,
        value: Value,
    },
    In {
        column: QualifiedColumn,
        values: Vec<Value>,
    },
    IsNull {
        column: QualifiedColumn,
        negated: bool,
    },
    Columns {
        left: QualifiedColumn,
        op: CompareOp,
        right: QualifiedColumn,
    },
    /// SQL fragment emitted as written.
    Raw(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::Raw(sql.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut all) => {
                all.push(other);
                Self::And(all)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut any) => {
                any.push(other);
                Self::Or(any)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    fn to_expr(&self) -> SimpleExpr {
        match self {
            Self::Compare { column, op, value } => {
                column.expr().binary(op.bin_oper(), value.to_sea())
            }
            Self::In { values, .. } if values.is_empty() => Expr::cust("1 = 0"),
            Self::In { column, values } => column.expr().is_in(values.iter().map(Value::to_sea)),
            Self::IsNull {
                column,
                negated: false,
            } => column.expr().is_null(),
            Self::IsNull {
                column,
                negated: true,
            } => column.expr().is_not_null(),
            Self::Columns { left, op, right } => left.expr().binary(op.bin_oper(), right.expr()),
            Self::Raw(sql) => Expr::cust(format!("({})", sql)),
            Self::And(all) => all
                .iter()
                .map(Predicate::to_expr)
                .reduce(SimpleExpr::and)
                .unwrap_or_else(|| Expr::cust("1 = 1")),
            Self::Or(any) => any
                .iter()
                .map(Predicate::to_expr)
                .reduce(SimpleExpr::or)
                .unwrap_or_else(|| Expr::cust("1 = 0")),
            Self::Not(inner) => inner.to_expr().not(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    column: QualifiedColumn,
    descending: bool,
}

impl OrderBy {
    pub fn is_descending(&self) -> bool {
        self.descending
    }

    fn order(&self) -> Order {
        if self.descending {
            Order::Desc
        } else {
            Order::Asc
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

/// A join against another entity's table.
///
/// Mark joins that can match several rows per primary row with
/// [`Join::one_to_many`]; statements carrying one are de-duplicated after execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    kind: JoinKind,
    table: &'static str,
    on: Predicate,
    one_to_many: bool,
}

impl Join {
    pub fn inner<E: Entity>(on: Predicate) -> Self {
        Self {
            kind: JoinKind::Inner,
            table: E::TABLE,
            on,
            one_to_many: false,
        }
    }

    pub fn left<E: Entity>(on: Predicate) -> Self {
        Self {
            kind: JoinKind::Left,
            table: E::TABLE,
            on,
            one_to_many: false,
        }
    }

    pub fn one_to_many(mut self) -> Self {
        self.one_to_many = true;
        self
    }

    pub fn is_fan_out(&self) -> bool {
        self.one_to_many
    }
}

/// Loader options a DAO attaches to the SELECT statements it builds.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOption {
    Join(Join),
    Distinct,
}

impl From<Join> for QueryOption {
    fn from(join: Join) -> Self {
        QueryOption::Join(join)
    }
}

// =============================================================================
// Projections
// =============================================================================

/// Bounds for values read from a single column.
pub trait ColumnValue:
    for<'r> Decode<'r, Any> + Type<Any> + Into<Value> + Clone + Send + Sync + 'static
{
}

impl<T> ColumnValue for T where
    T: for<'r> Decode<'r, Any> + Type<Any> + Into<Value> + Clone + Send + Sync + 'static
{
}

/// One item of a select list: an entity or a column.
pub trait Selectable: Send + Sync {
    type Output: Send;

    /// Table the item belongs to.
    fn owner(&self) -> &'static str;
    fn columns(&self) -> Vec<QualifiedColumn>;
    fn width(&self) -> usize;
    fn decode_at(&self, row: &AnyRow, offset: usize) -> Result<Self::Output, sqlx::Error>;
    /// Identity used to de-duplicate fan-out results.
    fn identity(&self, output: &Self::Output) -> Value;
}

impl<E: Entity> Selectable for Table<E> {
    type Output = E;

    fn owner(&self) -> &'static str {
        E::TABLE
    }

    fn columns(&self) -> Vec<QualifiedColumn> {
        E::COLUMNS
            .iter()
            .map(|column| QualifiedColumn {
                table: E::TABLE,
                column,
            })
            .collect()
    }

    fn width(&self) -> usize {
        E::COLUMNS.len()
    }

    fn decode_at(&self, row: &AnyRow, offset: usize) -> Result<E, sqlx::Error> {
        E::from_row(row, offset)
    }

    fn identity(&self, output: &E) -> Value {
        output.primary_key()
    }
}

impl<E: Entity, V: ColumnValue> Selectable for Column<E, V> {
    type Output = V;

    fn owner(&self) -> &'static str {
        E::TABLE
    }

    fn columns(&self) -> Vec<QualifiedColumn> {
        vec![self.qualified()]
    }

    fn width(&self) -> usize {
        1
    }

    fn decode_at(&self, row: &AnyRow, offset: usize) -> Result<V, sqlx::Error> {
        row.try_get::<V, _>(offset)
    }

    fn identity(&self, output: &V) -> Value {
        output.clone().into()
    }
}

/// The full select list of a statement and how its rows are shaped.
///
/// A single item yields bare values; a tuple of items yields tuples. `First` is what
/// `get_first` returns: `Option<T>` for one item, a tuple of `Option`s otherwise, so a
/// miss still destructures.
pub trait Projection: Send + Sync {
    type Output: Send;
    type First;

    /// Table in the FROM clause: the owner of the first item.
    fn source(&self) -> &'static str;
    fn select_list(&self) -> Vec<QualifiedColumn>;
    fn decode(&self, row: &AnyRow) -> Result<Self::Output, sqlx::Error>;
    fn identity(&self, output: &Self::Output) -> Vec<Value>;
    fn first(output: Option<Self::Output>) -> Self::First;
}

macro_rules! impl_single_projection {
    ($item:ty, $($generics:tt)*) => {
        impl<$($generics)*> Projection for $item {
            type Output = <$item as Selectable>::Output;
            type First = Option<Self::Output>;

            fn source(&self) -> &'static str {
                self.owner()
            }

            fn select_list(&self) -> Vec<QualifiedColumn> {
                self.columns()
            }

            fn decode(&self, row: &AnyRow) -> Result<Self::Output, sqlx::Error> {
                self.decode_at(row, 0)
            }

            fn identity(&self, output: &Self::Output) -> Vec<Value> {
                vec![Selectable::identity(self, output)]
            }

            fn first(output: Option<Self::Output>) -> Self::First {
                output
            }
        }
    };
}

impl_single_projection!(Table<E>, E: Entity);
impl_single_projection!(Column<E, V>, E: Entity, V: ColumnValue);

macro_rules! impl_tuple_projection {
    ($($item:ident : $idx:tt),+) => {
        impl<$($item: Selectable),+> Projection for ($($item,)+) {
            type Output = ($(<$item as Selectable>::Output,)+);
            type First = ($(Option<<$item as Selectable>::Output>,)+);

            fn source(&self) -> &'static str {
                self.0.owner()
            }

            fn select_list(&self) -> Vec<QualifiedColumn> {
                let mut columns = Vec::new();
                $(columns.extend(self.$idx.columns());)+
                columns
            }

            #[allow(unused_assignments)]
            fn decode(&self, row: &AnyRow) -> Result<Self::Output, sqlx::Error> {
                let mut offset = 0;
                Ok(($(
                    {
                        let value = self.$idx.decode_at(row, offset)?;
                        offset += self.$idx.width();
                        value
                    },
                )+))
            }

            fn identity(&self, output: &Self::Output) -> Vec<Value> {
                vec![$(self.$idx.identity(&output.$idx)),+]
            }

            fn first(output: Option<Self::Output>) -> Self::First {
                match output {
                    Some(row) => ($(Some(row.$idx),)+),
                    None => ($(None::<<$item as Selectable>::Output>,)+),
                }
            }
        }
    };
}

impl_tuple_projection!(A: 0, B: 1);
impl_tuple_projection!(A: 0, B: 1, C: 2);
impl_tuple_projection!(A: 0, B: 1, C: 2, D: 3);

// =============================================================================
// Statements
// =============================================================================

/// SQL text plus the values for its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl CompiledStatement {
    fn from_built((sql, values): (String, Values)) -> DbResult<Self> {
        let params = values
            .0
            .into_iter()
            .map(Value::from_sea)
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Self { sql, params })
    }
}

/// Render a sea-query statement with the builder for `dialect`.
fn build<S: QueryStatementWriter>(stmt: &S, dialect: Dialect) -> DbResult<CompiledStatement> {
    let built = match dialect {
        Dialect::PostgreSQL => stmt.build(PostgresQueryBuilder),
        Dialect::MySQL => stmt.build(MysqlQueryBuilder),
        Dialect::SQLite => stmt.build(SqliteQueryBuilder),
    };
    CompiledStatement::from_built(built)
}

fn table_ref(table: &'static str) -> Alias {
    Alias::new(table)
}

/// Anything that compiles to a single SQL statement.
pub trait Executable {
    fn compile(&self, dialect: Dialect) -> DbResult<CompiledStatement>;
}

#[derive(Debug, Clone)]
pub struct Select<P> {
    projection: P,
    joins: Vec<Join>,
    criteria: Vec<Predicate>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    distinct: bool,
}

impl<P: Projection> Select<P> {
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            joins: Vec::new(),
            criteria: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            distinct: false,
        }
    }

    pub fn option(self, option: QueryOption) -> Self {
        match option {
            QueryOption::Join(join) => self.join(join),
            QueryOption::Distinct => self.distinct(),
        }
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.criteria.push(predicate);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Whether a one-to-many join can repeat primary rows.
    pub fn is_fan_out(&self) -> bool {
        self.joins.iter().any(Join::is_fan_out)
    }

    fn to_statement(&self) -> SelectStatement {
        let mut query = Query::select();
        if self.distinct {
            query.distinct();
        }
        for column in self.projection.select_list() {
            query.column((Alias::new(column.table), Alias::new(column.column)));
        }
        query.from(table_ref(self.projection.source()));
        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Inner => JoinType::InnerJoin,
                JoinKind::Left => JoinType::LeftJoin,
            };
            query.join(kind, table_ref(join.table), join.on.to_expr());
        }
        for predicate in &self.criteria {
            query.and_where(predicate.to_expr());
        }
        for order in &self.order_by {
            query.order_by(
                (Alias::new(order.column.table), Alias::new(order.column.column)),
                order.order(),
            );
        }
        if let Some(limit) = self.limit {
            query.limit(limit);
        }
        query
    }
}

impl<P: Projection> Executable for Select<P> {
    fn compile(&self, dialect: Dialect) -> DbResult<CompiledStatement> {
        build(&self.to_statement(), dialect)
    }
}

#[derive(Debug, Clone)]
pub struct Update<E> {
    assignments: Vec<(&'static str, Value)>,
    criteria: Vec<Predicate>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Update<E> {
    pub fn new() -> Self {
        Self {
            assignments: Vec::new(),
            criteria: Vec::new(),
            _entity: PhantomData,
        }
    }

    pub fn set<V>(mut self, column: Column<E, V>, value: impl Into<Value>) -> Self {
        self.assignments.push((column.name(), value.into()));
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.criteria.push(predicate);
        self
    }

    fn to_statement(&self) -> UpdateStatement {
        let mut query = Query::update();
        query.table(table_ref(E::TABLE));
        for (column, value) in &self.assignments {
            query.value(Alias::new(*column), value.to_sea());
        }
        for predicate in &self.criteria {
            query.and_where(predicate.to_expr());
        }
        query
    }
}

impl<E: Entity> Default for Update<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Executable for Update<E> {
    fn compile(&self, dialect: Dialect) -> DbResult<CompiledStatement> {
        if self.assignments.is_empty() {
            return Err(DbError::validation(format!(
                "UPDATE of {} has no assignments",
                E::TABLE
            )));
        }
        build(&self.to_statement(), dialect)
    }
}

#[derive(Debug, Clone)]
pub struct Delete<E> {
    criteria: Vec<Predicate>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Delete<E> {
    pub fn new() -> Self {
        Self {
            criteria: Vec::new(),
            _entity: PhantomData,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.criteria.push(predicate);
        self
    }

    fn to_statement(&self) -> DeleteStatement {
        let mut query = Query::delete();
        query.from_table(table_ref(E::TABLE));
        for predicate in &self.criteria {
            query.and_where(predicate.to_expr());
        }
        query
    }
}

impl<E: Entity> Default for Delete<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> Executable for Delete<E> {
    fn compile(&self, dialect: Dialect) -> DbResult<CompiledStatement> {
        build(&self.to_statement(), dialect)
    }
}

/// Hand-written SQL in the backend's own placeholder syntax (`$1` on PostgreSQL, `?`
/// elsewhere). The text is passed to the driver untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSql {
    sql: String,
    params: Vec<Value>,
}

impl RawSql {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl Executable for RawSql {
    fn compile(&self, _dialect: Dialect) -> DbResult<CompiledStatement> {
        Ok(CompiledStatement {
            sql: self.sql.clone(),
            params: self.params.clone(),
        })
    }
}

/// INSERT for one entity. With RETURNING the stored row comes back from the statement
/// itself; otherwise the caller reloads it.
pub(crate) fn compile_insert<E: Entity>(
    entity: &E,
    dialect: Dialect,
) -> DbResult<CompiledStatement> {
    let values = entity.insert_values();
    let mut query: InsertStatement = Query::insert();
    query.into_table(table_ref(E::TABLE));

    if values.is_empty() {
        query.or_default_values();
    } else {
        query.columns(values.iter().map(|(column, _)| Alias::new(*column)));
        query
            .values(values.iter().map(|(_, value)| SimpleExpr::from(value.to_sea())))
            .map_err(|e| DbError::validation(format!("INSERT into {}: {}", E::TABLE, e)))?;
    }

    if dialect.uses_returning() {
        query.returning(Query::returning().columns(E::COLUMNS.iter().map(|c| Alias::new(*c))));
    }
    build(&query, dialect)
}
