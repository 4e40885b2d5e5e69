//! Shared fixtures: an in-memory connection and the test models.
#![allow(dead_code)]

use asupersync::{Cx, Outcome};
use batchfetch::prelude::*;
use batchfetch::{QueryError, QueryErrorKind};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

// ============================================================================
// In-memory connection
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    statements: Vec<(String, Vec<Value>)>,
    fail_next: bool,
}

/// Evaluates the statement shapes the session emits against in-memory tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<M: Model>(&self, model: &M) {
        let row = Row::from_pairs(model.to_row());
        self.state
            .lock()
            .expect("lock poisoned")
            .tables
            .entry(M::TABLE_NAME.to_string())
            .or_default()
            .push(row);
    }

    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .statements
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn statement_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").statements.len()
    }

    pub fn last_params(&self) -> Vec<Value> {
        self.state
            .lock()
            .expect("lock poisoned")
            .statements
            .last()
            .map(|(_, params)| params.clone())
            .unwrap_or_default()
    }

    pub fn reset_log(&self) {
        self.state.lock().expect("lock poisoned").statements.clear();
    }

    /// Make the next statement fail with a database error.
    pub fn fail_next(&self) {
        self.state.lock().expect("lock poisoned").fail_next = true;
    }
}

impl Connection for MemoryConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().expect("lock poisoned");
            guard.statements.push((sql.clone(), params.clone()));
            if std::mem::take(&mut guard.fail_next) {
                return Outcome::Err(query_error(&sql, "injected failure"));
            }
            match select(&guard, &sql, &params) {
                Ok(rows) => Outcome::Ok(rows),
                Err(message) => Outcome::Err(query_error(&sql, &message)),
            }
        }
    }
}

fn query_error(sql: &str, message: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        sqlstate: None,
        message: message.to_string(),
        source: None,
    })
}

fn quoted(s: &str) -> std::result::Result<(&str, &str), String> {
    let body = s
        .strip_prefix('"')
        .ok_or_else(|| format!("expected identifier at '{s}'"))?;
    let end = body
        .find('"')
        .ok_or_else(|| format!("unterminated identifier at '{s}'"))?;
    Ok((&body[..end], &body[end + 1..]))
}

fn param(token: &str, params: &[Value]) -> std::result::Result<Value, String> {
    let index: usize = token
        .trim()
        .strip_prefix('$')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| format!("bad placeholder '{token}'"))?;
    index
        .checked_sub(1)
        .and_then(|i| params.get(i))
        .cloned()
        .ok_or_else(|| format!("missing parameter {index}"))
}

/// `SELECT *[, "fk" AS __owner_pk] FROM "table"[ WHERE predicate]`
fn select(state: &MemoryState, sql: &str, params: &[Value]) -> std::result::Result<Vec<Row>, String> {
    let rest = sql.strip_prefix("SELECT ").ok_or("not a SELECT")?;
    let (alias, rest) = if let Some(rest) = rest.strip_prefix("*, ") {
        let (column, rest) = quoted(rest)?;
        let rest = rest
            .strip_prefix(" AS __owner_pk")
            .ok_or("expected owner alias")?;
        (Some(column), rest)
    } else {
        (None, rest.strip_prefix('*').ok_or("expected *")?)
    };
    let rest = rest.strip_prefix(" FROM ").ok_or("expected FROM")?;
    let (table, rest) = quoted(rest)?;
    let predicate = if rest.is_empty() {
        None
    } else {
        Some(rest.strip_prefix(" WHERE ").ok_or("expected WHERE")?)
    };

    let mut out = Vec::new();
    for row in state.tables.get(table).map(Vec::as_slice).unwrap_or_default() {
        if let Some(predicate) = predicate {
            if !eval(state, predicate, row, params)? {
                continue;
            }
        }
        out.push(match alias {
            Some(column) => {
                let owner = row.get_by_name(column).cloned().unwrap_or(Value::Null);
                row.with_extra_column("__owner_pk", owner)
            }
            None => row.clone(),
        });
    }
    Ok(out)
}

/// `SELECT "column" FROM "table"[ WHERE predicate]`
fn subquery_values(state: &MemoryState, sql: &str, params: &[Value]) -> std::result::Result<Vec<Value>, String> {
    let rest = sql.strip_prefix("SELECT ").ok_or("not a SELECT")?;
    let (column, rest) = quoted(rest)?;
    let rest = rest.strip_prefix(" FROM ").ok_or("expected FROM")?;
    let (table, rest) = quoted(rest)?;
    let predicate = if rest.is_empty() {
        None
    } else {
        Some(rest.strip_prefix(" WHERE ").ok_or("expected WHERE")?)
    };

    let mut out = Vec::new();
    for row in state.tables.get(table).map(Vec::as_slice).unwrap_or_default() {
        if let Some(predicate) = predicate {
            if !eval(state, predicate, row, params)? {
                continue;
            }
        }
        out.push(row.get_by_name(column).cloned().unwrap_or(Value::Null));
    }
    Ok(out)
}

fn split_top_level_and(predicate: &str) -> Vec<&str> {
    let bytes = predicate.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0_i32;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            b' ' if depth == 0 && predicate[i..].starts_with(" AND ") => {
                parts.push(&predicate[start..i]);
                i += " AND ".len();
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&predicate[start..]);
    parts
}

fn strip_wrapping_parens(predicate: &str) -> &str {
    let Some(inner) = predicate
        .strip_prefix('(')
        .and_then(|p| p.strip_suffix(')'))
    else {
        return predicate;
    };
    let mut depth = 0_i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return predicate;
                }
            }
            _ => {}
        }
    }
    inner
}

fn eval(state: &MemoryState, predicate: &str, row: &Row, params: &[Value]) -> std::result::Result<bool, String> {
    let parts = split_top_level_and(predicate);
    if parts.len() > 1 {
        for part in parts {
            if !eval(state, part, row, params)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let predicate = strip_wrapping_parens(predicate.trim());
    if predicate == "1 = 0" {
        return Ok(false);
    }
    let (column, rest) = quoted(predicate)?;
    let value = row.get_by_name(column).cloned().unwrap_or(Value::Null);

    if let Some(token) = rest.strip_prefix(" = ") {
        return Ok(value.same_key(&param(token, params)?));
    }
    let list = rest
        .strip_prefix(" IN (")
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| format!("unsupported predicate '{predicate}'"))?;
    let candidates = if list.starts_with("SELECT ") {
        subquery_values(state, list, params)?
    } else {
        list.split(", ")
            .map(|token| param(token, params))
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    Ok(candidates.iter().any(|candidate| value.same_key(candidate)))
}

// ============================================================================
// Models
// ============================================================================

/// Owner with a subselect-fetched collection and a large batch size.
#[derive(Debug)]
pub struct EmployeeGroup {
    pub id: i64,
    pub name: String,
    pub employees: LazyCollection<Employee>,
}

impl EmployeeGroup {
    pub fn new(id: i64, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            employees: LazyCollection::new(),
        }
    }
}

impl Model for EmployeeGroup {
    const TABLE_NAME: &'static str = "employee_group";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const BATCH_SIZE: usize = 1000;
    const COLLECTIONS: &'static [CollectionInfo] =
        &[CollectionInfo::new("employees", "employee", "group_id").fetch(FetchMode::Subselect)];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            employees: LazyCollection::new(),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

pub fn employees(group: &EmployeeGroup) -> &LazyCollection<Employee> {
    &group.employees
}

pub const EMPLOYEES: CollectionRole<EmployeeGroup, Employee> =
    CollectionRole::new("employees", employees);

#[derive(Debug, Clone, PartialEq)]
pub struct Employee {
    pub id: i64,
    pub name: String,
    pub group_id: i64,
}

impl Employee {
    pub fn new(id: i64, name: &str, group_id: i64) -> Self {
        Self {
            id,
            name: name.to_string(),
            group_id,
        }
    }
}

impl Model for Employee {
    const TABLE_NAME: &'static str = "employee";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
            ("group_id", Value::BigInt(self.group_id)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            group_id: row.get_named("group_id")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

/// Owner with two subselect roles and no declared batch size.
#[derive(Debug)]
pub struct Department {
    pub id: i64,
    pub staff: LazyCollection<Staff>,
    pub projects: LazyCollection<Project>,
}

impl Model for Department {
    const TABLE_NAME: &'static str = "department";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const COLLECTIONS: &'static [CollectionInfo] = &[
        CollectionInfo::new("staff", "staff", "department_id").fetch(FetchMode::Subselect),
        CollectionInfo::new("projects", "project", "department_id").fetch(FetchMode::Subselect),
    ];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", Value::BigInt(self.id))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            staff: LazyCollection::new(),
            projects: LazyCollection::new(),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

pub fn department_staff(department: &Department) -> &LazyCollection<Staff> {
    &department.staff
}

pub fn department_projects(department: &Department) -> &LazyCollection<Project> {
    &department.projects
}

pub const STAFF: CollectionRole<Department, Staff> = CollectionRole::new("staff", department_staff);
pub const PROJECTS: CollectionRole<Department, Project> =
    CollectionRole::new("projects", department_projects);

#[derive(Debug, Clone)]
pub struct Staff {
    pub id: i64,
    pub department_id: i64,
}

impl Model for Staff {
    const TABLE_NAME: &'static str = "staff";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("department_id", Value::BigInt(self.department_id)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            department_id: row.get_named("department_id")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: i64,
    pub title: String,
    pub department_id: i64,
}

impl Model for Project {
    const TABLE_NAME: &'static str = "project";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("title", Value::Text(self.title.clone())),
            ("department_id", Value::BigInt(self.department_id)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            title: row.get_named("title")?,
            department_id: row.get_named("department_id")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

/// Owner with a batch-fetched role and a per-owner role.
#[derive(Debug)]
pub struct Team {
    pub id: i64,
    pub players: LazyCollection<Player>,
    pub sponsors: LazyCollection<Sponsor>,
}

impl Model for Team {
    const TABLE_NAME: &'static str = "team";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const COLLECTIONS: &'static [CollectionInfo] = &[
        CollectionInfo::new("players", "player", "team_id").batch_size(2),
        CollectionInfo::new("sponsors", "sponsor", "team_id"),
    ];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", Value::BigInt(self.id))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            players: LazyCollection::new(),
            sponsors: LazyCollection::new(),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

pub fn team_players(team: &Team) -> &LazyCollection<Player> {
    &team.players
}

pub fn team_sponsors(team: &Team) -> &LazyCollection<Sponsor> {
    &team.sponsors
}

pub const PLAYERS: CollectionRole<Team, Player> = CollectionRole::new("players", team_players);
pub const SPONSORS: CollectionRole<Team, Sponsor> = CollectionRole::new("sponsors", team_sponsors);

/// Entity with a small batch size.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: i64,
    pub name: String,
    pub team_id: i64,
}

impl Model for Player {
    const TABLE_NAME: &'static str = "player";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const BATCH_SIZE: usize = 2;

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("name", Value::Text(self.name.clone())),
            ("team_id", Value::BigInt(self.team_id)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            team_id: row.get_named("team_id")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

#[derive(Debug, Clone)]
pub struct Sponsor {
    pub id: i64,
    pub team_id: i64,
}

impl Model for Sponsor {
    const TABLE_NAME: &'static str = "sponsor";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::BigInt(self.id)),
            ("team_id", Value::BigInt(self.team_id)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            team_id: row.get_named("team_id")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![Value::BigInt(self.id)]
    }
}

// ============================================================================
// Seed data
// ============================================================================

/// Two groups with two employees each.
pub fn seed_groups(conn: &MemoryConnection) {
    conn.insert(&EmployeeGroup::new(1, "Engineering"));
    conn.insert(&EmployeeGroup::new(2, "Support"));
    conn.insert(&Employee::new(10, "Ada", 1));
    conn.insert(&Employee::new(11, "Grace", 1));
    conn.insert(&Employee::new(20, "Linus", 2));
    conn.insert(&Employee::new(21, "Ken", 2));
}

/// Three departments; department 3 has no staff and no projects.
pub fn seed_departments(conn: &MemoryConnection) {
    for id in 1..=3 {
        conn.insert(&Department {
            id,
            staff: LazyCollection::new(),
            projects: LazyCollection::new(),
        });
    }
    conn.insert(&Staff {
        id: 100,
        department_id: 1,
    });
    conn.insert(&Staff {
        id: 101,
        department_id: 2,
    });
    conn.insert(&Project {
        id: 500,
        title: "Migration".to_string(),
        department_id: 1,
    });
}

/// Three teams with two players each and one sponsor each.
pub fn seed_teams(conn: &MemoryConnection) {
    for id in 1..=3 {
        conn.insert(&Team {
            id,
            players: LazyCollection::new(),
            sponsors: LazyCollection::new(),
        });
        conn.insert(&Player {
            id: id * 10,
            name: format!("p{}", id * 10),
            team_id: id,
        });
        conn.insert(&Player {
            id: id * 10 + 1,
            name: format!("p{}", id * 10 + 1),
            team_id: id,
        });
        conn.insert(&Sponsor {
            id: id * 100,
            team_id: id,
        });
    }
}

/// Factory with statistics enabled.
pub fn factory() -> SessionFactory {
    SessionFactory::new(SessionConfig::default().with_statistics(true))
}
