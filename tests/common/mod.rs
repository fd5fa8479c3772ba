//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rust_record_lock::core::alert::{Alert, AlertSink};
use rust_record_lock::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const SCHEMA: &[&str] = &[
    "CREATE TABLE AutoNumbers (NumberType INTEGER PRIMARY KEY, NextNumber INTEGER)",
    "CREATE TABLE Customers (ID INTEGER PRIMARY KEY AUTOINCREMENT, Name VARCHAR(40), Joined DATETIME)",
    "CREATE TABLE OrderLines (ID INTEGER PRIMARY KEY AUTOINCREMENT, CustomerID INTEGER, Item VARCHAR(20))",
    "CREATE TABLE Invoices (Number INTEGER PRIMARY KEY, Memo TEXT)",
    "CREATE TABLE Notes (ID INTEGER PRIMARY KEY, First TEXT, Second TEXT, Code VARCHAR(5))",
    "CREATE TABLE Accounts (ID INTEGER PRIMARY KEY, Balance INTEGER)",
    "CREATE TABLE Tickets (ID INTEGER PRIMARY KEY, Seq INTEGER, Title TEXT)",
];

/// Database file in a temporary directory
pub struct TestDb {
    _dir: TempDir,
    pub path: String,
}

pub fn database() -> TestDb {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("records.db").to_string_lossy().to_string();
    TestDb { _dir: dir, path }
}

pub fn fast_retry() -> RetrySettings {
    RetrySettings::default()
        .with_connection_retries(1, Duration::from_millis(1))
        .with_lock_retries(2, Duration::from_millis(1))
}

pub fn config(db: &TestDb, database_type: DatabaseType, user: &str) -> DatabaseConfig {
    DatabaseConfig::new(database_type, db.path.as_str())
        .with_user(user)
        .with_retry(fast_retry())
}

/// Lock retries long enough to outlast another user's short lock
pub fn patient_retry() -> RetrySettings {
    RetrySettings::default()
        .with_connection_retries(1, Duration::from_millis(1))
        .with_lock_retries(200, Duration::from_millis(5))
}

/// Desktop-only context for `user` that waits out short lock conflicts
pub async fn patient_context(db: &TestDb, user: &str) -> DataContext {
    open_context([DatabaseConfig::new(DatabaseType::Desktop, db.path.as_str())
        .with_user(user)
        .with_retry(patient_retry())])
    .await
    .expect("Failed to open context")
}

/// Context for `user` with both engines on the same file
pub async fn context(db: &TestDb, user: &str) -> DataContext {
    open_context([
        config(db, DatabaseType::Desktop, user),
        config(db, DatabaseType::Server, user),
    ])
    .await
    .expect("Failed to open context")
}

pub async fn desktop(context: &DataContext) -> Arc<dyn Connection> {
    context
        .acquire(DatabaseType::Desktop)
        .await
        .expect("No desktop connection")
        .connection
}

/// Create a database with the test schema and return a context on it
pub async fn setup(user: &str) -> (TestDb, DataContext) {
    let db = database();
    let context = context(&db, user).await;
    let connection = desktop(&context).await;
    for statement in SCHEMA {
        connection
            .execute_command(&Command::new(*statement, vec![]))
            .await
            .expect("Failed to create schema");
    }
    (db, context)
}

/// Alert sink keeping every alert
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn notify(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}

// ============================================================================
// Entities
// ============================================================================

pub struct Customer {
    pub id: i32,
    pub name: String,
    pub joined: NaiveDateTime,
    pub orders: DetailList<OrderLine>,
}

impl Default for Customer {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            joined: NaiveDateTime::default(),
            orders: DetailList::new(&[("id", "customer_id")]),
        }
    }
}

impl Customer {
    pub fn with_id(id: i32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for Customer {
    fn describe() -> TableSchema {
        TableSchema::new("Customers", DatabaseType::Desktop)
            .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key().auto_number())
            .column(ColumnBinding::new("name", ColumnType::String).column("Name").truncate_at(40))
            .column(ColumnBinding::new("joined", ColumnType::Date).column("Joined"))
    }

    fn get(&self, field: &str) -> DatabaseValue {
        match field {
            "id" => self.id.into(),
            "name" => self.name.as_str().into(),
            "joined" => self.joined.into(),
            _ => DatabaseValue::Null,
        }
    }

    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
        match field {
            "id" => self.id = value.take()?,
            "name" => self.name = value.take()?,
            "joined" => self.joined = value.take()?,
            _ => {}
        }
        Ok(())
    }

    fn detail_members(&mut self) -> Vec<&mut dyn DetailMember> {
        vec![&mut self.orders]
    }

    fn data_requirements_met_for_update(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("A customer needs a name".to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct OrderLine {
    pub id: i32,
    pub customer_id: i32,
    pub item: String,
}

impl OrderLine {
    pub fn new(item: &str) -> Self {
        Self {
            item: item.to_string(),
            ..Self::default()
        }
    }
}

impl Entity for OrderLine {
    fn describe() -> TableSchema {
        TableSchema::new("OrderLines", DatabaseType::Desktop)
            .detail()
            .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key().auto_number())
            .column(ColumnBinding::new("customer_id", ColumnType::Int).column("CustomerID"))
            .column(ColumnBinding::new("item", ColumnType::String).column("Item").truncate_at(20))
    }

    fn get(&self, field: &str) -> DatabaseValue {
        match field {
            "id" => self.id.into(),
            "customer_id" => self.customer_id.into(),
            "item" => self.item.as_str().into(),
            _ => DatabaseValue::Null,
        }
    }

    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
        match field {
            "id" => self.id = value.take()?,
            "customer_id" => self.customer_id = value.take()?,
            "item" => self.item = value.take()?,
            _ => {}
        }
        Ok(())
    }
}

/// Numbered from the `AutoNumbers` counter 1
#[derive(Default)]
pub struct Invoice {
    pub number: i64,
    pub memo: String,
}

impl Entity for Invoice {
    fn describe() -> TableSchema {
        TableSchema::new("Invoices", DatabaseType::Desktop)
            .column(
                ColumnBinding::new("number", ColumnType::Long)
                    .column("Number")
                    .primary_key()
                    .custom_auto_number(1),
            )
            .column(ColumnBinding::new("memo", ColumnType::String).column("Memo"))
    }

    fn get(&self, field: &str) -> DatabaseValue {
        match field {
            "number" => self.number.into(),
            "memo" => self.memo.as_str().into(),
            _ => DatabaseValue::Null,
        }
    }

    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
        match field {
            "number" => self.number = value.take()?,
            "memo" => self.memo = value.take()?,
            _ => {}
        }
        Ok(())
    }
}

/// Three text fields; `Code` is declared `VARCHAR(5)` with no mapper limit
#[derive(Default)]
pub struct Note {
    pub id: i32,
    pub first: String,
    pub second: String,
    pub code: String,
}

impl Entity for Note {
    fn describe() -> TableSchema {
        TableSchema::new("Notes", DatabaseType::Desktop)
            .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key())
            .column(ColumnBinding::new("first", ColumnType::String).column("First"))
            .column(ColumnBinding::new("second", ColumnType::String).column("Second"))
            .column(ColumnBinding::new("code", ColumnType::String).column("Code"))
    }

    fn get(&self, field: &str) -> DatabaseValue {
        match field {
            "id" => self.id.into(),
            "first" => self.first.as_str().into(),
            "second" => self.second.as_str().into(),
            "code" => self.code.as_str().into(),
            _ => DatabaseValue::Null,
        }
    }

    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
        match field {
            "id" => self.id = value.take()?,
            "first" => self.first = value.take()?,
            "second" => self.second = value.take()?,
            "code" => self.code = value.take()?,
            _ => {}
        }
        Ok(())
    }
}

/// Stored on the server engine
#[derive(Default)]
pub struct Account {
    pub id: i32,
    pub balance: i64,
}

impl Entity for Account {
    fn describe() -> TableSchema {
        TableSchema::new("Accounts", DatabaseType::Server)
            .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key())
            .column(ColumnBinding::new("balance", ColumnType::Long).column("Balance"))
    }

    fn get(&self, field: &str) -> DatabaseValue {
        match field {
            "id" => self.id.into(),
            "balance" => self.balance.into(),
            _ => DatabaseValue::Null,
        }
    }

    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
        match field {
            "id" => self.id = value.take()?,
            "balance" => self.balance = value.take()?,
            _ => {}
        }
        Ok(())
    }
}

/// Customers with their order lines keyed by item
pub struct CustomerItems {
    pub id: i32,
    pub name: String,
    pub lines: DetailMap<String, OrderLine>,
}

impl Default for CustomerItems {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            lines: DetailMap::new(&[("id", "customer_id")], |line: &OrderLine| line.item.clone()),
        }
    }
}

impl CustomerItems {
    pub fn with_id(id: i32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

impl Entity for CustomerItems {
    fn describe() -> TableSchema {
        TableSchema::new("Customers", DatabaseType::Desktop)
            .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key().auto_number())
            .column(ColumnBinding::new("name", ColumnType::String).column("Name").truncate_at(40))
    }

    fn get(&self, field: &str) -> DatabaseValue {
        match field {
            "id" => self.id.into(),
            "name" => self.name.as_str().into(),
            _ => DatabaseValue::Null,
        }
    }

    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
        match field {
            "id" => self.id = value.take()?,
            "name" => self.name = value.take()?,
            _ => {}
        }
        Ok(())
    }

    fn detail_members(&mut self) -> Vec<&mut dyn DetailMember> {
        vec![&mut self.lines]
    }
}

/// Notes whose code must fit five characters
#[derive(Default)]
pub struct StrictNote {
    pub id: i32,
    pub code: String,
}

impl Entity for StrictNote {
    fn describe() -> TableSchema {
        TableSchema::new("Notes", DatabaseType::Desktop)
            .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key())
            .column(
                ColumnBinding::new("code", ColumnType::String)
                    .column("Code")
                    .truncate_at(5)
                    .strict_truncation(),
            )
    }

    fn get(&self, field: &str) -> DatabaseValue {
        match field {
            "id" => self.id.into(),
            "code" => self.code.as_str().into(),
            _ => DatabaseValue::Null,
        }
    }

    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
        match field {
            "id" => self.id = value.take()?,
            "code" => self.code = value.take()?,
            _ => {}
        }
        Ok(())
    }
}

/// Ticket with a sequence number from counter 2; titles are stored in capitals
#[derive(Default)]
pub struct Ticket {
    pub id: i32,
    pub seq: i64,
    pub title: String,
}

impl Entity for Ticket {
    fn describe() -> TableSchema {
        TableSchema::new("Tickets", DatabaseType::Desktop)
            .column(ColumnBinding::new("id", ColumnType::Int).column("ID").primary_key())
            .column(ColumnBinding::new("seq", ColumnType::Long).column("Seq").custom_auto_number(2))
            .column(ColumnBinding::new("title", ColumnType::String).column("Title"))
    }

    fn get(&self, field: &str) -> DatabaseValue {
        match field {
            "id" => self.id.into(),
            "seq" => self.seq.into(),
            "title" => self.title.as_str().into(),
            _ => DatabaseValue::Null,
        }
    }

    fn set(&mut self, field: &str, value: DatabaseValue) -> Result<()> {
        match field {
            "id" => self.id = value.take()?,
            "seq" => self.seq = value.take()?,
            "title" => self.title = value.take()?,
            _ => {}
        }
        Ok(())
    }

    fn pre_update(&mut self) -> Result<()> {
        self.title = self.title.to_uppercase();
        Ok(())
    }
}
