//! Parameterized SQL builders
//!
//! Builders generate the default query of an entity, the queries loading
//! detail collections, and the statements the engines issue when applying
//! table changes. Values are always bound as parameters.

use super::value::DatabaseValue;

/// SQL comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Equal to (=)
    Eq,
    /// Null-safe equality (IS)
    Is,
    /// IS NULL
    IsNull,
}

impl Operator {
    fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Is => "IS",
            Operator::IsNull => "IS NULL",
        }
    }
}

/// WHERE clause condition
#[derive(Debug, Clone)]
pub struct Condition {
    column: String,
    operator: Operator,
    value: Option<DatabaseValue>,
}

impl Condition {
    fn render(&self) -> String {
        match self.operator {
            Operator::IsNull => format!("{} {}", self.column, self.operator.as_sql()),
            _ => format!("{} {} ?", self.column, self.operator.as_sql()),
        }
    }
}

fn where_clause(conditions: &[Condition]) -> String {
    if conditions.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = conditions.iter().map(Condition::render).collect();
    format!(" WHERE {}", rendered.join(" AND "))
}

fn where_params(conditions: &[Condition]) -> impl Iterator<Item = DatabaseValue> + '_ {
    conditions.iter().filter_map(|cond| cond.value.clone())
}

// WHERE methods shared by the builders
macro_rules! where_methods {
    () => {
        /// Add a `column = ?` condition
        #[must_use]
        pub fn where_eq(mut self, column: &str, value: impl Into<DatabaseValue>) -> Self {
            self.where_conditions.push(Condition {
                column: column.to_string(),
                operator: Operator::Eq,
                value: Some(value.into()),
            });
            self
        }

        /// Add a null-safe `column IS ?` condition
        #[must_use]
        pub fn where_is(mut self, column: &str, value: impl Into<DatabaseValue>) -> Self {
            self.where_conditions.push(Condition {
                column: column.to_string(),
                operator: Operator::Is,
                value: Some(value.into()),
            });
            self
        }

        /// Add a `column IS NULL` condition
        #[must_use]
        pub fn where_null(mut self, column: &str) -> Self {
            self.where_conditions.push(Condition {
                column: column.to_string(),
                operator: Operator::IsNull,
                value: None,
            });
            self
        }
    };
}

/// SELECT query builder
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    table: String,
    columns: Vec<String>,
    where_conditions: Vec<Condition>,
    order_by: Vec<String>,
}

impl SelectBuilder {
    /// Create a new SELECT query builder
    ///
    /// # Example
    ///
    /// ```
    /// use rust_record_lock::core::query_builder::SelectBuilder;
    ///
    /// let query = SelectBuilder::new("Customers")
    ///     .columns(&["ID", "Name"])
    ///     .where_eq("ID", 7)
    ///     .build();
    /// assert_eq!(query, "SELECT ID, Name FROM Customers WHERE ID = ?");
    /// ```
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: vec!["*".to_string()],
            where_conditions: Vec::new(),
            order_by: Vec::new(),
        }
    }

    /// Select specific columns
    #[must_use]
    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    where_methods!();

    /// Add ORDER BY ASC
    #[must_use]
    pub fn order_by_asc(mut self, column: &str) -> Self {
        self.order_by.push(format!("{column} ASC"));
        self
    }

    /// Build the SQL query string
    pub fn build(&self) -> String {
        let mut sql = format!("SELECT {} FROM {}", self.columns.join(", "), self.table);
        sql.push_str(&where_clause(&self.where_conditions));
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        sql
    }

    /// Get the parameter values for parameterized queries
    pub fn params(&self) -> Vec<DatabaseValue> {
        where_params(&self.where_conditions).collect()
    }
}

/// INSERT query builder
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    columns: Vec<String>,
    values: Vec<DatabaseValue>,
}

impl InsertBuilder {
    /// Create a new INSERT query builder
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Add a column-value pair
    #[must_use]
    pub fn value(mut self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.columns.push(column.to_string());
        self.values.push(value.into());
        self
    }

    /// Build the SQL query string
    pub fn build(&self) -> String {
        if self.columns.is_empty() {
            return format!("INSERT INTO {} DEFAULT VALUES", self.table);
        }
        let placeholders = vec!["?"; self.values.len()];
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            self.columns.join(", "),
            placeholders.join(", ")
        )
    }

    /// Get the parameter values
    pub fn params(&self) -> Vec<DatabaseValue> {
        self.values.clone()
    }
}

/// UPDATE query builder
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    set_columns: Vec<String>,
    set_values: Vec<DatabaseValue>,
    where_conditions: Vec<Condition>,
}

impl UpdateBuilder {
    /// Create a new UPDATE query builder
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            set_columns: Vec::new(),
            set_values: Vec::new(),
            where_conditions: Vec::new(),
        }
    }

    /// Set a column value
    #[must_use]
    pub fn set(mut self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.set_columns.push(column.to_string());
        self.set_values.push(value.into());
        self
    }

    where_methods!();

    /// Build the SQL query string
    pub fn build(&self) -> String {
        let set_clauses: Vec<String> = self
            .set_columns
            .iter()
            .map(|col| format!("{} = ?", col))
            .collect();

        format!(
            "UPDATE {} SET {}{}",
            self.table,
            set_clauses.join(", "),
            where_clause(&self.where_conditions)
        )
    }

    /// Get the parameter values (SET values followed by WHERE values)
    pub fn params(&self) -> Vec<DatabaseValue> {
        let mut params = self.set_values.clone();
        params.extend(where_params(&self.where_conditions));
        params
    }
}

/// DELETE query builder
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    where_conditions: Vec<Condition>,
}

impl DeleteBuilder {
    /// Create a new DELETE query builder
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_conditions: Vec::new(),
        }
    }

    where_methods!();

    /// Build the SQL query string
    pub fn build(&self) -> String {
        format!("DELETE FROM {}{}", self.table, where_clause(&self.where_conditions))
    }

    /// Get the parameter values
    pub fn params(&self) -> Vec<DatabaseValue> {
        where_params(&self.where_conditions).collect()
    }
}
