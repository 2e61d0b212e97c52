//! In-memory record collection behind the CRUD routes.
//!
//! Records are JSON objects with a numeric `id`. Every mutation happens
//! under one lock inside a single handler call.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{json, Map, Value};

pub type Record = Map<String, Value>;

/// The mutable user collection.
#[derive(Debug)]
pub struct RecordStore {
    records: Mutex<Vec<Record>>,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::seeded()
    }
}

fn record(id: i64, fields: Record) -> Record {
    let mut record = fields;
    // The path/allocated id always wins over a body-supplied one.
    record.insert("id".to_string(), json!(id));
    record
}

fn record_id(record: &Record) -> Option<i64> {
    record.get("id").and_then(Value::as_i64)
}

impl RecordStore {
    /// The two canonical users.
    pub fn seeded() -> Self {
        let seed = [
            (1, "John Doe", "john@example.com"),
            (2, "Jane Doe", "jane@example.com"),
        ];
        let records = seed
            .into_iter()
            .map(|(id, name, email)| {
                let mut fields = Record::new();
                fields.insert("name".to_string(), json!(name));
                fields.insert("email".to_string(), json!(email));
                record(id, fields)
            })
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A snapshot of every record, in insertion order.
    pub fn list(&self) -> Vec<Record> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn get(&self, id: i64) -> Option<Record> {
        self.lock().iter().find(|r| record_id(r) == Some(id)).cloned()
    }

    /// Appends a record with the next free id (`max + 1`).
    pub fn create(&self, fields: Record) -> Record {
        let mut records = self.lock();
        let id = records.iter().filter_map(record_id).max().unwrap_or(0) + 1;
        let created = record(id, fields);
        records.push(created.clone());
        created
    }

    /// Merges `fields` into record `id`. Returns `false` if it does not exist.
    pub fn patch(&self, id: i64, fields: Record) -> bool {
        let mut records = self.lock();
        let Some(existing) = records.iter_mut().find(|r| record_id(r) == Some(id)) else {
            return false;
        };
        for (key, value) in fields {
            if key != "id" {
                existing.insert(key, value);
            }
        }
        true
    }

    /// Replaces record `id` wholesale, keeping its id.
    pub fn replace(&self, id: i64, fields: Record) -> Option<Record> {
        let mut records = self.lock();
        let existing = records.iter_mut().find(|r| record_id(r) == Some(id))?;
        *existing = record(id, fields);
        Some(existing.clone())
    }

    /// Removes record `id`. Returns `false` if it does not exist.
    pub fn delete(&self, id: i64) -> bool {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| record_id(r) != Some(id));
        records.len() != before
    }
}
