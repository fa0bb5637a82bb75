//! Typed record collections stored inside the shared document
//!
//! Each collection lives at `/m/<name>` as
//!
//! ```json
//! { "nextId": 3, "obj": { "1": { "id": "1", ... }, "2": { "id": "2", ... } } }
//! ```
//!
//! Ids are decimal strings handed out from `nextId` and never reused.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{SyncError, SyncResult};

use super::session::ClientSession;

/// Key under which all collections are stored
const MODELS_KEY: &str = "m";

/// A value that can be stored in a [`Collection`]
///
/// The id should be serialized with the record (usually as an `id` field) so
/// the stored object carries it.
pub trait Record: Serialize + DeserializeOwned {
    /// Collection name, the key under `/m`
    const COLLECTION: &'static str;

    fn id(&self) -> Option<&str>;

    fn set_id(&mut self, id: Option<String>);
}

/// Records of one type, read from and written to a session's document
pub struct Collection<T> {
    session: ClientSession,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Collection<T> {
    pub fn new(session: &ClientSession) -> Self {
        Self::named(session, T::COLLECTION)
    }

    /// A collection stored under a name other than the record's default
    pub fn named(session: &ClientSession, name: &str) -> Self {
        Self {
            session: session.clone(),
            name: name.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every record, in id order
    pub fn all(&self) -> SyncResult<Vec<T>> {
        let data = self.session.data()?;
        read_records(&data, &self.name)
    }

    pub fn get(&self, id: &str) -> SyncResult<Option<T>> {
        let data = self.session.data()?;
        match storage(&data, &self.name).and_then(|s| s.get("obj")?.get(id)) {
            Some(value) => decode(&self.name, value.clone()).map(Some),
            None => Ok(None),
        }
    }

    /// First record matching the predicate
    pub fn find<F>(&self, predicate: F) -> SyncResult<Option<T>>
    where
        F: Fn(&T) -> bool,
    {
        Ok(self.all()?.into_iter().find(|record| predicate(record)))
    }

    /// Every record matching the predicate
    pub fn find_all<F>(&self, predicate: F) -> SyncResult<Vec<T>>
    where
        F: Fn(&T) -> bool,
    {
        Ok(self
            .all()?
            .into_iter()
            .filter(|record| predicate(record))
            .collect())
    }

    /// Insert or overwrite a record
    ///
    /// A record without an id is given the next one. With `immediately` the
    /// session is flushed instead of waiting for the idle window.
    pub async fn save(&self, record: &mut T, immediately: bool) -> SyncResult<()> {
        let name = &self.name;
        self.session.update(|doc| -> SyncResult<()> {
            let storage = storage_mut(doc, name)?;
            let id = match record.id() {
                Some(id) => id.to_string(),
                None => take_next_id(storage),
            };
            record.set_id(Some(id.clone()));

            let value = serde_json::to_value(&*record).map_err(|e| {
                SyncError::Validation(format!("record can not be serialized: {}", e))
            })?;
            if let Some(Value::Object(objects)) = storage.get_mut("obj") {
                objects.insert(id, value);
            }
            Ok(())
        })??;

        if immediately {
            self.session.save().await?;
        }
        Ok(())
    }

    /// Remove a record and clear its id
    ///
    /// Returns false when the record was never saved or is already gone.
    pub async fn delete(&self, record: &mut T, immediately: bool) -> SyncResult<bool> {
        let Some(id) = record.id().map(str::to_string) else {
            return Ok(false);
        };

        let name = &self.name;
        let removed = self.session.update(|doc| -> SyncResult<bool> {
            let storage = storage_mut(doc, name)?;
            Ok(match storage.get_mut("obj") {
                Some(Value::Object(objects)) => objects.remove(&id).is_some(),
                _ => false,
            })
        })??;

        if !removed {
            return Ok(false);
        }
        record.set_id(None);

        if immediately {
            self.session.save().await?;
        }
        Ok(true)
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish()
    }
}

fn storage<'a>(doc: &'a Value, name: &str) -> Option<&'a Value> {
    doc.get(MODELS_KEY)?.get(name)
}

/// The storage object of a collection, created when missing
fn storage_mut<'a>(doc: &'a mut Value, name: &str) -> SyncResult<&'a mut Map<String, Value>> {
    let Value::Object(root) = doc else {
        return Err(SyncError::Validation(
            "document root is not an object".to_string(),
        ));
    };

    let models = root
        .entry(MODELS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(models) = models else {
        return Err(SyncError::Validation(format!(
            "'/{}' is not an object",
            MODELS_KEY
        )));
    };

    let storage = models
        .entry(name)
        .or_insert_with(|| json!({"nextId": 1, "obj": {}}));
    let Value::Object(storage) = storage else {
        return Err(SyncError::Validation(format!(
            "'/{}/{}' is not an object",
            MODELS_KEY, name
        )));
    };

    if !matches!(storage.get("obj"), Some(Value::Object(_))) {
        storage.insert("obj".to_string(), Value::Object(Map::new()));
    }
    Ok(storage)
}

fn take_next_id(storage: &mut Map<String, Value>) -> String {
    let next = storage.get("nextId").and_then(Value::as_u64).unwrap_or(1);
    storage.insert("nextId".to_string(), json!(next + 1));
    next.to_string()
}

fn decode<T: DeserializeOwned>(name: &str, value: Value) -> SyncResult<T> {
    serde_json::from_value(value)
        .map_err(|e| SyncError::Validation(format!("malformed record in '{}': {}", name, e)))
}

fn read_records<T: DeserializeOwned>(doc: &Value, name: &str) -> SyncResult<Vec<T>> {
    let Some(Value::Object(objects)) = storage(doc, name).and_then(|s| s.get("obj")) else {
        return Ok(Vec::new());
    };

    // Map keys sort as strings; ids are numbers
    let mut entries: Vec<(&String, &Value)> = objects.iter().collect();
    entries.sort_by_key(|(id, _)| (id.parse::<u64>().unwrap_or(u64::MAX), (*id).clone()));

    entries
        .into_iter()
        .map(|(_, value)| decode(name, value.clone()))
        .collect()
}
