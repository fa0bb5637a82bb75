//! Local change tracking
//!
//! A [`Observation`] keeps a mirror of the document as it was last seen and
//! turns each mutation batch into the patch operations that take the mirror
//! to the current document. [`DataContainer`] pairs a document with its
//! observation and folds every batch into a pending [`Modification`].

use json_patch::PatchOperation;
use serde_json::Value;
use thiserror::Error;

/// Errors from the change observer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObserverError {
    #[error("Document is already observed")]
    AlreadyObserving,

    #[error("Document is not observed")]
    NotObserving,

    /// Remote operations could not be applied to the local document
    #[error("Patch could not be applied: {0}")]
    Patch(String),
}

/// Unsent local changes
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Modification {
    /// Nothing to send
    #[default]
    None,
    /// The whole document was replaced; send this document
    Set(Value),
    /// Patch operations accumulated since the last flush, in order
    Update(Vec<PatchOperation>),
}

impl Modification {
    pub fn is_none(&self) -> bool {
        matches!(self, Modification::None)
    }

    /// Take the pending change, leaving `None`
    pub fn take(&mut self) -> Modification {
        std::mem::take(self)
    }

    /// Record a whole-document replacement
    fn record_set(&mut self, data: Value) {
        *self = Modification::Set(data);
    }

    /// Record a mutation batch
    ///
    /// A pending replacement absorbs the batch by snapshotting `current`.
    fn record_update(&mut self, ops: Vec<PatchOperation>, current: &Value) {
        match self {
            Modification::None => *self = Modification::Update(ops),
            Modification::Update(pending) => pending.extend(ops),
            Modification::Set(_) => *self = Modification::Set(current.clone()),
        }
    }

    /// Put back a change that failed to send
    ///
    /// `earlier` is ordered before whatever was recorded since it was taken.
    /// `current` is the document as it is now.
    pub fn requeue(&mut self, earlier: Modification, current: &Value) {
        let later = self.take();
        *self = match (earlier, later) {
            (earlier, Modification::None) => earlier,
            (_, Modification::Set(data)) => Modification::Set(data),
            (Modification::None, later) => later,
            (Modification::Update(mut ops), Modification::Update(more)) => {
                ops.extend(more);
                Modification::Update(ops)
            }
            (Modification::Set(_), Modification::Update(_)) => Modification::Set(current.clone()),
        };
    }
}

/// Tracks changes to one document
#[derive(Debug)]
pub struct Observer;

impl Observer {
    /// Start tracking a document
    pub fn observe(data: &Value) -> Observation {
        Observation {
            mirror: data.clone(),
        }
    }
}

/// Active tracking of a document
#[derive(Debug, Clone)]
pub struct Observation {
    mirror: Value,
}

impl Observation {
    /// Operations turning the last seen document into `current`
    ///
    /// The mirror advances, so each change is reported once.
    pub fn generate(&mut self, current: &Value) -> Vec<PatchOperation> {
        if self.mirror == *current {
            return Vec::new();
        }
        let ops = json_patch::diff(&self.mirror, current).0;
        self.mirror = current.clone();
        ops
    }

    /// Stop tracking
    pub fn unobserve(self) {}
}

/// A document, its observation and its pending change
#[derive(Debug)]
pub struct DataContainer {
    data: Value,
    observation: Option<Observation>,
    modification: Modification,
}

impl DataContainer {
    /// Wrap a document and start observing it
    pub fn new(data: Value) -> Self {
        let observation = Some(Observer::observe(&data));
        Self {
            data,
            observation,
            modification: Modification::None,
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn modification(&self) -> &Modification {
        &self.modification
    }

    pub fn is_observed(&self) -> bool {
        self.observation.is_some()
    }

    /// Start observing the current document
    pub fn observe(&mut self) -> Result<(), ObserverError> {
        if self.observation.is_some() {
            return Err(ObserverError::AlreadyObserving);
        }
        self.observation = Some(Observer::observe(&self.data));
        Ok(())
    }

    /// Stop observing. Returns false if nothing was observed.
    pub fn unobserve(&mut self) -> bool {
        match self.observation.take() {
            Some(observation) => {
                observation.unobserve();
                true
            }
            None => false,
        }
    }

    fn reobserve(&mut self) {
        self.unobserve();
        self.observation = Some(Observer::observe(&self.data));
    }

    /// Replace the whole document as a local change
    ///
    /// Returns the previous document.
    pub fn set(&mut self, data: Value) -> Value {
        let previous = std::mem::replace(&mut self.data, data);
        self.reobserve();
        self.modification.record_set(self.data.clone());
        previous
    }

    /// Run a mutation batch against the document
    ///
    /// Returns the closure's result and the operations the batch produced.
    /// An empty batch leaves the pending change untouched.
    pub fn mutate<F, R>(&mut self, f: F) -> Result<(R, Vec<PatchOperation>), ObserverError>
    where
        F: FnOnce(&mut Value) -> R,
    {
        if self.observation.is_none() {
            return Err(ObserverError::NotObserving);
        }

        let result = f(&mut self.data);

        let ops = match self.observation.as_mut() {
            Some(observation) => observation.generate(&self.data),
            None => Vec::new(),
        };
        if !ops.is_empty() {
            self.modification.record_update(ops.clone(), &self.data);
        }
        Ok((result, ops))
    }

    /// Take the pending change for sending
    pub fn take_modification(&mut self) -> Modification {
        self.modification.take()
    }

    /// Put back a change that failed to send
    pub fn requeue(&mut self, earlier: Modification) {
        self.modification.requeue(earlier, &self.data);
    }

    /// Install a document received from the server
    ///
    /// Pending local changes are discarded. Returns the previous document.
    pub fn reset(&mut self, data: Value) -> Value {
        let previous = std::mem::replace(&mut self.data, data);
        self.modification = Modification::None;
        self.reobserve();
        previous
    }

    /// Move pending local changes onto a fresh server document
    ///
    /// A pending replacement is kept as it is. Pending operations are replayed
    /// on `data` and stay pending. When they no longer apply the document is
    /// reset to `data` and the error is returned. Returns the previous
    /// document either way.
    pub fn rebase(&mut self, data: Value) -> (Value, Result<(), ObserverError>) {
        match self.modification.take() {
            Modification::None => (self.reset(data), Ok(())),
            Modification::Set(local) => {
                self.modification = Modification::Set(local);
                (self.data.clone(), Ok(()))
            }
            Modification::Update(ops) => {
                let mut next = data.clone();
                if let Err(e) = json_patch::patch(&mut next, &ops) {
                    let previous = self.reset(data);
                    return (previous, Err(ObserverError::Patch(e.to_string())));
                }
                let previous = std::mem::replace(&mut self.data, next);
                self.modification = Modification::Update(ops);
                self.reobserve();
                (previous, Ok(()))
            }
        }
    }

    /// Apply operations received from the server on top of local state
    ///
    /// Pending local changes are kept. A pending replacement is refreshed to
    /// include the remote operations. On failure nothing changes.
    pub fn apply_remote(&mut self, ops: &[PatchOperation]) -> Result<Value, ObserverError> {
        let mut next = self.data.clone();
        json_patch::patch(&mut next, ops).map_err(|e| ObserverError::Patch(e.to_string()))?;

        let previous = std::mem::replace(&mut self.data, next);
        if let Modification::Set(_) = self.modification {
            self.modification = Modification::Set(self.data.clone());
        }
        self.reobserve();
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ops(value: Value) -> Vec<PatchOperation> {
        serde_json::from_value(value).unwrap()
    }

    fn apply(doc: &Value, patch: &[PatchOperation]) -> Value {
        let mut doc = doc.clone();
        json_patch::patch(&mut doc, patch).unwrap();
        doc
    }

    #[test]
    fn test_generate_reports_each_change_once() {
        let mut doc = json!({"a": 1});
        let mut observation = Observer::observe(&doc);

        assert!(observation.generate(&doc).is_empty());

        doc["b"] = json!(2);
        let first = observation.generate(&doc);
        assert_eq!(apply(&json!({"a": 1}), &first), doc);
        assert!(observation.generate(&doc).is_empty());
    }

    #[test]
    fn test_update_replays_to_post_mutation_document() {
        let before = json!({"users": [{"name": "ann"}], "count": 1});
        let mut container = DataContainer::new(before.clone());

        container
            .mutate(|doc| {
                doc["users"]
                    .as_array_mut()
                    .unwrap()
                    .push(json!({"name": "bob"}));
                doc["count"] = json!(2);
            })
            .unwrap();
        container
            .mutate(|doc| {
                doc.as_object_mut().unwrap().remove("count");
            })
            .unwrap();

        let Modification::Update(pending) = container.modification() else {
            panic!("Expected Update modification");
        };
        assert_eq!(apply(&before, pending), *container.data());
    }

    #[test]
    fn test_empty_batch_records_nothing() {
        let mut container = DataContainer::new(json!({"a": 1}));
        let (_, batch) = container.mutate(|doc| doc["a"] = json!(1)).unwrap();
        assert!(batch.is_empty());
        assert!(container.modification().is_none());
    }

    #[test]
    fn test_set_then_mutation_stays_set() {
        let mut container = DataContainer::new(json!({}));
        container.set(json!({"s": 1}));
        container.mutate(|doc| doc["t"] = json!(2)).unwrap();

        assert_eq!(
            *container.modification(),
            Modification::Set(json!({"s": 1, "t": 2}))
        );
    }

    #[test]
    fn test_update_then_set_becomes_set() {
        let mut container = DataContainer::new(json!({}));
        container.mutate(|doc| doc["a"] = json!(1)).unwrap();
        let previous = container.set(json!({"fresh": true}));

        assert_eq!(previous, json!({"a": 1}));
        assert_eq!(
            *container.modification(),
            Modification::Set(json!({"fresh": true}))
        );
    }

    #[test]
    fn test_observe_twice_fails() {
        let mut container = DataContainer::new(json!({}));
        assert_eq!(container.observe(), Err(ObserverError::AlreadyObserving));

        assert!(container.unobserve());
        assert!(!container.unobserve());
        assert_eq!(
            container.mutate(|_| ()).unwrap_err(),
            ObserverError::NotObserving
        );

        container.observe().unwrap();
        assert!(container.is_observed());
    }

    #[test]
    fn test_take_and_requeue_updates() {
        let mut container = DataContainer::new(json!({}));
        container.mutate(|doc| doc["a"] = json!(1)).unwrap();
        let sent = container.take_modification();
        assert!(container.modification().is_none());

        // A change made while the send was in flight
        container.mutate(|doc| doc["b"] = json!(2)).unwrap();
        container.requeue(sent);

        let Modification::Update(pending) = container.modification() else {
            panic!("Expected Update modification");
        };
        assert_eq!(apply(&json!({}), pending), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_requeue_combinations() {
        let current = json!({"now": true});
        let update = || Modification::Update(ops(json!([{"op": "add", "path": "/x", "value": 1}])));

        let mut pending = Modification::None;
        pending.requeue(update(), &current);
        assert_eq!(pending, update());

        let mut pending = Modification::Set(json!({"later": 1}));
        pending.requeue(update(), &current);
        assert_eq!(pending, Modification::Set(json!({"later": 1})));

        let mut pending = update();
        pending.requeue(Modification::Set(json!({"earlier": 1})), &current);
        assert_eq!(pending, Modification::Set(current.clone()));

        let mut pending = update();
        pending.requeue(Modification::None, &current);
        assert_eq!(pending, update());
    }

    #[test]
    fn test_reset_discards_pending() {
        let mut container = DataContainer::new(json!({}));
        container.mutate(|doc| doc["a"] = json!(1)).unwrap();

        let previous = container.reset(json!({"server": 1}));
        assert_eq!(previous, json!({"a": 1}));
        assert!(container.modification().is_none());

        // Observation follows the new document
        container.mutate(|doc| doc["b"] = json!(2)).unwrap();
        let Modification::Update(pending) = container.modification() else {
            panic!("Expected Update modification");
        };
        assert_eq!(
            apply(&json!({"server": 1}), pending),
            json!({"server": 1, "b": 2})
        );
    }

    #[test]
    fn test_apply_remote_keeps_local_changes() {
        let mut container = DataContainer::new(json!({"a": 1}));
        container.mutate(|doc| doc["local"] = json!(true)).unwrap();

        container
            .apply_remote(&ops(json!([{"op": "add", "path": "/remote", "value": 1}])))
            .unwrap();

        assert_eq!(
            *container.data(),
            json!({"a": 1, "local": true, "remote": 1})
        );
        // Remote ops are not recorded as local changes
        let Modification::Update(pending) = container.modification() else {
            panic!("Expected Update modification");
        };
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_rebase_replays_pending_update() {
        let mut container = DataContainer::new(json!({"a": 1}));
        container.mutate(|doc| doc["local"] = json!(true)).unwrap();

        let (previous, rebased) = container.rebase(json!({"a": 1, "missed": 2}));
        rebased.unwrap();
        assert_eq!(previous, json!({"a": 1, "local": true}));
        assert_eq!(
            *container.data(),
            json!({"a": 1, "missed": 2, "local": true})
        );

        // Still pending, and later batches extend it
        container.mutate(|doc| doc["more"] = json!(3)).unwrap();
        let Modification::Update(pending) = container.modification() else {
            panic!("Expected Update modification");
        };
        assert_eq!(
            apply(&json!({"a": 1, "missed": 2}), pending),
            *container.data()
        );
    }

    #[test]
    fn test_rebase_keeps_pending_set() {
        let mut container = DataContainer::new(json!({}));
        container.set(json!({"mine": 1}));

        let (_, rebased) = container.rebase(json!({"server": 1}));
        rebased.unwrap();
        assert_eq!(*container.data(), json!({"mine": 1}));
        assert_eq!(
            *container.modification(),
            Modification::Set(json!({"mine": 1}))
        );
    }

    #[test]
    fn test_rebase_without_pending_resets() {
        let mut container = DataContainer::new(json!({"old": 1}));
        let (previous, rebased) = container.rebase(json!({"new": 1}));
        rebased.unwrap();
        assert_eq!(previous, json!({"old": 1}));
        assert_eq!(*container.data(), json!({"new": 1}));
        assert!(container.modification().is_none());
    }

    #[test]
    fn test_rebase_conflict_falls_back_to_server() {
        let mut container = DataContainer::new(json!({"list": [1]}));
        container.mutate(|doc| doc["list"][0] = json!(9)).unwrap();

        let (_, rebased) = container.rebase(json!({"other": true}));
        assert!(matches!(rebased, Err(ObserverError::Patch(_))));
        assert_eq!(*container.data(), json!({"other": true}));
        assert!(container.modification().is_none());
    }

    #[test]
    fn test_apply_remote_failure_changes_nothing() {
        let mut container = DataContainer::new(json!({"a": 1}));
        let err = container
            .apply_remote(&ops(json!([{"op": "remove", "path": "/missing"}])))
            .unwrap_err();

        assert!(matches!(err, ObserverError::Patch(_)));
        assert_eq!(*container.data(), json!({"a": 1}));
    }
}
