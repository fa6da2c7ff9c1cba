//! Merge operators. A MERGE entry does not overwrite the previous value of its key; instead the
//! engine folds the entry into the key's history with a user-supplied operator, both when reading
//! and when compacting.

use std::rc::Rc;

/// A user-supplied associative fold applied to MERGE entries.
pub trait Merger {
    /// A unique identifier for this operator.
    fn name(&self) -> &'static str;

    /// Combines two values of `key`, where `older` was written before `newer`. The engine folds
    /// histories newest-first, so `newer` is the accumulated result of all later operands.
    fn merge(&self, key: &[u8], newer: &[u8], older: &[u8]) -> Vec<u8>;
}

pub type BoxedMerger = Rc<Box<dyn Merger>>;

/// The default operator: concatenates operands in write order.
#[derive(Clone)]
pub struct ConcatMerger;

impl Merger for ConcatMerger {
    fn name(&self) -> &'static str {
        "shaledb.ConcatMerger"
    }

    fn merge(&self, _key: &[u8], newer: &[u8], older: &[u8]) -> Vec<u8> {
        let mut v = Vec::with_capacity(older.len() + newer.len());
        v.extend_from_slice(older);
        v.extend_from_slice(newer);
        v
    }
}
