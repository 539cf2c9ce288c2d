//! A value stamped with the data version at which it last changed.

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VersionedField<T> {
    value: T,
    data_version: u64,
}

impl<T: PartialEq> VersionedField<T> {
    pub fn new(value: T) -> Self {
        VersionedField {
            value,
            data_version: 0,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    /// Store `value` at `version`. Writing the current value again is a
    /// no-op, and the stored version never moves backwards.
    ///
    /// Returns true if the value changed.
    pub fn set(&mut self, value: T, version: u64) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        self.data_version = self.data_version.max(version);
        true
    }

    pub fn changed_since(&self, version: u64) -> bool {
        self.data_version > version
    }
}

impl<T: PartialEq> VersionedField<Option<T>> {
    /// Store only when `value` is present; absent readings leave the
    /// previous value alone.
    pub fn set_some(&mut self, value: Option<T>, version: u64) -> bool {
        match value {
            Some(v) => self.set(Some(v), version),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
