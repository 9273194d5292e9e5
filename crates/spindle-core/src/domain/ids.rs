//! Domain identifiers (strongly-typed IDs).
//!
//! Task and worker ids are ULIDs wrapped in a phantom-typed `Id<T>`, so a
//! `TaskId` can never be passed where a `WorkerId` is expected. ULIDs sort by
//! creation time and can be generated on any node without coordination.
//!
//! Tenant, stage and service names are configured by operators rather than
//! generated, so they are plain string newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Marker trait for each id kind. Provides the display prefix.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed id.
///
/// `T` only exists at compile time; `Id<T>` is the same size as a `Ulid`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Parse from the display form (`task-01H...`) or a bare ULID string.
    pub fn parse(s: &str) -> Option<Self> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).ok().map(Self::from_ulid)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Task marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Worker marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Worker {}

impl IdMarker for Worker {
    fn prefix() -> &'static str {
        "worker-"
    }
}

/// Identifier of a task (one unit of pipeline work owned by a tenant).
pub type TaskId = Id<Task>;

/// Identifier of a worker (the holder of a claim).
pub type WorkerId = Id<Worker>;

macro_rules! name_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self::new(s))
            }
        }
    };
}

name_newtype!(
    /// Identifier of a tenant (channel). Ordered lexically; the fairness
    /// tie-break picks the lowest.
    TenantId
);

name_newtype!(
    /// Name of a pipeline stage.
    StageName
);

name_newtype!(
    /// Name of a rate-limited downstream service.
    ServiceName
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_prefix() {
        let task = TaskId::from_ulid(Ulid::new());
        let worker = WorkerId::from_ulid(Ulid::new());

        assert!(task.to_string().starts_with("task-"));
        assert!(worker.to_string().starts_with("worker-"));
        // let _: WorkerId = task; // <- does not compile
    }

    #[test]
    fn parse_accepts_prefixed_and_bare_forms() {
        let ulid = Ulid::new();
        let task = TaskId::from_ulid(ulid);

        assert_eq!(TaskId::parse(&task.to_string()), Some(task));
        assert_eq!(TaskId::parse(&ulid.to_string()), Some(task));
        assert_eq!(TaskId::parse("task-not-a-ulid"), None);
    }

    #[test]
    fn ids_serialize_as_bare_ulid() {
        let task = TaskId::from_ulid(Ulid::new());
        let serialized = serde_json::to_string(&task).unwrap();
        let back: TaskId = serde_json::from_str(&serialized).unwrap();

        assert_eq!(task, back);
        assert_eq!(serialized, format!("\"{}\"", task.as_ulid()));
    }

    #[test]
    fn tenant_ids_order_lexically() {
        let mut tenants = vec![TenantId::new("b"), TenantId::new("a"), TenantId::new("c")];
        tenants.sort();
        assert_eq!(tenants, vec![TenantId::new("a"), TenantId::new("b"), TenantId::new("c")]);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<WorkerId>(), 16);
    }
}
