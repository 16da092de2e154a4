//! Cross-snapshot thread identity.

use std::fmt;

use facet::Facet;
use stallscope_types::{Snapshot, ThreadRecord};

/// Matching key for one logical thread.
///
/// Deliberately not `Eq`/`Hash`: the comparison in [`identities_match`] is
/// not transitive, so identities are matched linearly.
#[derive(Debug, Clone, Default, PartialEq, Facet)]
pub struct ThreadIdentity {
    #[facet(skip_unless_truthy)]
    pub native_id: Option<u64>,
    #[facet(skip_unless_truthy)]
    pub logical_id: Option<u64>,
    #[facet(skip_unless_truthy)]
    pub name: Option<String>,
}

impl ThreadIdentity {
    pub fn of(thread: &ThreadRecord) -> Self {
        Self {
            native_id: thread.native_id,
            logical_id: thread.logical_id,
            name: thread.name.clone(),
        }
    }

    pub fn matches(&self, other: &ThreadIdentity) -> bool {
        identities_match(self, other)
    }

    pub fn matches_thread(&self, thread: &ThreadRecord) -> bool {
        identities_match(self, &ThreadIdentity::of(thread))
    }

    /// Name when known, otherwise the best id.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ThreadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.native_id, self.logical_id) {
            (Some(name), _, _) => f.write_str(name),
            (None, Some(nid), _) => write!(f, "nid=0x{nid:x}"),
            (None, None, Some(tid)) => write!(f, "tid={tid}"),
            (None, None, None) => f.write_str("<unnamed>"),
        }
    }
}

/// Three-tier identity comparison.
///
/// When both sides carry a native id only the native ids are compared.
/// Otherwise, when both carry a logical id only those are compared.
/// Otherwise the names decide. A renamed thread therefore still matches on
/// its native id, and names only count when nothing better exists.
pub fn identities_match(a: &ThreadIdentity, b: &ThreadIdentity) -> bool {
    if let (Some(x), Some(y)) = (a.native_id, b.native_id) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.logical_id, b.logical_id) {
        return x == y;
    }
    a.name == b.name
}

/// Resolves `thread` in `target`: the first thread with the same native id,
/// else the first with the same logical id, else the first with the same name.
pub fn match_thread<'a>(thread: &ThreadRecord, target: &'a Snapshot) -> Option<&'a ThreadRecord> {
    if let Some(nid) = thread.native_id
        && let Some(found) = target.threads.iter().find(|t| t.native_id == Some(nid))
    {
        return Some(found);
    }
    if let Some(tid) = thread.logical_id
        && let Some(found) = target.threads.iter().find(|t| t.logical_id == Some(tid))
    {
        return Some(found);
    }
    target.threads.iter().find(|t| t.name == thread.name)
}
