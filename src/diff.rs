//! Image set diff (C11 step 6). Pure helper, no I/O: given the
//! existing and newly discovered Image name sets, return what to create
//! and what is now obsolete.

use std::collections::HashSet;

#[derive(Debug, PartialEq, Eq)]
pub struct ImageSetDiff {
    /// `D \ E` — discovered but not yet in the store.
    pub to_create: HashSet<String>,
    /// `E \ D` — in the store but no longer discovered.
    pub to_delete: HashSet<String>,
}

pub fn diff_image_sets(existing: &HashSet<String>, discovered: &HashSet<String>) -> ImageSetDiff {
    ImageSetDiff {
        to_create: discovered.difference(existing).cloned().collect(),
        to_delete: existing.difference(discovered).cloned().collect(),
    }
}
