use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bagpipe_api::schema::SchemaTable;

use crate::sync::lock;

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

struct Entry {
    table: Arc<SchemaTable>,
    handles: usize,
}

/// Shared schema tables, reference counted by [`SchemaHandle`]s.
///
/// Identical tables registered twice share one entry. An entry is dropped
/// together with its last handle.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: SchemaTable) -> SchemaHandle {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let existing = state
            .entries
            .iter_mut()
            .find(|(_, entry)| *entry.table == table);
        let (id, table) = match existing {
            Some((id, entry)) => {
                entry.handles += 1;
                (*id, entry.table.clone())
            }
            None => {
                let id = state.next_id;
                state.next_id += 1;
                let table = Arc::new(table);
                state.entries.insert(
                    id,
                    Entry {
                        table: table.clone(),
                        handles: 1,
                    },
                );
                (id, table)
            }
        };
        SchemaHandle {
            id,
            table,
            registry: Arc::downgrade(&self.state),
        }
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque reference to a registered schema table.
pub struct SchemaHandle {
    id: u64,
    table: Arc<SchemaTable>,
    registry: Weak<Mutex<RegistryState>>,
}

impl SchemaHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schemas(&self) -> &SchemaTable {
        &self.table
    }
}

impl std::fmt::Debug for SchemaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaHandle")
            .field("id", &self.id)
            .field("schemas", &self.table.len())
            .finish()
    }
}

impl Clone for SchemaHandle {
    fn clone(&self) -> Self {
        if let Some(state) = self.registry.upgrade() {
            if let Some(entry) = lock(&state).entries.get_mut(&self.id) {
                entry.handles += 1;
            }
        }
        Self {
            id: self.id,
            table: self.table.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl Drop for SchemaHandle {
    fn drop(&mut self) {
        let Some(state) = self.registry.upgrade() else {
            return;
        };
        let mut state = lock(&state);
        let remove = match state.entries.get_mut(&self.id) {
            Some(entry) => {
                entry.handles -= 1;
                entry.handles == 0
            }
            None => false,
        };
        if remove {
            state.entries.remove(&self.id);
        }
    }
}
