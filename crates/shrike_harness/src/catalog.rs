//! Static registry mapping transaction types to benchmark procedures.
//!
//! Built once per worker from the module's procedure snapshot; immutable
//! afterwards. Three lookup views: by type id (the hot path), by concrete
//! procedure type, and by name (legacy only).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use shrike_common::error::CatalogError;
use shrike_common::types::TransactionType;

use crate::module::{Connection, Procedure};

/// One registered transaction: its type plus the procedure that executes it.
struct Entry<C: Connection> {
    txn: TransactionType,
    procedure: Arc<dyn Procedure<C>>,
}

/// Immutable procedure registry. Exactly one procedure per type.
pub struct TransactionCatalog<C: Connection> {
    by_id: HashMap<i32, Entry<C>>,
    by_name: HashMap<String, Arc<dyn Procedure<C>>>,
    by_class: HashMap<TypeId, Arc<dyn Procedure<C>>>,
    types: Vec<TransactionType>,
}

impl<C: Connection> std::fmt::Debug for TransactionCatalog<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCatalog")
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> TransactionCatalog<C> {
    /// Build the three lookup views from a module's procedure snapshot.
    /// `declared` lists the workload's transaction types; every declared
    /// type must have a procedure and no type may have two.
    pub fn build(
        declared: &[TransactionType],
        procedures: HashMap<TransactionType, Arc<dyn Procedure<C>>>,
    ) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::with_capacity(procedures.len());
        let mut by_name = HashMap::with_capacity(procedures.len());
        let mut by_class = HashMap::with_capacity(procedures.len());

        for (txn, procedure) in procedures {
            // Upcast to `dyn Any` so type_id() reaches the concrete
            // procedure type instead of the trait object.
            let as_any: &dyn Any = &*procedure;
            let type_id = as_any.type_id();
            by_name.insert(txn.name().to_string(), procedure.clone());
            by_class.insert(type_id, procedure.clone());
            let id = txn.id();
            let prev = by_id.insert(id, Entry { txn, procedure });
            if let Some(prev) = prev {
                return Err(CatalogError::DuplicateProcedure(prev.txn));
            }
        }

        for txn in declared {
            if !by_id.contains_key(&txn.id()) {
                return Err(CatalogError::MissingProcedure(txn.clone()));
            }
        }

        Ok(Self {
            by_id,
            by_name,
            by_class,
            types: declared.to_vec(),
        })
    }

    /// The declared transaction types, in id order.
    pub fn types(&self) -> &[TransactionType] {
        &self.types
    }

    /// Resolve a type id to its transaction type. `None` from inside the
    /// work loop means the workload mix handed out an unregistered id —
    /// a programming error, not a runtime condition.
    pub fn transaction(&self, id: i32) -> Option<&TransactionType> {
        self.by_id.get(&id).map(|e| &e.txn)
    }

    /// The procedure for a type id.
    pub fn procedure(&self, id: i32) -> Option<&Arc<dyn Procedure<C>>> {
        self.by_id.get(&id).map(|e| &e.procedure)
    }

    /// Look up a procedure by its concrete implementation type.
    pub fn procedure_of<P: Procedure<C>>(&self) -> Option<&Arc<dyn Procedure<C>>> {
        self.by_class.get(&TypeId::of::<P>())
    }

    /// Look up a procedure by transaction name.
    #[deprecated(note = "string lookups are for legacy benchmark code; use \
                         `procedure` or `procedure_of` instead")]
    pub fn procedure_by_name(&self, name: &str) -> Option<&Arc<dyn Procedure<C>>> {
        self.by_name.get(name)
    }
}
