//! Convenient re-exports of commonly used types from emberdoc.
//!
//! ```ignore
//! use emberdoc::prelude::*;
//! ```

pub use emberdoc_core::{
    backend::{DynStoreBackend, Snapshot, StoreBackend, StoreBackendBuilder},
    cache::{CacheStats, QueryCacheOptions},
    collection::{Collection, CollectionOptions, OptimizeStats},
    compression::{CompressionOptions, CompressionStats},
    concurrency::{ConcurrencyOptions, ConcurrencyStats},
    document::Document,
    error::{DocumentStoreError, DocumentStoreResult},
    index::{IndexDefinition, IndexKind},
    page::{Page, PaginationParams},
    plugin::Plugin,
    query::{Expr, FieldOp, Filter, FindOptions, Query, QueryVisitor, Sort, SortDirection},
    store::{DocumentStore, DocumentStoreBuilder},
    update::Update,
};
