//! Catalog materialization: turn a validated candidate record into a stored
//! product, auto-creating stub parents on the way.
//!
//! Per row the order is: ensure category, ensure subcategory (if any), check
//! that the subcategory belongs to the category, create the product. Each
//! step is its own write; a failure part way leaves earlier writes in place.

use std::sync::Arc;

use chrono::Utc;

use crate::error::IngestError;
use crate::models::{CandidateRecord, Category, ProductSummary, Subcategory};
use crate::store::CatalogStore;

/// Identifiers in first-insertion order, each kept once.
#[derive(Debug, Default, Clone)]
pub struct CreatedSet(Vec<String>);

impl CreatedSet {
    pub fn insert(&mut self, id: &str) -> bool {
        if self.0.iter().any(|existing| existing == id) {
            return false;
        }
        self.0.push(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|existing| existing == id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// Stub entities created while processing one job.
#[derive(Debug, Default)]
pub struct CreatedParents {
    pub categories: CreatedSet,
    pub subcategories: CreatedSet,
}

/// `"home-garden_tools"` → `"home garden tools"`.
pub fn stub_display_name(id: &str) -> String {
    id.replace(['-', '_'], " ")
}

pub struct Materializer {
    store: Arc<dyn CatalogStore>,
}

impl Materializer {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Creates a stub category unless one exists. Never fails on "already
    /// exists"; a concurrent insert is treated as success.
    pub async fn ensure_category(
        &self,
        category_id: &str,
        created: &mut CreatedSet,
    ) -> Result<(), IngestError> {
        if self.store.category_exists(category_id).await? {
            return Ok(());
        }
        let stub = Category {
            id: category_id.to_string(),
            name: stub_display_name(category_id),
            description: format!("Auto-created category: {}", category_id),
            image: String::new(),
            is_active: true,
            sort_order: 0,
            created_at_utc: Utc::now(),
        };
        if self.store.insert_category(&stub).await? {
            created.insert(category_id);
            tracing::info!(category_id, "created stub category");
        }
        Ok(())
    }

    /// Creates a stub subcategory under `category_id` unless one exists.
    ///
    /// An existing subcategory attached to a different category is a
    /// referential error.
    pub async fn ensure_subcategory(
        &self,
        subcategory_id: &str,
        category_id: &str,
        created: &mut CreatedSet,
    ) -> Result<(), IngestError> {
        let existing = match self.store.get_subcategory(subcategory_id).await? {
            Some(existing) => existing,
            None => {
                let stub = Subcategory {
                    id: subcategory_id.to_string(),
                    name: stub_display_name(subcategory_id),
                    description: format!("Auto-created subcategory: {}", subcategory_id),
                    image: None,
                    category_id: category_id.to_string(),
                    is_active: true,
                    sort_order: 0,
                    created_at_utc: Utc::now(),
                };
                if self.store.insert_subcategory(&stub).await? {
                    created.insert(subcategory_id);
                    tracing::info!(subcategory_id, category_id, "created stub subcategory");
                    return Ok(());
                }
                // Lost a race with another writer; validate what it stored.
                self.store
                    .get_subcategory(subcategory_id)
                    .await?
                    .ok_or_else(referential_error)?
            }
        };

        if existing.category_id != category_id {
            return Err(referential_error());
        }
        Ok(())
    }

    /// Inserts the product. Fails with [`IngestError::DuplicateKey`] if the
    /// identifier is taken.
    pub async fn create_leaf_entity(
        &self,
        record: &CandidateRecord,
    ) -> Result<ProductSummary, IngestError> {
        if self.store.product_exists(&record.id).await? {
            return Err(IngestError::DuplicateKey(record.id.clone()));
        }
        self.store
            .insert_product(record, Utc::now())
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    IngestError::DuplicateKey(record.id.clone())
                } else {
                    IngestError::Store(err)
                }
            })
    }

    /// Runs the full per-row sequence.
    pub async fn materialize(
        &self,
        record: &CandidateRecord,
        created: &mut CreatedParents,
    ) -> Result<ProductSummary, IngestError> {
        self.ensure_category(&record.category_id, &mut created.categories)
            .await?;
        if let Some(subcategory_id) = &record.subcategory_id {
            self.ensure_subcategory(
                subcategory_id,
                &record.category_id,
                &mut created.subcategories,
            )
            .await?;
        }
        self.create_leaf_entity(record).await
    }
}

fn referential_error() -> IngestError {
    IngestError::Referential(
        "Subcategory not found or doesn't belong to the specified category".to_string(),
    )
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::Database(db)) if db.is_unique_violation()
        )
    })
}
