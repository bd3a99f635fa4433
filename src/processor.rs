//! Job processing: apply a whole CSV body row by row.
//!
//! Every data row yields exactly one outcome, a created product or a recorded
//! error string prefixed with its display row number (`index + 2`, counting
//! the header line). A bad row never stops the batch. `process` itself only
//! fails for an unusable body (fewer than two lines), a progress write that
//! fails, or a datastore error that indicates the datastore is gone.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::config::ProcessingConfig;
use crate::csv_row::{map_row, parse_line};
use crate::error::IngestError;
use crate::materializer::{CreatedParents, Materializer};
use crate::models::{ProcessingResult, ProductSummary, ProgressSnapshot};
use crate::progress::ProgressReporter;
use crate::store::CatalogStore;

pub struct JobProcessor {
    materializer: Materializer,
    settings: ProcessingConfig,
}

impl JobProcessor {
    pub fn new(catalog: Arc<dyn CatalogStore>, settings: ProcessingConfig) -> Self {
        Self {
            materializer: Materializer::new(catalog),
            settings,
        }
    }

    pub async fn process(
        &self,
        csv_content: &str,
        job_id: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingResult, IngestError> {
        self.run(csv_content, progress)
            .instrument(tracing::info_span!("process", job_id = %job_id))
            .await
    }

    async fn run(
        &self,
        csv_content: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingResult, IngestError> {
        let lines = split_lines(csv_content);
        if lines.len() < 2 {
            return Err(IngestError::Format(
                "CSV file must contain at least a header row and one data row".to_string(),
            ));
        }

        let headers = parse_line(lines[0]);
        let data_rows = &lines[1..];
        let total = data_rows.len() as u64;
        tracing::info!(total_rows = total, "processing rows");

        let mut snapshot = ProgressSnapshot {
            total_rows: total,
            ..Default::default()
        };
        let mut products = Vec::new();
        let mut created = CreatedParents::default();

        for (index, line) in data_rows.iter().enumerate() {
            let row_number = index as u64 + 2;

            match self.process_row(&headers, line, row_number, &mut created).await {
                Ok(product) => {
                    products.push(product);
                    snapshot.successful_rows += 1;
                }
                Err(err) if err.is_row_level() => {
                    tracing::warn!(row = row_number, error = %err, "row failed");
                    snapshot.errors.push(format!("Row {}: {}", row_number, err));
                    snapshot.failed_rows += 1;
                }
                Err(err) => {
                    tracing::error!(row = row_number, error = %err, "aborting job");
                    return Err(err);
                }
            }
            snapshot.processed_rows += 1;

            if snapshot.processed_rows % self.settings.progress_every_rows == 0
                || snapshot.processed_rows == total
            {
                progress.report(&snapshot).await?;
            }

            if index as u64 % self.settings.yield_every_rows == 0 {
                self.pause().await;
            }
        }

        tracing::info!(
            successful = snapshot.successful_rows,
            failed = snapshot.failed_rows,
            categories = created.categories.len(),
            subcategories = created.subcategories.len(),
            "rows processed"
        );

        Ok(ProcessingResult {
            total_rows: total,
            successful_rows: snapshot.successful_rows,
            failed_rows: snapshot.failed_rows,
            errors: snapshot.errors,
            created_products: products,
            created_categories: created.categories.into_vec(),
            created_subcategories: created.subcategories.into_vec(),
        })
    }

    async fn process_row(
        &self,
        headers: &[String],
        line: &str,
        row_number: u64,
        created: &mut CreatedParents,
    ) -> Result<ProductSummary, IngestError> {
        let values = parse_line(line);
        if values.len() != headers.len() {
            return Err(IngestError::validation(
                row_number,
                format!(
                    "Column count mismatch. Expected {}, got {}",
                    headers.len(),
                    values.len()
                ),
            ));
        }
        let record = map_row(headers, &values, row_number)?;
        self.materializer.materialize(&record, created).await
    }

    async fn pause(&self) {
        if self.settings.yield_delay_ms == 0 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(self.settings.yield_delay_ms)).await;
        }
    }
}

/// Splits on `\n`, dropping a trailing `\r` and any blank lines.
fn split_lines(content: &str) -> Vec<&str> {
    content
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{NoProgress, RecordingProgress};
    use crate::store::InMemoryStore;

    const HEADER: &str = "id,name,description,price,categoryId,brand,tags";

    fn settings() -> ProcessingConfig {
        ProcessingConfig {
            progress_every_rows: 10,
            yield_every_rows: 50,
            yield_delay_ms: 0,
        }
    }

    fn processor(store: &Arc<InMemoryStore>) -> JobProcessor {
        JobProcessor::new(store.clone(), settings())
    }

    fn row(id: &str, price: &str, category: &str) -> String {
        format!("{},Item {},\"Nice, sturdy\",{},{},Acme,\"[\"\"new\"\"]\"", id, id, price, category)
    }

    fn csv(rows: &[String]) -> String {
        let mut out = HEADER.to_string();
        for r in rows {
            out.push('\n');
            out.push_str(r);
        }
        out
    }

    #[tokio::test]
    async fn three_valid_rows_create_one_category() {
        let store = Arc::new(InMemoryStore::new());
        let body = csv(&[row("a", "1.00", "gadgets"), row("b", "2.50", "gadgets"), row("c", "3", "gadgets")]);

        let result = processor(&store).process(&body, "job-a", &NoProgress).await.unwrap();

        assert_eq!(result.total_rows, 3);
        assert_eq!(result.successful_rows, 3);
        assert_eq!(result.failed_rows, 0);
        assert!(result.errors.is_empty());
        assert_eq!(result.created_categories, vec!["gadgets".to_string()]);
        assert!(result.created_subcategories.is_empty());
        assert_eq!(result.created_products.len(), 3);
        assert_eq!(result.created_products[0].description, "Nice, sturdy");
        assert_eq!(result.created_products[0].tags, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn missing_brand_fails_only_that_row() {
        let store = Arc::new(InMemoryStore::new());
        let body = "id,name,price,categoryId\np-1,Widget,4.99,tools";

        let result = processor(&store).process(body, "job-b", &NoProgress).await.unwrap();

        assert_eq!(result.successful_rows, 0);
        assert_eq!(result.failed_rows, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("Row 2"));
        assert!(result.errors[0].contains("Brand is required"));
    }

    #[tokio::test]
    async fn header_only_is_format_error() {
        let store = Arc::new(InMemoryStore::new());
        let err = processor(&store)
            .process(HEADER, "job-c", &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Format(_)));
        assert!(!err.to_string().is_empty());
    }

    #[tokio::test]
    async fn one_malformed_row_is_isolated() {
        let store = Arc::new(InMemoryStore::new());
        let mut rows: Vec<String> = (0..6).map(|i| row(&format!("p{}", i), "5", "tools")).collect();
        rows[3] = row("p3", "five", "tools");

        let result = processor(&store).process(&csv(&rows), "job", &NoProgress).await.unwrap();

        assert_eq!(result.failed_rows, 1);
        assert_eq!(result.successful_rows, 5);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Row 5: Invalid value 'five' for column 'price'"));
    }

    #[tokio::test]
    async fn non_finite_rating_fails_the_row() {
        let store = Arc::new(InMemoryStore::new());
        let body = "id,name,categoryId,brand,rating\n\
                    r1,A,tools,Acme,inf\n\
                    r2,B,tools,Acme,NaN\n\
                    r3,C,tools,Acme,-infinity\n\
                    r4,D,tools,Acme,4.5";

        let result = processor(&store).process(body, "job", &NoProgress).await.unwrap();

        assert_eq!(result.successful_rows, 1);
        assert_eq!(result.failed_rows, 3);
        assert!(result.errors[0].starts_with("Row 2: Invalid value 'inf' for column 'rating'"));
        assert!(result.errors[1].starts_with("Row 3: Invalid value 'NaN' for column 'rating'"));
        assert!(result.errors[2].contains("must be a finite number"));
        assert_eq!(result.created_products[0].id, "r4");
        assert!(!store.product_exists("r1").await.unwrap());
    }

    #[tokio::test]
    async fn column_count_mismatch_is_recorded() {
        let store = Arc::new(InMemoryStore::new());
        let body = format!("{}\nshort,row\n{}", HEADER, row("ok", "1", "tools"));

        let result = processor(&store).process(&body, "job", &NoProgress).await.unwrap();

        assert_eq!(result.successful_rows, 1);
        assert_eq!(
            result.errors,
            vec!["Row 2: Column count mismatch. Expected 7, got 2".to_string()]
        );
    }

    #[tokio::test]
    async fn progress_is_cumulative_and_ends_at_total() {
        let store = Arc::new(InMemoryStore::new());
        let rows: Vec<String> = (0..25).map(|i| row(&format!("p{}", i), "1", "tools")).collect();
        let recorder = RecordingProgress::new();

        processor(&store).process(&csv(&rows), "job", &recorder).await.unwrap();

        let seen: Vec<u64> = recorder.snapshots().iter().map(|s| s.processed_rows).collect();
        assert_eq!(seen, vec![10, 20, 25]);
        let last = recorder.snapshots().pop().unwrap();
        assert_eq!(last.total_rows, 25);
        assert_eq!(last.percentage(), 100);
        for s in recorder.snapshots() {
            assert_eq!(s.successful_rows + s.failed_rows, s.processed_rows);
            assert!(s.processed_rows <= s.total_rows);
        }
    }

    #[tokio::test]
    async fn duplicate_ids_within_and_across_batches() {
        let store = Arc::new(InMemoryStore::new());
        let body = csv(&[row("dup", "1", "tools"), row("dup", "2", "tools")]);

        let first = processor(&store).process(&body, "job-1", &NoProgress).await.unwrap();
        assert_eq!(first.successful_rows, 1);
        assert_eq!(first.failed_rows, 1);
        assert_eq!(first.errors, vec!["Row 3: Product with ID 'dup' already exists".to_string()]);

        let second = processor(&store).process(&body, "job-2", &NoProgress).await.unwrap();
        assert_eq!(second.successful_rows, 0);
        assert_eq!(second.failed_rows, 2);
        assert!(second.created_categories.is_empty());
    }

    #[tokio::test]
    async fn crlf_and_blank_lines() {
        let store = Arc::new(InMemoryStore::new());
        let body = format!("{}\r\n{}\r\n\r\n  \n{}\r\n", HEADER, row("a", "1", "t"), row("b", "1", "t"));

        let result = processor(&store).process(&body, "job", &NoProgress).await.unwrap();

        assert_eq!(result.total_rows, 2);
        assert_eq!(result.successful_rows, 2);
    }

    #[tokio::test]
    async fn subcategories_are_reported_once() {
        let store = Arc::new(InMemoryStore::new());
        let body = "id,name,categoryid,subcategoryid,brand\n\
                    a,A,tools,hand-tools,Acme\n\
                    b,B,tools,hand-tools,Acme\n\
                    c,C,garden,hand-tools,Acme";

        let result = processor(&store).process(body, "job", &NoProgress).await.unwrap();

        assert_eq!(result.created_categories, vec!["tools".to_string(), "garden".to_string()]);
        assert_eq!(result.created_subcategories, vec!["hand-tools".to_string()]);
        assert_eq!(result.successful_rows, 2);
        assert_eq!(
            result.errors,
            vec!["Row 4: Subcategory not found or doesn't belong to the specified category"
                .to_string()]
        );
    }
}
