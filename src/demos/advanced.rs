use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use perennial_engine::WorkflowContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileResult {
  filename: String,
  records: u64,
  status: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AggregateStats {
  total_files: usize,
  total_records: u64,
  processed_at: DateTime<Utc>,
}

/// Data processing pipeline: initialize, process every file in parallel with
/// a per-file step id, then aggregate and report.
pub async fn data_processing_pipeline(
  ctx: Arc<WorkflowContext>,
  data_files: Vec<String>,
) -> Result<()> {
  println!("Starting data processing pipeline...");

  let pipeline_id: String = ctx
    .step("init-pipeline", || async {
      println!("Initializing pipeline...");
      tokio::time::sleep(Duration::from_millis(500)).await;
      Ok("PIPELINE-12345".to_string())
    })
    .await?;
  println!("Pipeline ID: {}", pipeline_id);

  let results: Arc<Mutex<Vec<FileResult>>> = Arc::new(Mutex::new(Vec::new()));

  for (index, filename) in data_files.iter().cloned().enumerate() {
    let branch = ctx.clone();
    let results = results.clone();
    ctx.spawn(async move {
      // Each file gets its own step id, so each is processed exactly once.
      let result: FileResult = branch
        .step(&format!("process-file-{}", index), || async {
          println!("Processing file: {}...", filename);
          tokio::time::sleep(Duration::from_secs(1)).await;
          Ok(FileResult {
            filename: filename.clone(),
            records: 100 + index as u64 * 10,
            status: "completed".to_string(),
          })
        })
        .await?;
      results.lock().unwrap().push(result);
      Ok(())
    });
  }

  ctx.join().await?;
  println!("All files processed successfully");

  let file_results = Arc::clone(&results);
  let total_files = data_files.len();
  let stats: AggregateStats = ctx
    .step("aggregate-results", || async move {
      println!("Aggregating results...");
      tokio::time::sleep(Duration::from_millis(500)).await;

      let total_records = file_results
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.records)
        .sum();

      Ok(AggregateStats {
        total_files,
        total_records,
        processed_at: Utc::now(),
      })
    })
    .await?;
  println!(
    "Pipeline stats: {} files, {} records",
    stats.total_files, stats.total_records
  );

  let report: String = ctx
    .step("generate-report", || async {
      println!("Generating final report...");
      tokio::time::sleep(Duration::from_millis(500)).await;
      Ok("report.pdf".to_string())
    })
    .await?;
  println!("Report written: {}", report);

  Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
  id: String,
  status: String,
  total: f64,
}

/// Order fulfillment: validate, reserve inventory per item in parallel, take
/// payment, ship, confirm.
pub async fn order_fulfillment(
  ctx: Arc<WorkflowContext>,
  order_id: String,
  items: Vec<String>,
) -> Result<()> {
  println!("Processing order: {}", order_id);

  let order: Order = ctx
    .step("validate-order", || async {
      println!("Validating order...");
      tokio::time::sleep(Duration::from_millis(500)).await;
      Ok(Order {
        id: order_id.clone(),
        status: "validated".to_string(),
        total: 99.99,
      })
    })
    .await?;

  for (index, item) in items.iter().cloned().enumerate() {
    let branch = ctx.clone();
    ctx.spawn(async move {
      let _: bool = branch
        .step(&format!("reserve-item-{}", index), || async {
          println!("Reserving inventory for: {}", item);
          tokio::time::sleep(Duration::from_secs(1)).await;
          Ok(true)
        })
        .await?;
      Ok(())
    });
  }

  ctx.join().await?;

  let payment: String = ctx
    .step("process-payment", || async {
      println!("Processing payment of ${:.2}...", order.total);
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok("PAYMENT-CONFIRMED".to_string())
    })
    .await?;
  println!("Payment: {}", payment);

  let tracking: String = ctx
    .step("ship-order", || async {
      println!("Shipping order...");
      tokio::time::sleep(Duration::from_millis(500)).await;
      Ok("TRACKING-123456".to_string())
    })
    .await?;
  println!("Tracking number: {}", tracking);

  ctx
    .step("send-confirmation", || async {
      println!("Sending order confirmation email...");
      tokio::time::sleep(Duration::from_millis(500)).await;
      Ok(true)
    })
    .await?;

  println!("Order {} fulfilled successfully", order.id);
  Ok(())
}
