use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use perennial_engine::{Engine, EngineConfig};

mod demos;

/// Perennial - a durable execution engine
///
/// Demo workflows memoize each step to SQLite; killing a run halfway and
/// re-running the same command resumes from the last completed step.
#[derive(Parser)]
#[command(name = "perennial")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the SQLite database holding workflow state
  #[arg(long, global = true, default_value = "./perennial.db")]
  database: PathBuf,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run (or resume) a demo workflow
  Run {
    #[command(subcommand)]
    demo: Demo,
  },

  /// Print the persisted status of a workflow
  Status {
    /// The workflow id to look up
    workflow_id: String,
  },
}

#[derive(Subcommand)]
enum Demo {
  /// Employee onboarding with parallel provisioning
  Onboarding {
    /// Workflow id (re-use the same id to resume)
    #[arg(long, default_value = "onboarding-employee-001")]
    workflow_id: String,
  },

  /// Data processing pipeline with per-file steps
  Pipeline {
    #[arg(long, default_value = "data-pipeline-001")]
    workflow_id: String,
  },

  /// Order fulfillment
  Order {
    #[arg(long, default_value = "order-001")]
    workflow_id: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let cli = Cli::parse();

  let engine = Engine::new(EngineConfig {
    database_path: cli.database,
  })
  .await
  .context("failed to open workflow store")?;

  match cli.command {
    Commands::Run { demo } => run_demo(&engine, demo).await?,
    Commands::Status { workflow_id } => {
      let status = engine.get_workflow_status(&workflow_id).await?;
      println!("{}: {:?}", workflow_id, status);
    }
  }

  engine.close().await?;
  Ok(())
}

async fn run_demo(engine: &Engine, demo: Demo) -> Result<()> {
  spawn_crash_listener();

  match demo {
    Demo::Onboarding { workflow_id } => {
      println!("=== Employee Onboarding Demo ===");
      println!("Workflow ID: {}\n", workflow_id);
      engine
        .execute(&workflow_id, |ctx| {
          demos::employee_onboarding(ctx, "john.doe@example.com", "John Doe")
        })
        .await?;
    }
    Demo::Pipeline { workflow_id } => {
      println!("=== Data Processing Pipeline Demo ===");
      println!("Workflow ID: {}\n", workflow_id);
      let data_files = vec![
        "data1.csv".to_string(),
        "data2.csv".to_string(),
        "data3.csv".to_string(),
        "data4.csv".to_string(),
      ];
      engine
        .execute(&workflow_id, |ctx| {
          demos::data_processing_pipeline(ctx, data_files)
        })
        .await?;
    }
    Demo::Order { workflow_id } => {
      println!("=== Order Fulfillment Demo ===");
      println!("Workflow ID: {}\n", workflow_id);
      let items = vec![
        "Widget A".to_string(),
        "Gadget B".to_string(),
        "Doohickey C".to_string(),
      ];
      engine
        .execute(&workflow_id, |ctx| {
          demos::order_fulfillment(ctx, "ORDER-12345".to_string(), items)
        })
        .await?;
    }
  }

  println!("\nWorkflow completed successfully");
  Ok(())
}

/// Lets the operator simulate a crash mid-run: press 'c' to kill the process,
/// then re-run the same command to resume from the last completed step.
fn spawn_crash_listener() {
  tokio::spawn(async {
    use tokio::io::AsyncReadExt;

    println!("Press 'c' at any time to simulate a crash\n");
    let mut stdin = tokio::io::stdin();
    let mut buf = [0_u8; 1];
    while let Ok(n) = stdin.read(&mut buf).await {
      if n == 0 {
        break;
      }
      if buf[0] == b'c' || buf[0] == b'C' {
        println!("\nSimulating crash - process terminating");
        std::process::exit(1);
      }
    }
  });
}
