//! Integration tests for the durable execution engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use perennial_engine::{Engine, StepError};
use perennial_store::{SqliteStore, StepStatus, Store, WorkflowStatus};
use serde::{Deserialize, Serialize};

async fn create_test_engine() -> (Engine, Arc<SqliteStore>, tempfile::TempDir) {
  let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
  let store = Arc::new(
    SqliteStore::open(temp_dir.path().join("test.db"))
      .await
      .expect("failed to open store"),
  );
  let engine = Engine::with_store(store.clone());
  (engine, store, temp_dir)
}

fn counter() -> Arc<AtomicU32> {
  Arc::new(AtomicU32::new(0))
}

#[tokio::test]
async fn test_basic_memoization() {
  let (engine, store, _temp_dir) = create_test_engine().await;
  let s1_runs = counter();
  let s2_runs = counter();

  for _ in 0..2 {
    let s1 = s1_runs.clone();
    let s2 = s2_runs.clone();
    engine
      .execute("w1", |ctx| async move {
        let a: i64 = ctx
          .step("s1", || async {
            s1.fetch_add(1, Ordering::SeqCst);
            Ok(42)
          })
          .await?;
        assert_eq!(a, 42);

        let b: String = ctx
          .step("s2", || async {
            s2.fetch_add(1, Ordering::SeqCst);
            Ok("ok".to_string())
          })
          .await?;
        assert_eq!(b, "ok");

        Ok(())
      })
      .await
      .expect("workflow execution failed");
  }

  // Each body ran exactly once across both executions.
  assert_eq!(s1_runs.load(Ordering::SeqCst), 1);
  assert_eq!(s2_runs.load(Ordering::SeqCst), 1);

  assert_eq!(
    engine.get_workflow_status("w1").await.unwrap(),
    WorkflowStatus::Completed
  );

  // Outputs are durably recorded under the expected keys.
  let record = store.get_step("w1", "s1:1").await.unwrap().unwrap();
  assert_eq!(record.status, StepStatus::Completed);
  assert_eq!(record.output.as_deref(), Some(b"42".as_slice()));
  let record = store.get_step("w1", "s2:2").await.unwrap().unwrap();
  assert_eq!(record.status, StepStatus::Completed);
  assert_eq!(record.output.as_deref(), Some(b"\"ok\"".as_slice()));
}

#[tokio::test]
async fn test_resume_after_step_failure() {
  let (engine, store, _temp_dir) = create_test_engine().await;
  let a_runs = counter();
  let b_runs = counter();

  // First execution: step "b" fails, the workflow is marked failed.
  let a = a_runs.clone();
  let result = engine
    .execute("w2", |ctx| async move {
      ctx
        .step("a", || async {
          a.fetch_add(1, Ordering::SeqCst);
          Ok("A".to_string())
        })
        .await?;
      let _: String = ctx.step("b", || async { anyhow::bail!("boom") }).await?;
      Ok(())
    })
    .await;
  assert!(result.is_err());

  assert_eq!(
    engine.get_workflow_status("w2").await.unwrap(),
    WorkflowStatus::Failed
  );
  let record = store.get_step("w2", "a:1").await.unwrap().unwrap();
  assert_eq!(record.status, StepStatus::Completed);
  let record = store.get_step("w2", "b:2").await.unwrap().unwrap();
  assert_eq!(record.status, StepStatus::Failed);
  assert!(record.error.unwrap().contains("boom"));

  // Second execution with a corrected body: "a" replays, "b" runs.
  let a = a_runs.clone();
  let b = b_runs.clone();
  engine
    .execute("w2", |ctx| async move {
      let replayed: String = ctx
        .step("a", || async {
          a.fetch_add(1, Ordering::SeqCst);
          Ok("A".to_string())
        })
        .await?;
      assert_eq!(replayed, "A");
      let fixed: String = ctx
        .step("b", || async {
          b.fetch_add(1, Ordering::SeqCst);
          Ok("B".to_string())
        })
        .await?;
      assert_eq!(fixed, "B");
      Ok(())
    })
    .await
    .expect("resumed execution failed");

  assert_eq!(a_runs.load(Ordering::SeqCst), 1);
  assert_eq!(b_runs.load(Ordering::SeqCst), 1);
  assert_eq!(
    engine.get_workflow_status("w2").await.unwrap(),
    WorkflowStatus::Completed
  );

  // The failed record kept its sequence number across the resume.
  let record = store.get_step("w2", "b:2").await.unwrap().unwrap();
  assert_eq!(record.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_loop_with_synthesized_ids() {
  let (engine, store, _temp_dir) = create_test_engine().await;
  let runs = counter();

  for _ in 0..2 {
    let runs = runs.clone();
    engine
      .execute("w3", |ctx| async move {
        for i in 0..3_i64 {
          let step_id = format!("loop-{}", i);
          let runs = runs.clone();
          let value: i64 = ctx
            .step(&step_id, || async move {
              runs.fetch_add(1, Ordering::SeqCst);
              Ok(i)
            })
            .await?;
          assert_eq!(value, i);
        }
        Ok(())
      })
      .await
      .expect("workflow execution failed");
  }

  // One body run per iteration, none on the second execution.
  assert_eq!(runs.load(Ordering::SeqCst), 3);

  // Iterations were keyed in encounter order.
  for i in 0..3_i64 {
    let key = format!("loop-{}:{}", i, i + 1);
    let record = store.get_step("w3", &key).await.unwrap().unwrap();
    assert_eq!(record.status, StepStatus::Completed);
    assert_eq!(record.sequence_num, i + 1);
  }
}

#[tokio::test]
async fn test_parallel_branches() {
  let (engine, store, _temp_dir) = create_test_engine().await;
  let runs = counter();

  let body_runs = runs.clone();
  engine
    .execute("w4", |ctx| async move {
      for k in 1..=3_i64 {
        let branch = ctx.clone();
        let runs = body_runs.clone();
        ctx.spawn(async move {
          let value: i64 = branch
            .step(&format!("p-{}", k), || async move {
              runs.fetch_add(1, Ordering::SeqCst);
              Ok(k)
            })
            .await?;
          anyhow::ensure!(value == k, "branch observed wrong value");
          Ok(())
        });
      }
      ctx.join().await
    })
    .await
    .expect("workflow execution failed");

  assert_eq!(runs.load(Ordering::SeqCst), 3);

  // Exactly three completed steps; sequence numbers are a permutation of
  // 1..=3 regardless of scheduling.
  let completed = store.load_completed("w4").await.unwrap();
  assert_eq!(completed.len(), 3);
  let sequences = store.load_step_sequences("w4").await.unwrap();
  let mut assigned: Vec<i64> = sequences.values().copied().collect();
  assigned.sort_unstable();
  assert_eq!(assigned, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_branch_sequence_numbers_are_stable_across_resume() {
  let (engine, store, _temp_dir) = create_test_engine().await;
  let runs = counter();

  // First execution: branches complete, then the finalize step fails.
  let body_runs = runs.clone();
  let result = engine
    .execute("w4r", |ctx| async move {
      for k in 1..=3_i64 {
        let branch = ctx.clone();
        let runs = body_runs.clone();
        ctx.spawn(async move {
          branch
            .step(&format!("p-{}", k), || async move {
              runs.fetch_add(1, Ordering::SeqCst);
              Ok(k)
            })
            .await?;
          Ok(())
        });
      }
      ctx.join().await?;
      let _: String = ctx.step("finalize", || async { anyhow::bail!("not yet") }).await?;
      Ok(())
    })
    .await;
  assert!(result.is_err());

  let before = store.load_step_sequences("w4r").await.unwrap();

  // Second execution: branches replay from memo, finalize succeeds.
  let body_runs = runs.clone();
  engine
    .execute("w4r", |ctx| async move {
      for k in 1..=3_i64 {
        let branch = ctx.clone();
        let runs = body_runs.clone();
        ctx.spawn(async move {
          branch
            .step(&format!("p-{}", k), || async move {
              runs.fetch_add(1, Ordering::SeqCst);
              Ok(k)
            })
            .await?;
          Ok(())
        });
      }
      ctx.join().await?;
      ctx
        .step("finalize", || async { Ok("done".to_string()) })
        .await?;
      Ok(())
    })
    .await
    .expect("resumed execution failed");

  assert_eq!(runs.load(Ordering::SeqCst), 3);

  let after = store.load_step_sequences("w4r").await.unwrap();
  for (step_id, seq) in &before {
    assert_eq!(after[step_id], *seq, "sequence of '{}' changed", step_id);
  }
}

#[tokio::test]
async fn test_join_surfaces_branch_error() {
  let (engine, store, _temp_dir) = create_test_engine().await;
  let x_runs = counter();

  let x = x_runs.clone();
  let result = engine
    .execute("w5", |ctx| async move {
      let branch = ctx.clone();
      ctx.spawn(async move {
        branch
          .step("x", || async {
            x.fetch_add(1, Ordering::SeqCst);
            Ok("done".to_string())
          })
          .await?;
        Ok(())
      });

      let branch = ctx.clone();
      ctx.spawn(async move {
        let _: String = branch
          .step("y", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            anyhow::bail!("y exploded")
          })
          .await?;
        Ok(())
      });

      ctx.join().await
    })
    .await;

  let err = result.unwrap_err();
  assert!(format!("{:#}", anyhow::Error::new(err)).contains("y exploded"));

  // The branch's sequence number depends on scheduling; look it up.
  let sequences = store.load_step_sequences("w5").await.unwrap();
  let y_key = format!("y:{}", sequences["y"]);
  let record = store.get_step("w5", &y_key).await.unwrap().unwrap();
  assert_eq!(record.status, StepStatus::Failed);

  // Second execution with a corrected branch: "x" replays, "y" completes.
  let x = x_runs.clone();
  engine
    .execute("w5", |ctx| async move {
      let branch = ctx.clone();
      ctx.spawn(async move {
        branch
          .step("x", || async {
            x.fetch_add(1, Ordering::SeqCst);
            Ok("done".to_string())
          })
          .await?;
        Ok(())
      });

      let branch = ctx.clone();
      ctx.spawn(async move {
        branch.step("y", || async { Ok("fixed".to_string()) }).await?;
        Ok(())
      });

      ctx.join().await
    })
    .await
    .expect("resumed execution failed");

  assert_eq!(x_runs.load(Ordering::SeqCst), 1);
  assert_eq!(
    engine.get_workflow_status("w5").await.unwrap(),
    WorkflowStatus::Completed
  );
}

#[tokio::test]
async fn test_completed_workflow_is_terminal() {
  let (engine, _store, _temp_dir) = create_test_engine().await;

  engine
    .execute("w6", |ctx| async move {
      ctx.step("only", || async { Ok(1_i64) }).await?;
      Ok(())
    })
    .await
    .expect("workflow execution failed");

  // Re-executing a completed workflow never invokes the procedure, even a
  // hostile one.
  let calls = counter();
  let c = calls.clone();
  engine
    .execute("w6", |_ctx| async move {
      c.fetch_add(1, Ordering::SeqCst);
      anyhow::bail!("must never run")
    })
    .await
    .expect("re-execution of completed workflow failed");

  assert_eq!(calls.load(Ordering::SeqCst), 0);
  assert_eq!(
    engine.get_workflow_status("w6").await.unwrap(),
    WorkflowStatus::Completed
  );
}

#[tokio::test]
async fn test_new_steps_after_resume_get_fresh_sequence_numbers() {
  let (engine, store, _temp_dir) = create_test_engine().await;

  let result = engine
    .execute("w7", |ctx| async move {
      ctx.step("a", || async { Ok(1_i64) }).await?;
      let _: i64 = ctx.step("b", || async { anyhow::bail!("boom") }).await?;
      Ok(())
    })
    .await;
  assert!(result.is_err());

  // The resumed procedure discovers a new step "c" before retrying "b";
  // "c" must not collide with the failed record's number.
  engine
    .execute("w7", |ctx| async move {
      ctx.step("a", || async { Ok(1_i64) }).await?;
      ctx.step("c", || async { Ok(3_i64) }).await?;
      ctx.step("b", || async { Ok(2_i64) }).await?;
      Ok(())
    })
    .await
    .expect("resumed execution failed");

  let sequences = store.load_step_sequences("w7").await.unwrap();
  assert_eq!(sequences["a"], 1);
  assert_eq!(sequences["b"], 2);
  assert_eq!(sequences["c"], 3);

  let record = store.get_step("w7", "b:2").await.unwrap().unwrap();
  assert_eq!(record.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_branches_with_same_step_id_converge() {
  let (engine, store, _temp_dir) = create_test_engine().await;
  let runs = counter();
  let observed: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

  let body_runs = runs.clone();
  let values = observed.clone();
  engine
    .execute("w8", |ctx| async move {
      for _ in 0..2 {
        let branch = ctx.clone();
        let runs = body_runs.clone();
        let values = values.clone();
        ctx.spawn(async move {
          let value: i64 = branch
            .step("shared", || async move {
              tokio::time::sleep(Duration::from_millis(10)).await;
              Ok(runs.fetch_add(1, Ordering::SeqCst) as i64)
            })
            .await?;
          values.lock().unwrap().push(value);
          Ok(())
        });
      }
      ctx.join().await
    })
    .await
    .expect("workflow execution failed");

  // Both branches observe the single recorded output, whichever body
  // committed first.
  let observed = observed.lock().unwrap();
  assert_eq!(observed.len(), 2);
  assert_eq!(observed[0], observed[1]);

  let completed = store.load_completed("w8").await.unwrap();
  assert_eq!(completed.len(), 1);
  assert!(completed.contains_key("shared:1"));
}

#[tokio::test]
async fn test_step_id_validation() {
  let (engine, _store, _temp_dir) = create_test_engine().await;

  for bad_id in ["", "bad:id"] {
    let result = engine
      .execute("w9", |ctx| async move {
        let _: i64 = ctx.step(bad_id, || async { Ok(0) }).await?;
        Ok(())
      })
      .await;

    let err = result.unwrap_err();
    let source = anyhow::Error::new(err);
    let step_err = source
      .chain()
      .find_map(|e| e.downcast_ref::<StepError>())
      .expect("expected a step error in the chain");
    assert!(matches!(step_err, StepError::InvalidStepId { .. }));
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
  id: i64,
  name: String,
  email: String,
}

#[tokio::test]
async fn test_complex_data_types_replay() {
  let (engine, _store, _temp_dir) = create_test_engine().await;
  let user_runs = counter();

  let expected = User {
    id: 123,
    name: "Test User".to_string(),
    email: "test@example.com".to_string(),
  };

  // First execution computes the values, then dies.
  let runs = user_runs.clone();
  let user = expected.clone();
  let result = engine
    .execute("w10", |ctx| async move {
      ctx
        .step("create-user", || async move {
          runs.fetch_add(1, Ordering::SeqCst);
          Ok(user)
        })
        .await?;
      ctx
        .step("get-tags", || async {
          Ok(vec!["tag1".to_string(), "tag2".to_string()])
        })
        .await?;
      anyhow::bail!("simulated crash")
    })
    .await;
  assert!(result.is_err());

  // Second execution replays both values from storage.
  let runs = user_runs.clone();
  let want = expected.clone();
  engine
    .execute("w10", |ctx| async move {
      let user: User = ctx
        .step("create-user", || async move {
          runs.fetch_add(1, Ordering::SeqCst);
          anyhow::bail!("body must not re-run")
        })
        .await?;
      assert_eq!(user, want);

      let tags: Vec<String> = ctx
        .step("get-tags", || async { anyhow::bail!("body must not re-run") })
        .await?;
      assert_eq!(tags, vec!["tag1".to_string(), "tag2".to_string()]);

      let metadata: HashMap<String, i64> = ctx
        .step("get-metadata", || async {
          Ok(HashMap::from([("answer".to_string(), 42_i64)]))
        })
        .await?;
      assert_eq!(metadata["answer"], 42);

      Ok(())
    })
    .await
    .expect("resumed execution failed");

  assert_eq!(user_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unencodable_output_fails_the_step() {
  let (engine, store, _temp_dir) = create_test_engine().await;

  // serde_json refuses maps with non-string keys at encode time.
  let result = engine
    .execute("w11", |ctx| async move {
      let _: HashMap<Vec<u8>, i64> = ctx
        .step("bad-output", || async {
          Ok(HashMap::from([(vec![1_u8, 2], 3_i64)]))
        })
        .await?;
      Ok(())
    })
    .await;
  assert!(result.is_err());

  // The step is not marked completed; it will re-run on resume.
  let record = store.get_step("w11", "bad-output:1").await.unwrap().unwrap();
  assert_eq!(record.status, StepStatus::InProgress);
}

#[tokio::test]
async fn test_unknown_workflow_status_errors() {
  let (engine, _store, _temp_dir) = create_test_engine().await;
  assert!(engine.get_workflow_status("never-seen").await.is_err());
}
