use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use perennial_engine::WorkflowContext;

/// Employee onboarding: create the user record, provision laptop and system
/// access in parallel, then send the welcome email.
pub async fn employee_onboarding(
  ctx: Arc<WorkflowContext>,
  email: &str,
  name: &str,
) -> Result<()> {
  println!("Starting employee onboarding for {}...", name);

  let user_id: i64 = ctx
    .step("create-user-record", || async {
      println!("Creating user record for {}...", email);
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok(12345)
    })
    .await?;
  println!("User created with ID: {}", user_id);

  let provisioning = ctx.clone();
  ctx.spawn(async move {
    let laptop: String = provisioning
      .step("provision-laptop", || async {
        println!("Provisioning laptop...");
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok("LAPTOP-001".to_string())
      })
      .await?;
    println!("Laptop assigned: {}", laptop);
    Ok(())
  });

  let access = ctx.clone();
  ctx.spawn(async move {
    let grant: String = access
      .step("provision-access", || async {
        println!("Provisioning system access...");
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok("ACCESS-GRANTED".to_string())
      })
      .await?;
    println!("System access: {}", grant);
    Ok(())
  });

  ctx.join().await?;
  println!("Parallel provisioning completed");

  ctx
    .step("send-welcome-email", || async {
      println!("Sending welcome email to {}...", email);
      tokio::time::sleep(Duration::from_secs(1)).await;
      Ok("EMAIL-SENT".to_string())
    })
    .await?;

  Ok(())
}
