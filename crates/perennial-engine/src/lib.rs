//! Perennial Engine
//!
//! A durable execution engine: ordinary imperative procedures become
//! crash-resistant, resumable workflows by memoizing each step to durable
//! storage. Re-executing a workflow replays completed steps from their
//! recorded outputs and runs only the steps that have not completed yet.
//!
//! # Example
//!
//! ```rust,ignore
//! use perennial_engine::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig {
//!   database_path: "./workflows.db".into(),
//! })
//! .await?;
//!
//! engine
//!   .execute("signup-42", |ctx| async move {
//!     let user_id = ctx.step("create-user", || async { Ok(create_user().await?) }).await?;
//!     ctx.step("send-welcome-email", || async move { Ok(send_email(user_id).await?) }).await?;
//!     Ok(())
//!   })
//!   .await?;
//! ```
//!
//! If the process crashes between the two steps, running the same command
//! again replays `create-user` from storage and only `send-welcome-email`
//! executes.

mod codec;
mod context;
mod engine;
mod error;
mod key;

pub use codec::{Codec, JsonCodec};
pub use context::WorkflowContext;
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, StepError};

pub use perennial_store as store;
