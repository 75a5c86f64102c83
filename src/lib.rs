//! # taskweft: Plan-Driven Conversational Agent Server
//!
//! taskweft hosts stateful conversation sessions. Each session persists its
//! history across three storage tiers, recalls past exchanges through a
//! tiered vector memory, and, when a request is worth more than a single
//! reply, decomposes it into a typed task board executed by
//! role-specialised workers with human checkpoints.
//!
//! ## Core Concepts
//!
//! - **Messages**: immutable conversation turns, fanned out by priority to
//!   the durable log, the archive, and the memory pipeline
//! - **Boards**: execution plans of typed tasks with a guarded state machine
//! - **Workers**: bounded reason-act loops with self-assessment and retry
//! - **Memory**: short-term records and long-term rollups with a
//!   similarity-gated answer cache
//! - **Events**: one broadcast bus per session feeding sinks and clients
//!
//! ## A Turn in One Paragraph
//!
//! The transport hands a message to the session's executor, which persists
//! it, consults the cached-answer gate, assembles memory context, and
//! either answers through a streaming reason-act loop or asks the
//! orchestrator to plan. The orchestrator drives workers task by task,
//! pausing at checkpoints for the user and replanning on failure while
//! preserving completed work. Every transition lands in the durable log;
//! every observable step lands on the event bus.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskweft::config::RuntimeConfig;
//! use taskweft::gateway::StaticModel;
//! use taskweft::memory::InMemoryRecallIndex;
//! use taskweft::storage::{InMemoryArchive, InMemoryDurableLog};
//! use taskweft::transport::{SessionRegistry, SharedServices, router};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SessionRegistry::new(SharedServices {
//!     config: RuntimeConfig::default(),
//!     provider: Arc::new(StaticModel::always("hello")),
//!     archive: Arc::new(InMemoryArchive::new()),
//!     log: Arc::new(InMemoryDurableLog::new()),
//!     index: Arc::new(InMemoryRecallIndex::new()),
//! });
//! let app = router(registry);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8787").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`message`] - conversation turns and tool-call records
//! - [`events`] - typed events, broadcast hub, sinks
//! - [`gateway`] - resilient model front door (retry, breaker, deadline)
//! - [`storage`] - durable log, archive, priority fan-out coordinator
//! - [`memory`] - recall index, embedding cache/batcher, rollups
//! - [`board`] - task and board data model with guarded transitions
//! - [`planner`] - triage, plan generation, replanning
//! - [`worker`] - role-specialised task execution
//! - [`orchestrator`] - the board state machine
//! - [`executor`] - per-session single-writer turn pipeline
//! - [`transport`] - WebSocket channel and HTTP admin surface

pub mod board;
pub mod config;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod memory;
pub mod message;
pub mod orchestrator;
pub mod planner;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod utils;
pub mod worker;
