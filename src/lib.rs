//! # docsync
//!
//! **A distributed ingestion worker that mirrors third-party documents into
//! vector stores.**
//!
//! docsync consumes index jobs from a durable queue, loads the referenced
//! pipeline from PostgreSQL, pulls documents from the configured upstream
//! integration (a knowledge base or an issue tracker), delegates chunking,
//! embedding, and sink writes to a stateless helper service, and reconciles
//! the persisted mirror so it matches the upstream source of truth.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────┐   ┌───────────────┐
//! │  Queue  │──▶│  Consumers   │──▶│  Orchestrator │
//! │ (SQS)   │   │ (heartbeat)  │   │  (per step)   │
//! └─────────┘   └──────────────┘   └───────┬───────┘
//!                                          │
//!                     ┌────────────────────┼─────────────────────┐
//!                     ▼                    ▼                     ▼
//!               ┌──────────┐        ┌───────────┐         ┌──────────┐
//!               │ Sources  │        │  Helper   │         │ Postgres │
//!               │ (list/   │        │ (count/   │         │ (mirror, │
//!               │  fetch)  │        │  ingest/  │         │  steps,  │
//!               │          │        │  delete)  │         │  quotas) │
//!               └──────────┘        └───────────┘         └──────────┘
//! ```
//!
//! ## Job flow
//!
//! 1. A consumer ([`queue`]) long-polls the queue and drives the handler
//!    under a visibility heartbeat. Delivery is at-least-once; every
//!    downstream write is idempotent.
//! 2. The orchestrator ([`handler`]) hydrates the run step, pipeline,
//!    account, and integration connection, applies gatekeeping (stale step,
//!    disabled source, suspended account, missing connection), and
//!    dispatches by sync mode.
//! 3. The reconciliation engine ([`reconcile`]) either diffs the full
//!    upstream listing against the mirror (ingesting changes in parallel
//!    and deleting drift) or applies a single-document change event.
//! 4. Source clients ([`source_notion`], [`source_linear`]) and the helper
//!    client ([`helper`]) bound their concurrency with per-subsystem
//!    semaphores and classify failures for the retry policy ([`retry`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration |
//! | [`models`] | Domain types and discriminator-tagged variants |
//! | [`retry`] | Exponential backoff with transient/permanent classification |
//! | [`store`] | Persistence gateway trait, PostgreSQL + in-memory backends |
//! | [`db`] | Connection pool construction |
//! | [`migrate`] | Idempotent schema DDL |
//! | [`sources`] | Source capability trait and integration registry |
//! | [`source_notion`] | Knowledge-base client (pages, databases, markdown sidecar) |
//! | [`source_linear`] | Issue-tracker GraphQL client |
//! | [`helper`] | Embedding/vector-store helper client |
//! | [`queue`] | Queue wire client (SigV4) and consumer loop |
//! | [`handler`] | Run orchestrator |
//! | [`reconcile`] | Full-index reconciliation and delta handling |
//! | [`server`] | Liveness HTTP endpoint |

pub mod config;
pub mod db;
pub mod handler;
pub mod helper;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod server;
pub mod source_linear;
pub mod source_notion;
pub mod sources;
pub mod store;
