//! The processing pipeline: graph-consuming workers and the item
//! storage policy.
//!
//! ```text
//! ┌──────────────┐      bounded channel      ┌───────────────┐
//! │   Adapter    │ ─── Arc<ItemGraph> ─────▶ │ Worker pool   │
//! │ (list_items) │                           │ (process_graph│
//! └──────────────┘                           │  per message) │
//!                                            └──────┬────────┘
//!                                                   ▼
//!                                  index rows + content files
//! ```
//!
//! One producer, a small fixed pool of consumers. Per-item mutual
//! exclusion makes reprocessing the same item from two workers safe;
//! per-graph recursive state makes cyclic graphs terminate.

mod collections;
mod processor;

pub(crate) use processor::RecursiveState;
