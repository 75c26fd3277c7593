//! `trench_core`: the inter-procedural taint dataflow core of a
//! whole-program static analyzer for Dalvik/Java-style bytecode.
//!
//! This crate specifies only the hard engineering at the center of such an
//! analyzer (§1): the abstract tree domain, the frame/taint lattices, the
//! points-to memory model, per-method summaries ([`model::Model`]), the
//! call graph, and the interprocedural fixpoint that ties them together.
//! Everything that decides *what* a program means — a Dex loader, a JSON
//! model-generator front end, a report emitter — is an external
//! collaborator the core only talks to through [`interfaces`].

pub mod access_path;
pub mod callgraph;
pub mod config;
pub mod constraints;
pub mod errors;
pub mod fixpoint;
pub mod frame;
pub mod interfaces;
pub mod interning;
pub mod issue;
pub mod kind;
pub mod kind_frames;
pub mod memory;
pub mod model;
pub mod rules;
pub mod statistics;
pub mod taint;
pub mod tree;

pub use access_path::{AccessPath, Path, PathElement, Root};
pub use config::Configuration;
pub use errors::{TrenchError, TrenchResult};
pub use fixpoint::{DefaultModelRegistry, Fixpoint};
pub use frame::Frame;
pub use issue::Issue;
pub use kind::Kind;
pub use model::Model;
pub use rules::{RuleCode, Rules};
pub use statistics::Statistics;
pub use taint::Taint;
