//! # xyzzy-agent
//!
//! The weaving and tracing core of a JVM monitoring agent: advice is matched
//! to classes as they load, method bodies are rewritten to call into the
//! agent, and the calls build per-thread transactions made of trace entries
//! and timers.
//!
//! ## Architecture
//!
//! - **classfile**: class-file parsing, writing, descriptors, instruction
//!   decoding, stack-map frames and a small assembler
//! - **pointcut** / **config** / **advice**: pointcut patterns, advice
//!   configuration and the advisor set (`AdviceCache`)
//! - **loader** / **world** / **matcher**: class loaders, the per-loader class
//!   analysis cache and advice matching against type hierarchies
//! - **weaver** / **method_weaver**: the load-time transformer and method
//!   rewriting
//! - **dispatch**: what woven code calls at runtime
//! - **timer** / **trace_entry** / **transaction**: the trace state machine
//! - **thread_context** / **registry** / **tracer**: per-thread context and
//!   the transaction registry
//! - **collector** / **aggregate**: where finished and in-flight
//!   transactions go
//! - **reweave** / **live**: reweaving after configuration changes and the
//!   live-weaving query API
//! - **classpath** / **scan**: classpath cataloging
//! - **side_table** / **adapter**: identity-keyed side state and
//!   context-propagating task adapters

pub mod adapter;
pub mod advice;
pub mod aggregate;
pub mod classfile;
pub mod classpath;
pub mod cli;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod invocation;
pub mod live;
pub mod loader;
pub mod matcher;
pub mod method_weaver;
pub mod pointcut;
pub mod registry;
pub mod reweave;
pub mod scan;
pub mod side_table;
pub mod thread_context;
pub mod timer;
pub mod trace_entry;
pub mod tracer;
pub mod transaction;
pub mod weaver;
pub mod world;
