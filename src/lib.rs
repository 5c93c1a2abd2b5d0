//! # Secret Agent
//!
//! Kubernetes operator that generates, rotates and stores the secrets declared
//! by `SecretAgentConfiguration` resources.
//!
//! This crate holds the operator's process core: flag parsing, logging, the
//! type registry, the manager with its probe, metrics and webhook listeners,
//! leader election, webhook certificate bootstrap, and the startup sequence
//! that wires them together.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod manager;
pub mod observability;
pub mod runtime;
pub mod scheme;
pub mod webhook;

#[cfg(test)]
mod fake_api;
