//! Manifest resolution and deployment orchestration engine of Bundlebee.
//!
//! An alveolus is a deployable unit made of Kubernetes descriptors and of dependencies on other
//! alveoli. The engine walks the dependency graph of a root alveolus, patches and interpolates every
//! descriptor, applies them in order and awaits their readiness between ordering barriers.
//!
//! The main entry points are:
//!
//! - [`command::Engine`] running the apply, delete and process commands,
//! - [`resolver::Resolver`] walking the alveolus graph with a custom [`resolver::AlveolusVisitor`],
//! - [`substitutor::replace`] the `{{placeholder}}` interpolation algorithm.
//!
//! ## Crate Features
//!
//! - `default` enables `clap`.
//! - `clap` derives [`clap::Args`](https://docs.rs/clap) on the option structs of [`config`].

pub mod archive;
pub mod awaiter;
pub mod command;
pub mod condition;
pub mod config;
pub mod futures;
pub mod kube;
pub mod logging;
pub mod manifest;
pub mod patch;
pub mod placeholders;
pub mod resolver;
pub mod substitutor;
pub mod yaml;

// External re-exports
pub use k8s_openapi;
