//! # kpfuse-core
//!
//! Core types and utilities for the kpfuse point-cloud segmentation
//! stack: architecture configuration, label remapping, and kernel-point
//! disposition geometry. This crate is tensor-free; everything that
//! touches the numerical backend lives in `kpfuse-net`.

pub mod config;
pub mod error;
pub mod geometry;
pub mod labels;

pub use config::{BlockKind, FittingMode, FusionSegConfig};
pub use error::{Error, Result};
pub use geometry::kernel_dispositions;
pub use labels::{LabelMap, IGNORED_LABEL};
