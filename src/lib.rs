//! # kudzu-rs
//!
//! A cluster-resident operator that materializes declared `API` resources
//! into concrete CustomResourceDefinitions. Each API names a source image;
//! the operator runs that image as a short-lived delegate Pod, collects the
//! resulting CRD list over an HTTP callback, and reconciles the declared
//! resources against the cluster, including drift repair and cascading
//! deletion via finalizers.

pub mod delegate;
pub mod logging;
pub mod operator;

pub use operator::{Context, OperatorError, Result, API};
