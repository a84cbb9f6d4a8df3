#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

//! # dxmeta
//!
//! Pools per-study diagnostic accuracy (2×2 tables or reported
//! sensitivity/specificity) for one or more biomarkers under a bivariate
//! random-effects model, and derives heterogeneity, SROC, subgroup,
//! leave-one-out, meta-regression and publication-bias results from it.
//!
//! Every statistical stage is a pure function of its inputs and an explicit
//! [`config::AnalysisConfig`]; I/O lives in [`data`] and [`report`] only.

pub mod bias;
pub mod config;
pub mod data;
pub mod dist;
pub mod estimate;
pub mod heterogeneity;
pub mod orchestrate;
pub mod pipeline;
pub mod regression;
pub mod report;
pub mod sroc;
pub mod types;
pub mod validate;
