#![recursion_limit = "256"]

//! Polysomnography sleep-staging pipeline: canonical windowing of raw
//! PSG recordings, subject-level fold splitting, a model-agnostic
//! train / evaluate / finetune loop and resumable checkpoints.

pub mod cli;
pub mod application;
pub mod domain;
pub mod data;
pub mod ml;
pub mod infra;

#[cfg(test)]
mod testutil;
