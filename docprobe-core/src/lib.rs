//! Docprobe Core
//!
//! Core types shared by every Docprobe service.
//!
//! This crate contains:
//! - Domain types: the job aggregate, use case records, quality reports
//! - DTOs: request/response shapes exchanged between gateway, worker and CLI

pub mod domain;
pub mod dto;
