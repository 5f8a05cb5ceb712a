//! Common configuration helpers for all eventdata sources

pub mod size;
pub mod template;
