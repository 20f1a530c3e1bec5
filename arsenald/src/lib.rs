//! HTTP front end for the tool-execution fabric. The binary in
//! `main.rs` wires this router to a TCP listener; tests drive it
//! in-process through `tower::ServiceExt`.

pub mod http;
