//! Built-in tool executors (§4.3, §4.4): the sandboxed shell tool, the
//! parser-builder triplet, and the REST tool.

pub mod parser_builder;
pub mod rest;
pub mod shell;
