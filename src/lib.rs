pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod sql;
pub mod util;
pub mod web;
