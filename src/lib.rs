#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_wraps
)]

pub mod concurrency;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod gateway;
pub mod health;
pub mod history;
pub mod pipeline;
pub mod providers;
pub mod status_events;
pub mod util;

pub use config::Config;
