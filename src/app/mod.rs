mod data_io;
mod error;
mod harvest;
mod runtime;
mod sites;
mod tui;
mod types;
mod ui_utils;
mod webdriver;

pub use runtime::run;
