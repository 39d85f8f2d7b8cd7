pub mod formatters;

pub use formatters::{ConsoleSink, JsonSink, ResultSink};
