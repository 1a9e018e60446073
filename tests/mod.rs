mod common;

mod consumer_tests;
mod engine_tests;
