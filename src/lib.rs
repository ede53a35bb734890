pub mod batch;
pub mod config;
pub mod data_models;
pub mod errors;
pub mod extraction;
pub mod fetcher;
pub mod judge;
pub mod pipeline;
pub mod recovery;
pub mod relevance;
pub mod url_safety;
