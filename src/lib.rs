pub mod audit;
pub mod checksum;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod lock;
pub mod ops;
pub mod policy;
pub mod request;
pub mod review;
pub mod rollback;
pub mod sandbox;
