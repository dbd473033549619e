pub mod alpaca;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod ports;
pub mod risk;
pub mod signals;
pub mod trading212;
pub mod trading_rules;
pub mod tuner;
