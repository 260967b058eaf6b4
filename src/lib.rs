pub mod billing;
pub mod bot;
pub mod config;
pub mod error;
pub mod extractor;
pub mod ledger;
pub mod polling;
pub mod routes;
pub mod telegram;
pub mod tenants;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testing;
