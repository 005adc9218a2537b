pub mod airtable;
pub mod audit;
pub mod cascade;
pub mod confirmation;
pub mod deals;
pub mod events;
pub mod history;
pub mod payouts;
pub mod repair;
pub mod sync;
