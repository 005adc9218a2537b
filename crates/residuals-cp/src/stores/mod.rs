pub mod deal;
pub mod event;
pub mod history;
pub mod payout;
pub mod repair;
pub mod setting;
