pub mod checkout;
pub mod gateway;
pub mod reconciler;
pub mod refund;
pub mod webhook;
