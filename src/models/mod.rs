pub mod courier;
pub mod event;
pub mod message;
pub mod order;
