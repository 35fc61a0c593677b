//! mailbridge: contact-form email gateway with an auto-reply daemon.

pub mod captcha;
pub mod config;
pub mod daemon;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod ratelimit;
pub mod templates;
