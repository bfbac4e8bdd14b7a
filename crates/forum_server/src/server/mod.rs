#![forbid(unsafe_code)]

pub mod auth;
pub mod broadcast;
pub mod chat;
pub mod connection;
pub mod dispatcher;
pub mod health;
pub mod http;
pub mod notify;
pub mod presence;
pub mod registry;
pub mod sqlite_store;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_support;




#[cfg(test)]
mod presence_tests;
