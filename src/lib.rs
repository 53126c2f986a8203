//! Contact form backend: accepts `POST /send-email`, mails a notification in
//! the background and stores the entry with the sender's IP geolocation.

pub mod app;
pub mod config;
pub mod db;
pub mod geo;
pub mod handler;
pub mod logging;
pub mod notifier;
pub mod smtpclient;
pub mod submission;
