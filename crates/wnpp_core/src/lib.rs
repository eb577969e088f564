pub mod config;
pub mod debbugs;
pub mod feed;
pub mod html;
pub mod import_debbugs;
pub mod import_popcon;
pub mod links;
pub mod listing;
pub mod migrate;
pub mod models;
pub mod pagination;
pub mod runtime;
pub mod static_files;
pub mod store;
