mod feeds;
mod items;
mod repo;
mod schema;
mod types;

pub use repo::{FeedStore, ItemStore, Store};
pub use schema::Database;
pub use types::{
    DatabaseError, FeedRecord, FetchAttempt, ItemRecord, ItemStats, NewItem, UpsertedFeed,
};
