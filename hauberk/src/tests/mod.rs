#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

mod connect;
mod packets;

pub(crate) fn test_init() {
    env_logger::try_init().unwrap_or(());
}
