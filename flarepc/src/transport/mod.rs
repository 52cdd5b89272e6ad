mod channel;
pub use channel::Channel;

mod connection;
pub use connection::{FrameHandler, IdlePolicy, dial, start_channel};

mod listener;
pub use listener::Listener;

mod channel_group;
pub use channel_group::ChannelGroup;

mod group_list;
pub use group_list::{CopyOnWriteGroupList, DirectoryGroup, GroupRefCounts};

mod watchdog;
pub use watchdog::{ConnectionWatchdog, backoff};

mod connection_manager;
pub use connection_manager::{Connection, ConnectionManager};

#[cfg(test)]
pub(crate) use channel::tests::detached_channel;
