mod presence_heartbeat;

pub use presence_heartbeat::PresenceHeartbeat;
